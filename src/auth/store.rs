// ============================================================================
// src/auth/store.rs – Root-filed grant records keyed by token fingerprint
// ============================================================================

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{Pid, Uid};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Authority, CapabilityToken, PermissionScope};
use crate::error::AuthError;
use crate::util::atomic::atomic_write_toml;

/// On-disk grant. Named `<sha256(token)>.toml`; the token itself is not kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GrantRecord {
    scopes: Vec<PermissionScope>,
    /// Process holding the grant open; the grant dies with it.
    pid: u32,
    /// User the grant was issued to.
    uid: u32,
    issued_at: String,
}

/// Grant records as the worker sees them. Only files owned by the trusted
/// owner (root) count, so only the elevated grant helper can file one.
#[derive(Debug, Clone)]
pub struct GrantStore {
    dir: PathBuf,
    trusted_owner: u32,
}

impl GrantStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            trusted_owner: 0,
        }
    }

    /// Store trusting the current user, so tests can file grants unprivileged.
    #[cfg(test)]
    pub fn for_current_user<P: AsRef<Path>>(dir: P) -> Self {
        Self::new(dir).trusting(Uid::current().as_raw())
    }

    #[cfg(test)]
    pub fn trusting(mut self, owner: u32) -> Self {
        self.trusted_owner = owner;
        self
    }

    /// Create the grant directory 0755. An existing directory must belong to
    /// the trusted owner.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create grant dir {}", self.dir.display()))?;
        let meta = fs::symlink_metadata(&self.dir)
            .with_context(|| format!("stat grant dir {}", self.dir.display()))?;
        if !meta.is_dir() || meta.uid() != self.trusted_owner {
            bail!(
                "grant dir {} is not a directory owned by uid {}",
                self.dir.display(),
                self.trusted_owner
            );
        }
        fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("chmod grant dir {}", self.dir.display()))?;
        Ok(())
    }

    fn record_path(&self, token: &CapabilityToken) -> PathBuf {
        self.dir.join(format!("{}.toml", token.fingerprint()))
    }

    fn load(&self, token: &CapabilityToken) -> Result<GrantRecord> {
        let path = self.record_path(token);
        let meta = fs::symlink_metadata(&path)
            .with_context(|| format!("stat {}", path.display()))?;

        anyhow::ensure!(meta.file_type().is_file(), "grant is not a regular file");
        anyhow::ensure!(
            meta.uid() == self.trusted_owner,
            "grant filed by uid {}, not {}",
            meta.uid(),
            self.trusted_owner
        );
        anyhow::ensure!(meta.mode() & 0o022 == 0, "grant is writable by others");

        let s = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let record: GrantRecord = toml::from_str(&s).context("toml parse")?;
        anyhow::ensure!(holder_alive(record.pid), "grant holder {} is gone", record.pid);
        Ok(record)
    }

    /// File a grant for `uid`, held by the calling process.
    pub fn grant_as(
        &self,
        token: &CapabilityToken,
        scopes: &[PermissionScope],
        uid: u32,
    ) -> Result<(), AuthError> {
        let record = GrantRecord {
            scopes: scopes.to_vec(),
            pid: std::process::id(),
            uid,
            issued_at: Utc::now().to_rfc3339(),
        };
        atomic_write_toml(&self.record_path(token), &record, true)
            .map_err(|e| AuthError::Store(format!("{e:#}")))
    }
}

fn holder_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Null signal: EPERM still means the process exists.
    match kill(Pid::from_raw(raw), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

impl Authority for GrantStore {
    fn grant(&self, token: &CapabilityToken, scopes: &[PermissionScope]) -> Result<(), AuthError> {
        self.grant_as(token, scopes, Uid::current().as_raw())
    }

    fn check(&self, token: &CapabilityToken, scope: PermissionScope) -> bool {
        match self.load(token) {
            Ok(record) => {
                let allowed = record.scopes.contains(&scope);
                debug!(uid = record.uid, issued_at = %record.issued_at, %scope, allowed, "grant checked");
                allowed
            }
            Err(err) => {
                debug!(grant = ?token, "grant check failed: {err:#}");
                false
            }
        }
    }

    fn revoke(&self, token: &CapabilityToken) -> Result<(), AuthError> {
        match fs::remove_file(self.record_path(token)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AuthError::Store(e.to_string())),
        }
    }
}
