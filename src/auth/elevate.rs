// ============================================================================
// src/auth/elevate.rs – Grants filed by a pkexec-elevated helper process
// ============================================================================

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{Authority, CapabilityToken, GrantStore, PermissionScope};
use crate::cmd::base::{resolve_allowlisted, PKEXEC_BINARIES};
use crate::config::ConfigFile;
use crate::error::AuthError;
use crate::util::binary::determine_binary_path;

/// Acknowledgement line the helper prints once the record is on disk.
const GRANTED: &str = "granted";

/// First line the requester sends to the helper.
#[derive(Debug, Serialize, Deserialize)]
struct GrantRequest {
    token: String,
    scopes: Vec<PermissionScope>,
}

/// Client-side authority. Each grant is held by a root helper started
/// through pkexec; closing the helper's stdin revokes it.
pub struct ElevatedAuthority {
    program: PathBuf,
    args: Vec<String>,
    helpers: RefCell<HashMap<String, Child>>,
}

impl ElevatedAuthority {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            helpers: RefCell::new(HashMap::new()),
        }
    }

    /// `pkexec <bootnext> grant`
    pub fn from_config(cfg: &ConfigFile) -> Result<Self> {
        let pkexec = resolve_allowlisted(PKEXEC_BINARIES)?;
        let binary = determine_binary_path(cfg)?;
        Ok(Self::new(
            pkexec,
            vec![binary.display().to_string(), "grant".to_string()],
        ))
    }

    fn spawn(&self) -> Result<Child, AuthError> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| AuthError::Store(format!("spawn {}: {e}", self.program.display())))
    }
}

impl Authority for ElevatedAuthority {
    fn grant(&self, token: &CapabilityToken, scopes: &[PermissionScope]) -> Result<(), AuthError> {
        let mut child = self.spawn()?;
        let request = Zeroizing::new(
            serde_json::to_string(&GrantRequest {
                token: token.to_external(),
                scopes: scopes.to_vec(),
            })
            .map_err(|e| AuthError::Store(e.to_string()))?,
        );

        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(AuthError::Store("grant helper has no pipes".to_string()));
        };

        // A helper refused by polkit exits before reading; the write may fail.
        let sent = writeln!(stdin, "{}", request.as_str()).and_then(|_| stdin.flush());
        let mut ack = String::new();
        let acked = sent.is_ok()
            && BufReader::new(stdout).read_line(&mut ack).is_ok()
            && ack.trim() == GRANTED;

        if !acked {
            drop(stdin);
            let status = child.wait();
            debug!(?status, "grant helper refused");
            return Err(AuthError::Denied);
        }

        child.stdin = Some(stdin);
        self.helpers.borrow_mut().insert(token.fingerprint(), child);
        Ok(())
    }

    /// Grants are verified by the worker against the store, never here.
    fn check(&self, _token: &CapabilityToken, _scope: PermissionScope) -> bool {
        false
    }

    fn revoke(&self, token: &CapabilityToken) -> Result<(), AuthError> {
        let Some(mut child) = self.helpers.borrow_mut().remove(&token.fingerprint()) else {
            return Ok(());
        };
        drop(child.stdin.take());
        let status = child.wait().map_err(|e| AuthError::Store(e.to_string()))?;
        if !status.success() {
            warn!(%status, "grant helper exited uncleanly");
        }
        Ok(())
    }
}

/// Helper side: file the requested grant for `uid`, hold it until the
/// requester closes its end, then revoke it.
pub fn serve_grant<R: BufRead, W: Write>(
    store: &GrantStore,
    mut reader: R,
    mut writer: W,
    uid: u32,
) -> Result<()> {
    let mut line = Zeroizing::new(String::new());
    reader.read_line(&mut line).context("read grant request")?;
    let request: GrantRequest = serde_json::from_str(&line).context("malformed grant request")?;
    let token = CapabilityToken::from_external(&request.token).context("malformed token")?;
    anyhow::ensure!(!request.scopes.is_empty(), "grant request names no scopes");

    store.grant_as(&token, &request.scopes, uid)?;
    info!(uid, grant = ?token, "grant filed");

    let held = (|| -> Result<()> {
        writeln!(writer, "{GRANTED}")?;
        writer.flush()?;
        io::copy(&mut reader, &mut io::sink())?;
        Ok(())
    })();

    store.revoke(&token)?;
    info!(uid, grant = ?token, "grant revoked");
    held
}
