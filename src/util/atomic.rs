// ============================================================================
// src/util/atomic.rs – Durable atomic writes (grant records, loader payload)
// ============================================================================

use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Return the parent directory path or error with context.
fn parent_dir(path: &Path) -> Result<PathBuf> {
    path.parent()
        .map(|p| p.to_path_buf())
        .context("Target path has no parent directory")
}

/// Fsync a directory to persist metadata (like rename).
fn fsync_dir(dir: &Path) -> Result<()> {
    let f = File::open(dir).with_context(|| format!("Open dir for fsync: {dir:?}"))?;
    f.sync_all()
        .with_context(|| format!("Fsync dir failed: {dir:?}"))?;
    Ok(())
}

/// Reject writes if target is a symlink.
fn reject_symlink_target(path: &Path) -> Result<()> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.file_type().is_symlink() {
            bail!("Refusing to write to symlink: {}", path.display());
        }
    }
    Ok(())
}

/// Writes bytes to a temp file in the same directory, fsyncs it, renames into
/// place, then fsyncs the parent directory.
///
/// With `mode` set the final file gets exactly that POSIX mode. EFI system
/// partitions are FAT and reject chmod, so payload writes pass `None`.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8], mode: Option<u32>, force: bool) -> Result<()> {
    reject_symlink_target(path)?;

    let dir = parent_dir(path)?;
    if !dir.exists() {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Create parent directory failed: {dir:?}"))?;
    }

    if !force && path.exists() {
        bail!("File already exists: {}", path.display());
    }

    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("Target path missing file name")?;

    let mut tmp = dir.join(format!("{base}.tmp"));
    for _ in 0..8 {
        tmp.set_file_name(format!("{}.tmp-{}", base, nanoid::nanoid!(8)));
        if !tmp.exists() {
            break;
        }
    }

    let mut opts = OpenOptions::new();
    opts.create_new(true).write(true);
    if let Some(mode) = mode {
        opts.mode(mode);
    }
    let mut f = opts
        .open(&tmp)
        .with_context(|| format!("Open temp file failed: {tmp:?}"))?;

    let staged = f
        .write_all(bytes)
        .context("Write to temp file failed")
        .and_then(|_| f.sync_all().context("Fsync temp file failed"));
    if let Err(err) = staged {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    drop(f);

    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err).with_context(|| {
            format!(
                "Atomic rename failed ({} -> {})",
                tmp.display(),
                path.display()
            )
        });
    }

    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("Set permissions failed for {}", path.display()))?;
    }

    fsync_dir(&dir)?;

    Ok(())
}

/// Atomic write of TOML-serializable records with 0600 permissions.
pub fn atomic_write_toml<T: serde::Serialize>(path: &Path, value: &T, force: bool) -> Result<()> {
    let s = toml::to_string_pretty(value).context("Serialize TOML failed")?;
    atomic_write_bytes(path, s.as_bytes(), Some(0o600), force)
}
