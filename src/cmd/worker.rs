// ============================================================================
// src/cmd/worker.rs – Run the privileged worker on its socket
// ============================================================================

use std::io;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::unistd::Uid;
use tracing::{info, warn};

use crate::arbiter::{LsblkBackend, Session};
use crate::auth::elevate::serve_grant;
use crate::auth::{Gateway, GrantStore};
use crate::config::{ConfigFile, DEFAULT_CONFIG_PATH};
use crate::installer::FilePayload;
use crate::server::{Listener, Worker};
use crate::util::audit::AuditTrail;

pub fn run_worker(cfg: &ConfigFile) -> Result<()> {
    if !Uid::effective().is_root() {
        warn!("worker is not running as root; mounts will likely be refused");
    }

    // ---- Step 1: authorization store --------------------------------------
    let grants = GrantStore::new(&cfg.auth.grant_dir);
    grants.prepare()?;

    // ---- Step 2: arbitration session and handlers ------------------------
    let backend = LsblkBackend::new(&cfg.worker.mount_root, cfg.worker.command_timeout());
    let worker = Worker::new(
        Session::new(backend),
        Gateway::verifier(Rc::new(grants)),
        Rc::new(FilePayload::from_config(&cfg.payload)),
        AuditTrail::new(&cfg.worker.audit_log),
    );

    // ---- Step 3: serve until told to stop ---------------------------------
    let listener = Listener::bind(&cfg.worker.socket_path)
        .with_context(|| format!("bind {}", cfg.worker.socket_path.display()))?
        .with_timing(
            Duration::from_millis(cfg.worker.tick_ms.max(1)),
            Duration::from_millis(cfg.worker.rescan_ms.max(1)),
        );
    info!(version = env!("CARGO_PKG_VERSION"), "starting worker");
    listener.run(&worker)
}

/// Elevated grant helper, started by the front-end through pkexec. Files one
/// grant for the invoking user and holds it until stdin closes.
pub fn run_grant() -> Result<()> {
    if !Uid::effective().is_root() {
        bail!("the grant helper must run as root (via pkexec)");
    }

    // Always the system config; a caller-chosen one could redirect root writes.
    let cfg = ConfigFile::load_or_default(DEFAULT_CONFIG_PATH)?;
    let grants = GrantStore::new(&cfg.auth.grant_dir);
    grants.prepare()?;

    let uid = requesting_uid(std::env::var("PKEXEC_UID").ok().as_deref());
    serve_grant(&grants, io::stdin().lock(), io::stdout().lock(), uid)
}

fn requesting_uid(pkexec_uid: Option<&str>) -> u32 {
    pkexec_uid
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(|| Uid::current().as_raw())
}
