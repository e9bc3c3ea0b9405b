// ============================================================================
// src/service.rs – Install / upgrade the privileged worker as a systemd unit
// ============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::info;

use crate::cmd::base::{run_external, SYSTEMCTL_BINARIES};
use crate::config::ConfigFile;
use crate::util::atomic::atomic_write_bytes;
use crate::util::binary::determine_binary_path;

/// Brings a worker of the given version up on the well-known socket.
pub trait WorkerService {
    fn ensure_installed(&self, version: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SystemdService {
    unit_name: String,
    unit_path: PathBuf,
    binary: PathBuf,
    config_path: PathBuf,
    timeout: Duration,
}

impl SystemdService {
    pub fn from_config(cfg: &ConfigFile) -> Result<Self> {
        Ok(Self {
            unit_name: cfg.service.unit_name.clone(),
            unit_path: cfg.service.unit_path.clone(),
            binary: determine_binary_path(cfg)?,
            config_path: cfg.path.clone(),
            timeout: cfg.worker.command_timeout(),
        })
    }

    fn systemctl(&self, args: &[&str]) -> Result<()> {
        let out = run_external(SYSTEMCTL_BINARIES, args, self.timeout)?;
        if !out.success() {
            bail!("systemctl {} failed: {}", args.join(" "), out.stderr.trim());
        }
        Ok(())
    }
}

fn render_unit(binary: &Path, config_path: &Path, version: &str) -> String {
    format!(
        r#"[Unit]
Description=BootNext privileged worker ({version})
After=local-fs.target

[Service]
Type=simple
User=root
Group=root
ExecStart={binary} worker --config {config}
Environment=BOOTNEXT_LOG=info
Restart=on-failure
RestartPreventExitStatus=0
NoNewPrivileges=true
PrivateTmp=true
UMask=0077

[Install]
WantedBy=multi-user.target
"#,
        binary = binary.display(),
        config = config_path.display(),
    )
}

impl WorkerService for SystemdService {
    fn ensure_installed(&self, version: &str) -> Result<()> {
        let unit = render_unit(&self.binary, &self.config_path, version);
        atomic_write_bytes(&self.unit_path, unit.as_bytes(), Some(0o644), true)?;
        info!(unit = %self.unit_name, "worker unit written; restarting");

        self.systemctl(&["daemon-reload"])?;
        self.systemctl(&["restart", &self.unit_name])?;
        Ok(())
    }
}
