// ============================================================================
// src/config.rs – strict config loader
// ============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/bootnext.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Volumes are mounted at `<mount_root>/<device>`.
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Re-enumeration interval while a device-appeared watch is armed.
    #[serde(default = "default_rescan_ms")]
    pub rescan_ms: u64,
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/bootnext/worker.sock")
}

fn default_mount_root() -> PathBuf {
    PathBuf::from("/run/bootnext/mnt")
}

fn default_command_timeout_secs() -> u64 {
    10
}

fn default_tick_ms() -> u64 {
    25
}

fn default_rescan_ms() -> u64 {
    2000
}

fn default_audit_log() -> PathBuf {
    PathBuf::from("/var/log/bootnext.log")
}

impl Default for Worker {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            mount_root: default_mount_root(),
            command_timeout_secs: default_command_timeout_secs(),
            tick_ms: default_tick_ms(),
            rescan_ms: default_rescan_ms(),
            audit_log: default_audit_log(),
        }
    }
}

impl Worker {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    /// Grant records live here. Root-owned 0755; records are filed only by the
    /// pkexec-elevated `bootnext grant` helper.
    #[serde(default = "default_grant_dir")]
    pub grant_dir: PathBuf,
}

fn default_grant_dir() -> PathBuf {
    PathBuf::from("/run/bootnext/grants")
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            grant_dir: default_grant_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default = "default_loader_path")]
    pub loader_path: PathBuf,
    #[serde(default = "default_boot_config_path")]
    pub config_path: PathBuf,
}

fn default_loader_path() -> PathBuf {
    PathBuf::from("/usr/lib/bootnext/BootNext.efi")
}

fn default_boot_config_path() -> PathBuf {
    PathBuf::from("/usr/lib/bootnext/config.conf")
}

impl Default for Payload {
    fn default() -> Self {
        Self {
            loader_path: default_loader_path(),
            config_path: default_boot_config_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    /// Delay between arming accumulation and the first scan.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
}

fn default_settle_ms() -> u64 {
    1000
}

fn default_reply_timeout_secs() -> u64 {
    30
}

fn default_connect_attempts() -> u32 {
    10
}

impl Default for Client {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            reply_timeout_secs: default_reply_timeout_secs(),
            connect_attempts: default_connect_attempts(),
        }
    }
}

impl Client {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    #[serde(default = "default_unit_name")]
    pub unit_name: String,
    #[serde(default = "default_unit_path")]
    pub unit_path: PathBuf,
    /// Worker executable; falls back to the running binary.
    #[serde(default)]
    pub binary_path: Option<String>,
}

fn default_unit_name() -> String {
    "bootnext-worker.service".to_string()
}

fn default_unit_path() -> PathBuf {
    PathBuf::from("/etc/systemd/system/bootnext-worker.service")
}

impl Default for Service {
    fn default() -> Self {
        Self {
            unit_name: default_unit_name(),
            unit_path: default_unit_path(),
            binary_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub worker: Worker,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub client: Client,
    #[serde(default)]
    pub service: Service,
    #[serde(skip)]
    pub path: PathBuf,
}

impl ConfigFile {
    pub fn load<P: AsRef<Path>>(p: P) -> Result<Self> {
        let s = fs::read_to_string(&p)
            .with_context(|| format!("read config: {}", p.as_ref().display()))?;
        let mut cfg: Self = match p.as_ref().extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&s).context("yaml parse")?,
            _ => toml::from_str(&s).context("toml parse")?,
        };
        cfg.path = p.as_ref().to_path_buf();
        Ok(cfg)
    }

    /// Load `p` if it exists, otherwise fall back to built-in defaults.
    pub fn load_or_default<P: AsRef<Path>>(p: P) -> Result<Self> {
        if p.as_ref().exists() {
            return Self::load(p);
        }
        Ok(Self {
            path: p.as_ref().to_path_buf(),
            ..Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = ConfigFile::load_or_default("/nonexistent/bootnext.toml").unwrap();
        assert_eq!(cfg.worker.socket_path, default_socket_path());
        assert_eq!(cfg.client.settle_ms, 1000);
        assert_eq!(cfg.service.unit_name, "bootnext-worker.service");
        assert_eq!(cfg.path, PathBuf::from("/nonexistent/bootnext.toml"));
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bootnext.toml");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "[worker]\nsocket_path = \"/tmp/bn.sock\"\n\n[client]\nsettle_ms = 5").unwrap();

        let cfg = ConfigFile::load(&path).unwrap();
        assert_eq!(cfg.worker.socket_path, PathBuf::from("/tmp/bn.sock"));
        assert_eq!(cfg.worker.mount_root, default_mount_root());
        assert_eq!(cfg.client.settle_ms, 5);
        assert_eq!(cfg.client.connect_attempts, 10);
        assert_eq!(cfg.auth.grant_dir, default_grant_dir());
    }

    #[test]
    fn yaml_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bootnext.yaml");
        fs::write(&path, "payload:\n  loader_path: /opt/BootNext.efi\n").unwrap();

        let cfg = ConfigFile::load(&path).unwrap();
        assert_eq!(cfg.payload.loader_path, PathBuf::from("/opt/BootNext.efi"));
        assert_eq!(cfg.payload.config_path, default_boot_config_path());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bootnext.toml");
        fs::write(&path, "[worker\nsocket_path = 3").unwrap();
        assert!(ConfigFile::load(&path).is_err());
    }
}
