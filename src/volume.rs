// ============================================================================
// src/volume.rs – Volume handles and point-in-time descriptions
// ============================================================================

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Stable device name of a partition (e.g. `sda1`, `nvme0n1p1`).
///
/// This is also the wire form of a volume; nothing else crosses the socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Disk {
    name: String,
}

impl Disk {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Disk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Read-only snapshot of a volume. Take a new one whenever mount state matters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VolumeDescription {
    pub device: String,
    /// Filesystem label, falling back to the partition label.
    pub media_name: Option<String>,
    /// Model of the parent disk.
    pub model: Option<String>,
    /// Partition-type GUID, lowercase.
    pub content: Option<String>,
    pub mount_path: Option<PathBuf>,
    pub uuid: Option<String>,
}

impl VolumeDescription {
    /// A description where nothing could be resolved.
    pub fn unresolved(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Self::default()
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mount_path.is_some()
    }

    pub fn has_content(&self, signature: &str) -> bool {
        self.content
            .as_deref()
            .map(|c| c.eq_ignore_ascii_case(signature))
            .unwrap_or(false)
    }
}

impl fmt::Display for VolumeDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.media_name.as_deref().unwrap_or("<unnamed>");
        let model = self
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or("<unknown>");
        write!(f, "\"{}\" on {} ({})", name, model, self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_menu_format() {
        let desc = VolumeDescription {
            device: "sda1".into(),
            media_name: Some("EFI".into()),
            model: Some("  Samsung SSD 860 ".into()),
            ..VolumeDescription::default()
        };
        assert_eq!(desc.to_string(), "\"EFI\" on Samsung SSD 860 (sda1)");
        assert_eq!(
            VolumeDescription::unresolved("sdb1").to_string(),
            "\"<unnamed>\" on <unknown> (sdb1)"
        );
    }

    #[test]
    fn content_match_ignores_case() {
        let desc = VolumeDescription {
            content: Some("c12a7328-f81f-11d2-ba4b-00a0c93ec93b".into()),
            ..VolumeDescription::unresolved("sda1")
        };
        assert!(desc.has_content("C12A7328-F81F-11D2-BA4B-00A0C93EC93B"));
        assert!(!VolumeDescription::unresolved("sda1").has_content("x"));
    }
}
