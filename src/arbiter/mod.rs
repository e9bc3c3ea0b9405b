//! Device arbitration: the one place that touches block devices.
//!
//! A [`Session`] serialises every mount, unmount and device-appeared event
//! through a single completion queue; backends only perform the raw
//! operation.

pub mod lsblk;
pub mod session;

#[cfg(test)]
pub mod fake;

pub use lsblk::LsblkBackend;
pub use session::{Session, WatchId};

use crate::error::Dissent;
use crate::volume::VolumeDescription;
use anyhow::Result;

/// Partition-type GUID of an EFI system partition.
pub const EFI_PARTITION_GUID: &str = "c12a7328-f81f-11d2-ba4b-00a0c93ec93b";

/// Mount flags understood by every backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub read_only: bool,
}

impl MountOptions {
    pub fn read_only() -> Self {
        Self { read_only: true }
    }
}

/// Raw device operations. Implementations must be synchronous; ordering and
/// completion delivery belong to [`Session`].
pub trait DiskBackend {
    /// Every partition currently visible.
    fn list(&self) -> Result<Vec<VolumeDescription>>;

    /// Fresh description; unresolvable fields are left empty.
    fn describe(&self, device: &str) -> VolumeDescription;

    fn exists(&self, device: &str) -> bool;

    fn mount(&self, device: &str, options: &MountOptions) -> std::result::Result<(), Dissent>;

    fn unmount(&self, device: &str) -> std::result::Result<(), Dissent>;
}

/// Device names are used as path components and command arguments.
pub fn valid_device_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_names_are_restricted() {
        for ok in ["sda1", "nvme0n1p1", "mmcblk0p1", "dm-0", "disk2s1"] {
            assert!(valid_device_name(ok), "{ok}");
        }
        for bad in ["", "../sda1", "sda1/..", ".hidden", "-o", "sda 1", "sda1;reboot"] {
            assert!(!valid_device_name(bad), "{bad}");
        }
    }
}
