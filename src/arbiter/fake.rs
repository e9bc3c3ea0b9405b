//! In-memory backend for tests. Each volume's "filesystem" is a directory
//! inside a private temp dir; mounting exposes it as the mount path.

use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Result;
use tempfile::TempDir;

use super::{DiskBackend, MountOptions, EFI_PARTITION_GUID};
use crate::error::{Dissent, DissentKind};
use crate::volume::VolumeDescription;

/// Recorded device operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Mount { device: String, read_only: bool },
    Unmount { device: String },
}

#[derive(Debug)]
struct FakeVolume {
    desc: VolumeDescription,
    root: PathBuf,
    refuse_mount: Option<DissentKind>,
    refuse_unmount: Option<DissentKind>,
    lose_mount_path: bool,
}

#[derive(Debug)]
struct State {
    dir: TempDir,
    volumes: Vec<FakeVolume>,
    ops: Vec<Operation>,
}

#[derive(Debug, Clone)]
pub struct FakeBackend {
    state: Rc<RefCell<State>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir for fake backend");
        Self {
            state: Rc::new(RefCell::new(State {
                dir,
                volumes: Vec::new(),
                ops: Vec::new(),
            })),
        }
    }

    pub fn add_volume(&self, device: &str, content: &str) -> PathBuf {
        let mut st = self.state.borrow_mut();
        let root = st.dir.path().join(device);
        fs::create_dir_all(&root).expect("fake volume root");
        st.volumes.push(FakeVolume {
            desc: VolumeDescription {
                device: device.to_string(),
                media_name: Some("EFI".to_string()),
                model: Some("Fake Disk".to_string()),
                content: Some(content.to_string()),
                mount_path: None,
                uuid: Some(format!("uuid-{device}")),
            },
            root: root.clone(),
            refuse_mount: None,
            refuse_unmount: None,
            lose_mount_path: false,
        });
        root
    }

    /// Add an EFI system partition; returns the directory backing its filesystem.
    pub fn add_efi(&self, device: &str) -> PathBuf {
        self.add_volume(device, EFI_PARTITION_GUID)
    }

    /// Add an EFI partition that already carries `EFI/BootNext`.
    pub fn add_installed_efi(&self, device: &str) -> PathBuf {
        let root = self.add_efi(device);
        fs::create_dir_all(root.join("EFI").join("BootNext")).expect("marker dir");
        root
    }

    pub fn refuse_mount(&self, device: &str, kind: DissentKind) {
        self.with_volume(device, |v| v.refuse_mount = Some(kind));
    }

    pub fn refuse_unmount(&self, device: &str, kind: DissentKind) {
        self.with_volume(device, |v| v.refuse_unmount = Some(kind));
    }

    /// Mount succeeds but no mount path ever shows up.
    pub fn lose_mount_path(&self, device: &str) {
        self.with_volume(device, |v| v.lose_mount_path = true);
    }

    /// Mount `device` outside of any session, as a user would.
    pub fn premount(&self, device: &str) {
        self.with_volume(device, |v| v.desc.mount_path = Some(v.root.clone()));
    }

    pub fn is_mounted(&self, device: &str) -> bool {
        self.state
            .borrow()
            .volumes
            .iter()
            .any(|v| v.desc.device == device && v.desc.mount_path.is_some())
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.state.borrow().ops.clone()
    }

    pub fn mount_count(&self) -> usize {
        self.count(|op| matches!(op, Operation::Mount { .. }))
    }

    pub fn unmount_count(&self) -> usize {
        self.count(|op| matches!(op, Operation::Unmount { .. }))
    }

    pub fn unmounts_of(&self, device: &str) -> usize {
        self.count(|op| matches!(op, Operation::Unmount { device: d } if d == device))
    }

    fn count(&self, pred: impl Fn(&Operation) -> bool) -> usize {
        self.state.borrow().ops.iter().filter(|op| pred(op)).count()
    }

    fn with_volume(&self, device: &str, f: impl FnOnce(&mut FakeVolume)) {
        let mut st = self.state.borrow_mut();
        let vol = st
            .volumes
            .iter_mut()
            .find(|v| v.desc.device == device)
            .expect("unknown fake volume");
        f(vol);
    }
}

impl DiskBackend for FakeBackend {
    fn list(&self) -> Result<Vec<VolumeDescription>> {
        Ok(self
            .state
            .borrow()
            .volumes
            .iter()
            .map(|v| v.desc.clone())
            .collect())
    }

    fn describe(&self, device: &str) -> VolumeDescription {
        self.state
            .borrow()
            .volumes
            .iter()
            .find(|v| v.desc.device == device)
            .map(|v| v.desc.clone())
            .unwrap_or_else(|| VolumeDescription::unresolved(device))
    }

    fn exists(&self, device: &str) -> bool {
        self.state
            .borrow()
            .volumes
            .iter()
            .any(|v| v.desc.device == device)
    }

    fn mount(&self, device: &str, options: &MountOptions) -> Result<(), Dissent> {
        let mut st = self.state.borrow_mut();
        st.ops.push(Operation::Mount {
            device: device.to_string(),
            read_only: options.read_only,
        });
        let vol = st
            .volumes
            .iter_mut()
            .find(|v| v.desc.device == device)
            .ok_or_else(|| Dissent::new(DissentKind::Refused, "no such device"))?;
        if let Some(kind) = vol.refuse_mount {
            return Err(Dissent::new(kind, "refused by fake"));
        }
        if !vol.lose_mount_path {
            vol.desc.mount_path = Some(vol.root.clone());
        }
        Ok(())
    }

    fn unmount(&self, device: &str) -> Result<(), Dissent> {
        let mut st = self.state.borrow_mut();
        st.ops.push(Operation::Unmount {
            device: device.to_string(),
        });
        let vol = st
            .volumes
            .iter_mut()
            .find(|v| v.desc.device == device)
            .ok_or_else(|| Dissent::new(DissentKind::Refused, "no such device"))?;
        if let Some(kind) = vol.refuse_unmount {
            return Err(Dissent::new(kind, "refused by fake"));
        }
        if vol.desc.mount_path.take().is_none() && !vol.lose_mount_path {
            return Err(Dissent::new(DissentKind::NotMounted, "not mounted"));
        }
        Ok(())
    }
}
