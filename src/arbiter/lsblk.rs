// ============================================================================
// src/arbiter/lsblk.rs – Linux backend: lsblk enumeration, mount/umount
// ============================================================================

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::{valid_device_name, DiskBackend, MountOptions};
use crate::cmd::base::{run_external, LSBLK_BINARIES, MOUNT_BINARIES, UMOUNT_BINARIES};
use crate::error::{Dissent, DissentKind};
use crate::volume::VolumeDescription;

const LSBLK_COLUMNS: &str = "NAME,TYPE,PARTTYPE,MOUNTPOINT,MODEL,LABEL,PARTLABEL,UUID";

/// JSON struct for parsing `lsblk -J`
#[derive(Debug, Deserialize, Clone)]
struct Device {
    name: Option<String>,

    #[serde(default, rename = "type")]
    kind: Option<String>,

    #[serde(default)]
    parttype: Option<String>,

    #[serde(default)]
    mountpoint: Option<String>,

    /// util-linux >= 2.37 may emit the plural form instead.
    #[serde(default)]
    mountpoints: Option<Vec<Option<String>>>,

    #[serde(default)]
    model: Option<String>,

    #[serde(default)]
    label: Option<String>,

    #[serde(default)]
    partlabel: Option<String>,

    #[serde(default)]
    uuid: Option<String>,

    #[serde(default)]
    children: Option<Vec<Device>>,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<Device>,
}

fn non_empty(s: &Option<String>) -> Option<String> {
    s.as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Flatten devices recursively; partitions inherit their disk's model.
fn flatten_devices(devs: &[Device], parent_model: Option<&str>, list: &mut Vec<VolumeDescription>) {
    for d in devs {
        let model = non_empty(&d.model).or_else(|| parent_model.map(str::to_string));
        if let Some(name) = non_empty(&d.name) {
            if d.kind.as_deref() != Some("disk") {
                let mount = non_empty(&d.mountpoint).or_else(|| {
                    d.mountpoints
                        .as_ref()
                        .and_then(|mps| mps.iter().flatten().find(|m| !m.is_empty()).cloned())
                });
                list.push(VolumeDescription {
                    device: name,
                    media_name: non_empty(&d.label).or_else(|| non_empty(&d.partlabel)),
                    model: model.clone(),
                    content: non_empty(&d.parttype).map(|t| t.to_lowercase()),
                    mount_path: mount.map(PathBuf::from),
                    uuid: non_empty(&d.uuid),
                });
            }
        }
        if let Some(ch) = &d.children {
            flatten_devices(ch, model.as_deref(), list);
        }
    }
}

fn parse_lsblk(json: &str) -> Result<Vec<VolumeDescription>> {
    let parsed: LsblkOutput = serde_json::from_str(json).context("failed to parse lsblk JSON")?;
    let mut flat = Vec::new();
    flatten_devices(&parsed.blockdevices, None, &mut flat);
    Ok(flat)
}

/// Block devices as seen through util-linux.
#[derive(Debug, Clone)]
pub struct LsblkBackend {
    mount_root: PathBuf,
    timeout: Duration,
}

impl LsblkBackend {
    pub fn new<P: AsRef<Path>>(mount_root: P, timeout: Duration) -> Self {
        Self {
            mount_root: mount_root.as_ref().to_path_buf(),
            timeout,
        }
    }

    fn mount_point(&self, device: &str) -> PathBuf {
        self.mount_root.join(device)
    }
}

impl DiskBackend for LsblkBackend {
    fn list(&self) -> Result<Vec<VolumeDescription>> {
        let out = run_external(LSBLK_BINARIES, &["-J", "-o", LSBLK_COLUMNS], self.timeout)?;
        if !out.success() {
            return Err(anyhow!("lsblk failed: {}", out.stderr.trim()));
        }
        parse_lsblk(&out.stdout)
    }

    fn describe(&self, device: &str) -> VolumeDescription {
        match self.list() {
            Ok(all) => all
                .into_iter()
                .find(|v| v.device == device)
                .unwrap_or_else(|| VolumeDescription::unresolved(device)),
            Err(err) => {
                debug!(device, "describe fell back to empty description: {err:#}");
                VolumeDescription::unresolved(device)
            }
        }
    }

    fn exists(&self, device: &str) -> bool {
        valid_device_name(device)
            && self
                .list()
                .map(|all| all.iter().any(|v| v.device == device))
                .unwrap_or(false)
    }

    fn mount(&self, device: &str, options: &MountOptions) -> Result<(), Dissent> {
        if !valid_device_name(device) {
            return Err(Dissent::new(DissentKind::Refused, "invalid device name"));
        }
        // Already attached somewhere: nothing to do.
        if self.describe(device).is_mounted() {
            return Ok(());
        }

        let target = self.mount_point(device);
        fs::create_dir_all(&target).map_err(|e| {
            Dissent::new(
                DissentKind::Refused,
                format!("create {}: {}", target.display(), e),
            )
        })?;

        let dev_path = format!("/dev/{device}");
        let target_str = target.to_string_lossy().into_owned();
        let mut args: Vec<&str> = Vec::new();
        if options.read_only {
            args.extend(["-o", "ro"]);
        }
        args.extend([dev_path.as_str(), target_str.as_str()]);

        let out = run_external(MOUNT_BINARIES, &args, self.timeout)
            .map_err(|e| Dissent::new(DissentKind::Refused, format!("{e:#}")))?;
        if !out.success() {
            let _ = fs::remove_dir(&target);
            return Err(Dissent::from_stderr(&out.stderr));
        }
        Ok(())
    }

    fn unmount(&self, device: &str) -> Result<(), Dissent> {
        if !valid_device_name(device) {
            return Err(Dissent::new(DissentKind::Refused, "invalid device name"));
        }
        let Some(path) = self.describe(device).mount_path else {
            return Err(Dissent::new(DissentKind::NotMounted, "not mounted"));
        };

        let path_str = path.to_string_lossy().into_owned();
        let out = run_external(UMOUNT_BINARIES, &[path_str.as_str()], self.timeout)
            .map_err(|e| Dissent::new(DissentKind::Refused, format!("{e:#}")))?;
        if !out.success() {
            return Err(Dissent::from_stderr(&out.stderr));
        }

        if path.starts_with(&self.mount_root) {
            if let Err(err) = fs::remove_dir(&path) {
                warn!("could not remove mount point {}: {}", path.display(), err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
       "blockdevices": [
          {"name":"sda", "type":"disk", "parttype":null, "mountpoint":null,
           "model":"Samsung SSD 860 ", "label":null, "partlabel":null, "uuid":null,
           "children": [
              {"name":"sda1", "type":"part", "parttype":"C12A7328-F81F-11D2-BA4B-00A0C93EC93B",
               "mountpoint":null, "model":null, "label":"EFI", "partlabel":"EFI System Partition",
               "uuid":"67E3-17ED"},
              {"name":"sda2", "type":"part", "parttype":"0fc63daf-8483-4772-8e79-3d69d8477de4",
               "mountpoint":"/", "model":null, "label":null, "partlabel":"root", "uuid":"abcd"}
           ]
          },
          {"name":"nvme0n1", "type":"disk", "model":"WD Blue",
           "children": [
              {"name":"nvme0n1p1", "type":"part", "parttype":"c12a7328-f81f-11d2-ba4b-00a0c93ec93b",
               "mountpoints":[null, "/boot/efi"], "label":"", "partlabel":"ESP"}
           ]
          }
       ]
    }"#;

    #[test]
    fn flattens_partitions_with_parent_model() {
        let vols = parse_lsblk(SAMPLE).unwrap();
        let names: Vec<_> = vols.iter().map(|v| v.device.as_str()).collect();
        assert_eq!(names, vec!["sda1", "sda2", "nvme0n1p1"]);

        let esp = &vols[0];
        assert_eq!(esp.model.as_deref(), Some("Samsung SSD 860"));
        assert_eq!(esp.media_name.as_deref(), Some("EFI"));
        assert_eq!(
            esp.content.as_deref(),
            Some("c12a7328-f81f-11d2-ba4b-00a0c93ec93b")
        );
        assert!(!esp.is_mounted());
        assert_eq!(esp.uuid.as_deref(), Some("67E3-17ED"));
    }

    #[test]
    fn reads_plural_mountpoints_and_falls_back_to_partlabel() {
        let vols = parse_lsblk(SAMPLE).unwrap();
        let nvme = vols.iter().find(|v| v.device == "nvme0n1p1").unwrap();
        assert_eq!(nvme.mount_path, Some(PathBuf::from("/boot/efi")));
        assert_eq!(nvme.media_name.as_deref(), Some("ESP"));
        assert_eq!(nvme.model.as_deref(), Some("WD Blue"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_lsblk("not json").is_err());
        assert!(parse_lsblk(r#"{"devices": []}"#).is_err());
    }

    #[test]
    fn invalid_names_dissent_without_spawning() {
        let backend = LsblkBackend::new("/nonexistent", Duration::from_secs(1));
        let err = backend.mount("../etc", &MountOptions::default()).unwrap_err();
        assert_eq!(err.kind, DissentKind::Refused);
        assert!(!backend.exists("sda1;reboot"));
    }
}
