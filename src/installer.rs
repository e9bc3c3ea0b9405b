// ============================================================================
// src/installer.rs – Stage the loader onto one EFI partition
// ============================================================================

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::arbiter::{MountOptions, Session};
use crate::config::Payload;
use crate::error::{Dissent, DissentKind};
use crate::layout::{self, CONFIG_FILE, LOADER_FILE};
use crate::util::atomic::atomic_write_bytes;
use crate::volume::Disk;

/// `installed_path` is set exactly when `success` is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOutcome {
    pub success: bool,
    pub installed_path: Option<PathBuf>,
}

impl InstallOutcome {
    pub fn failed() -> Self {
        Self {
            success: false,
            installed_path: None,
        }
    }

    pub fn installed(path: PathBuf) -> Self {
        Self {
            success: true,
            installed_path: Some(path),
        }
    }
}

/// Bytes that end up in `EFI/BootNext`.
pub trait PayloadSource {
    fn loader(&self) -> Result<Vec<u8>>;
    fn boot_config(&self) -> Result<Vec<u8>>;
}

/// Payload shipped next to the binary.
#[derive(Debug, Clone)]
pub struct FilePayload {
    loader_path: PathBuf,
    config_path: PathBuf,
}

impl FilePayload {
    pub fn from_config(payload: &Payload) -> Self {
        Self {
            loader_path: payload.loader_path.clone(),
            config_path: payload.config_path.clone(),
        }
    }
}

impl PayloadSource for FilePayload {
    fn loader(&self) -> Result<Vec<u8>> {
        fs::read(&self.loader_path)
            .with_context(|| format!("read loader {}", self.loader_path.display()))
    }

    fn boot_config(&self) -> Result<Vec<u8>> {
        fs::read(&self.config_path)
            .with_context(|| format!("read default config {}", self.config_path.display()))
    }
}

type InstallDone = Box<dyn FnOnce(InstallOutcome)>;

struct InstallJob {
    had_error: bool,
    target_path: Option<PathBuf>,
    done: Option<InstallDone>,
}

impl InstallJob {
    fn outcome(&self) -> InstallOutcome {
        match (&self.target_path, self.had_error) {
            (Some(path), false) => InstallOutcome::installed(path.clone()),
            _ => InstallOutcome::failed(),
        }
    }

    fn finish(&mut self) {
        let outcome = self.outcome();
        if let Some(done) = self.done.take() {
            done(outcome);
        }
    }
}

#[derive(Clone)]
pub struct Installer {
    session: Session,
    payload: Rc<dyn PayloadSource>,
}

impl Installer {
    pub fn new(session: Session, payload: Rc<dyn PayloadSource>) -> Self {
        Self { session, payload }
    }

    /// Single attempt, no retry. `done` fires only once the target is
    /// unmounted again (or was never mounted by us).
    pub fn install<F>(&self, disk: &Disk, done: F)
    where
        F: FnOnce(InstallOutcome) + 'static,
    {
        let job = Rc::new(RefCell::new(InstallJob {
            had_error: false,
            target_path: None,
            done: Some(Box::new(done)),
        }));

        // Mounted by the user: install in place and leave it mounted.
        if let Some(root) = self.session.describe(disk).mount_path {
            info!(device = %disk, "installing onto already mounted {}", root.display());
            self.stage(disk, &root, &job);
            self.session.post(move || job.borrow_mut().finish());
            return;
        }

        let me = self.clone();
        self.session
            .mount(disk, MountOptions::default(), move |disk, dissent| {
                me.on_mounted(disk, dissent, job)
            });
    }

    fn on_mounted(&self, disk: Disk, dissent: Option<Dissent>, job: Rc<RefCell<InstallJob>>) {
        match (self.session.describe(&disk).mount_path, dissent) {
            (Some(root), _) => self.stage(&disk, &root, &job),
            (None, Some(d)) => {
                // Never mounted, so nothing to unmount.
                warn!(device = %disk, "could not mount install target: {d}");
                job.borrow_mut().had_error = true;
                job.borrow_mut().finish();
                return;
            }
            (None, None) => {
                warn!(device = %disk, "mount reported success but no mount path");
                job.borrow_mut().had_error = true;
            }
        }

        let me = self.clone();
        self.session.unmount(&disk, move |disk, dissent| {
            me.on_unmounted(disk, dissent, job)
        });
    }

    fn on_unmounted(&self, disk: Disk, dissent: Option<Dissent>, job: Rc<RefCell<InstallJob>>) {
        let mut job = job.borrow_mut();
        match dissent {
            None => debug!(device = %disk, "install target unmounted"),
            Some(d) if d.kind == DissentKind::NotMounted => {
                debug!(device = %disk, "install target was already unmounted")
            }
            Some(d) if job.had_error => {
                debug!(device = %disk, "ignoring unmount dissent after failed install: {d}")
            }
            Some(d) => {
                warn!(device = %disk, "unmount after install dissented: {d}");
                job.had_error = true;
            }
        }
        job.finish();
    }

    fn stage(&self, disk: &Disk, root: &Path, job: &Rc<RefCell<InstallJob>>) {
        match self.write_payload(root) {
            Ok(dir) => {
                info!(device = %disk, "staged loader in {}", dir.display());
                job.borrow_mut().target_path = Some(dir);
            }
            Err(err) => {
                warn!(device = %disk, "could not install to volume: {err:#}");
                job.borrow_mut().had_error = true;
            }
        }
    }

    fn write_payload(&self, root: &Path) -> Result<PathBuf> {
        let dir = layout::install_dir(root);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;

        let loader = self.payload.loader()?;
        atomic_write_bytes(&dir.join(LOADER_FILE), &loader, None, true)?;

        // The user's boot entries live here; only seed it.
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            debug!("keeping existing {}", config_path.display());
        } else {
            let config = self.payload.boot_config()?;
            atomic_write_bytes(&config_path, &config, None, false)?;
        }
        Ok(dir)
    }
}
