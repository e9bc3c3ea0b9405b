// ============================================================================
// src/mounter.rs – One-shot mount of a single volume
// ============================================================================

use tracing::{info, warn};

use crate::arbiter::{MountOptions, Session};
use crate::volume::Disk;

/// Mounts one volume and leaves it mounted for the user.
#[derive(Clone)]
pub struct Mounter {
    session: Session,
}

impl Mounter {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// `done(true)` iff a mount path shows up afterwards. Every failure
    /// collapses to `false`.
    pub fn mount<F>(&self, disk: &Disk, done: F)
    where
        F: FnOnce(bool) + 'static,
    {
        let session = self.session.clone();
        self.session
            .mount(disk, MountOptions::default(), move |disk, dissent| {
                if let Some(d) = dissent {
                    warn!(device = %disk, "mount dissented: {d}");
                }
                match session.describe(&disk).mount_path {
                    Some(path) => {
                        info!(device = %disk, "mounted at {}", path.display());
                        done(true)
                    }
                    None => done(false),
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::fake::FakeBackend;
    use crate::error::DissentKind;
    use std::cell::Cell;
    use std::rc::Rc;

    fn run(backend: &FakeBackend, device: &str) -> Option<bool> {
        let session = Session::new(backend.clone());
        let mounter = Mounter::new(session.clone());
        let out = Rc::new(Cell::new(None));
        let sink = Rc::clone(&out);
        mounter.mount(&Disk::new(device), move |ok| sink.set(Some(ok)));
        assert_eq!(out.get(), None);
        session.run_pending();
        out.get()
    }

    #[test]
    fn reports_success_and_stays_mounted() {
        let backend = FakeBackend::new();
        backend.add_efi("sda1");
        assert_eq!(run(&backend, "sda1"), Some(true));
        assert!(backend.is_mounted("sda1"));
        assert_eq!(backend.unmount_count(), 0);
    }

    #[test]
    fn dissent_collapses_to_false() {
        let backend = FakeBackend::new();
        backend.add_efi("sda1");
        backend.refuse_mount("sda1", DissentKind::Busy);
        assert_eq!(run(&backend, "sda1"), Some(false));
        assert_eq!(backend.unmount_count(), 0);
    }

    #[test]
    fn success_without_path_is_false() {
        let backend = FakeBackend::new();
        backend.add_efi("sda1");
        backend.lose_mount_path("sda1");
        assert_eq!(run(&backend, "sda1"), Some(false));
    }
}
