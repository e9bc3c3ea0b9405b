// ============================================================================
// src/scanner.rs – Sequential EFI discovery: mount, look for marker, unmount
// ============================================================================

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::Path;
use std::rc::Rc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::arbiter::{MountOptions, Session, WatchId, EFI_PARTITION_GUID};
use crate::error::{Dissent, DissentKind};
use crate::layout;
use crate::volume::{Disk, VolumeDescription};

/// Outcome of one scan cycle. `installed` is a subset of `candidates`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    pub installed: Vec<VolumeDescription>,
    pub candidates: Vec<VolumeDescription>,
}

impl ScanResult {
    pub fn installed_names(&self) -> Vec<String> {
        self.installed.iter().map(|v| v.device.clone()).collect()
    }

    pub fn candidate_names(&self) -> Vec<String> {
        self.candidates.iter().map(|v| v.device.clone()).collect()
    }
}

type ScanListener = Box<dyn FnOnce(ScanResult)>;

#[derive(Default)]
struct ScanState {
    /// Everything the appeared-watch reported since the last `register`.
    scan_list: Vec<Disk>,
    /// Work queue of the scan in flight.
    pending: VecDeque<Disk>,
    snapshot: Vec<Disk>,
    found: Vec<Disk>,
    scanning: bool,
    watch: Option<WatchId>,
    listeners: Vec<ScanListener>,
}

/// Finds EFI partitions and tells which of them already carry an installation.
///
/// Only one device is ever in flight: the next mount is issued from the
/// previous unmount's completion.
#[derive(Clone)]
pub struct Scanner {
    session: Session,
    state: Rc<RefCell<ScanState>>,
}

impl Scanner {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            state: Rc::new(RefCell::new(ScanState::default())),
        }
    }

    /// Start accumulating EFI partitions, forgetting earlier ones.
    pub fn register(&self) {
        self.unregister();
        self.state.borrow_mut().scan_list.clear();

        let weak = Rc::downgrade(&self.state);
        let id = self
            .session
            .register_appeared(EFI_PARTITION_GUID, move |disk: Disk| {
                let Some(state) = weak.upgrade() else { return };
                let mut st = state.borrow_mut();
                if !st.scan_list.contains(&disk) {
                    debug!(device = %disk, "EFI partition appeared");
                    st.scan_list.push(disk);
                }
            });
        self.state.borrow_mut().watch = Some(id);
    }

    pub fn unregister(&self) {
        let watch = self.state.borrow_mut().watch.take();
        if let Some(id) = watch {
            self.session.unregister(id);
        }
    }

    #[cfg(test)]
    pub fn is_registered(&self) -> bool {
        self.state.borrow().watch.is_some()
    }

    pub fn is_scanning(&self) -> bool {
        self.state.borrow().scanning
    }

    /// Scan every accumulated partition and hand the result to `listener`.
    ///
    /// A call while a scan is running joins it instead of starting another.
    pub fn scan_disks<F>(&self, listener: F)
    where
        F: FnOnce(ScanResult) + 'static,
    {
        {
            let mut st = self.state.borrow_mut();
            st.listeners.push(Box::new(listener));
            if st.scanning {
                debug!("scan already in flight; joining it");
                return;
            }
            st.scanning = true;
        }

        self.unregister();

        let count = {
            let mut st = self.state.borrow_mut();
            st.found.clear();
            st.snapshot = st.scan_list.clone();
            st.pending = st.snapshot.iter().cloned().collect();
            st.pending.len()
        };
        info!(count, "scanning EFI partitions");
        self.scan_next();
    }

    fn scan_next(&self) {
        let next = self.state.borrow_mut().pending.pop_front();
        let Some(disk) = next else {
            self.finish();
            return;
        };

        // Someone else's mount: look, but leave it as it is.
        if let Some(path) = self.session.describe(&disk).mount_path {
            debug!(device = %disk, "already mounted; inspecting in place");
            self.inspect(&disk, &path);
            let me = self.clone();
            self.session.post(move || me.scan_next());
            return;
        }

        let me = self.clone();
        self.session
            .mount(&disk, MountOptions::read_only(), move |disk, dissent| {
                me.on_mounted(disk, dissent)
            });
    }

    fn on_mounted(&self, disk: Disk, dissent: Option<Dissent>) {
        match dissent {
            Some(d) => warn!(device = %disk, "could not mount EFI partition, skipping: {d}"),
            None => match self.session.describe(&disk).mount_path {
                Some(path) => self.inspect(&disk, &path),
                None => warn!(device = %disk, "mount reported success but no mount path"),
            },
        }

        let me = self.clone();
        self.session
            .unmount(&disk, move |disk, dissent| me.on_unmounted(disk, dissent));
    }

    fn on_unmounted(&self, disk: Disk, dissent: Option<Dissent>) {
        match dissent {
            None => {}
            Some(d) if d.kind == DissentKind::NotMounted => {
                debug!(device = %disk, "nothing to unmount")
            }
            Some(d) => warn!(device = %disk, "unmount after scan dissented: {d}"),
        }
        self.scan_next();
    }

    fn inspect(&self, disk: &Disk, root: &Path) {
        match layout::marker_dir(root) {
            Some(dir) => {
                info!(device = %disk, "found installation in {}", dir.display());
                self.state.borrow_mut().found.push(disk.clone());
            }
            None => debug!(device = %disk, "no installation on {}", root.display()),
        }
    }

    fn finish(&self) {
        let (found, snapshot, listeners) = {
            let mut st = self.state.borrow_mut();
            st.scanning = false;
            (
                std::mem::take(&mut st.found),
                st.snapshot.clone(),
                std::mem::take(&mut st.listeners),
            )
        };

        let result = ScanResult {
            installed: found.iter().map(|d| self.session.describe(d)).collect(),
            candidates: snapshot.iter().map(|d| self.session.describe(d)).collect(),
        };
        info!(
            installed = result.installed.len(),
            candidates = result.candidates.len(),
            "scan finished"
        );

        self.session.post(move || {
            for listener in listeners {
                listener(result.clone());
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::fake::FakeBackend;

    fn collect(scanner: &Scanner) -> Rc<RefCell<Vec<ScanResult>>> {
        let results = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&results);
        scanner.scan_disks(move |r| sink.borrow_mut().push(r));
        results
    }

    fn armed(backend: &FakeBackend) -> (Session, Scanner) {
        let session = Session::new(backend.clone());
        let scanner = Scanner::new(session.clone());
        scanner.register();
        session.run_pending();
        (session, scanner)
    }

    #[test]
    fn three_devices_two_installed() {
        let backend = FakeBackend::new();
        backend.add_installed_efi("sda1");
        backend.add_efi("sdb1");
        backend.add_installed_efi("sdc1");
        backend.add_volume("sda2", "0fc63daf-8483-4772-8e79-3d69d8477de4");
        let (session, scanner) = armed(&backend);

        let results = collect(&scanner);
        session.run_pending();

        let results = results.borrow();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].installed_names(), vec!["sda1", "sdc1"]);
        assert_eq!(results[0].candidate_names(), vec!["sda1", "sdb1", "sdc1"]);

        assert_eq!(backend.mount_count(), 3);
        assert_eq!(backend.unmount_count(), 3);
        for dev in ["sda1", "sdb1", "sdc1"] {
            assert!(!backend.is_mounted(dev));
        }
        assert!(!scanner.is_registered());
    }

    #[test]
    fn mount_dissent_still_unmounts_and_continues() {
        let backend = FakeBackend::new();
        backend.add_installed_efi("sda1");
        backend.add_installed_efi("sdb1");
        backend.refuse_mount("sda1", DissentKind::Unrecognized);
        let (session, scanner) = armed(&backend);

        let results = collect(&scanner);
        session.run_pending();

        let result = results.borrow()[0].clone();
        assert_eq!(result.installed_names(), vec!["sdb1"]);
        assert_eq!(result.candidate_names(), vec!["sda1", "sdb1"]);
        assert_eq!(backend.unmounts_of("sda1"), 1);
        assert_eq!(backend.mount_count(), backend.unmount_count());
    }

    #[test]
    fn installed_is_subset_of_candidates_even_when_unmount_refused() {
        let backend = FakeBackend::new();
        backend.add_installed_efi("sda1");
        backend.add_efi("sdb1");
        backend.refuse_unmount("sda1", DissentKind::Busy);
        let (session, scanner) = armed(&backend);

        let results = collect(&scanner);
        session.run_pending();

        let result = results.borrow()[0].clone();
        let candidates = result.candidate_names();
        assert!(result
            .installed_names()
            .iter()
            .all(|n| candidates.contains(n)));
        assert_eq!(result.candidate_names(), vec!["sda1", "sdb1"]);
    }

    #[test]
    fn rescan_gives_same_partition() {
        let backend = FakeBackend::new();
        backend.add_installed_efi("sda1");
        backend.add_efi("sdb1");
        let (session, scanner) = armed(&backend);

        let first = collect(&scanner);
        session.run_pending();
        let second = collect(&scanner);
        session.run_pending();

        assert_eq!(first.borrow()[0], second.borrow()[0]);
        assert_eq!(backend.mount_count(), 4);
        assert_eq!(backend.unmount_count(), 4);
    }

    #[test]
    fn concurrent_request_joins_running_scan() {
        let backend = FakeBackend::new();
        backend.add_installed_efi("sda1");
        backend.add_efi("sdb1");
        let (session, scanner) = armed(&backend);

        let first = collect(&scanner);
        assert!(scanner.is_scanning());
        let second = collect(&scanner);
        session.run_pending();

        assert_eq!(first.borrow().len(), 1);
        assert_eq!(second.borrow().len(), 1);
        assert_eq!(first.borrow()[0], second.borrow()[0]);
        assert_eq!(backend.mount_count(), 2);
        assert!(!scanner.is_scanning());
    }

    #[test]
    fn premounted_volume_is_inspected_in_place() {
        let backend = FakeBackend::new();
        backend.add_installed_efi("sda1");
        backend.add_efi("sdb1");
        backend.premount("sda1");
        let (session, scanner) = armed(&backend);

        let results = collect(&scanner);
        session.run_pending();

        assert_eq!(results.borrow()[0].installed_names(), vec!["sda1"]);
        assert!(backend.is_mounted("sda1"));
        assert_eq!(backend.unmounts_of("sda1"), 0);
        assert_eq!(backend.mount_count(), backend.unmount_count());
    }

    #[test]
    fn nothing_registered_finishes_empty() {
        let backend = FakeBackend::new();
        backend.add_installed_efi("sda1");
        let session = Session::new(backend.clone());
        let scanner = Scanner::new(session.clone());

        let results = collect(&scanner);
        assert!(results.borrow().is_empty());
        session.run_pending();

        assert_eq!(results.borrow()[0], ScanResult::default());
        assert!(backend.operations().is_empty());
    }

    #[test]
    fn register_restarts_accumulation() {
        let backend = FakeBackend::new();
        backend.add_efi("sda1");
        let (session, scanner) = armed(&backend);

        scanner.register();
        scanner.unregister();
        session.run_pending();

        let results = collect(&scanner);
        session.run_pending();
        assert!(results.borrow()[0].candidates.is_empty());
    }
}
