// ============================================================================
// src/arbiter/session.rs – single-threaded completion queue over a backend
// ============================================================================

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use super::{valid_device_name, DiskBackend, MountOptions};
use crate::error::Dissent;
use crate::volume::{Disk, VolumeDescription};

type Completion = Box<dyn FnOnce()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

struct Watch {
    id: WatchId,
    signature: String,
    seen: HashSet<String>,
    handler: Rc<dyn Fn(Disk)>,
}

struct Inner {
    backend: Box<dyn DiskBackend>,
    pending: RefCell<VecDeque<Completion>>,
    watches: RefCell<Vec<Watch>>,
    next_watch: Cell<u64>,
}

impl Inner {
    fn watch_active(&self, id: WatchId) -> bool {
        self.watches.borrow().iter().any(|w| w.id == id)
    }
}

/// Handle to the arbitration session. Clones share the same queue.
///
/// Completions never run inside the call that scheduled them; they run one at
/// a time from [`Session::run_pending`], so handlers may freely issue the next
/// operation.
#[derive(Clone)]
pub struct Session {
    inner: Rc<Inner>,
}

impl Session {
    pub fn new(backend: impl DiskBackend + 'static) -> Self {
        Self {
            inner: Rc::new(Inner {
                backend: Box::new(backend),
                pending: RefCell::new(VecDeque::new()),
                watches: RefCell::new(Vec::new()),
                next_watch: Cell::new(1),
            }),
        }
    }

    /// Resolve a wire name to a handle, if such a device exists right now.
    pub fn disk_from_name(&self, name: &str) -> Option<Disk> {
        (valid_device_name(name) && self.inner.backend.exists(name)).then(|| Disk::new(name))
    }

    pub fn describe(&self, disk: &Disk) -> VolumeDescription {
        self.inner.backend.describe(disk.name())
    }

    pub fn mount<F>(&self, disk: &Disk, options: MountOptions, done: F)
    where
        F: FnOnce(Disk, Option<Dissent>) + 'static,
    {
        let dissent = self.inner.backend.mount(disk.name(), &options).err();
        if let Some(d) = &dissent {
            debug!(device = %disk, dissent = %d, "mount dissented");
        }
        let disk = disk.clone();
        self.post(move || done(disk, dissent));
    }

    pub fn unmount<F>(&self, disk: &Disk, done: F)
    where
        F: FnOnce(Disk, Option<Dissent>) + 'static,
    {
        let dissent = self.inner.backend.unmount(disk.name()).err();
        if let Some(d) = &dissent {
            debug!(device = %disk, dissent = %d, "unmount dissented");
        }
        let disk = disk.clone();
        self.post(move || done(disk, dissent));
    }

    /// Queue an arbitrary completion behind the ones already pending.
    pub fn post<F: FnOnce() + 'static>(&self, completion: F) {
        self.inner.pending.borrow_mut().push_back(Box::new(completion));
    }

    /// Watch for devices whose content matches `signature`. Devices already
    /// present are reported as appearing.
    pub fn register_appeared<F>(&self, signature: &str, handler: F) -> WatchId
    where
        F: Fn(Disk) + 'static,
    {
        let id = WatchId(self.inner.next_watch.get());
        self.inner.next_watch.set(id.0 + 1);
        self.inner.watches.borrow_mut().push(Watch {
            id,
            signature: signature.to_string(),
            seen: HashSet::new(),
            handler: Rc::new(handler),
        });
        self.refresh();
        id
    }

    pub fn unregister(&self, id: WatchId) -> bool {
        let mut watches = self.inner.watches.borrow_mut();
        let before = watches.len();
        watches.retain(|w| w.id != id);
        before != watches.len()
    }

    pub fn has_watches(&self) -> bool {
        !self.inner.watches.borrow().is_empty()
    }

    /// Re-enumerate devices and queue an appeared event for each one a watch
    /// has not seen yet.
    pub fn refresh(&self) {
        if !self.has_watches() {
            return;
        }
        let volumes = match self.inner.backend.list() {
            Ok(v) => v,
            Err(err) => {
                warn!("device enumeration failed: {err:#}");
                return;
            }
        };

        let mut watches = self.inner.watches.borrow_mut();
        for watch in watches.iter_mut() {
            for vol in volumes.iter().filter(|v| v.has_content(&watch.signature)) {
                if !watch.seen.insert(vol.device.clone()) {
                    continue;
                }
                let id = watch.id;
                let handler = Rc::clone(&watch.handler);
                let inner: Weak<Inner> = Rc::downgrade(&self.inner);
                let disk = Disk::new(vol.device.clone());
                self.post(move || {
                    // Unregistered watches receive nothing further.
                    if inner.upgrade().is_some_and(|i| i.watch_active(id)) {
                        handler(disk);
                    }
                });
            }
        }
    }

    /// Deliver queued completions, one at a time, until the queue is empty.
    pub fn run_pending(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.inner.pending.borrow_mut().pop_front();
            match next {
                Some(completion) => {
                    completion();
                    delivered += 1;
                }
                None => return delivered,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::fake::{FakeBackend, Operation};
    use crate::arbiter::EFI_PARTITION_GUID;
    use crate::error::DissentKind;

    #[test]
    fn completions_are_deferred_until_run() {
        let backend = FakeBackend::new();
        backend.add_efi("sda1");
        let session = Session::new(backend.clone());

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        session.mount(&Disk::new("sda1"), MountOptions::default(), move |disk, dissent| {
            sink.borrow_mut().push((disk.name().to_string(), dissent.is_none()));
        });

        assert!(seen.borrow().is_empty());
        assert_eq!(session.run_pending(), 1);
        assert_eq!(*seen.borrow(), vec![("sda1".to_string(), true)]);
        assert!(backend.is_mounted("sda1"));
    }

    #[test]
    fn handlers_may_chain_operations() {
        let backend = FakeBackend::new();
        backend.add_efi("sda1");
        let session = Session::new(backend.clone());

        let chained = session.clone();
        session.mount(&Disk::new("sda1"), MountOptions::read_only(), move |disk, _| {
            chained.unmount(&disk, |_, dissent| assert!(dissent.is_none()));
        });

        assert_eq!(session.run_pending(), 2);
        assert_eq!(
            backend.operations(),
            vec![
                Operation::Mount {
                    device: "sda1".into(),
                    read_only: true
                },
                Operation::Unmount {
                    device: "sda1".into()
                },
            ]
        );
    }

    #[test]
    fn unmounting_an_unmounted_volume_dissents() {
        let backend = FakeBackend::new();
        backend.add_efi("sda1");
        let session = Session::new(backend);

        let kind = Rc::new(Cell::new(None));
        let out = Rc::clone(&kind);
        session.unmount(&Disk::new("sda1"), move |_, dissent| {
            out.set(dissent.map(|d| d.kind));
        });
        session.run_pending();
        assert_eq!(kind.get(), Some(DissentKind::NotMounted));
    }

    #[test]
    fn watch_reports_each_matching_device_once() {
        let backend = FakeBackend::new();
        backend.add_efi("sda1");
        backend.add_volume("sda2", "0fc63daf-8483-4772-8e79-3d69d8477de4");
        let session = Session::new(backend.clone());

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let id = session.register_appeared(EFI_PARTITION_GUID, move |disk| {
            sink.borrow_mut().push(disk.name().to_string());
        });
        session.run_pending();
        session.refresh();
        session.run_pending();
        assert_eq!(*seen.borrow(), vec!["sda1".to_string()]);

        backend.add_efi("sdb1");
        session.refresh();
        session.run_pending();
        assert_eq!(*seen.borrow(), vec!["sda1".to_string(), "sdb1".to_string()]);

        assert!(session.unregister(id));
        assert!(!session.has_watches());
    }

    #[test]
    fn unregistered_watch_drops_queued_events() {
        let backend = FakeBackend::new();
        backend.add_efi("sda1");
        let session = Session::new(backend);

        let hits = Rc::new(Cell::new(0));
        let counter = Rc::clone(&hits);
        let id = session.register_appeared(EFI_PARTITION_GUID, move |_| {
            counter.set(counter.get() + 1);
        });
        session.unregister(id);
        session.run_pending();
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn unknown_names_do_not_resolve() {
        let backend = FakeBackend::new();
        backend.add_efi("sda1");
        let session = Session::new(backend);
        assert!(session.disk_from_name("sda1").is_some());
        assert!(session.disk_from_name("sdz9").is_none());
        assert!(session.disk_from_name("../sda1").is_none());
    }
}
