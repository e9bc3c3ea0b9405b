// ============================================================================
// src/server.rs – Privileged call server: authorize, dispatch, push notices
// ============================================================================

use std::cell::RefCell;
use std::fs;
use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::arbiter::Session;
use crate::auth::Gateway;
use crate::installer::{InstallOutcome, Installer, PayloadSource};
use crate::mounter::Mounter;
use crate::protocol::{to_line, Call, EfiListing, Message, Notice, Reply, Request, MAX_LINE};
use crate::scanner::Scanner;
use crate::util::audit::AuditTrail;

/// Where a connection's messages go.
pub trait Peer {
    fn send(&self, message: &Message) -> io::Result<()>;
}

pub type PeerRef = Rc<dyn Peer>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Answers exactly one request.
struct Responder {
    peer: PeerRef,
    id: u64,
}

impl Responder {
    fn reply(self, reply: Reply) {
        let message = Message::Reply { id: self.id, reply };
        if let Err(err) = self.peer.send(&message) {
            debug!(id = self.id, "reply dropped: {err}");
        }
    }
}

/// The single push-notice slot.
#[derive(Default)]
pub struct Subscriptions {
    current: Option<(ConnectionId, PeerRef)>,
}

impl Subscriptions {
    pub fn subscribe(&mut self, conn: ConnectionId, peer: PeerRef) {
        if let Some((old, _)) = self.current.replace((conn, peer)) {
            if old != conn {
                debug!(old = old.0, new = conn.0, "subscriber replaced");
            }
        }
    }

    pub fn connection_lost(&mut self, conn: ConnectionId) {
        if self.subscriber() == Some(conn) {
            debug!(conn = conn.0, "subscriber went away");
            self.current = None;
        }
    }

    pub fn subscriber(&self) -> Option<ConnectionId> {
        self.current.as_ref().map(|(id, _)| *id)
    }

    /// Deliver to the subscriber, if any. Nothing is queued for later.
    pub fn notify(&mut self, notice: Notice) {
        let Some((conn, peer)) = &self.current else {
            debug!("no subscriber; notice dropped");
            return;
        };
        if let Err(err) = peer.send(&Message::Notice(notice)) {
            warn!(conn = conn.0, "subscriber unreachable, clearing: {err}");
            self.current = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Shutdown,
}

/// Worker-side handler shared by every connection.
pub struct Worker {
    version: String,
    gateway: Gateway,
    session: Session,
    scanner: Scanner,
    installer: Installer,
    mounter: Mounter,
    subscriptions: Rc<RefCell<Subscriptions>>,
    audit: AuditTrail,
}

impl Worker {
    pub fn new(
        session: Session,
        gateway: Gateway,
        payload: Rc<dyn PayloadSource>,
        audit: AuditTrail,
    ) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            gateway,
            scanner: Scanner::new(session.clone()),
            installer: Installer::new(session.clone(), payload),
            mounter: Mounter::new(session.clone()),
            session,
            subscriptions: Rc::new(RefCell::new(Subscriptions::default())),
            audit,
        }
    }

    /// Report a different version, to exercise the client's version handshake.
    #[cfg(test)]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn subscriber(&self) -> Option<ConnectionId> {
        self.subscriptions.borrow().subscriber()
    }

    /// Handle one request. Denied calls vanish: no reply, no side effect.
    pub fn dispatch(&self, conn: ConnectionId, peer: PeerRef, request: Request) -> Control {
        let Request { id, call } = request;
        let name = call.name();

        if let Some(scope) = call.required_scope() {
            let token = call.auth().unwrap_or_default();
            if !self.gateway.authorize(token, scope) {
                warn!(call = name, %scope, conn = conn.0, "call denied");
                self.audit
                    .record("CALL_DENIED", &format!("{name} conn={}", conn.0));
                return Control::Continue;
            }
        }
        debug!(call = name, id, conn = conn.0, "dispatching");

        let responder = Responder {
            peer: Rc::clone(&peer),
            id,
        };
        match call {
            Call::GetVersion => responder.reply(Reply::Version {
                version: self.version.clone(),
            }),

            Call::StartAccumulateDisks { .. } => {
                info!("accumulating EFI partitions");
                self.scanner.register();
            }

            Call::FindEfi { .. } => {
                // Joined requests share one result; only the first one notifies.
                let leader = !self.scanner.is_scanning();
                let subs = Rc::clone(&self.subscriptions);
                self.scanner.scan_disks(move |result| {
                    let listing = EfiListing::from(&result);
                    responder.reply(Reply::FoundEfi(listing.clone()));
                    if leader {
                        subs.borrow_mut().notify(Notice::ScanFinished(listing));
                    }
                });
            }

            Call::InstallToEfi { target, .. } => {
                let Some(disk) = self.session.disk_from_name(&target) else {
                    warn!(device = %target, "install target not found");
                    self.audit
                        .record("INSTALL_FAIL", &format!("{target}: no such device"));
                    responder.reply(Reply::Installed(InstallOutcome::failed()));
                    return Control::Continue;
                };
                let subs = Rc::clone(&self.subscriptions);
                let audit = self.audit.clone();
                self.installer.install(&disk, move |outcome| {
                    let Some(path) = outcome.installed_path.clone() else {
                        audit.record("INSTALL_FAIL", &target);
                        responder.reply(Reply::Installed(outcome));
                        return;
                    };
                    audit.record("INSTALL_OK", &format!("{target} -> {}", path.display()));
                    responder.reply(Reply::Installed(outcome));
                    subs.borrow_mut()
                        .notify(Notice::Installed { target, path });
                });
            }

            Call::MountEfi { target, .. } => {
                let Some(disk) = self.session.disk_from_name(&target) else {
                    warn!(device = %target, "mount target not found");
                    responder.reply(Reply::Mounted { success: false });
                    return Control::Continue;
                };
                let audit = self.audit.clone();
                self.mounter.mount(&disk, move |success| {
                    audit.record("MOUNT", &format!("{target} success={success}"));
                    responder.reply(Reply::Mounted { success });
                });
            }

            Call::Subscribe { .. } => {
                self.subscriptions.borrow_mut().subscribe(conn, peer);
                self.audit.record("SUBSCRIBE", &format!("conn={}", conn.0));
                responder.reply(Reply::Subscribed);
            }

            Call::Stop { .. } => {
                info!(conn = conn.0, "stop requested");
                self.audit.record("STOP", &format!("conn={}", conn.0));
                return Control::Shutdown;
            }
        }
        Control::Continue
    }

    pub fn connection_lost(&self, conn: ConnectionId) {
        debug!(conn = conn.0, "connection closed");
        self.subscriptions.borrow_mut().connection_lost(conn);
    }
}

/// Peer backed by the write half of a client socket.
struct SocketPeer {
    stream: UnixStream,
}

impl Peer for SocketPeer {
    fn send(&self, message: &Message) -> io::Result<()> {
        let line = to_line(message).map_err(io::Error::other)?;
        (&self.stream).write_all(line.as_bytes())
    }
}

/// Complete lines read this tick. `closed` means the peer is gone; the
/// lines it sent before going are still dispatched.
struct Polled {
    lines: Vec<String>,
    closed: bool,
}

struct Connection {
    id: ConnectionId,
    stream: UnixStream,
    peer: Rc<SocketPeer>,
    buf: Vec<u8>,
}

impl Connection {
    fn open(id: ConnectionId, stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(Duration::from_millis(1)))?;
        stream.set_write_timeout(Some(Duration::from_secs(5)))?;
        let writer = stream.try_clone()?;
        Ok(Self {
            id,
            stream,
            peer: Rc::new(SocketPeer { stream: writer }),
            buf: Vec::new(),
        })
    }

    fn poll(&mut self) -> Polled {
        let mut chunk = [0u8; 4096];
        let mut closed = false;
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn = self.id.0, "read failed: {e}");
                    closed = true;
                    break;
                }
            }
        }

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            push_line(&mut lines, &raw);
        }
        if self.buf.len() > MAX_LINE {
            warn!(conn = self.id.0, "request line too long; dropping connection");
            self.buf.clear();
            return Polled { lines, closed: true };
        }
        if closed {
            // An unterminated final request still counts.
            let rest = std::mem::take(&mut self.buf);
            push_line(&mut lines, &rest);
        }
        Polled { lines, closed }
    }
}

fn push_line(lines: &mut Vec<String>, raw: &[u8]) {
    let line = String::from_utf8_lossy(raw).trim().to_string();
    if !line.is_empty() {
        lines.push(line);
    }
}

/// The worker's socket and poll loop.
pub struct Listener {
    socket_path: PathBuf,
    listener: UnixListener,
    tick: Duration,
    rescan: Duration,
}

impl Listener {
    pub fn bind<P: AsRef<Path>>(socket_path: P) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        if let Some(dir) = socket_path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("create socket dir {}", dir.display()))?;
        }
        if fs::symlink_metadata(&socket_path).is_ok() {
            debug!("removing stale socket {}", socket_path.display());
            fs::remove_file(&socket_path)
                .with_context(|| format!("remove stale socket {}", socket_path.display()))?;
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("bind {}", socket_path.display()))?;
        listener.set_nonblocking(true)?;
        // Any local user may connect; calls are gated by tokens.
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o666))
            .with_context(|| format!("chmod {}", socket_path.display()))?;

        Ok(Self {
            socket_path,
            listener,
            tick: Duration::from_millis(25),
            rescan: Duration::from_millis(2000),
        })
    }

    pub fn with_timing(mut self, tick: Duration, rescan: Duration) -> Self {
        self.tick = tick;
        self.rescan = rescan;
        self
    }

    /// Serve until a `stop` call is authorized.
    pub fn run(self, worker: &Worker) -> Result<()> {
        info!(socket = %self.socket_path.display(), "worker listening");

        let mut conns: Vec<Connection> = Vec::new();
        let mut next_id = 1u64;
        let mut last_refresh = Instant::now();

        'serve: loop {
            // ---- Step 1: accept new connections
            loop {
                match self.listener.accept() {
                    Ok((stream, _)) => {
                        let id = ConnectionId(next_id);
                        next_id += 1;
                        match Connection::open(id, stream) {
                            Ok(conn) => {
                                debug!(conn = id.0, "client connected");
                                conns.push(conn);
                            }
                            Err(err) => warn!("could not set up connection: {err}"),
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        break;
                    }
                }
            }

            // ---- Step 2: read and dispatch requests
            let mut closed = Vec::new();
            let mut shutdown = false;
            for conn in conns.iter_mut() {
                let Polled { lines, closed: gone } = conn.poll();
                if gone {
                    closed.push(conn.id);
                }
                for line in lines {
                    let request: Request = match serde_json::from_str(&line) {
                        Ok(r) => r,
                        Err(err) => {
                            warn!(conn = conn.id.0, "malformed request skipped: {err}");
                            continue;
                        }
                    };
                    let peer: PeerRef = conn.peer.clone();
                    if worker.dispatch(conn.id, peer, request) == Control::Shutdown {
                        shutdown = true;
                        break;
                    }
                }
                if shutdown {
                    break;
                }
            }
            if shutdown {
                break 'serve;
            }
            if !closed.is_empty() {
                conns.retain(|c| !closed.contains(&c.id));
                for id in closed {
                    worker.connection_lost(id);
                }
            }

            // ---- Step 3: deliver device completions
            worker.session().run_pending();

            // ---- Step 4: pick up hot-plugged partitions
            if last_refresh.elapsed() >= self.rescan {
                worker.session().refresh();
                last_refresh = Instant::now();
            }

            thread::sleep(self.tick);
        }

        info!("worker stopping");
        // Unlink before clients see EOF, so a successor may bind right away.
        if let Err(err) = fs::remove_file(&self.socket_path) {
            debug!("could not remove socket: {err}");
        }
        for conn in &conns {
            worker.connection_lost(conn.id);
            if let Err(err) = conn.stream.shutdown(Shutdown::Both) {
                debug!(conn = conn.id.0, "shutdown failed: {err}");
            }
        }
        Ok(())
    }
}


/// In-thread worker on a real socket, backed by a fake disk backend.
#[cfg(test)]
pub(crate) mod harness {
    use super::*;
    use crate::arbiter::fake::FakeBackend;
    use crate::auth::GrantStore;
    use std::thread::JoinHandle;

    pub(crate) struct TestPayload;

    impl PayloadSource for TestPayload {
        fn loader(&self) -> anyhow::Result<Vec<u8>> {
            Ok(b"loader".to_vec())
        }
        fn boot_config(&self) -> anyhow::Result<Vec<u8>> {
            Ok(b"config".to_vec())
        }
    }

    /// `setup` runs on the worker thread, since the fake backend is not `Send`.
    pub(crate) fn spawn_worker(
        socket: &Path,
        grants: &Path,
        version: &str,
        setup: impl FnOnce(&FakeBackend) + Send + 'static,
    ) -> JoinHandle<Result<()>> {
        let listener = Listener::bind(socket)
            .unwrap()
            .with_timing(Duration::from_millis(2), Duration::from_millis(50));
        let grants = grants.to_path_buf();
        let version = version.to_string();
        thread::spawn(move || {
            let backend = FakeBackend::new();
            setup(&backend);
            let worker = Worker::new(
                Session::new(backend),
                Gateway::verifier(Rc::new(GrantStore::for_current_user(&grants))),
                Rc::new(TestPayload),
                AuditTrail::disabled(),
            )
            .with_version(version);
            listener.run(&worker)
        })
    }
}
