// ============================================================================
// src/client.rs – Front-end proxy for the worker's call surface
// ============================================================================

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::auth::Gateway;
use crate::config::ConfigFile;
use crate::error::ClientError;
use crate::installer::InstallOutcome;
use crate::protocol::{to_line, Call, EfiListing, Message, Notice, Reply, Request, MAX_LINE};
use crate::service::WorkerService;

type ReplyHandler = Box<dyn FnOnce(Result<Reply, ClientError>)>;
type NoticeHandler = Box<dyn FnMut(Notice)>;

/// The version this front-end expects to talk to.
pub const EXPECTED_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub socket_path: PathBuf,
    pub reply_timeout: Duration,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
}

impl ClientSettings {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        Self {
            socket_path: cfg.worker.socket_path.clone(),
            reply_timeout: cfg.client.reply_timeout(),
            connect_attempts: cfg.client.connect_attempts.max(1),
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// One connection to the worker. Calls return at once; results arrive through
/// their callbacks while [`WorkerClient::pump`] runs.
pub struct WorkerClient {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
    line: String,
    gateway: Rc<Gateway>,
    next_id: u64,
    pending: BTreeMap<u64, ReplyHandler>,
    deferred: VecDeque<Box<dyn FnOnce()>>,
    on_notice: Option<NoticeHandler>,
    lost: bool,
}

fn unexpected(reply: Reply) -> ClientError {
    ClientError::Protocol(format!("unexpected reply {reply:?}"))
}

impl WorkerClient {
    pub fn connect<P: AsRef<Path>>(socket: P, gateway: Rc<Gateway>) -> Result<Self, ClientError> {
        let writer = UnixStream::connect(socket.as_ref())?;
        let reader = BufReader::new(writer.try_clone()?);
        Ok(Self {
            writer,
            reader,
            line: String::new(),
            gateway,
            next_id: 1,
            pending: BTreeMap::new(),
            deferred: VecDeque::new(),
            on_notice: None,
            lost: false,
        })
    }

    pub fn is_connected(&self) -> bool {
        !self.lost
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.deferred.is_empty()
    }

    // ---- calls ------------------------------------------------------------

    pub fn get_version<F>(&mut self, done: F)
    where
        F: FnOnce(Result<String, ClientError>) + 'static,
    {
        self.request(
            Ok(Call::GetVersion),
            Box::new(move |r| {
                done(r.and_then(|reply| match reply {
                    Reply::Version { version } => Ok(version),
                    other => Err(unexpected(other)),
                }))
            }),
        );
    }

    /// Arm accumulation of EFI partitions. The worker never answers this.
    pub fn start_accumulate_disks(&mut self) -> Result<(), ClientError> {
        let auth = self.token()?;
        self.write_request(Call::StartAccumulateDisks { auth })
            .map(|_| ())
    }

    pub fn find_efi<F>(&mut self, done: F)
    where
        F: FnOnce(Result<EfiListing, ClientError>) + 'static,
    {
        let call = self.token().map(|auth| Call::FindEfi { auth });
        self.request(
            call,
            Box::new(move |r| {
                done(r.and_then(|reply| match reply {
                    Reply::FoundEfi(listing) => Ok(listing),
                    other => Err(unexpected(other)),
                }))
            }),
        );
    }

    pub fn install_to_efi<F>(&mut self, target: &str, done: F)
    where
        F: FnOnce(Result<InstallOutcome, ClientError>) + 'static,
    {
        let call = self.token().map(|auth| Call::InstallToEfi {
            target: target.to_string(),
            auth,
        });
        self.request(
            call,
            Box::new(move |r| {
                done(r.and_then(|reply| match reply {
                    Reply::Installed(outcome) => Ok(outcome),
                    other => Err(unexpected(other)),
                }))
            }),
        );
    }

    pub fn mount_efi<F>(&mut self, target: &str, done: F)
    where
        F: FnOnce(Result<bool, ClientError>) + 'static,
    {
        let call = self.token().map(|auth| Call::MountEfi {
            target: target.to_string(),
            auth,
        });
        self.request(
            call,
            Box::new(move |r| {
                done(r.and_then(|reply| match reply {
                    Reply::Mounted { success } => Ok(success),
                    other => Err(unexpected(other)),
                }))
            }),
        );
    }

    /// Become the worker's push-notice subscriber.
    pub fn subscribe<N, F>(&mut self, on_notice: N, done: F)
    where
        N: FnMut(Notice) + 'static,
        F: FnOnce(Result<(), ClientError>) + 'static,
    {
        self.on_notice = Some(Box::new(on_notice));
        let call = self.token().map(|auth| Call::Subscribe { auth });
        self.request(
            call,
            Box::new(move |r| {
                done(r.and_then(|reply| match reply {
                    Reply::Subscribed => Ok(()),
                    other => Err(unexpected(other)),
                }))
            }),
        );
    }

    /// Ask the worker to exit. Never answered; the connection closes instead.
    pub fn stop(&mut self) -> Result<(), ClientError> {
        let auth = self.token()?;
        self.write_request(Call::Stop { auth }).map(|_| ())
    }

    // ---- plumbing ---------------------------------------------------------

    fn token(&self) -> Result<String, ClientError> {
        Ok(self.gateway.mint()?.to_external())
    }

    fn write_request(&mut self, call: Call) -> Result<u64, ClientError> {
        if self.lost {
            return Err(ClientError::ConnectionLost);
        }
        let id = self.next_id;
        self.next_id += 1;

        let line = to_line(&Request { id, call }).map_err(|e| ClientError::Protocol(e.to_string()))?;
        if let Err(err) = self.writer.write_all(line.as_bytes()) {
            debug!("write to worker failed: {err}");
            self.mark_lost();
            return Err(ClientError::ConnectionLost);
        }
        Ok(id)
    }

    fn request(&mut self, call: Result<Call, ClientError>, handler: ReplyHandler) {
        match call.and_then(|c| self.write_request(c)) {
            Ok(id) => {
                self.pending.insert(id, handler);
            }
            Err(err) => self.deferred.push_back(Box::new(move || handler(Err(err)))),
        }
    }

    fn mark_lost(&mut self) {
        if !self.lost {
            info!("connection to worker lost");
        }
        self.lost = true;
        for (_, handler) in std::mem::take(&mut self.pending) {
            self.deferred
                .push_back(Box::new(move || handler(Err(ClientError::ConnectionLost))));
        }
    }

    fn run_deferred(&mut self) -> usize {
        let mut n = 0;
        while let Some(f) = self.deferred.pop_front() {
            f();
            n += 1;
        }
        n
    }

    fn handle_line(&mut self, line: &str) {
        match serde_json::from_str::<Message>(line) {
            Ok(Message::Reply { id, reply }) => match self.pending.remove(&id) {
                Some(handler) => handler(Ok(reply)),
                None => debug!(id, "reply for unknown request"),
            },
            Ok(Message::Notice(notice)) => match self.on_notice.as_mut() {
                Some(cb) => cb(notice),
                None => debug!("notice without subscription: {notice:?}"),
            },
            Err(err) => warn!("malformed message from worker: {err}"),
        }
    }

    /// Wait up to `timeout` for one message from the worker and deliver
    /// whatever became ready. Returns how many events were delivered.
    pub fn pump(&mut self, timeout: Duration) -> usize {
        let mut delivered = self.run_deferred();
        if self.lost || delivered > 0 {
            return delivered;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            if let Err(err) = self.reader.get_ref().set_read_timeout(Some(remaining)) {
                debug!("cannot set read timeout: {err}");
            }
            match self.reader.read_line(&mut self.line) {
                Ok(0) => {
                    self.mark_lost();
                    break;
                }
                Ok(_) if self.line.ends_with('\n') => {
                    let line = std::mem::take(&mut self.line);
                    self.handle_line(line.trim());
                    delivered += 1;
                    break;
                }
                Ok(_) => {}
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("read from worker failed: {e}");
                    self.mark_lost();
                    break;
                }
            }
            if self.line.len() > MAX_LINE {
                warn!("worker sent an oversized line; dropping connection");
                self.mark_lost();
                break;
            }
        }

        delivered + self.run_deferred()
    }

    /// Fail every outstanding call with `TimedOut`.
    fn expire_pending(&mut self) {
        for (_, handler) in std::mem::take(&mut self.pending) {
            self.deferred
                .push_back(Box::new(move || handler(Err(ClientError::TimedOut))));
        }
        self.run_deferred();
    }

    /// Pump until every issued call has completed, or expire them at the
    /// deadline. A denied call is only ever observed this way.
    pub fn wait_idle(&mut self, timeout: Duration) -> Result<(), ClientError> {
        let deadline = Instant::now() + timeout;
        while self.has_pending() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.expire_pending();
                return Err(ClientError::TimedOut);
            }
            self.pump(remaining);
        }
        Ok(())
    }

    /// Issue one call and block on its result.
    pub fn wait_for<T, I>(&mut self, timeout: Duration, issue: I) -> Result<T, ClientError>
    where
        T: 'static,
        I: FnOnce(&mut Self, Box<dyn FnOnce(Result<T, ClientError>)>),
    {
        let slot: Rc<RefCell<Option<Result<T, ClientError>>>> = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&slot);
        issue(self, Box::new(move |r| *sink.borrow_mut() = Some(r)));

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = slot.borrow_mut().take() {
                return result;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.expire_pending();
                if let Some(result) = slot.borrow_mut().take() {
                    return result;
                }
                return Err(ClientError::TimedOut);
            }
            self.pump(remaining);
        }
    }

    /// Block until the worker closes the connection.
    pub fn wait_closed(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.lost {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.pump(remaining);
        }
        true
    }

    /// `Ok(true)` when the worker matches `expected`. Otherwise the worker is
    /// told to stop and `Ok(false)` is returned once it has gone away.
    pub fn check_worker_recent(
        &mut self,
        expected: &str,
        timeout: Duration,
    ) -> Result<bool, ClientError> {
        let found = self.wait_for(timeout, |c, done| c.get_version(done))?;
        if found == expected {
            debug!(version = %found, "worker is current");
            return Ok(true);
        }

        warn!(%found, %expected, "worker is out of date; stopping it");
        self.stop()?;
        if !self.wait_closed(timeout) {
            return Err(ClientError::TimedOut);
        }
        Ok(false)
    }
}

fn connect_retrying(
    settings: &ClientSettings,
    gateway: &Rc<Gateway>,
) -> Result<WorkerClient, ClientError> {
    let mut last = ClientError::ConnectionLost;
    for attempt in 1..=settings.connect_attempts {
        match WorkerClient::connect(&settings.socket_path, Rc::clone(gateway)) {
            Ok(client) => return Ok(client),
            Err(err) => {
                debug!(attempt, "worker not reachable yet: {err}");
                last = err;
                thread::sleep(settings.retry_delay);
            }
        }
    }
    Err(last)
}

fn reinstall(service: &dyn WorkerService) -> Result<(), ClientError> {
    service
        .ensure_installed(EXPECTED_VERSION)
        .map_err(|e| ClientError::Install(format!("{e:#}")))
}

/// First-use handshake: connect, compare versions, and on a mismatch stop
/// the old worker, reinstall, and retry once.
pub fn connect_checked(
    settings: &ClientSettings,
    gateway: Rc<Gateway>,
    service: &dyn WorkerService,
) -> Result<WorkerClient, ClientError> {
    let mut client = match WorkerClient::connect(&settings.socket_path, Rc::clone(&gateway)) {
        Ok(client) => client,
        Err(err) => {
            info!("worker not running ({err}); installing it");
            reinstall(service)?;
            connect_retrying(settings, &gateway)?
        }
    };

    if client.check_worker_recent(EXPECTED_VERSION, settings.reply_timeout)? {
        return Ok(client);
    }
    drop(client);

    reinstall(service)?;
    let mut client = connect_retrying(settings, &gateway)?;
    let found = client.wait_for(settings.reply_timeout, |c, done| c.get_version(done))?;
    if found != EXPECTED_VERSION {
        return Err(ClientError::VersionMismatch {
            expected: EXPECTED_VERSION.to_string(),
            found,
        });
    }
    info!(version = %found, "worker upgraded");
    Ok(client)
}
