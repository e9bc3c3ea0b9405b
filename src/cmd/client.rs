// ============================================================================
// src/cmd/client.rs – Front-end commands talking to the worker
// ============================================================================

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{debug, warn};

use crate::arbiter::{DiskBackend, LsblkBackend};
use crate::auth::{Approver, AutoApprove, ElevatedAuthority, Gateway, TerminalApprover};
use crate::boot_config::{BootEntries, BootSection, ConfigEntries};
use crate::client::{connect_checked, ClientSettings, WorkerClient};
use crate::config::ConfigFile;
use crate::layout;
use crate::protocol::{EfiListing, Notice};
use crate::service::SystemdService;
use crate::ui::UX;
use crate::volume::VolumeDescription;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Connection plus the grant it minted. The grant is revoked on drop.
struct FrontEnd {
    client: WorkerClient,
    gateway: Rc<Gateway>,
    settings: ClientSettings,
}

impl FrontEnd {
    fn open(cfg: &ConfigFile, assume_yes: bool) -> Result<Self> {
        let approver: Box<dyn Approver> = if assume_yes {
            Box::new(AutoApprove(true))
        } else {
            Box::new(TerminalApprover)
        };
        let gateway = Rc::new(Gateway::new(
            Rc::new(ElevatedAuthority::from_config(cfg)?),
            approver,
        ));
        let settings = ClientSettings::from_config(cfg);
        let service = SystemdService::from_config(cfg)?;
        let client = connect_checked(&settings, Rc::clone(&gateway), &service)
            .context("connect to worker")?;
        Ok(Self {
            client,
            gateway,
            settings,
        })
    }

    fn timeout(&self) -> Duration {
        self.settings.reply_timeout
    }
}

impl Drop for FrontEnd {
    fn drop(&mut self) {
        if let Err(err) = self.gateway.release() {
            warn!("could not release authorization: {err}");
        }
    }
}

fn describe_rows(volumes: &[VolumeDescription]) -> Vec<(&str, String)> {
    volumes
        .iter()
        .map(|v| {
            let mount = v
                .mount_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string());
            (v.device.as_str(), format!("{v}  [{mount}]"))
        })
        .collect()
}

pub fn run_version(ui: &UX, cfg: &ConfigFile, assume_yes: bool) -> Result<()> {
    let mut fe = FrontEnd::open(cfg, assume_yes)?;
    let timeout = fe.timeout();
    let version = fe
        .client
        .wait_for(timeout, |c, done| c.get_version(done))?;
    ui.data_panel(
        "BootNext",
        &[
            ("client", env!("CARGO_PKG_VERSION").to_string()),
            ("worker", version),
        ],
    );
    Ok(())
}

pub fn run_scan(ui: &UX, cfg: &ConfigFile, assume_yes: bool) -> Result<()> {
    ui.phase("Scanning for EFI system partitions");
    let mut fe = FrontEnd::open(cfg, assume_yes)?;
    let timeout = fe.timeout();

    // ---- Step 1: arm accumulation and let devices arrive -----------------
    fe.client.start_accumulate_disks()?;
    thread::sleep(Duration::from_millis(cfg.client.settle_ms));

    // ---- Step 2: scan -----------------------------------------------------
    let listing = fe.client.wait_for(timeout, |c, done| c.find_efi(done))?;

    // ---- Step 3: describe locally; descriptions are never cached ----------
    let lookup = LsblkBackend::new(&cfg.worker.mount_root, cfg.worker.command_timeout());
    let fresh = |names: &[String]| -> Vec<VolumeDescription> {
        names.iter().map(|n| lookup.describe(n)).collect()
    };
    let installed = fresh(&listing.installed);
    let candidates = fresh(&listing.candidates);

    if candidates.is_empty() {
        ui.warn("No EFI system partitions found.");
        return Ok(());
    }
    ui.data_panel("Installed", &describe_rows(&installed));
    ui.data_panel("Candidates", &describe_rows(&candidates));
    ui.success(&format!(
        "{} candidate(s), {} with BootNext installed",
        candidates.len(),
        installed.len()
    ));
    Ok(())
}

/// Where a scan leaves the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    NoEfi,
    NotInstalled,
    /// Exactly one installation; it is selected without asking.
    Single(String),
    Multiple(Vec<String>),
}

impl Selection {
    pub fn from_listing(listing: &EfiListing) -> Self {
        if listing.candidates.is_empty() {
            Selection::NoEfi
        } else {
            match listing.installed.as_slice() {
                [] => Selection::NotInstalled,
                [only] => Selection::Single(only.clone()),
                many => Selection::Multiple(many.to_vec()),
            }
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Selection::NoEfi => "EFI partition not found",
            Selection::NotInstalled => "BootNext not installed",
            Selection::Single(_) => "Switching EFI...",
            Selection::Multiple(_) => "Multiple installations found",
        }
    }
}

/// Accumulate partitions for `settle`, then scan them.
pub fn discover(client: &mut WorkerClient, timeout: Duration, settle: Duration) -> Result<Selection> {
    client.start_accumulate_disks()?;
    thread::sleep(settle);
    let listing = client.wait_for(timeout, |c, done| c.find_efi(done))?;
    debug!(?listing, "scan for selection finished");
    Ok(Selection::from_listing(&listing))
}

/// A mounted installation and the boot entries it offers.
#[derive(Debug)]
pub struct Selected {
    pub device: String,
    pub install_dir: PathBuf,
    pub entries: Vec<BootSection>,
}

/// Mount `device` through the worker and load its boot entries.
pub fn select(
    client: &mut WorkerClient,
    timeout: Duration,
    device: &str,
    describe: &dyn Fn(&str) -> VolumeDescription,
    entries: &dyn BootEntries,
) -> Result<Selected> {
    let mounted = client.wait_for(timeout, |c, done| c.mount_efi(device, done))?;
    if !mounted {
        bail!("Mounting EFI failed on {device}");
    }

    let root = describe(device)
        .mount_path
        .with_context(|| format!("{device} reports no mount path"))?;
    let install_dir = layout::marker_dir(&root)
        .with_context(|| format!("BootNext is not installed on {device}"))?;
    let entries = entries.load_boot_entries(&install_dir)?;
    Ok(Selected {
        device: device.to_string(),
        install_dir,
        entries,
    })
}

pub fn run_select(ui: &UX, cfg: &ConfigFile, assume_yes: bool, device: Option<String>) -> Result<()> {
    let mut fe = FrontEnd::open(cfg, assume_yes)?;
    let timeout = fe.timeout();

    // ---- Step 1: pick the installation ----------------------------------
    let device = match device {
        Some(device) => device,
        None => {
            ui.phase("Scanning for EFI system partitions");
            let settle = Duration::from_millis(cfg.client.settle_ms);
            match discover(&mut fe.client, timeout, settle)? {
                Selection::Single(device) => device,
                Selection::NoEfi => bail!(
                    "EFI partition not found; EFI is required for BootNext operation"
                ),
                other => {
                    ui.warn(other.message());
                    if let Selection::Multiple(devices) = &other {
                        ui.info(&format!(
                            "choose one with `bootnext select <device>`: {}",
                            devices.join(", ")
                        ));
                    }
                    return Ok(());
                }
            }
        }
    };

    // ---- Step 2: mount it and read its entries ---------------------------
    let lookup = LsblkBackend::new(&cfg.worker.mount_root, cfg.worker.command_timeout());
    let selected = select(
        &mut fe.client,
        timeout,
        &device,
        &|name: &str| lookup.describe(name),
        &ConfigEntries,
    )?;

    let rows: Vec<(&str, String)> = selected
        .entries
        .iter()
        .map(|e| (e.key.as_str(), e.display_title()))
        .collect();
    ui.data_panel(&format!("Boot entries on {}", selected.device), &rows);
    ui.success(&format!("Ready to reboot ({})", selected.install_dir.display()));
    Ok(())
}

pub fn run_install(ui: &UX, cfg: &ConfigFile, assume_yes: bool, device: &str) -> Result<()> {
    ui.phase(&format!("Installing BootNext to {device}"));
    let mut fe = FrontEnd::open(cfg, assume_yes)?;
    let timeout = fe.timeout();
    let outcome = fe
        .client
        .wait_for(timeout, |c, done| c.install_to_efi(device, done))?;

    match outcome.installed_path {
        Some(path) if outcome.success => {
            ui.success(&format!("Installed to {}", path.display()));
            Ok(())
        }
        _ => bail!("installation to {device} failed; see the worker log"),
    }
}

pub fn run_mount(ui: &UX, cfg: &ConfigFile, assume_yes: bool, device: &str) -> Result<()> {
    let mut fe = FrontEnd::open(cfg, assume_yes)?;
    let timeout = fe.timeout();
    let mounted = fe
        .client
        .wait_for(timeout, |c, done| c.mount_efi(device, done))?;
    if !mounted {
        bail!("{device} could not be mounted");
    }

    let desc = LsblkBackend::new(&cfg.worker.mount_root, cfg.worker.command_timeout())
        .describe(device);
    match desc.mount_path {
        Some(path) => ui.success(&format!("{device} mounted at {}", path.display())),
        None => ui.success(&format!("{device} mounted")),
    }
    Ok(())
}

pub fn run_stop(ui: &UX, cfg: &ConfigFile, assume_yes: bool) -> Result<()> {
    let mut fe = FrontEnd::open(cfg, assume_yes)?;
    let timeout = fe.timeout();
    fe.client.stop()?;
    if fe.client.wait_closed(timeout) {
        ui.success("Worker stopped.");
    } else {
        ui.warn("Worker did not close the connection in time.");
    }
    Ok(())
}

pub fn run_watch(ui: &UX, cfg: &ConfigFile, assume_yes: bool) -> Result<()> {
    let handler = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only stores to an atomic.
    unsafe { sigaction(Signal::SIGINT, &handler) }.context("install SIGINT handler")?;

    let mut fe = FrontEnd::open(cfg, assume_yes)?;
    let timeout = fe.timeout();
    let out = ui.clone();
    fe.client.wait_for(timeout, |c, done| {
        c.subscribe(
            move |notice| match notice {
                Notice::ScanFinished(listing) => out.info(&format!(
                    "scan finished: installed [{}], candidates [{}]",
                    listing.installed.join(", "),
                    listing.candidates.join(", ")
                )),
                Notice::Installed { target, path } => {
                    out.success(&format!("{target}: installed to {}", path.display()))
                }
            },
            done,
        )
    })?;
    ui.info("Watching for worker notices; Ctrl-C to quit.");

    while fe.client.is_connected() && !INTERRUPTED.load(Ordering::SeqCst) {
        fe.client.pump(Duration::from_millis(250));
    }
    if fe.client.is_connected() {
        debug!("watch interrupted");
    } else {
        ui.warn("Worker connection closed.");
    }
    Ok(())
}
