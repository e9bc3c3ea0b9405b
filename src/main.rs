// ============================================================================
// src/main.rs – BootNext entrypoint (worker and front-end commands)
// ============================================================================

mod arbiter;
mod auth;
mod boot_config;
mod client;
mod cmd;
mod config;
mod error;
mod installer;
mod layout;
mod mounter;
mod protocol;
mod scanner;
mod server;
mod service;
mod ui;
mod util;
mod volume;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cmd::{client as front, worker};
use crate::config::{ConfigFile, DEFAULT_CONFIG_PATH};
use crate::ui::UX;

#[derive(Debug, Parser)]
#[command(name = "bootnext", version, about = "Find, mount and install BootNext on EFI system partitions")]
struct Cli {
    /// Configuration file (TOML or YAML).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Approve the rights request without prompting.
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    /// Only print results.
    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the privileged worker (as root, normally under systemd).
    Worker,
    /// File and hold a grant for the calling user (started through pkexec).
    #[command(hide = true)]
    Grant,
    /// Show client and worker versions.
    Version,
    /// List EFI system partitions and where BootNext is installed.
    Scan,
    /// Install the BootNext loader onto a partition.
    Install { device: String },
    /// Mount a partition and leave it mounted.
    Mount { device: String },
    /// Select an installation and list its boot entries. Without a device,
    /// the only installation found is picked.
    Select { device: Option<String> },
    /// Stop the worker.
    Stop,
    /// Print worker notices until the connection ends.
    Watch,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("BOOTNEXT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let cfg = ConfigFile::load_or_default(&cli.config)?;
    let ui = UX::new(cli.quiet);

    match cli.command {
        Command::Worker => worker::run_worker(&cfg),
        Command::Grant => worker::run_grant(),
        Command::Version => front::run_version(&ui, &cfg, cli.yes),
        Command::Scan => front::run_scan(&ui, &cfg, cli.yes),
        Command::Install { device } => front::run_install(&ui, &cfg, cli.yes, &device),
        Command::Mount { device } => front::run_mount(&ui, &cfg, cli.yes, &device),
        Command::Select { device } => front::run_select(&ui, &cfg, cli.yes, device),
        Command::Stop => front::run_stop(&ui, &cfg, cli.yes),
        Command::Watch => front::run_watch(&ui, &cfg, cli.yes),
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let quiet = cli.quiet;

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            UX::new(quiet).error(&format!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}
