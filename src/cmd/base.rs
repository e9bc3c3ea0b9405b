// ============================================================================
// src/cmd/base.rs – Allowlisted external command runner (for system utilities)
// ============================================================================

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Every binary the worker or the service installer may spawn.
const ALLOWED: &[&str] = &[
    // block device enumeration (must stay in sync with LSBLK_BINARIES)
    "/bin/lsblk",
    "/usr/bin/lsblk",
    "/bin/mount",
    "/usr/bin/mount",
    "/sbin/mount",
    "/bin/umount",
    "/usr/bin/umount",
    "/sbin/umount",
    // worker service management
    "/bin/systemctl",
    "/usr/bin/systemctl",
    // grant elevation
    "/usr/bin/pkexec",
    "/bin/pkexec",
];

pub const LSBLK_BINARIES: &[&str] = &["/bin/lsblk", "/usr/bin/lsblk"];
pub const MOUNT_BINARIES: &[&str] = &["/bin/mount", "/usr/bin/mount", "/sbin/mount"];
pub const UMOUNT_BINARIES: &[&str] = &["/bin/umount", "/usr/bin/umount", "/sbin/umount"];
pub const SYSTEMCTL_BINARIES: &[&str] = &["/bin/systemctl", "/usr/bin/systemctl"];
pub const PKEXEC_BINARIES: &[&str] = &["/usr/bin/pkexec", "/bin/pkexec"];

/// Safe wrapper for external process execution.
#[derive(Debug)]
pub struct Cmd {
    pub path: String,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct OutputData {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl OutputData {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

impl Cmd {
    /// Create a new allowlisted command runner.
    pub fn new_allowlisted<S: Into<String>>(path: S, timeout: Duration) -> Result<Self> {
        let path_str = path.into();
        if !ALLOWED.contains(&path_str.as_str()) {
            return Err(anyhow!("Command '{}' not in allowlist", path_str));
        }

        Ok(Self {
            path: path_str,
            timeout,
        })
    }

    /// Run command with arguments, returning `OutputData`
    pub fn run(&self, args: &[&str]) -> Result<OutputData> {
        let child = Command::new(&self.path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {}", self.path))?;

        self.wait_with_timeout(child)
    }

    fn wait_with_timeout(&self, mut child: Child) -> Result<OutputData> {
        // Drain both pipes while waiting; a full pipe would stall the child.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let start = Instant::now();

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if start.elapsed() > self.timeout {
                // Best effort terminate, then kill.
                use nix::sys::signal::{kill, Signal::SIGTERM};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(child.id() as i32), SIGTERM);
                thread::sleep(Duration::from_millis(200));
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!("{} timed out after {:?}", self.path, self.timeout));
            }
            thread::sleep(Duration::from_millis(30));
        };

        Ok(OutputData {
            stdout: collect(stdout)?,
            stderr: collect(stderr)?,
            status: status.code().unwrap_or(-1),
        })
    }
}

type Drained = Option<JoinHandle<io::Result<Vec<u8>>>>;

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Drained {
    pipe.map(|mut p| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            p.read_to_end(&mut buf)?;
            Ok(buf)
        })
    })
}

fn collect(handle: Drained) -> Result<String> {
    let Some(handle) = handle else {
        return Ok(String::new());
    };
    let bytes = handle
        .join()
        .map_err(|_| anyhow!("output reader panicked"))?
        .context("read child output")?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// First candidate that exists on this system. It must be allowlisted.
pub fn resolve_allowlisted<'a>(candidates: &[&'a str]) -> Result<&'a str> {
    for &path in candidates {
        if !Path::new(path).exists() {
            continue;
        }
        if !ALLOWED.contains(&path) {
            return Err(anyhow!("Command '{}' not in allowlist", path));
        }
        return Ok(path);
    }
    Err(anyhow!(
        "None of the candidate binaries {:?} were found on this system",
        candidates
    ))
}

/// Run the first candidate binary that exists on this system.
pub fn run_external(candidates: &[&str], args: &[&str], timeout: Duration) -> Result<OutputData> {
    let path = resolve_allowlisted(candidates)?;
    Cmd::new_allowlisted(path, timeout)?.run(args)
}
