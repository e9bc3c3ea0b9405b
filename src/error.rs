// ============================================================================
// src/error.rs – typed failures shared across the worker boundary
// ============================================================================

use thiserror::Error;

/// Failures minting or checking a capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("authorization denied")]
    Denied,

    #[error("authorization store: {0}")]
    Store(String),
}

/// Why the OS refused a mount or unmount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DissentKind {
    NotMounted,
    Busy,
    Unrecognized,
    Refused,
}

/// The OS declined a device operation. Per-volume and never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct Dissent {
    pub kind: DissentKind,
    pub message: String,
}

impl Dissent {
    pub fn new(kind: DissentKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify `mount`/`umount` stderr.
    pub fn from_stderr(stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        let kind = if lower.contains("not mounted") {
            DissentKind::NotMounted
        } else if lower.contains("busy") {
            DissentKind::Busy
        } else if lower.contains("wrong fs type")
            || lower.contains("unknown filesystem")
            || lower.contains("bad superblock")
        {
            DissentKind::Unrecognized
        } else {
            DissentKind::Refused
        };
        Self::new(kind, stderr.trim())
    }
}

/// Everything the front-end can observe about a worker call.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connection to worker lost")]
    ConnectionLost,

    #[error(transparent)]
    Authorization(#[from] AuthError),

    #[error("no reply from worker before the deadline")]
    TimedOut,

    #[error("worker version {found} does not match expected {expected}")]
    VersionMismatch { expected: String, found: String },

    #[error("worker installation failed: {0}")]
    Install(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
