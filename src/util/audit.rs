// ============================================================================
// src/util/audit.rs – Minimal append-only audit trail
// ============================================================================

use chrono::Local;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Append-only record of privileged calls, kept apart from the tracing stream.
#[derive(Debug, Clone, Default)]
pub struct AuditTrail {
    path: Option<PathBuf>,
}

impl AuditTrail {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
        }
    }

    /// A trail that records nothing.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Append a timestamped event (0600 permissions).
    /// Silent failure if log is unwritable – avoids blocking main logic.
    pub fn record(&self, event: &str, detail: &str) {
        let Some(path) = &self.path else {
            return;
        };
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(path)
        {
            let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
            let _ = writeln!(file, "[{ts}] {event}: {detail}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn appends_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let trail = AuditTrail::new(&path);
        trail.record("MOUNT", "device=sda1 ok=true");
        trail.record("STOP", "requested");

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("MOUNT: device=sda1 ok=true"));
        assert!(lines[1].ends_with("STOP: requested"));
    }

    #[test]
    fn unwritable_path_is_ignored() {
        AuditTrail::new("/nonexistent/dir/audit.log").record("X", "y");
        AuditTrail::disabled().record("X", "y");
    }
}
