//! Wire protocol between the front-end and the privileged worker.
//!
//! One JSON document per line over the worker's Unix socket. Device handles
//! travel as plain device names, tokens as their hex external form.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::auth::PermissionScope;
use crate::installer::InstallOutcome;
use crate::scanner::ScanResult;

/// Longest line either side accepts.
pub const MAX_LINE: usize = 64 * 1024;

/// Request from client to worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub call: Call,
}

/// The fixed call surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Call {
    GetVersion,

    /// Arm EFI accumulation; never replied to.
    StartAccumulateDisks { auth: String },

    FindEfi { auth: String },

    InstallToEfi { target: String, auth: String },

    MountEfi { target: String, auth: String },

    Subscribe { auth: String },

    /// Ends the worker; never replied to.
    Stop { auth: String },
}

impl Call {
    pub fn required_scope(&self) -> Option<PermissionScope> {
        match self {
            Call::GetVersion | Call::StartAccumulateDisks { .. } | Call::FindEfi { .. } => None,
            Call::InstallToEfi { .. } => Some(PermissionScope::Install),
            Call::MountEfi { .. } => Some(PermissionScope::Mount),
            Call::Subscribe { .. } => Some(PermissionScope::Subscribe),
            Call::Stop { .. } => Some(PermissionScope::Stop),
        }
    }

    pub fn auth(&self) -> Option<&str> {
        match self {
            Call::GetVersion => None,
            Call::StartAccumulateDisks { auth }
            | Call::FindEfi { auth }
            | Call::InstallToEfi { auth, .. }
            | Call::MountEfi { auth, .. }
            | Call::Subscribe { auth }
            | Call::Stop { auth } => Some(auth),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Call::GetVersion => "getVersion",
            Call::StartAccumulateDisks { .. } => "startAccumulateDisks",
            Call::FindEfi { .. } => "findEFI",
            Call::InstallToEfi { .. } => "installToEFI",
            Call::MountEfi { .. } => "mountEFI",
            Call::Subscribe { .. } => "subscribe",
            Call::Stop { .. } => "stop",
        }
    }
}

/// Device names found by a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EfiListing {
    pub installed: Vec<String>,
    pub candidates: Vec<String>,
}

impl From<&ScanResult> for EfiListing {
    fn from(result: &ScanResult) -> Self {
        Self {
            installed: result.installed_names(),
            candidates: result.candidate_names(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Version { version: String },
    FoundEfi(EfiListing),
    Installed(InstallOutcome),
    Mounted { success: bool },
    Subscribed,
}

/// Pushed to the current subscriber only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Notice {
    ScanFinished(EfiListing),
    Installed { target: String, path: PathBuf },
}

/// Anything the worker writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    Reply { id: u64, reply: Reply },
    Notice(Notice),
}

/// Serialize as one protocol line, newline included.
pub fn to_line<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_follow_the_call_table() {
        let auth = || "00".to_string();
        assert_eq!(Call::GetVersion.required_scope(), None);
        assert_eq!(
            Call::StartAccumulateDisks { auth: auth() }.required_scope(),
            None
        );
        assert_eq!(Call::FindEfi { auth: auth() }.required_scope(), None);
        assert_eq!(
            Call::InstallToEfi {
                target: "sda1".into(),
                auth: auth()
            }
            .required_scope(),
            Some(PermissionScope::Install)
        );
        assert_eq!(
            Call::MountEfi {
                target: "sda1".into(),
                auth: auth()
            }
            .required_scope(),
            Some(PermissionScope::Mount)
        );
        assert_eq!(
            Call::Subscribe { auth: auth() }.required_scope(),
            Some(PermissionScope::Subscribe)
        );
        assert_eq!(
            Call::Stop { auth: auth() }.required_scope(),
            Some(PermissionScope::Stop)
        );
    }

    #[test]
    fn wire_shape_is_stable() {
        let req = Request {
            id: 7,
            call: Call::InstallToEfi {
                target: "sda1".into(),
                auth: "ab".into(),
            },
        };
        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            r#"{"id":7,"call":{"install_to_efi":{"target":"sda1","auth":"ab"}}}"#
        );

        let get: Request = serde_json::from_str(r#"{"id":1,"call":"get_version"}"#).unwrap();
        assert_eq!(get.call, Call::GetVersion);
        assert!(get.call.auth().is_none());
    }

    #[test]
    fn lines_are_newline_terminated() {
        let msg = Message::Reply {
            id: 3,
            reply: Reply::Mounted { success: false },
        };
        let line = to_line(&msg).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let back: Message = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn notices_are_distinguishable_from_replies() {
        let notice = Message::Notice(Notice::Installed {
            target: "sda1".into(),
            path: PathBuf::from("/run/bootnext/mnt/sda1/EFI/BootNext"),
        });
        let json = serde_json::to_string(&notice).unwrap();
        assert!(json.starts_with(r#"{"notice":"#));
    }
}
