// ============================================================================
// src/auth/approve.rs – Who says yes to a rights request
// ============================================================================

use dialoguer::Confirm;
use tracing::warn;

use super::PermissionScope;

pub trait Approver {
    fn approve(&self, rights: &[PermissionScope]) -> bool;
}

/// Fixed answer (`--yes`, tests, and the worker which never asks).
#[derive(Debug, Clone, Copy)]
pub struct AutoApprove(pub bool);

impl Approver for AutoApprove {
    fn approve(&self, _rights: &[PermissionScope]) -> bool {
        self.0
    }
}

/// Interactive confirmation on the controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalApprover;

impl Approver for TerminalApprover {
    fn approve(&self, rights: &[PermissionScope]) -> bool {
        let names: Vec<&str> = rights.iter().map(|r| r.right_name()).collect();
        let prompt = format!("Allow BootNext to use {}?", names.join(", "));
        match Confirm::new().with_prompt(prompt).default(false).interact() {
            Ok(answer) => answer,
            Err(err) => {
                warn!("cannot prompt for authorization: {err}");
                false
            }
        }
    }
}
