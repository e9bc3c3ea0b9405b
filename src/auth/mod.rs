// ============================================================================
// src/auth/mod.rs – Capability tokens and the gateway that mints/checks them
// ============================================================================

pub mod approve;
pub mod elevate;
pub mod store;

pub use approve::{Approver, AutoApprove, TerminalApprover};
pub use elevate::ElevatedAuthority;
pub use store::GrantStore;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::AuthError;

const TOKEN_LEN: usize = 32;

/// Closed set of rights a privileged call can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionScope {
    Install,
    Mount,
    Subscribe,
    Stop,
}

impl PermissionScope {
    pub const ALL: [PermissionScope; 4] = [
        PermissionScope::Install,
        PermissionScope::Mount,
        PermissionScope::Subscribe,
        PermissionScope::Stop,
    ];

    pub fn right_name(self) -> &'static str {
        match self {
            PermissionScope::Install => "org.bootnext.install",
            PermissionScope::Mount => "org.bootnext.mount",
            PermissionScope::Subscribe => "org.bootnext.subscribe",
            PermissionScope::Stop => "org.bootnext.stop",
        }
    }
}

impl fmt::Display for PermissionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.right_name())
    }
}

/// Process-wide proof of a grant. Only its hex form crosses the socket.
pub struct CapabilityToken(Zeroizing<Vec<u8>>);

impl CapabilityToken {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new(vec![0u8; TOKEN_LEN]);
        OsRng.fill_bytes(bytes.as_mut_slice());
        Self(bytes)
    }

    /// Parse the external form; anything malformed is `None`.
    pub fn from_external(external: &str) -> Option<Self> {
        let bytes = Zeroizing::new(hex::decode(external.trim()).ok()?);
        (bytes.len() == TOKEN_LEN).then_some(Self(bytes))
    }

    pub fn to_external(&self) -> String {
        hex::encode(&*self.0)
    }

    /// Public name of the grant; the raw token is never stored.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&*self.0))
    }
}

impl fmt::Debug for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilityToken({}..)", &self.fingerprint()[..8])
    }
}

/// Whatever backs grants: records who was granted which rights.
pub trait Authority {
    fn grant(&self, token: &CapabilityToken, scopes: &[PermissionScope]) -> Result<(), AuthError>;
    fn check(&self, token: &CapabilityToken, scope: PermissionScope) -> bool;
    fn revoke(&self, token: &CapabilityToken) -> Result<(), AuthError>;
}

/// Owns the single process grant and validates tokens against scopes.
pub struct Gateway {
    authority: Rc<dyn Authority>,
    approver: Box<dyn Approver>,
    held: RefCell<Option<Rc<CapabilityToken>>>,
}

impl Gateway {
    pub fn new(authority: Rc<dyn Authority>, approver: Box<dyn Approver>) -> Self {
        Self {
            authority,
            approver,
            held: RefCell::new(None),
        }
    }

    /// Worker side: checks tokens, never mints.
    pub fn verifier(authority: Rc<dyn Authority>) -> Self {
        Self::new(authority, Box::new(AutoApprove(false)))
    }

    /// Same grant for every call within the process.
    pub fn mint(&self) -> Result<Rc<CapabilityToken>, AuthError> {
        if let Some(token) = self.held.borrow().as_ref() {
            return Ok(Rc::clone(token));
        }

        if !self.approver.approve(&PermissionScope::ALL) {
            info!("authorization request declined");
            return Err(AuthError::Denied);
        }

        let token = Rc::new(CapabilityToken::generate());
        self.authority.grant(&token, &PermissionScope::ALL)?;
        debug!(grant = ?token, "authorization granted");
        *self.held.borrow_mut() = Some(Rc::clone(&token));
        Ok(token)
    }

    /// Never fails; malformed or unknown tokens are simply not authorized.
    pub fn authorize(&self, external: &str, scope: PermissionScope) -> bool {
        match CapabilityToken::from_external(external) {
            Some(token) => self.authority.check(&token, scope),
            None => false,
        }
    }

    /// Revoke the held grant, if any.
    pub fn release(&self) -> Result<(), AuthError> {
        let held = self.held.borrow_mut().take();
        match held {
            Some(token) => {
                self.authority.revoke(&token)?;
                debug!(grant = ?token, "authorization released");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn gateway(dir: &std::path::Path, approve: bool) -> (Gateway, Gateway) {
        let store: Rc<dyn Authority> = Rc::new(GrantStore::for_current_user(dir));
        (
            Gateway::new(Rc::clone(&store), Box::new(AutoApprove(approve))),
            Gateway::verifier(store),
        )
    }

    #[test]
    fn token_external_form_is_strict() {
        let token = CapabilityToken::generate();
        let ext = token.to_external();
        assert_eq!(ext.len(), 64);
        let back = CapabilityToken::from_external(&ext).unwrap();
        assert_eq!(back.fingerprint(), token.fingerprint());

        assert!(CapabilityToken::from_external("zz").is_none());
        assert!(CapabilityToken::from_external(&ext[..62]).is_none());
        assert!(!format!("{token:?}").contains(&ext));
    }

    #[test]
    fn mint_is_idempotent_and_authorizes_every_scope() {
        let dir = tempdir().unwrap();
        let (client, worker) = gateway(dir.path(), true);

        let a = client.mint().unwrap();
        let b = client.mint().unwrap();
        assert!(Rc::ptr_eq(&a, &b));

        for scope in PermissionScope::ALL {
            assert!(worker.authorize(&a.to_external(), scope));
        }
    }

    #[test]
    fn declined_prompt_is_denied() {
        let dir = tempdir().unwrap();
        let (client, _) = gateway(dir.path(), false);
        assert_eq!(client.mint().unwrap_err(), AuthError::Denied);
    }

    #[test]
    fn forged_and_released_tokens_fail() {
        let dir = tempdir().unwrap();
        let (client, worker) = gateway(dir.path(), true);

        let forged = CapabilityToken::generate().to_external();
        assert!(!worker.authorize(&forged, PermissionScope::Install));
        assert!(!worker.authorize("", PermissionScope::Install));
        assert!(!worker.authorize("not hex at all", PermissionScope::Stop));

        let ext = client.mint().unwrap().to_external();
        assert!(worker.authorize(&ext, PermissionScope::Install));
        client.release().unwrap();
        assert!(!worker.authorize(&ext, PermissionScope::Install));

        // A fresh grant after release is a different token.
        let again = client.mint().unwrap().to_external();
        assert_ne!(again, ext);
    }

    #[test]
    fn verifier_never_mints() {
        let dir = tempdir().unwrap();
        let (_, worker) = gateway(dir.path(), true);
        assert_eq!(worker.mint().unwrap_err(), AuthError::Denied);
        worker.release().unwrap();
    }
}
