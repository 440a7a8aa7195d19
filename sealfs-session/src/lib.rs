//! Session-scoped unlock of a principal's private key.
//!
//! A [`Session`] starts `Locked`. [`Session::unlock`] derives a key from the
//! login secret, opens the principal's wrapped private key and checks it
//! against the stored public key before holding it. The key lives only
//! inside the session and is zeroized when the session locks, expires or is
//! dropped.
//!
//! ```text
//! Locked --unlock(secret)--> Unlocking --ok--> Unlocked
//!                                \--PasswordMismatch--> Locked
//! Unlocked --lock / idle expiry / drop--> Locked
//! ```

mod error;
mod keys;

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use sealfs_crypto::{KeyPair, PublicKey, SecretKey, unprotect_private_key};
use sealfs_keystore::{KeyStore, PrincipalId};
use tracing::{debug, info, warn};

pub use error::{SessionError, SessionResult};
pub use keys::{provision_keypair, replace_keypair, rewrap_private_key};

use error::unwrap_error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Locked,
    Unlocking,
    Unlocked,
}

struct Inner {
    state: SessionState,
    keypair: Option<KeyPair>,
    last_used: Instant,
}

impl Inner {
    fn clear(&mut self) {
        // KeyPair's secret half zeroizes on drop
        self.keypair = None;
        self.state = SessionState::Locked;
    }
}

/// Unlock handle for one principal.
pub struct Session {
    principal: PrincipalId,
    idle_timeout: Option<Duration>,
    inner: Mutex<Inner>,
}

impl Session {
    /// Creates a locked session. With `idle_timeout` set, an unlocked
    /// session locks itself once it has not been used for that long.
    pub fn new(principal: PrincipalId, idle_timeout: Option<Duration>) -> Self {
        Self {
            principal,
            idle_timeout,
            inner: Mutex::new(Inner {
                state: SessionState::Locked,
                keypair: None,
                last_used: Instant::now(),
            }),
        }
    }

    pub fn principal(&self) -> &PrincipalId {
        &self.principal
    }

    // Inner is always replaced wholesale, so a poisoned guard is still consistent.
    fn guard(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn expire_if_idle(&self, inner: &mut Inner) {
        if inner.state != SessionState::Unlocked {
            return;
        }
        if let Some(timeout) = self.idle_timeout {
            if inner.last_used.elapsed() >= timeout {
                inner.clear();
                info!(principal = %self.principal, "session expired");
            }
        }
    }

    pub fn state(&self) -> SessionState {
        let mut inner = self.guard();
        self.expire_if_idle(&mut inner);
        inner.state
    }

    pub fn is_unlocked(&self) -> bool {
        self.state() == SessionState::Unlocked
    }

    /// Unlocks the session with the principal's login secret.
    pub fn unlock(&self, store: &dyn KeyStore, secret: &str) -> SessionResult<()> {
        {
            let mut inner = self.guard();
            inner.clear();
            inner.state = SessionState::Unlocking;
        }

        match self.open_private_key(store, secret) {
            Ok(keypair) => {
                let mut inner = self.guard();
                inner.keypair = Some(keypair);
                inner.state = SessionState::Unlocked;
                inner.last_used = Instant::now();
                info!(principal = %self.principal, "session unlocked");
                Ok(())
            }
            Err(e) => {
                self.guard().clear();
                warn!(principal = %self.principal, error = %e, "unlock failed");
                Err(e)
            }
        }
    }

    fn open_private_key(&self, store: &dyn KeyStore, secret: &str) -> SessionResult<KeyPair> {
        let stored = match store.get_keypair(&self.principal) {
            Ok(kp) => kp,
            Err(e) if e.is_not_found() => {
                return Err(SessionError::NotProvisioned(self.principal.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let secret_key = unprotect_private_key(&stored.protected, secret).map_err(unwrap_error)?;
        let keypair = KeyPair::from_secret_bytes(secret_key.to_bytes());
        if keypair.public_bytes() != stored.public_key {
            return Err(SessionError::CorruptRecord(format!(
                "private key of {} does not match its public key",
                self.principal
            )));
        }
        Ok(keypair)
    }

    /// Locks the session and zeroizes the private key.
    pub fn lock(&self) {
        let mut inner = self.guard();
        if inner.state != SessionState::Locked {
            inner.clear();
            debug!(principal = %self.principal, "session locked");
        }
    }

    /// Runs `f` with the unlocked private key of `principal`.
    ///
    /// Errors with [`SessionError::SessionLocked`] when locked or expired,
    /// and with [`SessionError::PrincipalMismatch`] when asked for another
    /// principal's key.
    pub fn with_private_key<T>(
        &self,
        principal: &PrincipalId,
        f: impl FnOnce(&SecretKey) -> T,
    ) -> SessionResult<T> {
        if principal != &self.principal {
            return Err(SessionError::PrincipalMismatch {
                session: self.principal.clone(),
                requested: principal.clone(),
            });
        }

        let mut inner = self.guard();
        self.expire_if_idle(&mut inner);
        inner.last_used = Instant::now();
        match &inner.keypair {
            Some(kp) if inner.state == SessionState::Unlocked => Ok(f(&kp.secret)),
            _ => Err(SessionError::SessionLocked),
        }
    }

    /// Returns a copy of the unlocked private key. The copy zeroizes on drop.
    pub fn unlocked_private_key(&self, principal: &PrincipalId) -> SessionResult<SecretKey> {
        self.with_private_key(principal, |sk| sk.clone())
    }

    /// Public key of the unlocked principal.
    pub fn public_key(&self) -> SessionResult<PublicKey> {
        let principal = self.principal.clone();
        self.with_private_key(&principal, |sk| sk.public_key())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.lock();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("principal", &self.principal)
            .field("state", &self.guard().state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealfs_crypto::KdfParams;
    use sealfs_keystore::MemoryKeyStore;

    fn provisioned(secret: &str) -> (MemoryKeyStore, PrincipalId) {
        let store = MemoryKeyStore::new();
        let alice = PrincipalId::from("alice");
        provision_keypair(&store, &alice, secret, &KdfParams::testing()).unwrap();
        (store, alice)
    }

    #[test]
    fn locked_session_refuses_key_access() {
        let session = Session::new("alice".into(), None);
        assert_eq!(session.state(), SessionState::Locked);
        assert!(matches!(
            session.unlocked_private_key(&"alice".into()),
            Err(SessionError::SessionLocked)
        ));
    }

    #[test]
    fn failed_unlock_returns_to_locked() {
        let (store, alice) = provisioned("pw1");
        let session = Session::new(alice, None);
        assert!(matches!(
            session.unlock(&store, "wrong"),
            Err(SessionError::PasswordMismatch)
        ));
        assert_eq!(session.state(), SessionState::Locked);
    }

    #[test]
    fn other_principal_is_refused() {
        let (store, alice) = provisioned("pw1");
        let session = Session::new(alice, None);
        session.unlock(&store, "pw1").unwrap();
        assert!(matches!(
            session.unlocked_private_key(&"bob".into()),
            Err(SessionError::PrincipalMismatch { .. })
        ));
    }

    #[test]
    fn idle_session_expires() {
        let (store, alice) = provisioned("pw1");
        let session = Session::new(alice.clone(), Some(Duration::from_millis(20)));
        session.unlock(&store, "pw1").unwrap();
        assert!(session.is_unlocked());

        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(
            session.unlocked_private_key(&alice),
            Err(SessionError::SessionLocked)
        ));
        assert_eq!(session.state(), SessionState::Locked);
    }

    #[test]
    fn swapped_keypair_is_corrupt() {
        let (store, alice) = provisioned("pw1");
        let mut record = store.get_keypair(&alice).unwrap();
        record.public_key = sealfs_crypto::generate_keypair().public_bytes();
        store.put_keypair(&alice, &record).unwrap();

        let session = Session::new(alice, None);
        assert!(matches!(
            session.unlock(&store, "pw1"),
            Err(SessionError::CorruptRecord(_))
        ));
    }
}
