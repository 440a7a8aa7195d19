//! Provisioning and re-wrapping of principal keypairs.

use chrono::Utc;
use sealfs_crypto::{
    KdfParams, KeyPair, PublicKey, fingerprint, generate_keypair, protect_private_key,
    unprotect_private_key,
};
use sealfs_keystore::{KeyStore, PrincipalId, StoredKeypair};
use tracing::info;

use crate::error::{SessionError, SessionResult, unwrap_error};

/// Wraps `keypair` under `secret` and checks the wrapping opens again
/// before it is handed out for storage.
fn wrap_verified(keypair: &KeyPair, secret: &str, kdf: &KdfParams) -> SessionResult<StoredKeypair> {
    let protected = protect_private_key(&keypair.secret, secret, kdf)?;
    let reopened = unprotect_private_key(&protected, secret).map_err(unwrap_error)?;
    if reopened.public_key().as_bytes() != keypair.public.as_bytes() {
        return Err(SessionError::CorruptRecord(
            "fresh wrapping does not reopen to the same key".to_string(),
        ));
    }

    Ok(StoredKeypair {
        public_key: keypair.public_bytes(),
        protected,
        created_at: Utc::now(),
    })
}

/// Creates the keypair of a new principal, wrapped under `secret`.
pub fn provision_keypair(
    store: &dyn KeyStore,
    principal: &PrincipalId,
    secret: &str,
    kdf: &KdfParams,
) -> SessionResult<PublicKey> {
    match store.get_keypair(principal) {
        Ok(_) => return Err(SessionError::AlreadyProvisioned(principal.clone())),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }
    replace_keypair(store, principal, secret, kdf)
}

/// Generates a fresh keypair for `principal`, replacing any existing one.
///
/// Files wrapped for the old public key become unreadable for this
/// principal until they are re-wrapped.
pub fn replace_keypair(
    store: &dyn KeyStore,
    principal: &PrincipalId,
    secret: &str,
    kdf: &KdfParams,
) -> SessionResult<PublicKey> {
    let keypair = generate_keypair();
    let stored = wrap_verified(&keypair, secret, kdf)?;
    store.put_keypair(principal, &stored)?;

    info!(
        principal = %principal,
        key = %fingerprint(&stored.public_key),
        "provisioned keypair"
    );
    Ok(keypair.public)
}

/// Re-wraps a principal's private key from `old_secret` to `new_secret`.
///
/// The old wrapping stays in the store until the new one has been built
/// and verified; the overwrite itself is a single `put_keypair`.
pub fn rewrap_private_key(
    store: &dyn KeyStore,
    principal: &PrincipalId,
    old_secret: &str,
    new_secret: &str,
    kdf: &KdfParams,
) -> SessionResult<()> {
    let stored = match store.get_keypair(principal) {
        Ok(kp) => kp,
        Err(e) if e.is_not_found() => return Err(SessionError::NotProvisioned(principal.clone())),
        Err(e) => return Err(e.into()),
    };

    let secret = unprotect_private_key(&stored.protected, old_secret).map_err(unwrap_error)?;
    let keypair = KeyPair::from_secret_bytes(secret.to_bytes());
    if keypair.public_bytes() != stored.public_key {
        return Err(SessionError::CorruptRecord(format!(
            "private key of {principal} does not match its public key"
        )));
    }

    let mut rewrapped = wrap_verified(&keypair, new_secret, kdf)?;
    rewrapped.created_at = stored.created_at;
    store.put_keypair(principal, &rewrapped)?;

    info!(principal = %principal, "re-wrapped private key under new secret");
    Ok(())
}
