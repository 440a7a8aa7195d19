//! Session lifecycle tests against a real key store.

use sealfs_crypto::{KdfParams, generate_file_key, open_key, seal_key};
use sealfs_keystore::{DuckDbKeyStore, KeyStore, MemoryKeyStore, PrincipalId};
use sealfs_session::{
    Session, SessionError, SessionState, provision_keypair, replace_keypair, rewrap_private_key,
};

fn kdf() -> KdfParams {
    KdfParams::testing()
}

// ── Lock discipline ──

#[test]
fn lock_unlock_cycles_with_same_secret() {
    let store = MemoryKeyStore::new();
    let alice = PrincipalId::from("alice");
    provision_keypair(&store, &alice, "pw1", &kdf()).unwrap();

    let session = Session::new(alice.clone(), None);
    for _ in 0..3 {
        session.unlock(&store, "pw1").unwrap();
        assert_eq!(session.state(), SessionState::Unlocked);
        assert!(session.unlocked_private_key(&alice).is_ok());

        session.lock();
        assert_eq!(session.state(), SessionState::Locked);
        assert!(matches!(
            session.unlocked_private_key(&alice),
            Err(SessionError::SessionLocked)
        ));
    }
}

#[test]
fn unlock_unknown_principal() {
    let store = MemoryKeyStore::new();
    let session = Session::new("ghost".into(), None);
    assert!(matches!(
        session.unlock(&store, "pw1"),
        Err(SessionError::NotProvisioned(_))
    ));
}

#[test]
fn unlocked_key_opens_envelopes_sealed_to_public_key() {
    let store = DuckDbKeyStore::open_in_memory().unwrap();
    let alice = PrincipalId::from("alice");
    let public = provision_keypair(&store, &alice, "pw1", &kdf()).unwrap();

    let file_key = generate_file_key(1);
    let envelope = seal_key(file_key.as_bytes(), &public).unwrap();

    let session = Session::new(alice.clone(), None);
    session.unlock(&store, "pw1").unwrap();
    let opened = session
        .with_private_key(&alice, |sk| open_key(&envelope, sk))
        .unwrap()
        .unwrap();
    assert_eq!(opened.as_slice(), file_key.as_bytes());
    assert_eq!(session.public_key().unwrap().as_bytes(), public.as_bytes());
}

// ── Secret change ──

#[test]
fn changed_secret_replaces_old_one() {
    let store = MemoryKeyStore::new();
    let alice = PrincipalId::from("alice");
    provision_keypair(&store, &alice, "pw1", &kdf()).unwrap();

    rewrap_private_key(&store, &alice, "pw1", "pw2", &kdf()).unwrap();

    let session = Session::new(alice, None);
    assert!(matches!(
        session.unlock(&store, "pw1"),
        Err(SessionError::PasswordMismatch)
    ));
    session.unlock(&store, "pw2").unwrap();
    assert!(session.is_unlocked());
}

#[test]
fn replaced_keypair_has_new_public_key() {
    let store = MemoryKeyStore::new();
    let alice = PrincipalId::from("alice");
    let old = provision_keypair(&store, &alice, "pw1", &kdf()).unwrap();
    let new = replace_keypair(&store, &alice, "fresh", &kdf()).unwrap();

    assert_ne!(old.as_bytes(), new.as_bytes());
    assert_eq!(&store.get_keypair(&alice).unwrap().public_key, new.as_bytes());
}
