//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sealfs_engine::{
    AccessPolicy, Engine, EngineConfig, FileId, HostStorage, MemoryAccessPolicy, MemoryStorage,
    PrincipalId, Session,
};
use sealfs_keystore::{
    FileKeyMarker, KeyStore, KeyStoreError, KeyStoreResult, MemoryKeyStore, ShareKeyRecord,
    StoredKeypair, SystemState,
};

/// In-memory key store that can be told to fail the next record set replace.
#[derive(Default)]
pub struct FailingKeyStore {
    inner: MemoryKeyStore,
    fail_next_put: AtomicBool,
}

impl FailingKeyStore {
    pub fn fail_next_put(&self) {
        self.fail_next_put.store(true, Ordering::SeqCst);
    }
}

impl KeyStore for FailingKeyStore {
    fn get_keypair(&self, principal: &PrincipalId) -> KeyStoreResult<StoredKeypair> {
        self.inner.get_keypair(principal)
    }

    fn put_keypair(&self, principal: &PrincipalId, keypair: &StoredKeypair) -> KeyStoreResult<()> {
        self.inner.put_keypair(principal, keypair)
    }

    fn delete_keypair(&self, principal: &PrincipalId) -> KeyStoreResult<()> {
        self.inner.delete_keypair(principal)
    }

    fn list_principals(&self) -> KeyStoreResult<Vec<PrincipalId>> {
        self.inner.list_principals()
    }

    fn get_file_marker(&self, file: &FileId) -> KeyStoreResult<FileKeyMarker> {
        self.inner.get_file_marker(file)
    }

    fn list_files(&self) -> KeyStoreResult<Vec<FileId>> {
        self.inner.list_files()
    }

    fn get_file_key_record(
        &self,
        file: &FileId,
        principal: &PrincipalId,
    ) -> KeyStoreResult<ShareKeyRecord> {
        self.inner.get_file_key_record(file, principal)
    }

    fn list_share_key_records(&self, file: &FileId) -> KeyStoreResult<Vec<ShareKeyRecord>> {
        self.inner.list_share_key_records(file)
    }

    fn put_share_key_records(
        &self,
        marker: &FileKeyMarker,
        records: &[ShareKeyRecord],
    ) -> KeyStoreResult<()> {
        if self.fail_next_put.swap(false, Ordering::SeqCst) {
            return Err(KeyStoreError::Storage("injected crash before commit".into()));
        }
        self.inner.put_share_key_records(marker, records)
    }

    fn delete_share_key_record(&self, file: &FileId, principal: &PrincipalId) -> KeyStoreResult<()> {
        self.inner.delete_share_key_record(file, principal)
    }

    fn delete_file_records(&self, file: &FileId) -> KeyStoreResult<()> {
        self.inner.delete_file_records(file)
    }

    fn get_system_state(&self) -> KeyStoreResult<SystemState> {
        self.inner.get_system_state()
    }

    fn put_system_state(&self, state: &SystemState) -> KeyStoreResult<()> {
        self.inner.put_system_state(state)
    }
}

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<FailingKeyStore>,
    pub storage: Arc<MemoryStorage>,
    pub policy: Arc<MemoryAccessPolicy>,
}

pub fn harness() -> Harness {
    harness_with(EngineConfig::testing())
}

pub fn harness_with(config: EngineConfig) -> Harness {
    let store = Arc::new(FailingKeyStore::default());
    let storage = Arc::new(MemoryStorage::new());
    let policy = Arc::new(MemoryAccessPolicy::new());
    let engine = Engine::new(
        store.clone() as Arc<dyn KeyStore>,
        storage.clone() as Arc<dyn HostStorage>,
        policy.clone() as Arc<dyn AccessPolicy>,
        config,
    )
    .unwrap();
    Harness {
        engine,
        store,
        storage,
        policy,
    }
}

pub fn file(name: &str) -> FileId {
    FileId::from(name)
}

pub fn principals(names: &[&str]) -> BTreeSet<PrincipalId> {
    names.iter().map(|n| PrincipalId::from(*n)).collect()
}

impl Harness {
    /// Provisions `name` with secret `pw-<name>` and logs in.
    pub fn user(&self, name: &str) -> (PrincipalId, Session) {
        let principal = PrincipalId::from(name);
        let secret = format!("pw-{name}");
        self.engine.provision_principal(&principal, &secret).unwrap();
        let session = self.engine.login(&principal, &secret).unwrap();
        (principal, session)
    }

    /// Authorizes the session's principal for `f` and writes `data` to it.
    pub fn write(&self, f: &FileId, session: &Session, data: &[u8]) {
        self.policy.grant(f, session.principal());
        self.engine.write_all(f, session, data).unwrap();
    }

    pub fn share(&self, f: &FileId, acting: &Session, grantee: &PrincipalId) {
        self.policy.grant(f, grantee);
        self.engine.on_share_granted(f, acting, grantee).unwrap();
    }

    pub fn unshare(&self, f: &FileId, acting: &Session, revoked: &PrincipalId) {
        self.policy.revoke(f, revoked);
        self.engine.on_share_revoked(f, acting, revoked).unwrap();
    }

    pub fn recipients(&self, f: &FileId) -> BTreeSet<PrincipalId> {
        self.store.list_principals_for_file(f).unwrap()
    }

    pub fn version(&self, f: &FileId) -> u32 {
        self.store.get_file_marker(f).unwrap().current_version
    }

    /// Staging objects left behind by unfinished writes.
    pub fn staging_objects(&self) -> Vec<String> {
        self.storage
            .objects()
            .into_iter()
            .filter(|o| o.ends_with(".part"))
            .collect()
    }
}
