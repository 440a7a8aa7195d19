//! Process-local key store.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::error::{KeyStoreError, KeyStoreResult};
use crate::records::{FileId, FileKeyMarker, PrincipalId, ShareKeyRecord, StoredKeypair, SystemState};
use crate::{KeyStore, validate_record_set};

#[derive(Default)]
struct Tables {
    keypairs: HashMap<PrincipalId, StoredKeypair>,
    markers: HashMap<FileId, FileKeyMarker>,
    shares: HashMap<FileId, BTreeMap<PrincipalId, ShareKeyRecord>>,
    system: Option<SystemState>,
}

/// In-memory [`KeyStore`]. Every mutation happens under one write lock, so
/// record set replacement is atomic with respect to readers.
#[derive(Default)]
pub struct MemoryKeyStore {
    tables: RwLock<Tables>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> KeyStoreResult<T>) -> KeyStoreResult<T> {
        let tables = self
            .tables
            .read()
            .map_err(|e| KeyStoreError::Storage(e.to_string()))?;
        f(&tables)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> KeyStoreResult<T>) -> KeyStoreResult<T> {
        let mut tables = self
            .tables
            .write()
            .map_err(|e| KeyStoreError::Storage(e.to_string()))?;
        f(&mut tables)
    }
}

impl KeyStore for MemoryKeyStore {
    fn get_keypair(&self, principal: &PrincipalId) -> KeyStoreResult<StoredKeypair> {
        self.read(|t| {
            t.keypairs
                .get(principal)
                .cloned()
                .ok_or_else(|| KeyStoreError::NotFound(format!("keypair for {principal}")))
        })
    }

    fn put_keypair(&self, principal: &PrincipalId, keypair: &StoredKeypair) -> KeyStoreResult<()> {
        self.write(|t| {
            t.keypairs.insert(principal.clone(), keypair.clone());
            Ok(())
        })
    }

    fn delete_keypair(&self, principal: &PrincipalId) -> KeyStoreResult<()> {
        self.write(|t| {
            t.keypairs
                .remove(principal)
                .map(|_| ())
                .ok_or_else(|| KeyStoreError::NotFound(format!("keypair for {principal}")))
        })
    }

    fn list_principals(&self) -> KeyStoreResult<Vec<PrincipalId>> {
        self.read(|t| {
            let mut ids: Vec<_> = t.keypairs.keys().cloned().collect();
            ids.sort();
            Ok(ids)
        })
    }

    fn get_file_marker(&self, file: &FileId) -> KeyStoreResult<FileKeyMarker> {
        self.read(|t| {
            t.markers
                .get(file)
                .cloned()
                .ok_or_else(|| KeyStoreError::NotFound(format!("file key marker for {file}")))
        })
    }

    fn list_files(&self) -> KeyStoreResult<Vec<FileId>> {
        self.read(|t| {
            let mut ids: Vec<_> = t.markers.keys().cloned().collect();
            ids.sort();
            Ok(ids)
        })
    }

    fn get_file_key_record(
        &self,
        file: &FileId,
        principal: &PrincipalId,
    ) -> KeyStoreResult<ShareKeyRecord> {
        self.read(|t| {
            t.shares
                .get(file)
                .and_then(|set| set.get(principal))
                .cloned()
                .ok_or_else(|| KeyStoreError::NotFound(format!("share key of {file} for {principal}")))
        })
    }

    fn list_share_key_records(&self, file: &FileId) -> KeyStoreResult<Vec<ShareKeyRecord>> {
        self.read(|t| {
            Ok(t.shares
                .get(file)
                .map(|set| set.values().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn put_share_key_records(
        &self,
        marker: &FileKeyMarker,
        records: &[ShareKeyRecord],
    ) -> KeyStoreResult<()> {
        self.write(|t| {
            validate_record_set(marker, records, t.markers.get(&marker.file_id))?;

            let set: BTreeMap<_, _> = records
                .iter()
                .map(|r| (r.principal.clone(), r.clone()))
                .collect();
            t.shares.insert(marker.file_id.clone(), set);
            t.markers.insert(marker.file_id.clone(), marker.clone());
            Ok(())
        })
    }

    fn delete_share_key_record(
        &self,
        file: &FileId,
        principal: &PrincipalId,
    ) -> KeyStoreResult<()> {
        self.write(|t| {
            t.shares
                .get_mut(file)
                .and_then(|set| set.remove(principal))
                .map(|_| ())
                .ok_or_else(|| KeyStoreError::NotFound(format!("share key of {file} for {principal}")))
        })
    }

    fn delete_file_records(&self, file: &FileId) -> KeyStoreResult<()> {
        self.write(|t| {
            t.shares.remove(file);
            t.markers.remove(file);
            Ok(())
        })
    }

    fn get_system_state(&self) -> KeyStoreResult<SystemState> {
        self.read(|t| Ok(t.system.clone().unwrap_or_default()))
    }

    fn put_system_state(&self, state: &SystemState) -> KeyStoreResult<()> {
        self.write(|t| {
            t.system = Some(state.clone());
            Ok(())
        })
    }
}
