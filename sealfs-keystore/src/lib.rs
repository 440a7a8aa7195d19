//! Persistence of wrapped key material.
//!
//! The [`KeyStore`] trait is the only place durable key state lives:
//! principal keypairs (private half always wrapped), one version marker per
//! file, the share key record set of each file's current version, and the
//! system-wide mode/recovery/migration record.
//!
//! `put_share_key_records` is the single mutation path for a file's
//! recipient set. It replaces the whole set and moves the version pointer in
//! one step, so readers never see a partial recipient set.

mod duck;
mod error;
mod memory;
mod records;

use std::collections::{BTreeSet, HashSet};

pub use duck::DuckDbKeyStore;
pub use error::{KeyStoreError, KeyStoreResult};
pub use memory::MemoryKeyStore;
pub use records::{
    FileId, FileKeyMarker, FileMigrationStatus, KeyMode, MigrationState, PrincipalId,
    ShareKeyRecord, StoredKeypair, SystemState,
};

/// Storage contract for wrapped keys.
///
/// Implementations never swallow errors: a missing record is
/// [`KeyStoreError::NotFound`], an undecodable one is
/// [`KeyStoreError::CorruptRecord`].
pub trait KeyStore: Send + Sync {
    fn get_keypair(&self, principal: &PrincipalId) -> KeyStoreResult<StoredKeypair>;

    /// Inserts or atomically overwrites a keypair.
    fn put_keypair(&self, principal: &PrincipalId, keypair: &StoredKeypair) -> KeyStoreResult<()>;

    fn delete_keypair(&self, principal: &PrincipalId) -> KeyStoreResult<()>;

    fn list_principals(&self) -> KeyStoreResult<Vec<PrincipalId>>;

    fn get_file_marker(&self, file: &FileId) -> KeyStoreResult<FileKeyMarker>;

    fn list_files(&self) -> KeyStoreResult<Vec<FileId>>;

    /// The record for `principal` at the file's current version.
    fn get_file_key_record(
        &self,
        file: &FileId,
        principal: &PrincipalId,
    ) -> KeyStoreResult<ShareKeyRecord>;

    /// All records of the file's current version.
    fn list_share_key_records(&self, file: &FileId) -> KeyStoreResult<Vec<ShareKeyRecord>>;

    /// Replaces the complete recipient set of `marker.file_id` and moves its
    /// version pointer to `marker.current_version`, all-or-nothing.
    ///
    /// Records of older versions are dropped. A marker older than the stored
    /// one is rejected.
    fn put_share_key_records(
        &self,
        marker: &FileKeyMarker,
        records: &[ShareKeyRecord],
    ) -> KeyStoreResult<()>;

    /// Removes one principal's record from the current version.
    fn delete_share_key_record(&self, file: &FileId, principal: &PrincipalId)
    -> KeyStoreResult<()>;

    /// Removes the marker and every record of a file.
    fn delete_file_records(&self, file: &FileId) -> KeyStoreResult<()>;

    /// Returns the stored system state, or the default state if none was saved.
    fn get_system_state(&self) -> KeyStoreResult<SystemState>;

    fn put_system_state(&self, state: &SystemState) -> KeyStoreResult<()>;

    /// Principals holding a record for the file's current version.
    fn list_principals_for_file(&self, file: &FileId) -> KeyStoreResult<BTreeSet<PrincipalId>> {
        Ok(self
            .list_share_key_records(file)?
            .into_iter()
            .map(|r| r.principal)
            .collect())
    }
}

/// Checks a record set against its marker before anything is written.
pub(crate) fn validate_record_set(
    marker: &FileKeyMarker,
    records: &[ShareKeyRecord],
    stored: Option<&FileKeyMarker>,
) -> KeyStoreResult<()> {
    if records.is_empty() {
        return Err(KeyStoreError::InvalidRecordSet(format!(
            "empty recipient set for {}",
            marker.file_id
        )));
    }

    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        if record.file_id != marker.file_id || record.version != marker.current_version {
            return Err(KeyStoreError::InvalidRecordSet(format!(
                "record for {}@v{} does not match marker {}@v{}",
                record.file_id, record.version, marker.file_id, marker.current_version
            )));
        }
        if !seen.insert(&record.principal) {
            return Err(KeyStoreError::InvalidRecordSet(format!(
                "duplicate recipient {}",
                record.principal
            )));
        }
    }

    if let Some(stored) = stored {
        if stored.current_version > marker.current_version {
            return Err(KeyStoreError::InvalidRecordSet(format!(
                "stale version {} for {} (current {})",
                marker.current_version, marker.file_id, stored.current_version
            )));
        }
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn rejects_mismatched_version() {
        let err = validate_record_set(&marker("f", 2), &[record("f", 1, "a")], None).unwrap_err();
        assert!(matches!(err, KeyStoreError::InvalidRecordSet(_)));
    }

    #[test]
    fn rejects_duplicate_principals() {
        let records = [record("f", 1, "a"), record("f", 1, "a")];
        assert!(validate_record_set(&marker("f", 1), &records, None).is_err());
    }

    #[test]
    fn rejects_stale_marker() {
        let stored = marker("f", 3);
        let err =
            validate_record_set(&marker("f", 2), &[record("f", 2, "a")], Some(&stored)).unwrap_err();
        assert!(err.to_string().contains("stale"));
    }

    #[test]
    fn rejects_empty_set() {
        assert!(validate_record_set(&marker("f", 1), &[], None).is_err());
    }
}
