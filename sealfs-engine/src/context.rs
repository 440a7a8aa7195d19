//! State shared by the interceptor and the coordinator, plus the key
//! resolution and recipient fan-out both of them build on.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use sealfs_crypto::{FileKey, PublicKey, fingerprint, open_key, seal_key};
use sealfs_keystore::{
    FileId, FileKeyMarker, KeyMode, KeyStore, PrincipalId, ShareKeyRecord, SystemState,
};
use sealfs_session::Session;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::locks::FileLocks;
use crate::policy::AccessPolicy;
use crate::storage::HostStorage;

pub(crate) struct Context {
    pub store: Arc<dyn KeyStore>,
    pub storage: Arc<dyn HostStorage>,
    pub policy: Arc<dyn AccessPolicy>,
    pub config: EngineConfig,
    pub locks: Arc<FileLocks>,
    /// Engine-held unlock of the master key, used in master key mode.
    pub master: Session,
    /// Serializes read-modify-write of the system state.
    state_lock: Mutex<()>,
}

impl Context {
    pub fn new(
        store: Arc<dyn KeyStore>,
        storage: Arc<dyn HostStorage>,
        policy: Arc<dyn AccessPolicy>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            storage,
            policy,
            config,
            locks: FileLocks::new(),
            master: Session::new(PrincipalId::master(), None),
            state_lock: Mutex::new(()),
        }
    }

    pub fn state_guard(&self) -> MutexGuard<'_, ()> {
        self.state_lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Reads, modifies and writes back the system state under the state lock.
    /// Must not be called while already holding [`Context::state_guard`].
    pub fn update_state<T>(
        &self,
        f: impl FnOnce(&mut SystemState) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let _guard = self.state_guard();
        let mut state = self.system_state()?;
        let out = f(&mut state)?;
        self.store.put_system_state(&state)?;
        Ok(out)
    }

    /// Current marker of `file`, `None` if the file was never encrypted.
    pub fn marker(&self, file: &FileId) -> EngineResult<Option<FileKeyMarker>> {
        match self.store.get_file_marker(file) {
            Ok(m) => Ok(Some(m)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Unwraps the current file key of `file` for the principal of `session`.
    ///
    /// In master key mode the key is opened with the engine-held master
    /// session once the access policy confirms the caller is authorized.
    pub fn resolve_file_key(
        &self,
        file: &FileId,
        session: &Session,
    ) -> EngineResult<(FileKeyMarker, FileKey)> {
        let marker = self
            .marker(file)?
            .ok_or_else(|| EngineError::NotFound(format!("{file} is not encrypted")))?;
        let principal = session.principal();

        let key = if marker.mode == KeyMode::MasterKey && *principal != PrincipalId::master() {
            session.public_key()?;
            if !self.policy.is_authorized(file, principal) && *principal != PrincipalId::recovery()
            {
                return Err(EngineError::NotAuthorized {
                    file: file.clone(),
                    principal: principal.clone(),
                });
            }
            self.open_record(&marker, &self.master)?
        } else {
            self.open_record(&marker, session)?
        };
        Ok((marker, key))
    }

    /// Opens the share key record of `session`'s principal at the marker's version.
    pub fn open_record(&self, marker: &FileKeyMarker, session: &Session) -> EngineResult<FileKey> {
        let principal = session.principal();
        let record = self.store.get_file_key_record(&marker.file_id, principal)?;
        if record.version != marker.current_version {
            return Err(EngineError::CorruptRecord(format!(
                "share key of {} for {principal} is v{}, marker is v{}",
                marker.file_id, record.version, marker.current_version
            )));
        }

        let bytes = session
            .with_private_key(principal, |sk| open_key(&record.envelope, sk))?
            .map_err(|_| EngineError::WrongKey(marker.file_id.to_string()))?;
        FileKey::from_bytes(marker.current_version, &bytes).map_err(|e| {
            EngineError::CorruptRecord(format!("file key of {}: {e}", marker.file_id))
        })
    }

    /// Principals a file's key must be wrapped for, excluding `without`.
    pub fn recipients(
        &self,
        file: &FileId,
        owner: &PrincipalId,
        mode: KeyMode,
        state: &SystemState,
        without: Option<&PrincipalId>,
    ) -> BTreeSet<PrincipalId> {
        let mut set = match mode {
            KeyMode::MasterKey => BTreeSet::from([PrincipalId::master()]),
            KeyMode::PerUser => {
                let mut set = self.policy.authorized_principals(file);
                set.insert(owner.clone());
                if state.recovery_applies_to(owner) {
                    set.insert(PrincipalId::recovery());
                }
                set
            }
        };
        if let Some(p) = without {
            set.remove(p);
        }
        set
    }

    pub fn public_key_of(&self, principal: &PrincipalId) -> EngineResult<PublicKey> {
        match self.store.get_keypair(principal) {
            Ok(kp) => Ok(PublicKey::from(kp.public_key)),
            Err(e) if e.is_not_found() => Err(EngineError::PrincipalNotReady(principal.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Seals `key` for one principal.
    pub fn wrap_for(
        &self,
        file: &FileId,
        key: &FileKey,
        principal: &PrincipalId,
    ) -> EngineResult<ShareKeyRecord> {
        let public = self.public_key_of(principal)?;
        let envelope = seal_key(key.as_bytes(), &public)?;
        debug!(
            file = %file,
            principal = %principal,
            key = %fingerprint(public.as_bytes()),
            "wrapped file key"
        );
        Ok(ShareKeyRecord {
            file_id: file.clone(),
            version: key.version(),
            principal: principal.clone(),
            envelope,
        })
    }

    /// Builds a complete record set in memory. Nothing is persisted.
    pub fn build_record_set(
        &self,
        file: &FileId,
        key: &FileKey,
        recipients: &BTreeSet<PrincipalId>,
    ) -> EngineResult<Vec<ShareKeyRecord>> {
        recipients
            .iter()
            .map(|p| self.wrap_for(file, key, p))
            .collect()
    }

    /// Like [`Context::build_record_set`], but leaves out recipients that
    /// have no keypair yet and returns them alongside the records.
    pub fn build_ready_record_set(
        &self,
        file: &FileId,
        key: &FileKey,
        recipients: &BTreeSet<PrincipalId>,
    ) -> EngineResult<(Vec<ShareKeyRecord>, Vec<PrincipalId>)> {
        let mut records = Vec::with_capacity(recipients.len());
        let mut not_ready = Vec::new();
        for principal in recipients {
            match self.wrap_for(file, key, principal) {
                Ok(record) => records.push(record),
                Err(EngineError::PrincipalNotReady(p)) => not_ready.push(p),
                Err(e) => return Err(e),
            }
        }
        Ok((records, not_ready))
    }

    pub fn next_marker(
        &self,
        file: &FileId,
        version: u32,
        owner: &PrincipalId,
        mode: KeyMode,
    ) -> FileKeyMarker {
        FileKeyMarker {
            file_id: file.clone(),
            current_version: version,
            owner: owner.clone(),
            mode,
            updated_at: Utc::now(),
        }
    }

    pub fn system_state(&self) -> EngineResult<SystemState> {
        Ok(self.store.get_system_state()?)
    }
}
