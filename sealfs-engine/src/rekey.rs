//! Keeps share key records in step with the sharing subsystem and performs
//! full re-keys.
//!
//! Every change to a file's recipient set is built completely in memory and
//! then written with one `put_share_key_records` call under the file lock.
//! If anything fails before that call, the stored set is untouched.

use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;

use chrono::Utc;
use sealfs_crypto::{FileKey, generate_file_key};
use sealfs_keystore::{FileId, FileKeyMarker, KeyMode, PrincipalId};
use sealfs_session::{Session, replace_keypair};
use tracing::{debug, info, warn};

use crate::config::RevokePolicy;
use crate::context::Context;
use crate::error::{EngineError, EngineResult, storage_error};
use crate::format::content_object;
use crate::locks::FileLockGuard;
use crate::reader::EncryptedReader;
use crate::storage::retry_io;
use crate::writer::EncryptedWriter;

/// Outcome of an operation over many files.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: Vec<FileId>,
    pub failed: Vec<(FileId, String)>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, file: FileId, result: EngineResult<()>) {
        match result {
            Ok(()) => self.succeeded.push(file),
            Err(e) => {
                warn!(file = %file, error = %e, "file skipped");
                self.failed.push((file, e.to_string()));
            }
        }
    }
}

/// Difference between the stored recipients of a file and the set the
/// sharing subsystem (plus implicit recovery/master recipients) expects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub file: FileId,
    pub expected: BTreeSet<PrincipalId>,
    pub actual: BTreeSet<PrincipalId>,
    /// Expected but without a share key.
    pub missing: BTreeSet<PrincipalId>,
    /// Holding a share key without being expected.
    pub stale: BTreeSet<PrincipalId>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.stale.is_empty()
    }
}

/// Re-wraps and re-keys file keys.
#[derive(Clone)]
pub struct ReKeyCoordinator {
    pub(crate) ctx: Arc<Context>,
}

fn touched(marker: &FileKeyMarker) -> FileKeyMarker {
    FileKeyMarker {
        updated_at: Utc::now(),
        ..marker.clone()
    }
}

impl ReKeyCoordinator {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    fn existing_marker(&self, file: &FileId) -> EngineResult<FileKeyMarker> {
        self.ctx
            .marker(file)?
            .ok_or_else(|| EngineError::NotFound(format!("{file} is not encrypted")))
    }

    /// Resolves the file key as `acting`, who must already have access.
    fn acting_key(
        &self,
        file: &FileId,
        acting: &Session,
    ) -> EngineResult<(FileKeyMarker, FileKey)> {
        self.ctx.resolve_file_key(file, acting).map_err(|e| {
            if e.is_not_found() {
                EngineError::NotAuthorized {
                    file: file.clone(),
                    principal: acting.principal().clone(),
                }
            } else {
                e
            }
        })
    }

    /// Adds `grantee` to the current record set of `file`. Returns `false`
    /// if the grantee already had a share key.
    fn add_recipient(
        &self,
        _guard: &FileLockGuard,
        file: &FileId,
        acting: &Session,
        grantee: &PrincipalId,
    ) -> EngineResult<bool> {
        self.ctx.public_key_of(grantee)?;

        let mut records = self.ctx.store.list_share_key_records(file)?;
        if records.iter().any(|r| &r.principal == grantee) {
            return Ok(false);
        }

        let (marker, key) = self.acting_key(file, acting)?;
        records.push(self.ctx.wrap_for(file, &key, grantee)?);
        self.ctx.store.put_share_key_records(&touched(&marker), &records)?;
        Ok(true)
    }

    /// Wraps the current file key for a newly authorized principal.
    ///
    /// `acting` must already be able to open the file. In master key mode
    /// there is nothing to wrap: reads are authorized against the policy.
    pub fn on_share_granted(
        &self,
        file: &FileId,
        acting: &Session,
        grantee: &PrincipalId,
    ) -> EngineResult<()> {
        if grantee.is_system() {
            return Err(EngineError::InvalidState(format!(
                "{grantee} cannot be granted explicitly"
            )));
        }

        let guard = self.ctx.locks.acquire(file)?;
        let marker = self.existing_marker(file)?;
        if marker.mode == KeyMode::MasterKey {
            debug!(file = %file, grantee = %grantee, "master key mode, no share key needed");
            return Ok(());
        }

        if self.add_recipient(&guard, file, acting, grantee)? {
            info!(file = %file, grantee = %grantee, by = %acting.principal(), "share granted");
        } else {
            debug!(file = %file, grantee = %grantee, "share key already present");
        }
        Ok(())
    }

    /// Removes `revoked`'s access according to the configured policy.
    ///
    /// Under [`RevokePolicy::Hard`] the file gets a new key version, content
    /// is re-encrypted and only the remaining recipients get the new key.
    /// The former recipient then finds no share key (`NotFound`).
    pub fn on_share_revoked(
        &self,
        file: &FileId,
        acting: &Session,
        revoked: &PrincipalId,
    ) -> EngineResult<()> {
        let guard = self.ctx.locks.acquire(file)?;
        let marker = self.existing_marker(file)?;
        if &marker.owner == revoked {
            return Err(EngineError::InvalidState(format!(
                "owner {revoked} cannot be revoked from {file}"
            )));
        }
        if marker.mode == KeyMode::MasterKey {
            debug!(file = %file, revoked = %revoked, "master key mode, nothing to revoke");
            return Ok(());
        }
        if !self.ctx.store.list_principals_for_file(file)?.contains(revoked) {
            debug!(file = %file, revoked = %revoked, "no share key to revoke");
            return Ok(());
        }

        match self.ctx.config.revoke_policy {
            RevokePolicy::Lazy => {
                self.ctx.store.delete_share_key_record(file, revoked)?;
                info!(file = %file, revoked = %revoked, "share key deleted (lazy revoke)");
            }
            RevokePolicy::Hard => {
                let version = self.rekey_locked(&guard, file, acting, Some(revoked))?;
                info!(file = %file, revoked = %revoked, version, "share revoked (hard revoke)");
            }
        }
        Ok(())
    }

    /// Moves `file` to a fresh key version and re-encrypts its content,
    /// also applying the configured block size. Returns the new version.
    pub fn rekey_file(&self, file: &FileId, acting: &Session) -> EngineResult<u32> {
        let guard = self.ctx.locks.acquire(file)?;
        let version = self.rekey_locked(&guard, file, acting, None)?;
        info!(file = %file, version, "file re-keyed");
        Ok(version)
    }

    fn rekey_locked(
        &self,
        _guard: &FileLockGuard,
        file: &FileId,
        acting: &Session,
        without: Option<&PrincipalId>,
    ) -> EngineResult<u32> {
        let (marker, old_key) = self.acting_key(file, acting)?;
        let state = self.ctx.system_state()?;
        let version = marker
            .current_version
            .checked_add(1)
            .ok_or_else(|| EngineError::InvalidState(format!("{file} ran out of key versions")))?;
        let new_key = generate_file_key(version);

        let recipients = self
            .ctx
            .recipients(file, &marker.owner, marker.mode, &state, without);
        // Principals without a keypair are left out; a later grant wraps for them.
        let (records, not_ready) = self
            .ctx
            .build_ready_record_set(file, &new_key, &recipients)?;
        if !not_ready.is_empty() {
            warn!(
                file = %file,
                version,
                skipped = ?not_ready,
                "recipients without a keypair left out of the new key version"
            );
        }

        let ctx = &self.ctx;
        let retries = ctx.config.io_retries;
        let old_object = content_object(file, marker.current_version);
        let new_object = content_object(file, version);
        let has_content = retry_io(retries, &old_object, || ctx.storage.exists(&old_object))
            .map_err(|e| storage_error(&old_object, e))?;

        if has_content {
            let mut reader = EncryptedReader::open(
                Arc::clone(&ctx.storage),
                retries,
                file.clone(),
                old_object.clone(),
                old_key,
            )?;
            let mut writer = EncryptedWriter::create(
                Arc::clone(&ctx.storage),
                retries,
                file.clone(),
                new_object.clone(),
                new_key,
                ctx.config.block_size,
                None,
            );
            io::copy(&mut reader, &mut writer).map_err(EngineError::from_io)?;
            writer.close()?;
        }

        let next = ctx.next_marker(file, version, &marker.owner, marker.mode);
        if let Err(e) = ctx.store.put_share_key_records(&next, &records) {
            if has_content {
                if let Err(cleanup) = ctx.storage.remove(&new_object) {
                    warn!(object = %new_object, error = %cleanup, "failed to remove new content");
                }
            }
            return Err(e.into());
        }

        if has_content {
            if let Err(e) = ctx.storage.remove(&old_object) {
                warn!(object = %old_object, error = %e, "failed to remove superseded content");
            }
        }
        Ok(version)
    }

    /// Compares stored recipients of `file` with the expected set.
    pub fn verify_consistency(&self, file: &FileId) -> EngineResult<ConsistencyReport> {
        let marker = self.existing_marker(file)?;
        let state = self.ctx.system_state()?;
        let expected = self
            .ctx
            .recipients(file, &marker.owner, marker.mode, &state, None);
        let actual = self.ctx.store.list_principals_for_file(file)?;

        let report = ConsistencyReport {
            file: file.clone(),
            missing: expected.difference(&actual).cloned().collect(),
            stale: actual.difference(&expected).cloned().collect(),
            expected,
            actual,
        };
        if !report.is_consistent() {
            warn!(
                file = %file,
                missing = report.missing.len(),
                stale = report.stale.len(),
                "recipient set out of sync"
            );
        }
        Ok(report)
    }

    // ── Recovery ──

    fn remove_recipient(
        &self,
        _guard: &FileLockGuard,
        file: &FileId,
        principal: &PrincipalId,
    ) -> EngineResult<()> {
        match self.ctx.store.delete_share_key_record(file, principal) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the recovery share key of every file, or only of files
    /// owned by `owner`.
    pub(crate) fn remove_recovery_records(
        &self,
        owner: Option<&PrincipalId>,
    ) -> EngineResult<BatchReport> {
        let recovery = PrincipalId::recovery();
        let mut report = BatchReport::default();
        for file in self.ctx.store.list_files()? {
            let guard = self.ctx.locks.acquire(&file)?;
            let Some(marker) = self.ctx.marker(&file)? else {
                continue;
            };
            if owner.is_some_and(|o| o != &marker.owner) {
                continue;
            }
            let result = self.remove_recipient(&guard, &file, &recovery);
            report.record(file, result);
        }
        Ok(report)
    }

    /// Opts the principal of `session` in or out of recovery and adjusts the
    /// recovery share keys of the files they own.
    pub fn set_recovery_for_principal(
        &self,
        session: &Session,
        enabled: bool,
    ) -> EngineResult<BatchReport> {
        session.public_key()?;
        let principal = session.principal().clone();

        let recovery_on = self.ctx.update_state(|state| {
            if enabled {
                state.recovery_opt_out.remove(&principal);
            } else {
                state.recovery_opt_out.insert(principal.clone());
            }
            Ok(state.recovery_enabled)
        })?;

        if !enabled {
            let report = self.remove_recovery_records(Some(&principal))?;
            info!(
                principal = %principal,
                files = report.succeeded.len(),
                "recovery disabled for principal"
            );
            return Ok(report);
        }

        let mut report = BatchReport::default();
        if !recovery_on {
            return Ok(report);
        }
        let recovery = PrincipalId::recovery();
        for file in self.ctx.store.list_files()? {
            let guard = self.ctx.locks.acquire(&file)?;
            let Some(marker) = self.ctx.marker(&file)? else {
                continue;
            };
            if marker.owner != principal || marker.mode != KeyMode::PerUser {
                continue;
            }
            let result = self
                .add_recipient(&guard, &file, session, &recovery)
                .map(|_| ());
            report.record(file, result);
        }
        info!(
            principal = %principal,
            files = report.succeeded.len(),
            "recovery enabled for principal"
        );
        Ok(report)
    }

    /// Gives `principal` a fresh keypair under `new_secret` and re-wraps
    /// every file the recovery key can open for it.
    ///
    /// Files without a recovery share key are reported as failed; they stay
    /// unreadable for the principal.
    pub fn recover_principal(
        &self,
        recovery: &Session,
        principal: &PrincipalId,
        new_secret: &str,
    ) -> EngineResult<BatchReport> {
        if recovery.principal() != &PrincipalId::recovery() {
            return Err(EngineError::InvalidState(
                "recovery needs the recovery key's session".to_string(),
            ));
        }
        if principal.is_system() {
            return Err(EngineError::InvalidState(format!("{principal} cannot be recovered")));
        }
        recovery.public_key()?;

        replace_keypair(self.ctx.store.as_ref(), principal, new_secret, &self.ctx.config.kdf)?;

        let mut report = BatchReport::default();
        for file in self.ctx.store.list_files()? {
            let guard = self.ctx.locks.acquire(&file)?;
            let Some(marker) = self.ctx.marker(&file)? else {
                continue;
            };
            if marker.mode != KeyMode::PerUser
                || !self.ctx.store.list_principals_for_file(&file)?.contains(principal)
            {
                continue;
            }
            let result = self.rewrap_for(&guard, &marker, recovery, principal);
            report.record(file, result);
        }

        info!(
            principal = %principal,
            recovered = report.succeeded.len(),
            unrecoverable = report.failed.len(),
            "principal recovered"
        );
        Ok(report)
    }

    fn rewrap_for(
        &self,
        _guard: &FileLockGuard,
        marker: &FileKeyMarker,
        recovery: &Session,
        principal: &PrincipalId,
    ) -> EngineResult<()> {
        let file = &marker.file_id;
        let key = self.ctx.open_record(marker, recovery).map_err(|e| {
            if e.is_not_found() {
                EngineError::NotFound(format!("{file} has no recovery share key"))
            } else {
                e
            }
        })?;

        let fresh = self.ctx.wrap_for(file, &key, principal)?;
        let records: Vec<_> = self
            .ctx
            .store
            .list_share_key_records(file)?
            .into_iter()
            .map(|r| if &r.principal == principal { fresh.clone() } else { r })
            .collect();
        self.ctx.store.put_share_key_records(&touched(marker), &records)?;
        Ok(())
    }
}
