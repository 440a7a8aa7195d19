//! Resumable migration between per-user keys and master key mode.
//!
//! Progress lives in the system state as one status per file. Each file is
//! switched by a single record set replace (same file key, same content,
//! new recipients), so a crash leaves every file either fully in the old
//! mode or fully in the new one. Re-running with the same `from`/`to`
//! resumes; different parameters are refused.

use std::collections::HashSet;

use chrono::Utc;
use sealfs_crypto::{FileKey, open_key};
use sealfs_keystore::{
    FileId, FileKeyMarker, FileMigrationStatus, KeyMode, MigrationState, PrincipalId, ShareKeyRecord,
};
use sealfs_session::Session;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::rekey::ReKeyCoordinator;

/// Outcome of one `migrate_mode` run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: KeyMode,
    pub to: KeyMode,
    pub migrated: Vec<FileId>,
    pub failed: Vec<(FileId, String)>,
    /// The system mode was switched to `to`.
    pub completed: bool,
}

/// Opens the file key of `marker` with the first session that can.
fn unwrap_with_any(
    ctx: &Context,
    marker: &FileKeyMarker,
    sessions: &[&Session],
) -> EngineResult<FileKey> {
    if marker.mode == KeyMode::MasterKey {
        return ctx.open_record(marker, &ctx.master);
    }
    for session in sessions {
        match ctx.open_record(marker, session) {
            Ok(key) => return Ok(key),
            Err(e) => debug!(
                file = %marker.file_id,
                principal = %session.principal(),
                error = %e,
                "session cannot unwrap"
            ),
        }
    }
    Err(EngineError::InvalidState(format!(
        "no supplied session can unwrap {}",
        marker.file_id
    )))
}

/// Opens one of the freshly built records with a session that is among its
/// recipients and checks it yields `key`. With no such session the seal-time
/// self-check is the only validation.
fn check_round_trip(
    ctx: &Context,
    records: &[ShareKeyRecord],
    key: &FileKey,
    sessions: &[&Session],
) -> EngineResult<()> {
    let candidates = sessions.iter().copied().chain(std::iter::once(&ctx.master));
    for session in candidates {
        let Some(record) = records.iter().find(|r| &r.principal == session.principal()) else {
            continue;
        };
        let Ok(opened) =
            session.with_private_key(session.principal(), |sk| open_key(&record.envelope, sk))
        else {
            continue;
        };
        let opened = opened?;
        if opened.as_slice() != key.as_bytes() {
            return Err(EngineError::CorruptRecord(format!(
                "re-wrapped key of {} does not round-trip",
                record.file_id
            )));
        }
        return Ok(());
    }
    Ok(())
}

impl ReKeyCoordinator {
    /// Current migration progress, if a migration is underway.
    pub fn migration_status(&self) -> EngineResult<Option<MigrationState>> {
        Ok(self.ctx.system_state()?.migration)
    }

    /// Re-wraps every file key from mode `from` to mode `to`.
    ///
    /// Per-user file keys are opened with the supplied `sessions` (typically
    /// the recovery session); master-wrapped keys with the engine-held master
    /// session, which must be unlocked whenever either side is
    /// [`KeyMode::MasterKey`]. Files that fail stay in the old mode and are
    /// retried by the next run; the system mode switches only once every
    /// file has moved.
    pub fn migrate_mode(
        &self,
        from: KeyMode,
        to: KeyMode,
        sessions: &[&Session],
    ) -> EngineResult<MigrationReport> {
        if from == to {
            return Err(EngineError::InvalidState(format!("already in {to} mode")));
        }
        if from == KeyMode::MasterKey || to == KeyMode::MasterKey {
            self.ctx.public_key_of(&PrincipalId::master())?;
            self.ctx.master.public_key()?;
        }

        let files = self.ctx.store.list_files()?;
        self.ctx.update_state(|state| match &state.migration {
            Some(m) if m.from == from && m.to == to => {
                info!(%from, %to, pending = m.pending().count(), "resuming migration");
                Ok(())
            }
            Some(m) => Err(EngineError::MigrationInconsistent(format!(
                "a {} -> {} migration is in progress",
                m.from, m.to
            ))),
            None if state.mode != from => Err(EngineError::MigrationInconsistent(format!(
                "system is in {} mode, not {from}",
                state.mode
            ))),
            None => {
                info!(%from, %to, files = files.len(), "starting migration");
                state.migration = Some(MigrationState {
                    from,
                    to,
                    started_at: Utc::now(),
                    files: files
                        .iter()
                        .map(|f| (f.clone(), FileMigrationStatus::Pending))
                        .collect(),
                });
                Ok(())
            }
        })?;

        let mut report = MigrationReport {
            from,
            to,
            migrated: Vec::new(),
            failed: Vec::new(),
            completed: false,
        };
        let mut attempted = HashSet::new();

        loop {
            let pending: Vec<FileId> = self
                .migration_status()?
                .map(|m| m.pending().cloned().collect())
                .unwrap_or_default();

            for file in pending {
                if !attempted.insert(file.clone()) {
                    continue;
                }
                let status = match self.migrate_file(&file, to, sessions) {
                    Ok(()) => {
                        report.migrated.push(file.clone());
                        FileMigrationStatus::Done
                    }
                    Err(e) => {
                        warn!(file = %file, error = %e, "file not migrated");
                        report.failed.push((file.clone(), e.to_string()));
                        FileMigrationStatus::Failed(e.to_string())
                    }
                };
                self.ctx.update_state(|state| {
                    let m = state.migration.as_mut().ok_or_else(|| {
                        EngineError::MigrationInconsistent("migration state vanished".to_string())
                    })?;
                    m.files.insert(file, status);
                    Ok(())
                })?;
            }

            // Files created while the batch ran are still in the old mode.
            let _guard = self.ctx.state_guard();
            let mut state = self.ctx.system_state()?;
            let Some(migration) = state.migration.as_mut() else {
                return Err(EngineError::MigrationInconsistent(
                    "migration state vanished".to_string(),
                ));
            };
            let mut added = 0;
            for file in self.ctx.store.list_files()? {
                if !migration.files.contains_key(&file) {
                    migration.files.insert(file, FileMigrationStatus::Pending);
                    added += 1;
                }
            }

            let finished = migration.pending().next().is_none();

            if added > 0 {
                debug!(added, "picked up files written during migration");
                self.ctx.store.put_system_state(&state)?;
                continue;
            }

            if finished {
                state.mode = to;
                state.migration = None;
                self.ctx.store.put_system_state(&state)?;
                report.completed = true;
                info!(%from, %to, files = report.migrated.len(), "migration complete");
            } else {
                warn!(%from, %to, failed = report.failed.len(), "migration incomplete");
            }
            return Ok(report);
        }
    }

    fn migrate_file(&self, file: &FileId, to: KeyMode, sessions: &[&Session]) -> EngineResult<()> {
        let _guard = self.ctx.locks.acquire(file)?;
        let Some(marker) = self.ctx.marker(file)? else {
            return Ok(());
        };
        if marker.mode == to {
            return Ok(());
        }

        let key = unwrap_with_any(&self.ctx, &marker, sessions)?;
        let state = self.ctx.system_state()?;
        let recipients = self.ctx.recipients(file, &marker.owner, to, &state, None);
        let records = self.ctx.build_record_set(file, &key, &recipients)?;
        check_round_trip(&self.ctx, &records, &key, sessions)?;

        let next = self
            .ctx
            .next_marker(file, marker.current_version, &marker.owner, to);
        self.ctx.store.put_share_key_records(&next, &records)?;
        debug!(file = %file, %to, recipients = records.len(), "file migrated");
        Ok(())
    }
}
