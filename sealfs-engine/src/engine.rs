//! Application-facing entry point tying the components together.

use std::sync::Arc;

use sealfs_crypto::{PRIVATE_KEY_ALGORITHM, generate_recovery_mnemonic};
use sealfs_keystore::{FileId, KeyMode, KeyStore, KeyStoreError, MigrationState, PrincipalId};
use sealfs_session::{Session, provision_keypair, rewrap_private_key};
use tracing::info;

use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::interceptor::StreamInterceptor;
use crate::migration::MigrationReport;
use crate::policy::AccessPolicy;
use crate::reader::EncryptedReader;
use crate::rekey::{BatchReport, ConsistencyReport, ReKeyCoordinator};
use crate::storage::HostStorage;
use crate::writer::EncryptedWriter;

// ============================================================================
// Key status
// ============================================================================

/// Administrative view of a principal's key material.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyStatus {
    NeverProvisioned,
    PerUserKeys,
    MasterKeyMode,
    /// The stored keypair cannot be decoded.
    Corrupt,
}

// ============================================================================
// Engine
// ============================================================================

/// Transparent per-file encryption over a host storage.
///
/// Cheap to clone; clones share the key store, locks and master session.
#[derive(Clone)]
pub struct Engine {
    ctx: Arc<Context>,
    interceptor: StreamInterceptor,
    coordinator: ReKeyCoordinator,
}

impl Engine {
    pub fn new(
        store: Arc<dyn KeyStore>,
        storage: Arc<dyn HostStorage>,
        policy: Arc<dyn AccessPolicy>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate()?;
        let ctx = Arc::new(Context::new(store, storage, policy, config));
        Ok(Self {
            interceptor: StreamInterceptor::new(Arc::clone(&ctx)),
            coordinator: ReKeyCoordinator::new(Arc::clone(&ctx)),
            ctx,
        })
    }

    pub fn interceptor(&self) -> &StreamInterceptor {
        &self.interceptor
    }

    pub fn coordinator(&self) -> &ReKeyCoordinator {
        &self.coordinator
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    fn check_secret(&self, secret: &str) -> EngineResult<()> {
        let min = self.ctx.config.min_secret_len;
        if secret.chars().count() < min {
            return Err(EngineError::SecretTooShort { min });
        }
        Ok(())
    }

    fn store(&self) -> &dyn KeyStore {
        self.ctx.store.as_ref()
    }

    // ── Principals ──

    /// Creates the keypair of a new principal wrapped under `secret`.
    pub fn provision_principal(&self, principal: &PrincipalId, secret: &str) -> EngineResult<()> {
        if principal.is_system() {
            return Err(EngineError::InvalidState(format!(
                "{principal} is reserved for the engine"
            )));
        }
        self.check_secret(secret)?;
        provision_keypair(self.store(), principal, secret, &self.ctx.config.kdf)?;
        Ok(())
    }

    /// Unlocks a new session for `principal`.
    pub fn login(&self, principal: &PrincipalId, secret: &str) -> EngineResult<Session> {
        let session = Session::new(principal.clone(), self.ctx.config.session_idle_timeout());
        session.unlock(self.store(), secret)?;
        Ok(session)
    }

    /// Re-wraps the principal's private key under `new_secret`. File keys
    /// and content are untouched.
    pub fn change_login_secret(
        &self,
        principal: &PrincipalId,
        old_secret: &str,
        new_secret: &str,
    ) -> EngineResult<()> {
        self.check_secret(new_secret)?;
        rewrap_private_key(
            self.store(),
            principal,
            old_secret,
            new_secret,
            &self.ctx.config.kdf,
        )?;
        Ok(())
    }

    pub fn key_status(&self, principal: &PrincipalId) -> EngineResult<KeyStatus> {
        let keypair = match self.store().get_keypair(principal) {
            Ok(kp) => kp,
            Err(KeyStoreError::NotFound(_)) => return Ok(KeyStatus::NeverProvisioned),
            Err(KeyStoreError::CorruptRecord(_)) => return Ok(KeyStatus::Corrupt),
            Err(e) => return Err(e.into()),
        };
        if keypair.protected.algorithm != PRIVATE_KEY_ALGORITHM {
            return Ok(KeyStatus::Corrupt);
        }
        Ok(match self.ctx.system_state()?.mode {
            KeyMode::MasterKey => KeyStatus::MasterKeyMode,
            KeyMode::PerUser => KeyStatus::PerUserKeys,
        })
    }

    // ── File I/O ──

    pub fn open_for_read(&self, file: &FileId, session: &Session) -> EngineResult<EncryptedReader> {
        self.interceptor.open_for_read(file, session)
    }

    pub fn open_for_write(&self, file: &FileId, session: &Session) -> EngineResult<EncryptedWriter> {
        self.interceptor.open_for_write(file, session)
    }

    pub fn read_to_end(&self, file: &FileId, session: &Session) -> EngineResult<Vec<u8>> {
        self.interceptor.read_to_end(file, session)
    }

    pub fn write_all(&self, file: &FileId, session: &Session, data: &[u8]) -> EngineResult<u64> {
        self.interceptor.write_all(file, session, data)
    }

    pub fn plaintext_size(&self, file: &FileId) -> EngineResult<u64> {
        self.interceptor.plaintext_size(file)
    }

    pub fn encrypt_existing(&self, file: &FileId, session: &Session) -> EngineResult<u64> {
        self.interceptor.encrypt_existing(file, session)
    }

    pub fn decrypt_to_plaintext(&self, file: &FileId, session: &Session) -> EngineResult<u64> {
        self.interceptor.decrypt_to_plaintext(file, session)
    }

    pub fn delete_file(&self, file: &FileId) -> EngineResult<()> {
        self.interceptor.delete_file(file)
    }

    // ── Sharing and re-keying ──

    pub fn on_share_granted(
        &self,
        file: &FileId,
        acting: &Session,
        grantee: &PrincipalId,
    ) -> EngineResult<()> {
        self.coordinator.on_share_granted(file, acting, grantee)
    }

    pub fn on_share_revoked(
        &self,
        file: &FileId,
        acting: &Session,
        revoked: &PrincipalId,
    ) -> EngineResult<()> {
        self.coordinator.on_share_revoked(file, acting, revoked)
    }

    pub fn rekey_file(&self, file: &FileId, acting: &Session) -> EngineResult<u32> {
        self.coordinator.rekey_file(file, acting)
    }

    pub fn verify_consistency(&self, file: &FileId) -> EngineResult<ConsistencyReport> {
        self.coordinator.verify_consistency(file)
    }

    // ── Recovery ──

    fn recovery_unlocks(&self, secret: &str) -> EngineResult<()> {
        self.recovery_session(secret).map(drop)
    }

    /// Turns the recovery feature on, creating the recovery keypair under
    /// `secret` on first use.
    ///
    /// Files written from now on get a recovery share key. Existing files
    /// gain one when their owner calls
    /// [`ReKeyCoordinator::set_recovery_for_principal`] or the file is re-keyed.
    pub fn enable_recovery(&self, secret: &str) -> EngineResult<()> {
        let recovery = PrincipalId::recovery();
        match self.store().get_keypair(&recovery) {
            Ok(_) => self.recovery_unlocks(secret)?,
            Err(e) if e.is_not_found() => {
                self.check_secret(secret)?;
                provision_keypair(self.store(), &recovery, secret, &self.ctx.config.kdf)?;
            }
            Err(e) => return Err(e.into()),
        }
        self.ctx.update_state(|state| {
            state.recovery_enabled = true;
            Ok(())
        })?;
        info!("recovery enabled");
        Ok(())
    }

    /// Creates the recovery keypair under a generated 12-word phrase and
    /// enables recovery. The phrase is returned once and never stored.
    pub fn enable_recovery_with_phrase(&self) -> EngineResult<String> {
        let recovery = PrincipalId::recovery();
        match self.store().get_keypair(&recovery) {
            Ok(_) => {
                return Err(EngineError::InvalidState(
                    "recovery key already exists".to_string(),
                ));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        let phrase = generate_recovery_mnemonic()?;
        self.enable_recovery(&phrase)?;
        Ok(phrase)
    }

    /// Turns recovery off and deletes every recovery share key. The
    /// recovery keypair is kept so recovery can be re-enabled later.
    pub fn disable_recovery(&self, secret: &str) -> EngineResult<BatchReport> {
        self.recovery_unlocks(secret)?;
        self.ctx.update_state(|state| {
            state.recovery_enabled = false;
            Ok(())
        })?;
        let report = self.coordinator.remove_recovery_records(None)?;
        info!(files = report.succeeded.len(), "recovery disabled");
        Ok(report)
    }

    /// Whether `secret` unlocks the recovery key.
    pub fn check_recovery_secret(&self, secret: &str) -> EngineResult<bool> {
        match self.recovery_unlocks(secret) {
            Ok(()) => Ok(true),
            Err(EngineError::PasswordMismatch) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn change_recovery_secret(&self, old_secret: &str, new_secret: &str) -> EngineResult<()> {
        self.check_secret(new_secret)?;
        rewrap_private_key(
            self.store(),
            &PrincipalId::recovery(),
            old_secret,
            new_secret,
            &self.ctx.config.kdf,
        )?;
        Ok(())
    }

    /// Unlocks a session for the recovery principal.
    pub fn recovery_session(&self, secret: &str) -> EngineResult<Session> {
        let session = Session::new(PrincipalId::recovery(), self.ctx.config.session_idle_timeout());
        session.unlock(self.store(), secret)?;
        Ok(session)
    }

    pub fn set_recovery_for_principal(
        &self,
        session: &Session,
        enabled: bool,
    ) -> EngineResult<BatchReport> {
        self.coordinator.set_recovery_for_principal(session, enabled)
    }

    pub fn recover_principal(
        &self,
        recovery: &Session,
        principal: &PrincipalId,
        new_secret: &str,
    ) -> EngineResult<BatchReport> {
        self.check_secret(new_secret)?;
        self.coordinator.recover_principal(recovery, principal, new_secret)
    }

    // ── Master key ──

    /// Creates the system master keypair wrapped under `secret`. The system
    /// stays in its current mode until [`Engine::migrate_mode`] runs.
    pub fn provision_master_key(&self, secret: &str) -> EngineResult<()> {
        self.check_secret(secret)?;
        provision_keypair(
            self.store(),
            &PrincipalId::master(),
            secret,
            &self.ctx.config.kdf,
        )?;
        Ok(())
    }

    /// Unlocks the engine-held master session used in master key mode.
    pub fn unlock_master_key(&self, secret: &str) -> EngineResult<()> {
        self.ctx.master.unlock(self.store(), secret)?;
        Ok(())
    }

    pub fn lock_master_key(&self) {
        self.ctx.master.lock();
    }

    // ── Migration ──

    pub fn migrate_mode(
        &self,
        from: KeyMode,
        to: KeyMode,
        sessions: &[&Session],
    ) -> EngineResult<MigrationReport> {
        self.coordinator.migrate_mode(from, to, sessions)
    }

    pub fn migration_status(&self) -> EngineResult<Option<MigrationState>> {
        self.coordinator.migration_status()
    }

    pub fn mode(&self) -> EngineResult<KeyMode> {
        Ok(self.ctx.system_state()?.mode)
    }
}
