//! Engine error types.

use std::io;

use sealfs_crypto::CryptoError;
use sealfs_keystore::{FileId, KeyStoreError, PrincipalId};
use sealfs_session::SessionError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the engine.
///
/// `NotFound` means "does not exist / never encrypted"; `WrongKey`,
/// `AuthenticationFailed` and `CorruptRecord` mean the data exists but cannot
/// be read. Use [`EngineError::is_inaccessible`] to tell the two apart.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    /// A wrapped file key did not open with the caller's private key.
    #[error("wrapped key for {0} does not open with this private key")]
    WrongKey(String),

    /// A content block failed authentication. The file is inaccessible.
    #[error("{file} is inaccessible: block {block} failed authentication")]
    AuthenticationFailed { file: FileId, block: u64 },

    #[error("login secret does not match")]
    PasswordMismatch,

    #[error("session is locked")]
    SessionLocked,

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// A migration is in progress with different parameters, or its state
    /// contradicts the stored records. Needs an explicit administrative re-run.
    #[error("migration inconsistent: {0}")]
    MigrationInconsistent(String),

    /// A recipient has no keypair yet.
    #[error("principal {0} has no keypair yet")]
    PrincipalNotReady(PrincipalId),

    #[error("principal {principal} is not authorized for {file}")]
    NotAuthorized { file: FileId, principal: PrincipalId },

    #[error("principal {0} already has a keypair")]
    AlreadyProvisioned(PrincipalId),

    #[error("secret too short (min {min} characters)")]
    SecretTooShort { min: usize },

    /// The file was rewritten while it was being read.
    #[error("{0} was rewritten while reading")]
    Conflict(FileId),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("crypto error: {0}")]
    Crypto(CryptoError),
}

impl EngineError {
    /// The data exists but cannot be decrypted (tampering, key mismatch or
    /// malformed key material).
    pub fn is_inaccessible(&self) -> bool {
        matches!(
            self,
            Self::WrongKey(_)
                | Self::AuthenticationFailed { .. }
                | Self::CorruptRecord(_)
                | Self::Crypto(CryptoError::AuthenticationFailed { .. })
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Recovers an engine error carried through `std::io` by a stream.
    pub fn from_io(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<EngineError>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(engine) = inner.downcast::<EngineError>() {
                    return *engine;
                }
            }
            return Self::Storage("stream error".to_string());
        }
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::Storage(err.to_string()),
        }
    }

    pub(crate) fn into_io(self) -> io::Error {
        io::Error::other(self)
    }
}

impl From<KeyStoreError> for EngineError {
    fn from(err: KeyStoreError) -> Self {
        match err {
            KeyStoreError::NotFound(what) => Self::NotFound(what),
            KeyStoreError::CorruptRecord(what) => Self::CorruptRecord(what),
            KeyStoreError::InvalidRecordSet(what) => Self::InvalidState(what),
            KeyStoreError::Storage(what) => Self::Storage(what),
        }
    }
}

impl From<SessionError> for EngineError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::SessionLocked => Self::SessionLocked,
            SessionError::PasswordMismatch => Self::PasswordMismatch,
            SessionError::PrincipalMismatch { session, requested } => Self::InvalidState(format!(
                "session of {session} used for {requested}"
            )),
            SessionError::NotProvisioned(p) => Self::NotFound(format!("keypair for {p}")),
            SessionError::AlreadyProvisioned(p) => Self::AlreadyProvisioned(p),
            SessionError::CorruptRecord(what) => Self::CorruptRecord(what),
            SessionError::KeyStore(e) => e.into(),
            SessionError::Crypto(e) => e.into(),
        }
    }
}

impl From<CryptoError> for EngineError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::WrongKey => Self::WrongKey("sealed envelope".to_string()),
            CryptoError::InvalidPassphrase => Self::PasswordMismatch,
            CryptoError::CorruptKey(what) => Self::CorruptRecord(what),
            other => Self::Crypto(other),
        }
    }
}

/// Maps a host storage failure on `object`.
pub(crate) fn storage_error(object: &str, err: io::Error) -> EngineError {
    match err.kind() {
        io::ErrorKind::NotFound => EngineError::NotFound(format!("object {object}")),
        _ => EngineError::Storage(format!("{object}: {err}")),
    }
}
