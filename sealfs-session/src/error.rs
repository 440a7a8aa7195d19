use sealfs_crypto::CryptoError;
use sealfs_keystore::{KeyStoreError, PrincipalId};
use thiserror::Error;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    /// A private key was requested while the session is locked.
    #[error("session is locked")]
    SessionLocked,

    #[error("session belongs to {session}, not {requested}")]
    PrincipalMismatch {
        session: PrincipalId,
        requested: PrincipalId,
    },

    /// The login secret does not unwrap the private key.
    #[error("login secret does not match")]
    PasswordMismatch,

    #[error("principal {0} has no keypair")]
    NotProvisioned(PrincipalId),

    #[error("principal {0} already has a keypair")]
    AlreadyProvisioned(PrincipalId),

    /// The stored keypair is malformed or inconsistent.
    #[error("corrupt keypair record: {0}")]
    CorruptRecord(String),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Maps private-key unwrap failures onto the session taxonomy.
pub(crate) fn unwrap_error(err: CryptoError) -> SessionError {
    match err {
        CryptoError::InvalidPassphrase => SessionError::PasswordMismatch,
        CryptoError::CorruptKey(msg) => SessionError::CorruptRecord(msg),
        other => SessionError::Crypto(other),
    }
}
