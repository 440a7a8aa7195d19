//! KeyStore error types.

use thiserror::Error;

/// Result type for key store operations.
pub type KeyStoreResult<T> = Result<T, KeyStoreError>;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// The record does not exist. Expected and recoverable.
    #[error("not found: {0}")]
    NotFound(String),

    /// A persisted record could not be decoded.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// A share key record set was rejected before anything was written.
    #[error("invalid record set: {0}")]
    InvalidRecordSet(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl KeyStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
