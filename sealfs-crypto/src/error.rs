//! Crypto error types.

use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur in cryptographic operations.
///
/// Messages say *what* failed, never anything derived from key material.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// A sealed envelope did not open with the supplied private key.
    #[error("wrapped key does not open with this private key")]
    WrongKey,

    /// A content block failed its authentication tag check.
    #[error("block {index} failed authentication")]
    AuthenticationFailed { index: u64 },

    /// The passphrase did not reproduce the verification token.
    #[error("passphrase does not unlock this key")]
    InvalidPassphrase,

    /// Wrapped key material is malformed (bad algorithm id, bad length, ...).
    #[error("corrupt key material: {0}")]
    CorruptKey(String),
}
