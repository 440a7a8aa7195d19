//! Cryptographic core of sealfs.
//!
//! This crate is a pure transform: it never persists anything. It provides
//!
//! - Argon2id key derivation from login secrets ([`derive_key`])
//! - ChaCha20-Poly1305 sealing of small secrets under derived keys ([`encrypt`])
//! - X25519 sealed envelopes for wrapping file keys under a principal's
//!   public key ([`seal_key`] / [`open_key`])
//! - passphrase protection of private keys with a verification token
//!   ([`protect_private_key`] / [`unprotect_private_key`])
//! - XChaCha20-Poly1305 content blocks with deterministic per-block nonces
//!   ([`encrypt_block`] / [`decrypt_block`])
//!
//! # Key hierarchy
//!
//! ```text
//! login secret --Argon2id--> derived key --wraps--> principal private key
//! principal public key --sealed envelope--> file key
//! file key --XChaCha20-Poly1305--> content blocks
//! ```
//!
//! Changing a login secret only re-wraps the private key; sharing a file only
//! seals its file key for one more public key. Content is re-encrypted only
//! when the file key itself changes.

mod block;
mod cipher;
pub mod envelope;
mod error;
mod key;
pub mod recovery;

pub use block::{
    BlockPosition, EncryptedBlock, FileKey, block_nonce, decrypt_block, encrypt_block,
    generate_file_key, BLOCK_NONCE_SIZE, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE,
};
pub use cipher::{EncryptedData, NONCE_SIZE, TAG_SIZE, decrypt, encrypt};
pub use envelope::{
    KeyPair, PassphraseProtectedKey, SealedEnvelope, fingerprint, generate_keypair, open_key,
    protect_private_key, seal_key, unprotect_private_key, PRIVATE_KEY_ALGORITHM,
};
pub use error::{CryptoError, CryptoResult};
pub use key::{DerivedKey, KdfParams, Salt, derive_key, generate_random_key, KEY_SIZE, SALT_SIZE};
pub use recovery::{generate_recovery_mnemonic, validate_recovery_mnemonic};

/// Re-exported so downstream crates name the same key types.
pub use crypto_box::{PublicKey, SecretKey};
