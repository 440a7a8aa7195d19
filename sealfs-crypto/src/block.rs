//! Fixed-size content blocks under a per-file key.
//!
//! Every block is sealed with XChaCha20-Poly1305. The nonce is never stored:
//! it is recomputed from the file key version, the write generation and the
//! block index, so a reader can seek straight to any block.
//!
//! ```text
//! nonce (24 bytes) = key_version (4, BE) || generation (8, BE) || index (8, BE) || 0000
//! aad              = "sealfs-block-v1" || key_version || generation || index || final flag
//! ```
//!
//! The final-block flag is authenticated, so dropping trailing blocks or
//! presenting an inner block as the last one fails the tag check.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use zeroize::Zeroizing;

use crate::cipher::TAG_SIZE;
use crate::error::{CryptoError, CryptoResult};
use crate::key::{DerivedKey, KEY_SIZE, generate_random_key};

/// XChaCha20 nonce size in bytes.
pub const BLOCK_NONCE_SIZE: usize = 24;

/// Default plaintext bytes per block.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Largest accepted plaintext block size.
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

const BLOCK_AAD_DOMAIN: &[u8] = b"sealfs-block-v1";

/// A per-file content key at a specific version.
#[derive(Clone)]
pub struct FileKey {
    version: u32,
    key: DerivedKey,
}

impl FileKey {
    /// Rebuilds a file key from unwrapped bytes.
    pub fn from_bytes(version: u32, bytes: &[u8]) -> CryptoResult<Self> {
        let raw: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: bytes.len(),
        })?;
        let raw = Zeroizing::new(raw);
        Ok(Self {
            version,
            key: DerivedKey::from_bytes(*raw),
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        self.key.as_bytes()
    }
}

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileKey")
            .field("version", &self.version)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Generates a fresh random file key for `version`.
pub fn generate_file_key(version: u32) -> FileKey {
    FileKey {
        version,
        key: generate_random_key(),
    }
}

/// Where a block sits inside a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockPosition {
    pub index: u64,
    /// Random per-write-session value recorded in the file header.
    pub generation: u64,
    /// Whether this is the last block of the file.
    pub is_final: bool,
}

/// One sealed block. Only `ciphertext` is persisted; the other fields are
/// recovered from the file header and the block's offset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedBlock {
    pub index: u64,
    pub generation: u64,
    pub is_final: bool,
    /// Ciphertext with the Poly1305 tag appended.
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlock {
    pub fn position(&self) -> BlockPosition {
        BlockPosition {
            index: self.index,
            generation: self.generation,
            is_final: self.is_final,
        }
    }

    /// Plaintext length carried by this block.
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(TAG_SIZE)
    }
}

/// Computes the nonce for a block. Deterministic in its inputs, so
/// re-encrypting a block is idempotent only within one write generation;
/// a new write session draws a new generation and yields new ciphertext.
pub fn block_nonce(key_version: u32, generation: u64, index: u64) -> [u8; BLOCK_NONCE_SIZE] {
    let mut nonce = [0u8; BLOCK_NONCE_SIZE];
    nonce[..4].copy_from_slice(&key_version.to_be_bytes());
    nonce[4..12].copy_from_slice(&generation.to_be_bytes());
    nonce[12..20].copy_from_slice(&index.to_be_bytes());
    nonce
}

fn block_aad(key_version: u32, position: BlockPosition) -> Vec<u8> {
    let mut aad = Vec::with_capacity(BLOCK_AAD_DOMAIN.len() + 21);
    aad.extend_from_slice(BLOCK_AAD_DOMAIN);
    aad.extend_from_slice(&key_version.to_be_bytes());
    aad.extend_from_slice(&position.generation.to_be_bytes());
    aad.extend_from_slice(&position.index.to_be_bytes());
    aad.push(u8::from(position.is_final));
    aad
}

/// Encrypts one block of plaintext.
pub fn encrypt_block(
    plaintext: &[u8],
    key: &FileKey,
    position: BlockPosition,
) -> CryptoResult<EncryptedBlock> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = block_nonce(key.version, position.generation, position.index);
    let aad = block_aad(key.version, position);

    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| CryptoError::Encryption(format!("block {}: {e}", position.index)))?;

    Ok(EncryptedBlock {
        index: position.index,
        generation: position.generation,
        is_final: position.is_final,
        ciphertext,
    })
}

/// Decrypts one block. Any mismatch of key, position or content yields
/// [`CryptoError::AuthenticationFailed`] and no plaintext.
pub fn decrypt_block(block: &EncryptedBlock, key: &FileKey) -> CryptoResult<Vec<u8>> {
    if block.ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::AuthenticationFailed { index: block.index });
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = block_nonce(key.version, block.generation, block.index);
    let aad = block_aad(key.version, block.position());

    cipher
        .decrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: &block.ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed { index: block.index })
}
