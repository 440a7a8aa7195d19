//! Encrypted file layout.
//!
//! ```text
//! header (32 bytes):
//!   magic "SLFS" (4) | format (1) | reserved (3) | key_version (4, BE)
//!   block_size (4, BE) | generation (8, BE) | plaintext_len (8, BE)
//! blocks:
//!   block_count = max(1, ceil(plaintext_len / block_size))
//!   every block is block_size + 16 bytes of ciphertext, the last one shorter
//! ```
//!
//! The header is not sealed itself, but every field a reader depends on is
//! bound into the blocks: version and generation through the nonce and AAD,
//! block size and length through block boundaries and the final-block flag.

use sealfs_crypto::{MAX_BLOCK_SIZE, TAG_SIZE};
use sealfs_keystore::FileId;

use crate::error::{EngineError, EngineResult};

pub const MAGIC: [u8; 4] = *b"SLFS";
pub const FORMAT_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub key_version: u32,
    pub block_size: u32,
    pub generation: u64,
    pub plaintext_len: u64,
}

impl FileHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&MAGIC);
        out[4] = FORMAT_VERSION;
        out[8..12].copy_from_slice(&self.key_version.to_be_bytes());
        out[12..16].copy_from_slice(&self.block_size.to_be_bytes());
        out[16..24].copy_from_slice(&self.generation.to_be_bytes());
        out[24..32].copy_from_slice(&self.plaintext_len.to_be_bytes());
        out
    }

    pub fn decode(file: &FileId, bytes: &[u8]) -> EngineResult<Self> {
        let corrupt = |why: &str| EngineError::CorruptRecord(format!("header of {file}: {why}"));

        let bytes: &[u8; HEADER_SIZE] = bytes
            .get(..HEADER_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| corrupt("truncated"))?;
        if bytes[..4] != MAGIC {
            return Err(corrupt("bad magic"));
        }
        if bytes[4] != FORMAT_VERSION {
            return Err(corrupt("unsupported format"));
        }

        let u32_at = |at: usize| {
            u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[at..at + 8]);
            u64::from_be_bytes(b)
        };

        let header = Self {
            key_version: u32_at(8),
            block_size: u32_at(12),
            generation: u64_at(16),
            plaintext_len: u64_at(24),
        };
        if header.block_size == 0 || header.block_size as usize > MAX_BLOCK_SIZE {
            return Err(corrupt("bad block size"));
        }
        Ok(header)
    }

    pub fn block_size(&self) -> u64 {
        u64::from(self.block_size)
    }

    /// Number of blocks; an empty file still has one (empty) final block.
    pub fn block_count(&self) -> u64 {
        self.plaintext_len.div_ceil(self.block_size()).max(1)
    }

    pub fn block_of(&self, offset: u64) -> u64 {
        offset / self.block_size()
    }

    /// Byte offset of block `index` inside the content object, `None` if it
    /// does not fit in a `u64`.
    pub fn block_offset(&self, index: u64) -> Option<u64> {
        index
            .checked_mul(self.block_size() + TAG_SIZE as u64)?
            .checked_add(HEADER_SIZE as u64)
    }

    /// Plaintext bytes carried by block `index`.
    pub fn block_plaintext_len(&self, index: u64) -> usize {
        let start = index.saturating_mul(self.block_size());
        self.plaintext_len.saturating_sub(start).min(self.block_size()) as usize
    }

    pub fn is_final(&self, index: u64) -> bool {
        index.checked_add(1) == Some(self.block_count())
    }

    /// Expected size of the content object, `None` if the header claims a
    /// length no object could have.
    pub fn encrypted_len(&self) -> Option<u64> {
        self.block_count()
            .checked_mul(TAG_SIZE as u64)?
            .checked_add(self.plaintext_len)?
            .checked_add(HEADER_SIZE as u64)
    }

    /// Checks the header against the real size of its content object.
    ///
    /// The length field is not authenticated until the final block is, so
    /// nothing may be sized from it before this check passes.
    pub fn check_object_size(&self, file: &FileId, actual: u64) -> EngineResult<()> {
        match self.encrypted_len() {
            Some(expected) if expected == actual => Ok(()),
            Some(expected) => Err(EngineError::CorruptRecord(format!(
                "header of {file}: expects {expected} bytes, object holds {actual}"
            ))),
            None => Err(EngineError::CorruptRecord(format!(
                "header of {file}: length {} out of range",
                self.plaintext_len
            ))),
        }
    }
}

/// Host object holding content of file key version `version`.
pub fn content_object(file: &FileId, version: u32) -> String {
    format!("{file}@v{version}")
}

/// Unique staging object for an in-progress write.
pub fn staging_object(target: &str) -> String {
    format!("{target}.{}.part", uuid::Uuid::new_v4())
}
