//! Plaintext view over an encrypted content object.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use sealfs_crypto::{CryptoError, EncryptedBlock, FileKey, TAG_SIZE, decrypt_block};
use sealfs_keystore::FileId;
use tracing::{trace, warn};
use zeroize::Zeroizing;

use crate::error::{EngineError, EngineResult, storage_error};
use crate::format::{FileHeader, HEADER_SIZE};
use crate::storage::{HostStorage, retry_io};

/// Random-access plaintext reader.
///
/// Blocks are fetched and decrypted on demand; only the block under the
/// cursor is kept in memory. Once a block fails authentication the reader
/// is poisoned and every further read fails, so no bytes past a tampered
/// block are ever returned.
pub struct EncryptedReader {
    storage: Arc<dyn HostStorage>,
    retries: u32,
    file: FileId,
    object: String,
    key: FileKey,
    header: FileHeader,
    position: u64,
    cached: Option<(u64, Zeroizing<Vec<u8>>)>,
    poisoned: Option<u64>,
}

impl std::fmt::Debug for EncryptedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedReader")
            .field("file", &self.file)
            .field("object", &self.object)
            .field("len", &self.header.plaintext_len)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

/// Reads and decodes the header of a content object.
pub(crate) fn read_header(
    storage: &dyn HostStorage,
    retries: u32,
    file: &FileId,
    object: &str,
) -> EngineResult<FileHeader> {
    let bytes = retry_io(retries, object, || storage.read(object, 0, HEADER_SIZE))
        .map_err(|e| storage_error(object, e))?;
    FileHeader::decode(file, &bytes)
}

/// Reads the header of a content object and checks it against the object's
/// size, so a forged length is caught before anything trusts it.
pub(crate) fn read_checked_header(
    storage: &dyn HostStorage,
    retries: u32,
    file: &FileId,
    object: &str,
) -> EngineResult<FileHeader> {
    let header = read_header(storage, retries, file, object)?;
    let size = retry_io(retries, object, || storage.size(object))
        .map_err(|e| storage_error(object, e))?;
    header.check_object_size(file, size)?;
    Ok(header)
}

impl EncryptedReader {
    pub(crate) fn open(
        storage: Arc<dyn HostStorage>,
        retries: u32,
        file: FileId,
        object: String,
        key: FileKey,
    ) -> EngineResult<Self> {
        let header = read_checked_header(storage.as_ref(), retries, &file, &object)?;
        if header.key_version != key.version() {
            return Err(EngineError::CorruptRecord(format!(
                "{object} is encrypted under v{}, expected v{}",
                header.key_version,
                key.version()
            )));
        }

        Ok(Self {
            storage,
            retries,
            file,
            object,
            key,
            header,
            position: 0,
            cached: None,
            poisoned: None,
        })
    }

    /// Plaintext length of the file.
    pub fn len(&self) -> u64 {
        self.header.plaintext_len
    }

    pub fn is_empty(&self) -> bool {
        self.header.plaintext_len == 0
    }

    pub fn file(&self) -> &FileId {
        &self.file
    }

    pub fn key_version(&self) -> u32 {
        self.header.key_version
    }

    fn auth_failed(&mut self, index: u64) -> EngineError {
        // A concurrent commit swaps the object under us; that is not tampering.
        let current = read_header(self.storage.as_ref(), self.retries, &self.file, &self.object);
        if let Ok(current) = current {
            if current.generation != self.header.generation {
                return EngineError::Conflict(self.file.clone());
            }
        }
        self.poisoned = Some(index);
        warn!(file = %self.file, block = index, "block failed authentication");
        EngineError::AuthenticationFailed {
            file: self.file.clone(),
            block: index,
        }
    }

    /// Decrypts block `index`.
    pub fn read_block(&mut self, index: u64) -> EngineResult<Zeroizing<Vec<u8>>> {
        if let Some(block) = self.poisoned {
            return Err(EngineError::AuthenticationFailed {
                file: self.file.clone(),
                block,
            });
        }
        if index >= self.header.block_count() {
            return Err(EngineError::InvalidState(format!(
                "block {index} past end of {}",
                self.file
            )));
        }

        let expected = self.header.block_plaintext_len(index);
        let offset = self.header.block_offset(index).ok_or_else(|| {
            EngineError::CorruptRecord(format!("block {index} of {} out of range", self.file))
        })?;
        let object = &self.object;
        let storage = &self.storage;
        let ciphertext = retry_io(self.retries, object, || {
            storage.read(object, offset, expected + TAG_SIZE)
        })
        .map_err(|e| storage_error(object, e))?;

        if ciphertext.len() != expected + TAG_SIZE {
            return Err(self.auth_failed(index));
        }

        let block = EncryptedBlock {
            index,
            generation: self.header.generation,
            is_final: self.header.is_final(index),
            ciphertext,
        };
        match decrypt_block(&block, &self.key) {
            Ok(plaintext) if plaintext.len() == expected => {
                trace!(file = %self.file, block = index, "decrypted block");
                Ok(Zeroizing::new(plaintext))
            }
            Ok(_) | Err(CryptoError::AuthenticationFailed { .. }) => Err(self.auth_failed(index)),
            Err(e) => Err(e.into()),
        }
    }

    fn cached_block(&mut self, index: u64) -> EngineResult<&[u8]> {
        if self.cached.as_ref().is_none_or(|(i, _)| *i != index) {
            let block = self.read_block(index)?;
            self.cached = Some((index, block));
        }
        Ok(self.cached.as_ref().map(|(_, b)| b.as_slice()).unwrap_or_default())
    }

    /// Reads up to `buf.len()` bytes at the cursor.
    pub fn read_plaintext(&mut self, buf: &mut [u8]) -> EngineResult<usize> {
        if buf.is_empty() || self.position >= self.header.plaintext_len {
            return Ok(0);
        }

        let index = self.header.block_of(self.position);
        let within = (self.position - index * self.header.block_size()) as usize;
        let block = self.cached_block(index)?;
        let n = (block.len() - within).min(buf.len());
        buf[..n].copy_from_slice(&block[within..within + n]);
        self.position += n as u64;
        Ok(n)
    }

    /// Reads the whole file from the start.
    pub fn read_all(&mut self) -> EngineResult<Zeroizing<Vec<u8>>> {
        self.position = 0;
        let mut out = Zeroizing::new(Vec::new());
        self.read_to_end(&mut *out).map_err(EngineError::from_io)?;
        Ok(out)
    }
}

impl Read for EncryptedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_plaintext(buf).map_err(EngineError::into_io)
    }
}

impl Seek for EncryptedReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(d) => self.header.plaintext_len.checked_add_signed(d),
            SeekFrom::Current(d) => self.position.checked_add_signed(d),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file")
        })?;
        self.position = target;
        Ok(target)
    }
}
