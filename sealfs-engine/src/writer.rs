//! Buffered block encryption into a staging object.

use std::io::{self, Write};
use std::sync::Arc;

use rand::RngCore;
use sealfs_crypto::{BlockPosition, FileKey, encrypt_block};
use sealfs_keystore::FileId;
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::error::{EngineError, EngineResult, storage_error};
use crate::format::{FileHeader, staging_object};
use crate::locks::FileLockGuard;
use crate::storage::{HostStorage, retry_io};

/// Streaming writer producing a complete new content object.
///
/// Plaintext is buffered to block boundaries and encrypted into a uniquely
/// named staging object. Nothing is visible to readers until [`close`]
/// renames the staging object over the content object. Dropping the writer
/// without closing it discards the staging object, leaving the previous
/// content untouched.
///
/// The last full block is held back until close, because whether it is the
/// final block is only known then.
///
/// [`close`]: EncryptedWriter::close
pub struct EncryptedWriter {
    storage: Arc<dyn HostStorage>,
    retries: u32,
    file: FileId,
    target: String,
    staging: String,
    key: FileKey,
    block_size: usize,
    generation: u64,
    buffer: Zeroizing<Vec<u8>>,
    blocks_written: u64,
    plaintext_len: u64,
    finished: bool,
    _guard: Option<FileLockGuard>,
}

impl std::fmt::Debug for EncryptedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedWriter")
            .field("file", &self.file)
            .field("staging", &self.staging)
            .field("blocks_written", &self.blocks_written)
            .field("buffer_len", &self.buffer.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl EncryptedWriter {
    /// `guard` is held until the writer is closed or dropped; pass `None`
    /// when the caller already holds the file lock.
    pub(crate) fn create(
        storage: Arc<dyn HostStorage>,
        retries: u32,
        file: FileId,
        target: String,
        key: FileKey,
        block_size: usize,
        guard: Option<FileLockGuard>,
    ) -> Self {
        let staging = staging_object(&target);
        let generation = rand::rng().next_u64();
        debug!(file = %file, staging = %staging, version = key.version(), "opened writer");

        Self {
            storage,
            retries,
            file,
            target,
            staging,
            key,
            block_size,
            generation,
            buffer: Zeroizing::new(Vec::with_capacity(block_size * 2)),
            blocks_written: 0,
            plaintext_len: 0,
            finished: false,
            _guard: guard,
        }
    }

    pub fn file(&self) -> &FileId {
        &self.file
    }

    pub fn key_version(&self) -> u32 {
        self.key.version()
    }

    fn write_block(&mut self, plaintext: &[u8], is_final: bool) -> EngineResult<()> {
        let position = BlockPosition {
            index: self.blocks_written,
            generation: self.generation,
            is_final,
        };
        let block = encrypt_block(plaintext, &self.key, position)?;

        let header = FileHeader {
            key_version: self.key.version(),
            block_size: self.block_size as u32,
            generation: self.generation,
            plaintext_len: 0,
        };
        let offset = header.block_offset(position.index).ok_or_else(|| {
            EngineError::InvalidState(format!("{} is too large to encrypt", self.file))
        })?;
        let (storage, staging) = (&self.storage, &self.staging);
        retry_io(self.retries, staging, || {
            storage.write(staging, offset, &block.ciphertext)
        })
        .map_err(|e| storage_error(staging, e))?;

        self.blocks_written += 1;
        trace!(file = %self.file, block = position.index, is_final, "wrote block");
        Ok(())
    }

    /// Buffers `data`, encrypting every block that is known not to be last.
    pub fn write_plaintext(&mut self, data: &[u8]) -> EngineResult<()> {
        if self.finished {
            return Err(EngineError::InvalidState("writer already closed".to_string()));
        }
        self.buffer.extend_from_slice(data);
        self.plaintext_len += data.len() as u64;

        while self.buffer.len() > self.block_size {
            let block: Zeroizing<Vec<u8>> =
                Zeroizing::new(self.buffer.drain(..self.block_size).collect());
            self.write_block(&block, false)?;
        }
        Ok(())
    }

    /// Encrypts the final block, writes the header and commits the content.
    /// Returns the plaintext length.
    pub fn close(mut self) -> EngineResult<u64> {
        if self.finished {
            return Err(EngineError::InvalidState("writer already closed".to_string()));
        }

        let last = std::mem::take(&mut *self.buffer);
        let last = Zeroizing::new(last);
        self.write_block(&last, true)?;

        let header = FileHeader {
            key_version: self.key.version(),
            block_size: self.block_size as u32,
            generation: self.generation,
            plaintext_len: self.plaintext_len,
        }
        .encode();
        let (storage, staging, target) = (&self.storage, &self.staging, &self.target);
        retry_io(self.retries, staging, || storage.write(staging, 0, &header))
            .map_err(|e| storage_error(staging, e))?;
        retry_io(self.retries, target, || storage.rename(staging, target))
            .map_err(|e| storage_error(target, e))?;

        self.finished = true;
        debug!(
            file = %self.file,
            version = self.key.version(),
            blocks = self.blocks_written,
            bytes = self.plaintext_len,
            "committed content"
        );
        Ok(self.plaintext_len)
    }

    /// Discards everything written so far.
    pub fn abort(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        match self.storage.remove(&self.staging) {
            Ok(()) => debug!(file = %self.file, "write aborted, staging removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(staging = %self.staging, error = %e, "failed to remove staging object"),
        }
    }
}

impl Write for EncryptedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_plaintext(buf).map_err(EngineError::into_io)?;
        Ok(buf.len())
    }

    /// Complete blocks are already on storage; the trailing partial block
    /// is only committed by [`EncryptedWriter::close`].
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EncryptedWriter {
    fn drop(&mut self) {
        self.discard();
    }
}
