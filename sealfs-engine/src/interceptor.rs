//! Plaintext read/write over encrypted host storage.

use std::io::{self, Read};
use std::sync::Arc;

use sealfs_crypto::generate_file_key;
use sealfs_keystore::{FileId, PrincipalId};
use sealfs_session::Session;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::context::Context;
use crate::error::{EngineError, EngineResult, storage_error};
use crate::format::{content_object, staging_object};
use crate::locks::FileLockGuard;
use crate::reader::{EncryptedReader, read_checked_header};
use crate::storage::{HostStorage, retry_io};
use crate::writer::EncryptedWriter;

/// Decorator translating plaintext file I/O into encrypted blocks.
#[derive(Clone)]
pub struct StreamInterceptor {
    ctx: Arc<Context>,
}

impl StreamInterceptor {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Opens `file` for reading as the principal of `session`.
    ///
    /// A file without a share key for the caller, or without committed
    /// content, is `NotFound`. Key or block failures are reported as
    /// inaccessible, never as missing.
    pub fn open_for_read(&self, file: &FileId, session: &Session) -> EngineResult<EncryptedReader> {
        let (marker, key) = self.ctx.resolve_file_key(file, session)?;
        let object = content_object(file, marker.current_version);
        if !self.exists(&object)? {
            return Err(EngineError::NotFound(format!("content of {file}")));
        }
        EncryptedReader::open(
            Arc::clone(&self.ctx.storage),
            self.ctx.config.io_retries,
            file.clone(),
            object,
            key,
        )
    }

    /// Opens `file` for a full rewrite as the principal of `session`.
    ///
    /// A file that was never encrypted gets a fresh file key, wrapped for
    /// every authorized principal before the writer is returned. The writer
    /// holds the file lock until it is closed or dropped; sharing changes
    /// and re-keys of the file on the same thread fail with `InvalidState`
    /// until then, other threads wait.
    pub fn open_for_write(&self, file: &FileId, session: &Session) -> EngineResult<EncryptedWriter> {
        session.public_key()?;
        let guard = self.ctx.locks.acquire(file)?;

        let key = match self.ctx.marker(file)? {
            Some(_) => self.ctx.resolve_file_key(file, session)?.1,
            None => self.create_file_key(file, session.principal(), &guard)?,
        };

        Ok(EncryptedWriter::create(
            Arc::clone(&self.ctx.storage),
            self.ctx.config.io_retries,
            file.clone(),
            content_object(file, key.version()),
            key,
            self.ctx.config.block_size,
            Some(guard),
        ))
    }

    fn create_file_key(
        &self,
        file: &FileId,
        owner: &PrincipalId,
        _guard: &FileLockGuard,
    ) -> EngineResult<sealfs_crypto::FileKey> {
        if !self.ctx.policy.is_authorized(file, owner) {
            return Err(EngineError::NotAuthorized {
                file: file.clone(),
                principal: owner.clone(),
            });
        }

        let _state = self.ctx.state_guard();
        let state = self.ctx.system_state()?;
        let key = generate_file_key(1);
        let recipients = self.ctx.recipients(file, owner, state.mode, &state, None);
        let records = self.ctx.build_record_set(file, &key, &recipients)?;
        let marker = self.ctx.next_marker(file, key.version(), owner, state.mode);
        self.ctx.store.put_share_key_records(&marker, &records)?;

        info!(
            file = %file,
            owner = %owner,
            mode = %state.mode,
            recipients = records.len(),
            "created file key"
        );
        Ok(key)
    }

    fn exists(&self, object: &str) -> EngineResult<bool> {
        let storage = &self.ctx.storage;
        retry_io(self.ctx.config.io_retries, object, || storage.exists(object))
            .map_err(|e| storage_error(object, e))
    }

    /// Reads and decrypts the whole file.
    pub fn read_to_end(&self, file: &FileId, session: &Session) -> EngineResult<Vec<u8>> {
        let mut reader = self.open_for_read(file, session)?;
        Ok(reader.read_all()?.to_vec())
    }

    /// Replaces the file content with `data`.
    pub fn write_all(&self, file: &FileId, session: &Session, data: &[u8]) -> EngineResult<u64> {
        let mut writer = self.open_for_write(file, session)?;
        writer.write_plaintext(data)?;
        writer.close()
    }

    /// Plaintext size from the stored header, without decrypting anything.
    /// A header that disagrees with the object size is `CorruptRecord`.
    pub fn plaintext_size(&self, file: &FileId) -> EngineResult<u64> {
        let marker = self
            .ctx
            .marker(file)?
            .ok_or_else(|| EngineError::NotFound(format!("{file} is not encrypted")))?;
        let object = content_object(file, marker.current_version);
        let header = read_checked_header(
            self.ctx.storage.as_ref(),
            self.ctx.config.io_retries,
            file,
            &object,
        )?;
        Ok(header.plaintext_len)
    }

    /// Encrypts the plaintext object named `file` in place, owned by the
    /// principal of `session`.
    pub fn encrypt_existing(&self, file: &FileId, session: &Session) -> EngineResult<u64> {
        if self.ctx.marker(file)?.is_some() {
            return Err(EngineError::InvalidState(format!("{file} is already encrypted")));
        }
        let raw = file.as_str();
        if !self.exists(raw)? {
            return Err(EngineError::NotFound(format!("object {raw}")));
        }

        let mut writer = self.open_for_write(file, session)?;
        let mut source = ObjectReader::new(self.ctx.storage.as_ref(), raw);
        io::copy(&mut source, &mut writer).map_err(EngineError::from_io)?;
        let len = writer.close()?;

        if let Err(e) = self.ctx.storage.remove(raw) {
            warn!(file = %file, error = %e, "encrypted copy committed but plaintext remains");
        }
        info!(file = %file, bytes = len, "encrypted existing file");
        Ok(len)
    }

    /// Writes the plaintext of `file` back to host storage under its own
    /// name and drops every key record of the file.
    pub fn decrypt_to_plaintext(&self, file: &FileId, session: &Session) -> EngineResult<u64> {
        let _guard = self.ctx.locks.acquire(file)?;
        let mut reader = self.open_for_read(file, session)?;
        let version = reader.key_version();

        let raw = file.as_str();
        let staging = staging_object(raw);
        let storage = self.ctx.storage.as_ref();
        let len = match copy_out(&mut reader, storage, &staging, self.ctx.config.block_size)
            .and_then(|len| {
                storage
                    .rename(&staging, raw)
                    .map(|()| len)
                    .map_err(|e| storage_error(raw, e))
            }) {
            Ok(len) => len,
            Err(e) => {
                if let Err(cleanup) = storage.remove(&staging) {
                    warn!(staging = %staging, error = %cleanup, "failed to remove staging object");
                }
                return Err(e);
            }
        };

        self.ctx.store.delete_file_records(file)?;
        let object = content_object(file, version);
        if let Err(e) = storage.remove(&object) {
            warn!(object = %object, error = %e, "failed to remove encrypted content");
        }
        info!(file = %file, bytes = len, "decrypted file to plaintext");
        Ok(len)
    }

    /// Removes the encrypted content and every key record of `file`.
    pub fn delete_file(&self, file: &FileId) -> EngineResult<()> {
        let _guard = self.ctx.locks.acquire(file)?;
        let marker = self
            .ctx
            .marker(file)?
            .ok_or_else(|| EngineError::NotFound(format!("{file} is not encrypted")))?;

        let object = content_object(file, marker.current_version);
        match self.ctx.storage.remove(&object) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(storage_error(&object, e)),
        }
        self.ctx.store.delete_file_records(file)?;
        info!(file = %file, "deleted encrypted file");
        Ok(())
    }
}

/// Streams the plaintext of `reader` into `object`. Returns bytes written.
fn copy_out(
    reader: &mut EncryptedReader,
    storage: &dyn HostStorage,
    object: &str,
    chunk: usize,
) -> EngineResult<u64> {
    let mut buf = Zeroizing::new(vec![0u8; chunk]);
    let mut offset = 0u64;
    loop {
        let n = reader.read_plaintext(&mut buf)?;
        if n == 0 && offset > 0 {
            return Ok(offset);
        }
        storage
            .write(object, offset, &buf[..n])
            .map_err(|e| storage_error(object, e))?;
        if n == 0 {
            return Ok(0);
        }
        offset += n as u64;
    }
}

/// Sequential `Read` over a plaintext host object.
struct ObjectReader<'a> {
    storage: &'a dyn HostStorage,
    object: &'a str,
    offset: u64,
}

impl<'a> ObjectReader<'a> {
    fn new(storage: &'a dyn HostStorage, object: &'a str) -> Self {
        Self {
            storage,
            object,
            offset: 0,
        }
    }
}

impl Read for ObjectReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let chunk = self.storage.read(self.object, self.offset, buf.len())?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        self.offset += chunk.len() as u64;
        Ok(chunk.len())
    }
}
