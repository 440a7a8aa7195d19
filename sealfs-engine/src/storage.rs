//! Host storage abstraction.
//!
//! The engine sees host storage as a flat namespace of byte objects with
//! positional reads and writes. Encrypted content, staging objects and
//! plaintext files are all just objects to it.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::warn;

/// Byte-object storage the engine encrypts into.
pub trait HostStorage: Send + Sync {
    /// Reads up to `len` bytes at `offset`. Returns fewer bytes at end of object.
    fn read(&self, object: &str, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    /// Writes `data` at `offset`, creating or extending the object.
    fn write(&self, object: &str, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Size of the object; `NotFound` if it does not exist.
    fn size(&self, object: &str) -> io::Result<u64>;

    fn exists(&self, object: &str) -> io::Result<bool>;

    /// Atomically replaces `to` with `from`.
    fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    fn remove(&self, object: &str) -> io::Result<()>;
}

fn not_found(object: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such object: {object}"))
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Runs `op`, retrying transient failures up to `retries` times.
pub(crate) fn retry_io<T>(
    retries: u32,
    what: &str,
    mut op: impl FnMut() -> io::Result<T>,
) -> io::Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if attempt < retries && is_transient(&e) => {
                attempt += 1;
                warn!(object = what, attempt, error = %e, "transient storage error, retrying");
                std::thread::sleep(Duration::from_millis(5 * u64::from(attempt)));
            }
            result => return result,
        }
    }
}

// ============================================================================
// MemoryStorage
// ============================================================================

/// Process-local [`HostStorage`].
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking writer leaves at worst one partially written object.
    fn read_objects(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<u8>>> {
        self.objects.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_objects(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<u8>>> {
        self.objects.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Names of all stored objects, sorted.
    pub fn objects(&self) -> Vec<String> {
        let objects = self.read_objects();
        let mut names: Vec<_> = objects.keys().cloned().collect();
        names.sort();
        names
    }

    /// Overwrites one byte of an object in place.
    pub fn corrupt_byte(&self, object: &str, offset: usize) -> io::Result<()> {
        let mut objects = self.write_objects();
        let data = objects.get_mut(object).ok_or_else(|| not_found(object))?;
        let byte = data
            .get_mut(offset)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset past end"))?;
        *byte ^= 0x55;
        Ok(())
    }
}

impl HostStorage for MemoryStorage {
    fn read(&self, object: &str, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let objects = self.read_objects();
        let data = objects.get(object).ok_or_else(|| not_found(object))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn write(&self, object: &str, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let mut objects = self.write_objects();
        let data = objects.entry(object.to_string()).or_default();
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
        let end = start
            .checked_add(bytes.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn size(&self, object: &str) -> io::Result<u64> {
        let objects = self.read_objects();
        objects
            .get(object)
            .map(|d| d.len() as u64)
            .ok_or_else(|| not_found(object))
    }

    fn exists(&self, object: &str) -> io::Result<bool> {
        let objects = self.read_objects();
        Ok(objects.contains_key(object))
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let mut objects = self.write_objects();
        let data = objects.remove(from).ok_or_else(|| not_found(from))?;
        objects.insert(to.to_string(), data);
        Ok(())
    }

    fn remove(&self, object: &str) -> io::Result<()> {
        let mut objects = self.write_objects();
        objects.remove(object).map(|_| ()).ok_or_else(|| not_found(object))
    }
}

// ============================================================================
// FsStorage
// ============================================================================

/// [`HostStorage`] backed by a directory. Object names are hex-encoded into
/// file names so any name maps to exactly one file inside `root`.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path(&self, object: &str) -> PathBuf {
        self.root.join(hex::encode(object.as_bytes()))
    }
}

impl HostStorage for FsStorage {
    fn read(&self, object: &str, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut file = fs::File::open(self.path(object))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn write(&self, object: &str, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.path(object))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }

    fn size(&self, object: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.path(object))?.len())
    }

    fn exists(&self, object: &str) -> io::Result<bool> {
        self.path(object).try_exists()
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let from_path = self.path(from);
        fs::File::open(&from_path)?.sync_all()?;
        fs::rename(from_path, self.path(to))
    }

    fn remove(&self, object: &str) -> io::Result<()> {
        fs::remove_file(self.path(object))
    }
}
