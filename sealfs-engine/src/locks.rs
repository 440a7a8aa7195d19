//! Per-file mutual exclusion for record set and content mutations.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use sealfs_keystore::FileId;

use crate::error::{EngineError, EngineResult};

/// Files currently being mutated, with the thread that took each lock.
#[derive(Default)]
pub struct FileLocks {
    held: Mutex<HashMap<FileId, ThreadId>>,
    released: Condvar,
}

/// Exclusive hold on one file; released on drop.
pub struct FileLockGuard {
    locks: Arc<FileLocks>,
    file: FileId,
}

impl FileLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // The guarded set has no invariant a panic could break.
    fn held(&self) -> MutexGuard<'_, HashMap<FileId, ThreadId>> {
        self.held.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Blocks until `file` is free, then holds it.
    ///
    /// Fails with `InvalidState` instead of waiting when the calling thread
    /// took the lock itself, typically through a writer it has not closed.
    pub fn acquire(self: &Arc<Self>, file: &FileId) -> EngineResult<FileLockGuard> {
        let me = thread::current().id();
        let mut held = self.held();
        while let Some(owner) = held.get(file) {
            if *owner == me {
                return Err(EngineError::InvalidState(format!(
                    "{file} is locked by this thread; close its writer first"
                )));
            }
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|p| p.into_inner());
        }
        held.insert(file.clone(), me);
        Ok(FileLockGuard {
            locks: Arc::clone(self),
            file: file.clone(),
        })
    }

    /// Holds `file` if it is free right now.
    pub fn try_acquire(self: &Arc<Self>, file: &FileId) -> Option<FileLockGuard> {
        let mut held = self.held();
        if held.contains_key(file) {
            return None;
        }
        held.insert(file.clone(), thread::current().id());
        Some(FileLockGuard {
            locks: Arc::clone(self),
            file: file.clone(),
        })
    }
}

impl FileLockGuard {
    pub fn file(&self) -> &FileId {
        &self.file
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        self.locks.held().remove(&self.file);
        self.locks.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn second_holder_waits() {
        let locks = FileLocks::new();
        let f = FileId::from("f");
        let guard = locks.acquire(&f).unwrap();
        assert!(locks.try_acquire(&f).is_none());
        assert!(locks.try_acquire(&FileId::from("g")).is_some());
        drop(guard);
        assert!(locks.try_acquire(&f).is_some());
    }

    #[test]
    fn same_thread_reacquire_fails_instead_of_blocking() {
        let locks = FileLocks::new();
        let f = FileId::from("f");
        let guard = locks.acquire(&f).unwrap();
        assert!(matches!(locks.acquire(&f), Err(EngineError::InvalidState(_))));
        drop(guard);
        locks.acquire(&f).unwrap();
    }

    #[test]
    fn serializes_threads() {
        let locks = FileLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _g = locks.acquire(&FileId::from("f")).unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
