//! The single store lock.
//!
//! One exclusive lock serializes every state change against a root, across
//! threads of this process and across other processes holding the same
//! root open. The in-process mutex is taken first, then the advisory file
//! lock on `<root>/lock`; release happens in reverse order via the guard.
//! The lock is not reentrant.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use fs4::FileExt;

const LOCK_FILENAME: &str = "lock";

#[derive(Debug)]
pub(crate) struct StoreLock {
    path: PathBuf,
    mutex: Mutex<()>,
}

impl StoreLock {
    pub(crate) fn new(root: &Path) -> Self {
        Self {
            path: root.join(LOCK_FILENAME),
            mutex: Mutex::new(()),
        }
    }

    /// Create the lock file. Must run while the root is writable; later
    /// acquisitions only open the existing file.
    pub(crate) fn ensure_lock_file(&self) -> Result<()> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)
            .map(drop)
            .with_context(|| format!("failed to create store lock file {}", self.path.display()))
    }

    pub(crate) fn acquire(&self) -> Result<StoreLockGuard<'_>> {
        let thread = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("failed to open store lock {}", self.path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", self.path.display()))?;
        Ok(StoreLockGuard {
            file,
            _thread: thread,
        })
    }
}

#[derive(Debug)]
pub(crate) struct StoreLockGuard<'a> {
    file: File,
    _thread: MutexGuard<'a, ()>,
}

impl Drop for StoreLockGuard<'_> {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn acquisitions_serialize_across_threads() -> Result<()> {
        let temp = tempdir()?;
        let lock = Arc::new(StoreLock::new(temp.path()));
        lock.ensure_lock_file()?;
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || -> Result<()> {
                for _ in 0..10 {
                    let _guard = lock.acquire()?;
                    // A non-atomic read-modify-write; lost updates would
                    // betray overlapping critical sections.
                    let value = counter.load(Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(1));
                    counter.store(value + 1, Ordering::SeqCst);
                }
                Ok(())
            }));
        }
        for handle in handles {
            handle.join().expect("lock thread panicked")?;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 40);
        Ok(())
    }

    #[test]
    fn guard_release_allows_reacquisition() -> Result<()> {
        let temp = tempdir()?;
        let lock = StoreLock::new(temp.path());
        lock.ensure_lock_file()?;
        drop(lock.acquire()?);
        drop(lock.acquire()?);
        Ok(())
    }
}
