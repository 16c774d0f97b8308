//! The store facade.
//!
//! Composes the path encoding, process lock, watcher, permission regime
//! and alias sidecar into the public operations. Every operation takes
//! the single store lock; observers inside the lock therefore see a
//! consistent snapshot of the filesystem and the sidecar together.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tracing::debug;

use crate::aliases::{AliasDb, AliasEntry, METADATA_DB_FILENAME};
use crate::content::{ContentRef, Item};
use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::hashing::{ContentHasher, TreeHasher};
use crate::lock::StoreLock;
use crate::paths;
use crate::perms::MutationWindow;
use crate::watcher::DirWatcher;

mod listing;
mod transitions;
mod waiter;

pub use listing::Listing;
pub use waiter::{Update, Waiter};

use transitions::EntryState;

/// Per-key status with unit payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryStatus {
    Missing,
    Pending,
    Complete,
}

/// Result of [`ContentStore::lookup`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    Missing,
    Pending,
    Complete(Item),
}

/// Result of [`ContentStore::construct_or_async`].
#[derive(Debug)]
pub enum Construct {
    /// The caller owns construction: populate the build directory, then
    /// call [`ContentStore::mark_complete`] (or clean up with
    /// [`ContentStore::remove_failed`]).
    Missing(PathBuf),
    /// Another party is building; the waiter resolves to the outcome.
    Pending(Waiter),
    Complete(Item),
}

/// Result of [`ContentStore::lookup_or_wait`].
#[derive(Debug)]
pub enum LookupWait {
    Missing,
    Pending(Waiter),
    Complete(Item),
}

/// Result of [`ContentStore::construct_if_missing`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Claim {
    Missing(PathBuf),
    Pending,
    Complete(Item),
}

/// Result of [`ContentStore::construct_or_wait`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    Missing(PathBuf),
    Complete(Item),
}

pub(crate) struct StoreInner {
    root: PathBuf,
    lock: StoreLock,
    aliases: Mutex<AliasDb>,
    watcher: DirWatcher,
    hasher: Arc<dyn ContentHasher>,
    closed: AtomicBool,
}

impl StoreInner {
    fn alias_db(&self) -> MutexGuard<'_, AliasDb> {
        self.aliases.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Hash-addressed store of immutable artifact trees, safe against
/// concurrent construction from multiple threads and processes sharing
/// the same root.
#[derive(Clone)]
pub struct ContentStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentStore")
            .field("root", &self.inner.root)
            .finish()
    }
}

impl ContentStore {
    /// Open (creating if necessary) the store rooted at `root`, using the
    /// built-in directory hasher.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created, the sidecar schema
    /// cannot be initialized, or background machinery fails to start.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_hasher(root, Arc::new(TreeHasher))
    }

    /// Open the store at the default root (see [`default_store_root`]).
    ///
    /// # Errors
    ///
    /// See [`ContentStore::open`].
    pub fn open_default() -> Result<Self> {
        Self::open(default_store_root()?)
    }

    /// Open with a caller-supplied hasher.
    ///
    /// # Errors
    ///
    /// See [`ContentStore::open`].
    pub fn open_with_hasher(
        root: impl Into<PathBuf>,
        hasher: Arc<dyn ContentHasher>,
    ) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create store root {}", root.display()))?;
        // A fresh root is writable and an existing root already carries
        // the lock file, so the lock can be set up before any permission
        // change. Everything else runs under it: the setup window below
        // also heals a root left writable by a crashed window.
        let lock = StoreLock::new(&root);
        lock.ensure_lock_file()?;
        let aliases = {
            let _guard = lock.acquire()?;
            let window = MutationWindow::open(&root)?;
            let aliases = AliasDb::open(&root.join(METADATA_DB_FILENAME))?;
            drop(window);
            aliases
        };
        let watcher = DirWatcher::new()?;
        debug!(root = %root.display(), "content store opened");
        Ok(Self {
            inner: Arc::new(StoreInner {
                root,
                lock,
                aliases: Mutex::new(aliases),
                watcher,
                hasher,
                closed: AtomicBool::new(false),
            }),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Release background resources (the watcher and its ticker).
    /// Idempotent. Queries keep working afterwards; new waiters can no
    /// longer be registered.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.watcher.shutdown();
        debug!(root = %self.inner.root.display(), "content store closed");
    }

    /// Absolute path of an item's tree.
    #[must_use]
    pub fn item_path(&self, item: &Item) -> PathBuf {
        self.inner.root.join(paths::item_dir_name(item.hash()))
    }

    /// Absolute path addressed by a content reference.
    #[must_use]
    pub fn content_path(&self, content: &ContentRef) -> PathBuf {
        self.item_path(content.item()).join(content.relative_path())
    }

    /// Status of `key`, observed under the store lock.
    ///
    /// # Errors
    ///
    /// Surfaces `CorruptedLink` and I/O failures.
    pub fn query(&self, key: &Fingerprint) -> Result<EntryStatus> {
        let _guard = self.inner.lock.acquire()?;
        Ok(self.inner.read_entry(key)?.status())
    }

    /// # Errors
    ///
    /// See [`ContentStore::query`].
    pub fn is_missing(&self, key: &Fingerprint) -> Result<bool> {
        Ok(self.query(key)? == EntryStatus::Missing)
    }

    /// # Errors
    ///
    /// See [`ContentStore::query`].
    pub fn is_pending(&self, key: &Fingerprint) -> Result<bool> {
        Ok(self.query(key)? == EntryStatus::Pending)
    }

    /// # Errors
    ///
    /// See [`ContentStore::query`].
    pub fn is_complete(&self, key: &Fingerprint) -> Result<bool> {
        Ok(self.query(key)? == EntryStatus::Complete)
    }

    /// Like [`ContentStore::query`], but returns the item on completion.
    ///
    /// # Errors
    ///
    /// Surfaces `CorruptedLink` and I/O failures.
    pub fn lookup(&self, key: &Fingerprint) -> Result<Lookup> {
        let _guard = self.inner.lock.acquire()?;
        Ok(match self.inner.read_entry(key)? {
            EntryState::Missing => Lookup::Missing,
            EntryState::Pending(_) => Lookup::Pending,
            EntryState::Complete(item) => Lookup::Complete(item),
        })
    }

    /// Like [`ContentStore::lookup`], but a pending key yields a waiter
    /// for the terminal outcome.
    ///
    /// # Errors
    ///
    /// See [`ContentStore::query`]; also fails if the waiter cannot be
    /// registered (for example after [`ContentStore::close`]).
    pub fn lookup_or_wait(&self, key: &Fingerprint) -> Result<LookupWait> {
        let _guard = self.inner.lock.acquire()?;
        Ok(match self.inner.read_entry(key)? {
            EntryState::Missing => LookupWait::Missing,
            EntryState::Pending(dir) => LookupWait::Pending(self.spawn_waiter(*key, dir)?),
            EntryState::Complete(item) => LookupWait::Complete(item),
        })
    }

    /// Block until `key` reaches a terminal state. Returns `None` when
    /// the key was never pending or its construction failed.
    ///
    /// # Errors
    ///
    /// See [`ContentStore::lookup_or_wait`].
    pub fn wait_until_complete(&self, key: &Fingerprint) -> Result<Option<Item>> {
        match self.lookup_or_wait(key)? {
            LookupWait::Missing => Ok(None),
            LookupWait::Complete(item) => Ok(Some(item)),
            LookupWait::Pending(waiter) => Ok(match waiter.wait()? {
                Update::Completed(item) => Some(item),
                Update::Failed => None,
            }),
        }
    }

    /// Atomically claim construction of `key`, subscribe to an in-flight
    /// build, or return the finished item. All three outcomes are decided
    /// in one lock-held critical section; the returned build directory is
    /// mutated by the caller outside the lock.
    ///
    /// # Errors
    ///
    /// See [`ContentStore::lookup_or_wait`].
    pub fn construct_or_async(&self, key: &Fingerprint) -> Result<Construct> {
        let _guard = self.inner.lock.acquire()?;
        Ok(match self.inner.read_entry(key)? {
            EntryState::Missing => Construct::Missing(self.inner.create_build_dir(key)?),
            EntryState::Pending(dir) => Construct::Pending(self.spawn_waiter(*key, dir)?),
            EntryState::Complete(item) => Construct::Complete(item),
        })
    }

    /// Like [`ContentStore::construct_or_async`], but blocks while
    /// another party builds.
    ///
    /// # Errors
    ///
    /// Raises [`StoreError::FailedToConstruct`] when the awaited build is
    /// abandoned instead of completed.
    pub fn construct_or_wait(&self, key: &Fingerprint) -> Result<BuildOutcome> {
        match self.construct_or_async(key)? {
            Construct::Missing(dir) => Ok(BuildOutcome::Missing(dir)),
            Construct::Complete(item) => Ok(BuildOutcome::Complete(item)),
            Construct::Pending(waiter) => match waiter.wait()? {
                Update::Completed(item) => Ok(BuildOutcome::Complete(item)),
                Update::Failed => Err(StoreError::FailedToConstruct { key: *key }.into()),
            },
        }
    }

    /// Like [`ContentStore::construct_or_async`], without subscribing a
    /// waiter to an in-flight build.
    ///
    /// # Errors
    ///
    /// See [`ContentStore::query`].
    pub fn construct_if_missing(&self, key: &Fingerprint) -> Result<Claim> {
        let _guard = self.inner.lock.acquire()?;
        Ok(match self.inner.read_entry(key)? {
            EntryState::Missing => Claim::Missing(self.inner.create_build_dir(key)?),
            EntryState::Pending(_) => Claim::Pending,
            EntryState::Complete(item) => Claim::Complete(item),
        })
    }

    /// Transition `key` from missing to pending, returning the writable
    /// build directory.
    ///
    /// # Errors
    ///
    /// Raises `AlreadyPending` or `AlreadyComplete` when the key is not
    /// missing.
    pub fn mark_pending(&self, key: &Fingerprint) -> Result<PathBuf> {
        let _guard = self.inner.lock.acquire()?;
        match self.inner.read_entry(key)? {
            EntryState::Missing => self.inner.create_build_dir(key),
            EntryState::Pending(_) => Err(StoreError::AlreadyPending { key: *key }.into()),
            EntryState::Complete(_) => Err(StoreError::AlreadyComplete { key: *key }.into()),
        }
    }

    /// Finalize the pending build for `key`: the tree is made read-only,
    /// hashed, deduplicated against existing items, moved into place and
    /// linked.
    ///
    /// # Errors
    ///
    /// Raises `NotPending` when no build exists and `AlreadyComplete`
    /// when the key already resolves.
    pub fn mark_complete(&self, key: &Fingerprint) -> Result<Item> {
        let _guard = self.inner.lock.acquire()?;
        match self.inner.read_entry(key)? {
            EntryState::Pending(dir) => self.inner.finalize_build(key, &dir),
            EntryState::Missing => Err(StoreError::NotPending { key: *key }.into()),
            EntryState::Complete(_) => Err(StoreError::AlreadyComplete { key: *key }.into()),
        }
    }

    /// Discard the pending build for `key`.
    ///
    /// # Errors
    ///
    /// Raises `NotPending` when no build exists.
    pub fn remove_failed(&self, key: &Fingerprint) -> Result<()> {
        let _guard = self.inner.lock.acquire()?;
        self.inner.remove_failed(key)
    }

    /// Remove whichever of the pending directory or completion link
    /// exists for `key`; a no-op when neither does. The item tree a link
    /// pointed at survives, as do aliases.
    ///
    /// # Errors
    ///
    /// Surfaces I/O failures only.
    pub fn remove_forcibly(&self, key: &Fingerprint) -> Result<()> {
        let _guard = self.inner.lock.acquire()?;
        self.inner.remove_forcibly(key)
    }

    /// Delete an item tree outright. Completion links and aliases that
    /// referenced it are left dangling and tolerated.
    ///
    /// # Errors
    ///
    /// Surfaces I/O failures only.
    pub fn remove_item_forcibly(&self, item: &Item) -> Result<()> {
        let _guard = self.inner.lock.acquire()?;
        self.inner.remove_item_forcibly(item)
    }

    /// Point `name` at `item`, replacing any previous assignment.
    ///
    /// # Errors
    ///
    /// Surfaces sidecar and permission failures.
    pub fn assign_alias(&self, name: &str, item: &Item) -> Result<()> {
        let _guard = self.inner.lock.acquire()?;
        let hash = self.inner.hasher.hash_alias(name);
        let window = MutationWindow::open(&self.inner.root)?;
        self.inner.alias_db().upsert(&hash, item.hash(), name)?;
        drop(window);
        debug!(alias = name, item = %item, "alias assigned");
        Ok(())
    }

    /// Resolve `name` to its item, if assigned.
    ///
    /// # Errors
    ///
    /// Surfaces sidecar failures.
    pub fn lookup_alias(&self, name: &str) -> Result<Option<Item>> {
        let _guard = self.inner.lock.acquire()?;
        let hash = self.inner.hasher.hash_alias(name);
        Ok(self.inner.alias_db().lookup(&hash)?.map(Item::new))
    }

    /// Drop the assignment for `name`; a no-op when absent.
    ///
    /// # Errors
    ///
    /// Surfaces sidecar and permission failures.
    pub fn remove_alias(&self, name: &str) -> Result<()> {
        let _guard = self.inner.lock.acquire()?;
        let hash = self.inner.hasher.hash_alias(name);
        let window = MutationWindow::open(&self.inner.root)?;
        let _ = self.inner.alias_db().remove(&hash)?;
        drop(window);
        Ok(())
    }

    /// Every alias currently assigned, ordered by name.
    ///
    /// # Errors
    ///
    /// Surfaces sidecar failures.
    pub fn list_aliases(&self) -> Result<Vec<AliasEntry>> {
        let _guard = self.inner.lock.acquire()?;
        self.inner.alias_db().list()
    }
}

/// Open a store, run `action`, and close the store on every exit path.
///
/// # Errors
///
/// Propagates open failures and whatever `action` returns.
pub fn with_store<T, F>(root: impl Into<PathBuf>, action: F) -> Result<T>
where
    F: FnOnce(&ContentStore) -> Result<T>,
{
    let store = ContentStore::open(root)?;
    let result = action(&store);
    store.close();
    result
}

/// Resolve the default store root: the `CASK_STORE_PATH` override when
/// set, else the platform cache directory.
///
/// # Errors
///
/// Fails when no home directory can be determined.
pub fn default_store_root() -> Result<PathBuf> {
    if let Some(path) = env::var_os("CASK_STORE_PATH") {
        return Ok(PathBuf::from(path));
    }
    if let Some(xdg) = env::var_os("XDG_CACHE_HOME") {
        return Ok(PathBuf::from(xdg).join("cask").join("store"));
    }
    let home = dirs_next::home_dir().context("unable to determine home directory")?;
    Ok(home.join(".cache").join("cask").join("store"))
}

#[cfg(test)]
mod tests;
