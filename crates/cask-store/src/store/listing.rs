use std::fs;

use anyhow::{Context, Result};

use super::ContentStore;
use crate::fingerprint::Fingerprint;
use crate::paths::{self, RootEntry};

/// Snapshot of every key and item under the store root.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Listing {
    pub pending: Vec<Fingerprint>,
    pub complete: Vec<Fingerprint>,
    pub items: Vec<Fingerprint>,
}

impl ContentStore {
    /// Scan the root once, classifying every entry by prefix. Entries
    /// the store does not own (the lock file, the sidecar) are skipped.
    ///
    /// # Errors
    ///
    /// Surfaces I/O failures while reading the root.
    pub fn list_all(&self) -> Result<Listing> {
        let _guard = self.inner.lock.acquire()?;
        let mut listing = Listing::default();
        let entries = fs::read_dir(&self.inner.root)
            .with_context(|| format!("failed to read store root {}", self.inner.root.display()))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match paths::classify(name) {
                Some(RootEntry::Pending(hash)) => listing.pending.push(hash),
                Some(RootEntry::Complete(hash)) => listing.complete.push(hash),
                Some(RootEntry::Item(hash)) => listing.items.push(hash),
                None => {}
            }
        }
        listing.pending.sort_unstable();
        listing.complete.sort_unstable();
        listing.items.sort_unstable();
        Ok(listing)
    }

    /// Keys with an in-flight build.
    ///
    /// # Errors
    ///
    /// See [`ContentStore::list_all`].
    pub fn list_pending(&self) -> Result<Vec<Fingerprint>> {
        Ok(self.list_all()?.pending)
    }

    /// Keys with a completion link.
    ///
    /// # Errors
    ///
    /// See [`ContentStore::list_all`].
    pub fn list_complete(&self) -> Result<Vec<Fingerprint>> {
        Ok(self.list_all()?.complete)
    }

    /// Item fingerprints present in the store.
    ///
    /// # Errors
    ///
    /// See [`ContentStore::list_all`].
    pub fn list_items(&self) -> Result<Vec<Fingerprint>> {
        Ok(self.list_all()?.items)
    }
}
