use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::hashing;

/// A completed, immutable artifact, identified by the fingerprint of its
/// finished tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Item {
    hash: Fingerprint,
}

impl Item {
    #[must_use]
    pub fn new(hash: Fingerprint) -> Self {
        Self { hash }
    }

    #[must_use]
    pub fn hash(&self) -> &Fingerprint {
        &self.hash
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.hash.fmt(f)
    }
}

/// Reference into store content: an item plus a relative path beneath it.
/// An empty relative path denotes the whole item.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContentRef {
    item: Item,
    rel: PathBuf,
}

impl ContentRef {
    /// Reference an entire item tree.
    #[must_use]
    pub fn whole(item: Item) -> Self {
        Self {
            item,
            rel: PathBuf::new(),
        }
    }

    /// Narrow the reference by a further relative path.
    #[must_use]
    pub fn join(&self, rel: impl AsRef<Path>) -> Self {
        Self {
            item: self.item,
            rel: self.rel.join(rel),
        }
    }

    #[must_use]
    pub fn item(&self) -> &Item {
        &self.item
    }

    #[must_use]
    pub fn relative_path(&self) -> &Path {
        &self.rel
    }

    /// Deterministic fingerprint of the reference, composing the item
    /// hash with the relative path. Referencing the whole item yields the
    /// item fingerprint itself.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        if self.rel.as_os_str().is_empty() {
            *self.item.hash()
        } else {
            hashing::compose(self.item.hash(), &self.rel)
        }
    }
}
