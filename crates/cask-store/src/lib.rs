#![deny(clippy::all, warnings)]
//! Hash-addressed store of immutable artifact trees.
//!
//! Callers address artifacts by an input fingerprint (the key); the store
//! mediates their construction under a single cross-process lock, records
//! finished trees read-only under their output fingerprint, deduplicates
//! identical content via symbolic links, and lets one process block on a
//! build another process owns.

mod aliases;
mod content;
mod error;
mod fingerprint;
mod hashing;
mod lock;
mod paths;
mod perms;
mod store;
mod watcher;

pub use aliases::AliasEntry;
pub use content::{ContentRef, Item};
pub use error::StoreError;
pub use fingerprint::{Fingerprint, FINGERPRINT_LEN};
pub use hashing::{ContentHasher, TreeHasher};
pub use store::{
    default_store_root, with_store, BuildOutcome, Claim, Construct, ContentStore, EntryStatus,
    Listing, Lookup, LookupWait, Update, Waiter,
};
pub use watcher::{DirWatcher, WatchHandle, POLL_INTERVAL};
