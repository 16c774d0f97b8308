//! On-disk name encoding for store root entries.
//!
//! Every top-level entry the store owns carries one of three fixed
//! prefixes followed by the printable fingerprint. The encoding is
//! reversible; names that do not round-trip are treated as foreign and
//! ignored by listings.

use std::path::Path;

use crate::error::StoreError;
use crate::fingerprint::Fingerprint;

pub(crate) const PENDING_PREFIX: &str = "pending-";
pub(crate) const COMPLETE_PREFIX: &str = "complete-";
pub(crate) const ITEM_PREFIX: &str = "item-";

/// A classified entry at the store root.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RootEntry {
    Pending(Fingerprint),
    Complete(Fingerprint),
    Item(Fingerprint),
}

pub(crate) fn classify(name: &str) -> Option<RootEntry> {
    let (ctor, rest): (fn(Fingerprint) -> RootEntry, &str) =
        if let Some(rest) = name.strip_prefix(PENDING_PREFIX) {
            (RootEntry::Pending, rest)
        } else if let Some(rest) = name.strip_prefix(COMPLETE_PREFIX) {
            (RootEntry::Complete, rest)
        } else if let Some(rest) = name.strip_prefix(ITEM_PREFIX) {
            (RootEntry::Item, rest)
        } else {
            return None;
        };
    Fingerprint::parse(rest).ok().map(ctor)
}

pub(crate) fn pending_dir_name(key: &Fingerprint) -> String {
    format!("{PENDING_PREFIX}{key}")
}

pub(crate) fn complete_link_name(key: &Fingerprint) -> String {
    format!("{COMPLETE_PREFIX}{key}")
}

pub(crate) fn item_dir_name(hash: &Fingerprint) -> String {
    format!("{ITEM_PREFIX}{hash}")
}

/// Extract the item fingerprint from a completion-link target.
pub(crate) fn parse_link_target(key: &Fingerprint, target: &Path) -> Result<Fingerprint, StoreError> {
    match target.file_name().and_then(|n| n.to_str()).and_then(classify) {
        Some(RootEntry::Item(hash)) => Ok(hash),
        _ => Err(StoreError::CorruptedLink {
            key: *key,
            target: target.display().to_string(),
        }),
    }
}
