//! Store unit tests, split by topic.

use super::*;
use anyhow::bail;
use std::thread;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

use crate::fingerprint::FINGERPRINT_LEN;
use crate::watcher::POLL_INTERVAL;

fn new_store() -> Result<(TempDir, ContentStore)> {
    let temp = tempdir()?;
    let store = ContentStore::open(temp.path().join("store"))?;
    Ok((temp, store))
}

fn key(byte: u8) -> Fingerprint {
    Fingerprint::from_bytes([byte; FINGERPRINT_LEN])
}

fn build_with(
    store: &ContentStore,
    key: &Fingerprint,
    file: &str,
    contents: &[u8],
) -> Result<Item> {
    let dir = store.mark_pending(key)?;
    fs::write(dir.join(file), contents)?;
    store.mark_complete(key)
}

mod basics;
mod waiters;
