//! One-shot waiters for pending builds.
//!
//! A waiter couples a capacity-one signal channel (the watcher callback
//! and the ticker both enqueue into it; duplicates are dropped) with a
//! listener thread that re-verifies ground truth under the store lock on
//! every wakeup. The first terminal state the listener observes after
//! subscription is the value delivered; spurious wakeups are harmless.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::warn;

use super::transitions::EntryState;
use super::{ContentStore, StoreInner};
use crate::content::Item;
use crate::fingerprint::Fingerprint;
use crate::watcher::WatchHandle;

/// Terminal outcome of a pending construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Update {
    Completed(Item),
    /// The pending directory was cleaned up by another party instead of
    /// completing.
    Failed,
}

/// One-shot handle resolving to the terminal state of a pending key.
/// Dropping the handle cancels the subscription and tears down its watch
/// and ticker registration.
#[derive(Debug)]
pub struct Waiter {
    update_rx: Receiver<Update>,
    signal_tx: SyncSender<()>,
    cancelled: Arc<AtomicBool>,
}

impl Waiter {
    /// Block until the build completes or is abandoned.
    ///
    /// # Errors
    ///
    /// Fails only if the listener died without delivering an update.
    pub fn wait(self) -> Result<Update> {
        self.update_rx
            .recv()
            .map_err(|_| anyhow!("waiter listener exited without delivering an update"))
    }

    /// Bounded wait; `None` when the build is still pending after
    /// `timeout`. Callers racing a deadline against a build poll this.
    ///
    /// # Errors
    ///
    /// Fails only if the listener died without delivering an update.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<Update>> {
        match self.update_rx.recv_timeout(timeout) {
            Ok(update) => Ok(Some(update)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("waiter listener exited without delivering an update"))
            }
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.signal_tx.try_send(());
    }
}

impl ContentStore {
    /// Subscribe to the in-flight build of `key`. Called with the store
    /// lock held, so the subscription cannot miss a transition.
    pub(super) fn spawn_waiter(&self, key: Fingerprint, pending_dir: PathBuf) -> Result<Waiter> {
        let (signal_tx, signal_rx) = mpsc::sync_channel::<()>(1);
        let (update_tx, update_rx) = mpsc::sync_channel::<Update>(1);
        let cancelled = Arc::new(AtomicBool::new(false));

        let notify_tx = signal_tx.clone();
        let watch = self.inner.watcher.watch_dir(&pending_dir, move || {
            let _ = notify_tx.try_send(());
        })?;
        // Prime one wakeup so the listener verifies state immediately.
        let _ = signal_tx.try_send(());

        let inner = Arc::clone(&self.inner);
        let listener_cancelled = Arc::clone(&cancelled);
        thread::Builder::new()
            .name(format!("cask-waiter-{}", key.short()))
            .spawn(move || listen(&inner, &key, watch, &signal_rx, &update_tx, &listener_cancelled))
            .context("failed to spawn waiter listener thread")?;

        Ok(Waiter {
            update_rx,
            signal_tx,
            cancelled,
        })
    }
}

fn listen(
    inner: &StoreInner,
    key: &Fingerprint,
    watch: WatchHandle,
    signal_rx: &Receiver<()>,
    update_tx: &SyncSender<Update>,
    cancelled: &AtomicBool,
) {
    let update = loop {
        if signal_rx.recv().is_err() {
            break None;
        }
        if cancelled.load(Ordering::SeqCst) {
            break None;
        }
        match poll_entry(inner, key) {
            Ok(None) => {}
            Ok(Some(update)) => break Some(update),
            Err(err) => {
                warn!(key = %key, %err, "waiter could not verify build state; reporting failure");
                break Some(Update::Failed);
            }
        }
    };
    inner.watcher.unwatch(watch);
    if let Some(update) = update {
        let _ = update_tx.try_send(update);
    }
}

/// Re-check ground truth under the lock; `None` keeps waiting.
fn poll_entry(inner: &StoreInner, key: &Fingerprint) -> Result<Option<Update>> {
    let _guard = inner.lock.acquire()?;
    Ok(match inner.read_entry(key)? {
        EntryState::Pending(_) => None,
        EntryState::Complete(item) => Some(Update::Completed(item)),
        EntryState::Missing => Some(Update::Failed),
    })
}
