//! Best-effort directory change notifications.
//!
//! Native OS events and a periodic ticker feed the same callbacks.
//! Delivery is at-least-once and may be coalesced; events carry no
//! payload consumers can rely on, so every wakeup must re-verify state.
//! The ticker covers filesystems (network mounts in particular) whose
//! native notifications are unreliable, and also stands in entirely when
//! the platform backend cannot be initialized.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

/// Interval at which every registered callback fires regardless of OS
/// events.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Watch {
    path: PathBuf,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    watches: HashMap<u64, Watch>,
}

impl Registry {
    fn snapshot(&self) -> Vec<Callback> {
        self.watches
            .values()
            .map(|watch| Arc::clone(&watch.callback))
            .collect()
    }

    fn matching(&self, event: &Event) -> Vec<Callback> {
        self.watches
            .values()
            .filter(|watch| {
                event.paths.is_empty()
                    || event
                        .paths
                        .iter()
                        .any(|path| path.starts_with(&watch.path) || watch.path.starts_with(path))
            })
            .map(|watch| Arc::clone(&watch.callback))
            .collect()
    }
}

fn lock_registry(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

struct TickerHandle {
    stop: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// Token identifying a registered watch; pass it back to
/// [`DirWatcher::unwatch`] to cancel.
#[derive(Debug)]
pub struct WatchHandle {
    id: u64,
    path: PathBuf,
}

/// Fire-and-forget change notifier over a set of directories.
pub struct DirWatcher {
    registry: Arc<Mutex<Registry>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    os: Mutex<Option<RecommendedWatcher>>,
    ticker: Mutex<Option<TickerHandle>>,
}

impl DirWatcher {
    /// # Errors
    ///
    /// Returns an error if the ticker thread cannot be spawned. An
    /// unavailable native backend is not an error; the watcher degrades
    /// to polling.
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Mutex::new(Registry::default()));

        let event_registry = Arc::clone(&registry);
        let os = match RecommendedWatcher::new(
            move |outcome: notify::Result<Event>| {
                let callbacks = match &outcome {
                    Ok(event) => lock_registry(&event_registry).matching(event),
                    // An errored event stream still means "something
                    // changed somewhere"; wake everyone.
                    Err(_) => lock_registry(&event_registry).snapshot(),
                };
                for callback in callbacks {
                    callback();
                }
            },
            Config::default(),
        ) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!(%err, "native change notifications unavailable; relying on polling");
                None
            }
        };

        let (stop, stop_rx) = mpsc::channel();
        let tick_registry = Arc::clone(&registry);
        let thread = std::thread::Builder::new()
            .name("cask-watch-tick".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(POLL_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => {
                        // Snapshot first; callbacks run without the
                        // registry lock held.
                        let callbacks = lock_registry(&tick_registry).snapshot();
                        for callback in callbacks {
                            callback();
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .context("failed to spawn watcher ticker thread")?;

        Ok(Self {
            registry,
            next_id: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            os: Mutex::new(os),
            ticker: Mutex::new(Some(TickerHandle { stop, thread })),
        })
    }

    /// Register `callback` to fire whenever anything changes under `path`
    /// (and on every ticker round).
    ///
    /// # Errors
    ///
    /// Fails once the watcher has been shut down.
    pub fn watch_dir<F>(&self, path: &Path, callback: F) -> Result<WatchHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.shut_down.load(Ordering::SeqCst) {
            bail!("directory watcher has been shut down");
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock_registry(&self.registry).watches.insert(
            id,
            Watch {
                path: path.to_path_buf(),
                callback: Arc::new(callback),
            },
        );
        if let Some(watcher) = self
            .os
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            if let Err(err) = watcher.watch(path, RecursiveMode::Recursive) {
                debug!(
                    path = %path.display(),
                    %err,
                    "native watch registration failed; polling only"
                );
            }
        }
        Ok(WatchHandle {
            id,
            path: path.to_path_buf(),
        })
    }

    /// Cancel a previously registered watch.
    pub fn unwatch(&self, handle: WatchHandle) {
        let mut registry = lock_registry(&self.registry);
        registry.watches.remove(&handle.id);
        let still_watched = registry
            .watches
            .values()
            .any(|watch| watch.path == handle.path);
        drop(registry);
        if !still_watched {
            if let Some(watcher) = self
                .os
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_mut()
            {
                let _ = watcher.unwatch(&handle.path);
            }
        }
    }

    /// Release every watch and stop the ticker. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        lock_registry(&self.registry).watches.clear();
        *self.os.lock().unwrap_or_else(PoisonError::into_inner) = None;
        let handle = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            drop(handle.stop);
            if handle.thread.join().is_err() {
                warn!("watcher ticker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for DirWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn callback_fires_after_a_change() -> Result<()> {
        let temp = tempdir()?;
        let watcher = DirWatcher::new()?;
        let (tx, rx) = mpsc::sync_channel::<()>(1);
        let _handle = watcher.watch_dir(temp.path(), move || {
            let _ = tx.try_send(());
        })?;

        fs::write(temp.path().join("touched"), b"x")?;
        // Native events should land quickly; the ticker bounds the wait
        // either way.
        rx.recv_timeout(POLL_INTERVAL + Duration::from_secs(2))
            .expect("expected a wakeup after a change");
        watcher.shutdown();
        Ok(())
    }

    #[test]
    fn ticker_fires_without_any_change() -> Result<()> {
        let temp = tempdir()?;
        let watcher = DirWatcher::new()?;
        let (tx, rx) = mpsc::sync_channel::<()>(1);
        let _handle = watcher.watch_dir(temp.path(), move || {
            let _ = tx.try_send(());
        })?;

        rx.recv_timeout(POLL_INTERVAL + Duration::from_secs(2))
            .expect("expected a polling wakeup with no filesystem activity");
        watcher.shutdown();
        Ok(())
    }

    #[test]
    fn unwatched_callbacks_stop_firing() -> Result<()> {
        let temp = tempdir()?;
        let watcher = DirWatcher::new()?;
        let (tx, rx) = mpsc::sync_channel::<()>(1);
        let handle = watcher.watch_dir(temp.path(), move || {
            let _ = tx.try_send(());
        })?;
        watcher.unwatch(handle);

        fs::write(temp.path().join("touched"), b"x")?;
        assert!(
            rx.recv_timeout(Duration::from_millis(300)).is_err(),
            "cancelled watch should not fire"
        );
        watcher.shutdown();
        Ok(())
    }

    #[test]
    fn shutdown_is_idempotent_and_rejects_new_watches() -> Result<()> {
        let temp = tempdir()?;
        let watcher = DirWatcher::new()?;
        watcher.shutdown();
        watcher.shutdown();
        assert!(watcher.watch_dir(temp.path(), || {}).is_err());
        Ok(())
    }
}
