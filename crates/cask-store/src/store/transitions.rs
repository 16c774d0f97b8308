//! The per-key state machine, with the filesystem as ground truth.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use super::{EntryStatus, StoreInner};
use crate::content::Item;
use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::paths;
use crate::perms::{self, MutationWindow};

/// Filesystem ground truth for one key. Callers must hold the store lock
/// while reading and while acting on the answer.
#[derive(Clone, Debug)]
pub(crate) enum EntryState {
    Missing,
    Pending(PathBuf),
    Complete(Item),
}

impl EntryState {
    pub(crate) fn status(&self) -> EntryStatus {
        match self {
            Self::Missing => EntryStatus::Missing,
            Self::Pending(_) => EntryStatus::Pending,
            Self::Complete(_) => EntryStatus::Complete,
        }
    }
}

impl StoreInner {
    pub(crate) fn read_entry(&self, key: &Fingerprint) -> Result<EntryState> {
        let pending = self.root.join(paths::pending_dir_name(key));
        if pending.is_dir() {
            return Ok(EntryState::Pending(pending));
        }
        let link = self.root.join(paths::complete_link_name(key));
        match fs::symlink_metadata(&link) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                let target = fs::read_link(&link).with_context(|| {
                    format!("failed to read completion link {}", link.display())
                })?;
                let hash = paths::parse_link_target(key, &target)?;
                Ok(EntryState::Complete(Item::new(hash)))
            }
            Ok(_) => Err(StoreError::CorruptedLink {
                key: *key,
                target: link.display().to_string(),
            }
            .into()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(EntryState::Missing),
            Err(err) => Err(err)
                .with_context(|| format!("failed to stat completion link {}", link.display())),
        }
    }

    /// Missing -> Pending. Assumes the lock is held and the key is known
    /// to be missing.
    pub(crate) fn create_build_dir(&self, key: &Fingerprint) -> Result<PathBuf> {
        let dir = self.root.join(paths::pending_dir_name(key));
        let window = MutationWindow::open(&self.root)?;
        fs::create_dir(&dir)
            .with_context(|| format!("failed to create build directory {}", dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(perms::BUILD_DIR_MODE))
                .with_context(|| format!("failed to set build directory mode {}", dir.display()))?;
        }
        drop(window);
        debug!(key = %key, dir = %dir.display(), "build directory created");
        Ok(dir)
    }

    /// Pending -> Complete. The rename is the linearization point: other
    /// parties observe either the pending directory or the finished item,
    /// never anything in between.
    pub(crate) fn finalize_build(&self, key: &Fingerprint, build_dir: &Path) -> Result<Item> {
        perms::make_read_only_recursive(build_dir)?;
        let hash = self.hasher.hash_directory(build_dir)?;
        let item_dir = self.root.join(paths::item_dir_name(&hash));

        let window = MutationWindow::open(&self.root)?;
        if item_dir.exists() {
            // Identical content is already stored; this build collapses
            // onto the existing item.
            remove_tree(build_dir)?;
            debug!(key = %key, item = %hash, "deduplicated against existing item");
        } else {
            fs::rename(build_dir, &item_dir).with_context(|| {
                format!(
                    "failed to move build into place ({} -> {})",
                    build_dir.display(),
                    item_dir.display()
                )
            })?;
        }
        // Both entries live at the root, so the relative link target is
        // the item directory's basename.
        symlink_dir(
            Path::new(&paths::item_dir_name(&hash)),
            &self.root.join(paths::complete_link_name(key)),
        )?;
        drop(window);
        debug!(key = %key, item = %hash, "build completed");
        Ok(Item::new(hash))
    }

    /// Pending -> Missing.
    pub(crate) fn remove_failed(&self, key: &Fingerprint) -> Result<()> {
        match self.read_entry(key)? {
            EntryState::Pending(dir) => {
                let window = MutationWindow::open(&self.root)?;
                remove_tree(&dir)?;
                drop(window);
                debug!(key = %key, "pending build removed");
                Ok(())
            }
            EntryState::Missing | EntryState::Complete(_) => {
                Err(StoreError::NotPending { key: *key }.into())
            }
        }
    }

    /// Delete whichever key entry exists, corrupted links included. Does
    /// not consult `read_entry` so that repair of unparseable links stays
    /// possible.
    pub(crate) fn remove_forcibly(&self, key: &Fingerprint) -> Result<()> {
        let pending = self.root.join(paths::pending_dir_name(key));
        let link = self.root.join(paths::complete_link_name(key));
        let window = MutationWindow::open(&self.root)?;
        if pending.is_dir() {
            remove_tree(&pending)?;
        } else if fs::symlink_metadata(&link).is_ok() {
            fs::remove_file(&link)
                .with_context(|| format!("failed to remove completion link {}", link.display()))?;
        }
        drop(window);
        debug!(key = %key, "key entry removed");
        Ok(())
    }

    pub(crate) fn remove_item_forcibly(&self, item: &Item) -> Result<()> {
        let dir = self.root.join(paths::item_dir_name(item.hash()));
        if !dir.exists() {
            return Ok(());
        }
        let window = MutationWindow::open(&self.root)?;
        remove_tree(&dir)?;
        drop(window);
        debug!(item = %item, "item tree removed");
        Ok(())
    }
}

/// Item trees and finalized builds are read-only; write bits come back
/// first so the deletion can empty directories.
fn remove_tree(root: &Path) -> Result<()> {
    perms::make_writable_recursive(root)?;
    fs::remove_dir_all(root).with_context(|| format!("failed to remove {}", root.display()))
}

fn symlink_dir(target: &Path, link: &Path) -> Result<()> {
    #[cfg(unix)]
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("failed to create completion link {}", link.display()))?;
    #[cfg(not(unix))]
    std::os::windows::fs::symlink_dir(target, link)
        .with_context(|| format!("failed to create completion link {}", link.display()))?;
    Ok(())
}
