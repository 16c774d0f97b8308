//! Permission regime for the store root and item trees.
//!
//! The root directory carries no owner write bit between operations, so
//! top-level entries cannot appear or vanish outside a mutation window.
//! Completed item trees are recursively stripped of every write bit.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Owner rwx, group/other rx. Applied to fresh build directories.
#[cfg(unix)]
pub(crate) const BUILD_DIR_MODE: u32 = 0o755;

#[cfg(unix)]
const ROOT_WRITABLE_MODE: u32 = 0o700;
#[cfg(unix)]
const ROOT_READ_ONLY_MODE: u32 = 0o500;

pub(crate) fn set_root_writable(root: &Path) -> Result<()> {
    #[cfg(unix)]
    fs::set_permissions(root, fs::Permissions::from_mode(ROOT_WRITABLE_MODE))
        .with_context(|| format!("failed to make store root writable {}", root.display()))?;
    #[cfg(not(unix))]
    {
        let mut perms = fs::metadata(root)?.permissions();
        perms.set_readonly(false);
        fs::set_permissions(root, perms)
            .with_context(|| format!("failed to make store root writable {}", root.display()))?;
    }
    Ok(())
}

pub(crate) fn set_root_read_only(root: &Path) -> Result<()> {
    #[cfg(unix)]
    fs::set_permissions(root, fs::Permissions::from_mode(ROOT_READ_ONLY_MODE))
        .with_context(|| format!("failed to make store root read-only {}", root.display()))?;
    #[cfg(not(unix))]
    {
        let mut perms = fs::metadata(root)?.permissions();
        perms.set_readonly(true);
        fs::set_permissions(root, perms)
            .with_context(|| format!("failed to make store root read-only {}", root.display()))?;
    }
    Ok(())
}

/// Scoped interval during which the store root accepts top-level
/// mutations. Always entered with the store lock held; the root is
/// restored to read-only on every exit path.
pub(crate) struct MutationWindow {
    root: PathBuf,
}

impl MutationWindow {
    pub(crate) fn open(root: &Path) -> Result<Self> {
        set_root_writable(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }
}

impl Drop for MutationWindow {
    fn drop(&mut self) {
        if let Err(err) = set_root_read_only(&self.root) {
            warn!(
                root = %self.root.display(),
                %err,
                "failed to restore read-only store root"
            );
        }
    }
}

/// Strip every write bit from `root` and everything beneath it.
pub(crate) fn make_read_only_recursive(root: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        strip_write_bits(entry.path())?;
    }
    Ok(())
}

/// Restore owner write (and directory traversal) so a read-only tree can
/// be deleted.
pub(crate) fn make_writable_recursive(root: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        add_owner_write(entry.path())?;
    }
    Ok(())
}

fn strip_write_bits(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }
    let mut perms = metadata.permissions();
    #[cfg(unix)]
    {
        let mode = perms.mode();
        let wanted = mode & !0o222;
        if mode != wanted {
            perms.set_mode(wanted);
            fs::set_permissions(path, perms)
                .with_context(|| format!("failed to strip write bits from {}", path.display()))?;
        }
    }
    #[cfg(not(unix))]
    {
        if !perms.readonly() {
            perms.set_readonly(true);
            fs::set_permissions(path, perms)
                .with_context(|| format!("failed to strip write bits from {}", path.display()))?;
        }
    }
    Ok(())
}

fn add_owner_write(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }
    let mut perms = metadata.permissions();
    #[cfg(unix)]
    {
        let mode = perms.mode();
        let wanted = if metadata.is_dir() {
            mode | 0o300
        } else {
            mode | 0o200
        };
        if mode != wanted {
            perms.set_mode(wanted);
            fs::set_permissions(path, perms)
                .with_context(|| format!("failed to restore write bits on {}", path.display()))?;
        }
    }
    #[cfg(not(unix))]
    {
        if perms.readonly() {
            perms.set_readonly(false);
            fs::set_permissions(path, perms)
                .with_context(|| format!("failed to restore write bits on {}", path.display()))?;
        }
    }
    Ok(())
}
