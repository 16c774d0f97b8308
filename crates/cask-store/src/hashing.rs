//! Content hashing.
//!
//! The store consumes hashing through the [`ContentHasher`] seam so
//! collaborators can substitute their own scheme. The built-in
//! [`TreeHasher`] fingerprints a directory by streaming a canonical tar
//! rendition of it (sorted walk, zeroed timestamps and ownership,
//! normalized modes) into SHA-256. Normalizing modes to 0o755/0o644 keeps
//! the fingerprint stable across the write-bit stripping that finalizes a
//! build tree.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use tar::{EntryType, Header};
use walkdir::WalkDir;

use crate::fingerprint::Fingerprint;

/// Hashing interface the store consumes. Implementations must be
/// deterministic: equal tree content must always yield equal
/// fingerprints.
pub trait ContentHasher: Send + Sync {
    /// Fingerprint a finalized directory tree.
    ///
    /// # Errors
    ///
    /// Returns an error when the tree cannot be read in full.
    fn hash_directory(&self, path: &Path) -> Result<Fingerprint>;

    /// Fingerprint an alias name.
    fn hash_alias(&self, name: &str) -> Fingerprint;
}

/// Default hasher used by [`crate::ContentStore::open`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TreeHasher;

struct DigestWriter(Sha256);

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ContentHasher for TreeHasher {
    fn hash_directory(&self, root: &Path) -> Result<Fingerprint> {
        let mut builder = tar::Builder::new(DigestWriter(Sha256::new()));
        builder.follow_symlinks(false);
        for entry in WalkDir::new(root).sort_by(|a, b| a.path().cmp(b.path())) {
            let entry = entry?;
            let path = entry.path();
            if path == root {
                continue;
            }
            let rel = path
                .strip_prefix(root)
                .context("failed to relativize path")?;
            let rel_name = encode_entry_path(rel)?;
            let metadata = fs::symlink_metadata(path)
                .with_context(|| format!("failed to stat {} for hashing", path.display()))?;
            let file_type = metadata.file_type();

            let mut header = Header::new_gnu();
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            let _ = header.set_username("");
            let _ = header.set_groupname("");
            if file_type.is_dir() {
                header.set_entry_type(EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder.append_data(&mut header, Path::new(&rel_name), io::empty())?;
            } else if file_type.is_file() {
                header.set_entry_type(EntryType::Regular);
                header.set_mode(if is_executable(&metadata) { 0o755 } else { 0o644 });
                header.set_size(metadata.len());
                let file = File::open(path)
                    .with_context(|| format!("failed to open {} for hashing", path.display()))?;
                builder.append_data(&mut header, Path::new(&rel_name), file)?;
            } else if file_type.is_symlink() {
                header.set_entry_type(EntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                let target = fs::read_link(path)
                    .with_context(|| format!("failed to read symlink target {}", path.display()))?;
                header
                    .set_link_name(&target)
                    .with_context(|| format!("unsupported symlink target {}", target.display()))?;
                builder.append_data(&mut header, Path::new(&rel_name), io::empty())?;
            } else {
                return Err(anyhow!("unsupported file type at {}", path.display()));
            }
        }
        builder.finish()?;
        let writer = builder.into_inner()?;
        Ok(Fingerprint::from_bytes(writer.0.finalize().into()))
    }

    fn hash_alias(&self, name: &str) -> Fingerprint {
        Fingerprint::from_bytes(Sha256::digest(name.as_bytes()).into())
    }
}

fn encode_entry_path(rel: &Path) -> Result<String> {
    let normalized = rel.to_string_lossy().replace('\\', "/");
    if normalized.is_empty() || normalized.starts_with('/') {
        return Err(anyhow!("hash entries must be relative (got {normalized})"));
    }
    Ok(normalized)
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

/// Compose an item fingerprint with a relative path into it. The
/// composition is fixed (independent of the configured hasher) so content
/// references address identically everywhere.
pub(crate) fn compose(item: &Fingerprint, rel: &Path) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(item.as_bytes());
    hasher.update(rel.to_string_lossy().replace('\\', "/").as_bytes());
    Fingerprint::from_bytes(hasher.finalize().into())
}
