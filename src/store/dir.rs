//! Plain-directory store
//!
//! Substitutes an ordinary directory for the tmpfs mount, for development
//! and tests where mounting needs privileges the environment lacks. The
//! exclusivity and freshness guarantees of the mount protocol do not
//! apply; `release` deletes the tree instead of unmounting.

use std::fs;
use std::path::{Path, PathBuf};

use super::{BackingStore, SENTINEL_FILE};
use crate::error::Result;

/// Directory-backed store without a mount lifecycle.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Create a handle for `root`; nothing is created until `prepare`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir_bytes(path: &Path) -> u64 {
        let Ok(entries) = fs::read_dir(path) else {
            return 0;
        };
        entries
            .flatten()
            .map(|entry| match entry.metadata() {
                Ok(meta) if meta.is_dir() => Self::dir_bytes(&entry.path()),
                Ok(meta) => meta.len(),
                Err(_) => 0,
            })
            .sum()
    }
}

impl BackingStore for DirStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::File::create(self.root.join(SENTINEL_FILE))?;
        Ok(())
    }

    fn release(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn is_mounted(&self) -> Result<bool> {
        Ok(true)
    }

    fn is_memfs(&self) -> Result<bool> {
        Ok(true)
    }

    fn used_bytes(&self) -> u64 {
        Self::dir_bytes(&self.root)
    }
}

// =============================================================================
// Tests
// =============================================================================
