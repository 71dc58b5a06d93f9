//! tmpfs-backed store
//!
//! Mounts a fresh tmpfs of the configured total size over the root path
//! and proves ownership with the sentinel file. Requires mount privileges;
//! the startup protocol refuses roots it cannot prove are its own.

use std::ffi::CString;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use rustix::mount::{self, MountFlags, UnmountFlags};
use tracing::{info, warn};

use super::{BackingStore, SENTINEL_FILE};
use crate::error::{CacheError, Result};

/// `statfs` magic of a tmpfs superblock
const TMPFS_MAGIC: u64 = 0x0102_1994;

/// Memory-resident backing filesystem of a fixed total size.
pub struct TmpfsStore {
    root: PathBuf,
    total: u64,
}

impl TmpfsStore {
    /// Create a handle for `root`; nothing is mounted until `prepare`.
    pub fn new(root: impl Into<PathBuf>, total: u64) -> Self {
        Self {
            root: root.into(),
            total,
        }
    }

    fn sentinel_path(&self) -> PathBuf {
        self.root.join(SENTINEL_FILE)
    }

    fn sentinel_exists(&self) -> bool {
        self.sentinel_path().exists()
    }

    fn write_sentinel(&self) -> Result<()> {
        fs::File::create(self.sentinel_path())?;
        Ok(())
    }

    fn mount_fresh(&self) -> Result<()> {
        let data = CString::new(format!("size={}", self.total)).expect("no NUL bytes");
        mount::mount("tmpfs", &self.root, "tmpfs", MountFlags::empty(), &*data).map_err(
            |err| CacheError::MountFailed {
                path: self.root.clone(),
                reason: err.to_string(),
            },
        )?;
        self.write_sentinel()?;
        info!(root = ?self.root, total = self.total, "mounted fresh tmpfs backing store");
        Ok(())
    }
}

impl BackingStore for TmpfsStore {
    fn root(&self) -> &Path {
        &self.root
    }

    /// Startup protocol:
    /// 1. missing root: create, mount fresh, write sentinel;
    /// 2. mounted non-memfs: `StoreOccupied`;
    /// 3. mounted memfs with sentinel: stale survivor, remount fresh;
    /// 4. otherwise an empty root mounts fresh and a non-empty one is
    ///    `StoreDirty`.
    fn prepare(&self) -> Result<()> {
        match fs::metadata(&self.root) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(&self.root)?;
                return self.mount_fresh();
            }
            Err(err) => return Err(err.into()),
            Ok(_) => {}
        }

        let mounted = self.is_mounted()?;
        if mounted {
            if !self.is_memfs()? {
                return Err(CacheError::StoreOccupied {
                    path: self.root.clone(),
                });
            }
            if self.sentinel_exists() {
                warn!(root = ?self.root, "stale backing store from a previous process, remounting");
                self.release()?;
                return self.mount_fresh();
            }
        }

        if fs::read_dir(&self.root)?.next().is_some() {
            return Err(CacheError::StoreDirty {
                path: self.root.clone(),
                mounted,
                sentinel: self.sentinel_exists(),
            });
        }
        self.mount_fresh()
    }

    fn release(&self) -> Result<()> {
        mount::unmount(&self.root, UnmountFlags::empty()).map_err(|err| {
            CacheError::MountFailed {
                path: self.root.clone(),
                reason: err.to_string(),
            }
        })
    }

    fn is_mounted(&self) -> Result<bool> {
        let root = fs::metadata(&self.root)?;
        let Some(parent) = self.root.parent() else {
            // Filesystem root is trivially a mount point.
            return Ok(true);
        };
        let parent = fs::metadata(parent)?;
        Ok(root.dev() != parent.dev())
    }

    fn is_memfs(&self) -> Result<bool> {
        let stat = rustix::fs::statfs(&self.root).map_err(std::io::Error::from)?;
        Ok(stat.f_type as u64 == TMPFS_MAGIC)
    }

    fn used_bytes(&self) -> u64 {
        match rustix::fs::statfs(&self.root) {
            Ok(stat) => {
                let consumed = (stat.f_blocks as u64).saturating_sub(stat.f_bfree as u64);
                consumed.saturating_mul(stat.f_bsize as u64)
            }
            Err(err) => {
                warn!(root = ?self.root, error = %err, "compute used size of backing store failed");
                0
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // Mount/unmount themselves need privileges integration environments
    // provide; these tests cover the decision logic that runs before any
    // syscall.

    #[test]
    fn test_prepare_rejects_dirty_unmounted_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("leftover"), b"x").unwrap();

        let store = TmpfsStore::new(dir.path(), 1 << 20);
        assert!(matches!(
            store.prepare(),
            Err(CacheError::StoreDirty { mounted: false, .. })
        ));
    }

    #[test]
    fn test_plain_directory_is_not_mounted() {
        let dir = tempfile::tempdir().unwrap();
        let store = TmpfsStore::new(dir.path(), 1 << 20);
        assert!(!store.is_mounted().unwrap());
    }

    #[test]
    fn test_sentinel_path_is_under_root() {
        let store = TmpfsStore::new("/data/blockcache", 1 << 30);
        assert_eq!(
            store.sentinel_path(),
            PathBuf::from("/data/blockcache/.init")
        );
    }
}
