//! Cache block
//!
//! One materialized block file on the backing store. A block is created
//! empty under its stripe lock, its storage is sized outside the lock, and
//! its content is filled exactly once from the request's data sources. The
//! one-shot latch is a state machine behind a mutex and condvar: concurrent
//! initializers block on the condvar until the first run latches `Ready`
//! or a terminal failure; readers never wait, they observe.
//!
//! # State machine
//!
//! ```text
//! Fresh ──▶ Initializing ──▶ Ready
//!                    │
//!                    └─────▶ Failed (terminal; entry evicted shortly after)
//! ```

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use super::key::BlockKey;
use super::CACHE_BLOCK_SIZE;
use crate::error::{CacheError, Result};
use crate::proto::{DataSource, ReadExtentFn};

enum InitState {
    Fresh,
    Initializing,
    Ready,
    Failed(String),
}

/// A materialized cache of one contiguous logical file region.
pub struct CacheBlock {
    key: BlockKey,
    path: PathBuf,
    alloc_size: u64,
    read_source: ReadExtentFn,
    state: Mutex<InitState>,
    ready: Condvar,
    file: RwLock<Option<File>>,
}

/// Allocation size for a source list: the sum of each source's
/// contribution, with placement fixed by list order.
pub fn compute_alloc_size(sources: &[DataSource]) -> Result<u64> {
    let total: u64 = sources.iter().map(|s| u64::from(s.size_in_block)).sum();
    if total == 0 {
        return Err(CacheError::ZeroAllocSize);
    }
    if total > CACHE_BLOCK_SIZE {
        return Err(CacheError::InvalidRequest(format!(
            "sources span {total} bytes, beyond the {CACHE_BLOCK_SIZE}-byte block"
        )));
    }
    Ok(total)
}

impl CacheBlock {
    /// Create an unmaterialized block rooted at the backing store.
    ///
    /// The caller guarantees `alloc_size` is nonzero (admission rejects
    /// zero-size requests before construction).
    pub fn new(root: &Path, key: BlockKey, alloc_size: u64, read_source: ReadExtentFn) -> Self {
        let path = root.join(key.to_string());
        Self {
            key,
            path,
            alloc_size,
            read_source,
            state: Mutex::new(InitState::Fresh),
            ready: Condvar::new(),
            file: RwLock::new(None),
        }
    }

    /// Block identity
    #[inline]
    pub fn key(&self) -> &BlockKey {
        &self.key
    }

    /// Absolute path of the backing file
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes reserved on the backing store
    #[inline]
    pub fn alloc_size(&self) -> u64 {
        self.alloc_size
    }

    /// Whether materialization has completed successfully
    pub fn is_ready(&self) -> bool {
        matches!(*self.state.lock(), InitState::Ready)
    }

    /// Create and size the backing file. Called once, before any read and
    /// before `init_once`.
    pub fn init_storage(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        file.set_len(self.alloc_size)?;
        *self.file.write() = Some(file);
        Ok(())
    }

    /// Materialize the block from `sources`, at most once.
    ///
    /// The first caller runs the fill; concurrent callers block until it
    /// latches, then observe the same outcome. After a failure the block
    /// is terminally `Failed` and the latched reason is returned to every
    /// subsequent caller.
    ///
    /// Storage is sized outside the admission lock, so a caller can race
    /// ahead of `init_storage`; that returns a transient `BlockNotReady`
    /// without latching anything.
    pub fn init_once(&self, sources: &[DataSource]) -> Result<()> {
        {
            let mut state = self.state.lock();
            loop {
                match &*state {
                    InitState::Ready => return Ok(()),
                    InitState::Failed(reason) => {
                        return Err(CacheError::BlockInitFailed {
                            key: self.key.to_string(),
                            reason: reason.clone(),
                        })
                    }
                    InitState::Initializing => self.ready.wait(&mut state),
                    InitState::Fresh => {
                        if self.file.read().is_none() {
                            return Err(CacheError::BlockNotReady {
                                key: self.key.to_string(),
                            });
                        }
                        *state = InitState::Initializing;
                        break;
                    }
                }
            }
        }

        let result = self.fill(sources);
        {
            let mut state = self.state.lock();
            match &result {
                Ok(()) => *state = InitState::Ready,
                Err(err) => {
                    warn!(key = %self.key, error = %err, "cache block materialization failed");
                    *state = InitState::Failed(err.to_string());
                }
            }
        }
        self.ready.notify_all();
        result
    }

    /// Pull every source through the read callback into the backing file.
    /// Partial content from earlier sources may remain after a failure;
    /// readers see the latched error instead.
    fn fill(&self, sources: &[DataSource]) -> Result<()> {
        let mut base = 0u64;
        let mut filled = 0usize;
        for source in sources {
            let span = u64::from(source.size_in_block);
            let guard = self.file.read();
            let Some(file) = guard.as_ref() else {
                return Err(CacheError::BlockNotReady {
                    key: self.key.to_string(),
                });
            };
            let mut write = |data: &[u8], off: u64| -> Result<()> {
                let len = data.len() as u64;
                if off.checked_add(len).map_or(true, |end| end > span) {
                    return Err(CacheError::OutOfBounds {
                        offset: off,
                        size: len,
                        alloc: span,
                    });
                }
                file.write_all_at(data, base + off)?;
                Ok(())
            };
            filled += (self.read_source)(source, &mut write)?;
            base += span;
        }
        debug!(key = %self.key, bytes = filled, "cache block materialized");
        Ok(())
    }

    /// Read `buf.len()` bytes at `offset` within the logical block.
    ///
    /// Fails `BlockNotReady` until materialization completes,
    /// `BlockInitFailed` after a latched failure, and `Closed` once the
    /// handle has been released.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        {
            let state = self.state.lock();
            match &*state {
                InitState::Ready => {}
                InitState::Failed(reason) => {
                    return Err(CacheError::BlockInitFailed {
                        key: self.key.to_string(),
                        reason: reason.clone(),
                    })
                }
                _ => {
                    return Err(CacheError::BlockNotReady {
                        key: self.key.to_string(),
                    })
                }
            }
        }

        let size = buf.len() as u64;
        if offset.checked_add(size).map_or(true, |end| end > self.alloc_size) {
            return Err(CacheError::OutOfBounds {
                offset,
                size,
                alloc: self.alloc_size,
            });
        }

        let guard = self.file.read();
        let Some(file) = guard.as_ref() else {
            return Err(CacheError::Closed);
        };
        file.read_exact_at(buf, offset)?;
        Ok(buf.len())
    }

    /// Release the file handle. Safe to call more than once.
    pub fn close(&self) {
        self.file.write().take();
    }

    /// Unlink the backing file, closing first if needed. Idempotent.
    pub fn delete(&self) -> Result<()> {
        self.close();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
