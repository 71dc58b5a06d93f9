//! Backing store lifecycle
//!
//! The engine owns a memory-resident filesystem mounted at a configured
//! root; every live block is one file under it. The store must be
//! exclusively prepared by the current process (proven by a sentinel file
//! written right after a fresh mount), verified on startup, watched at
//! runtime, and released on shutdown.
//!
//! The lifecycle sits behind the [`BackingStore`] trait so the tmpfs
//! protocol can be swapped for a plain directory where mounting needs
//! privileges the environment does not have (development, tests).

mod dir;
mod tmpfs;

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, tick, Receiver};
use tracing::{debug, error};

use crate::error::Result;

pub use dir::DirStore;
pub use tmpfs::TmpfsStore;

/// Zero-byte marker proving the current process prepared the mount
pub const SENTINEL_FILE: &str = ".init";

/// Interval between watchdog mount-state samples
pub(crate) const WATCHDOG_PERIOD: Duration = Duration::from_secs(10);

/// Exclusive owner of the cache's backing filesystem.
pub trait BackingStore: Send + Sync {
    /// Root directory holding block files and the sentinel
    fn root(&self) -> &Path;

    /// Run the startup protocol, leaving a freshly prepared, empty store
    /// with the sentinel in place.
    fn prepare(&self) -> Result<()>;

    /// Release the store on shutdown.
    fn release(&self) -> Result<()>;

    /// Whether the root is currently a mount point
    fn is_mounted(&self) -> Result<bool>;

    /// Whether the root is backed by a memory filesystem
    fn is_memfs(&self) -> Result<bool>;

    /// Bytes currently consumed on the backing filesystem. Logs and
    /// reports zero when the statistics are unavailable.
    fn used_bytes(&self) -> u64;
}

/// Sample the mount every [`WATCHDOG_PERIOD`] until the close broadcast
/// fires. A disappeared or foreign mount is reported critically but never
/// repaired; remount policy belongs to the host.
pub(crate) fn spawn_watchdog(
    store: Arc<dyn BackingStore>,
    close_rx: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let ticker = tick(WATCHDOG_PERIOD);
        loop {
            select! {
                recv(ticker) -> _ => check_mount(store.as_ref()),
                recv(close_rx) -> _ => {
                    debug!("backing store watchdog exiting");
                    return;
                }
            }
        }
    })
}

fn check_mount(store: &dyn BackingStore) {
    match store.is_mounted() {
        Ok(true) => match store.is_memfs() {
            Ok(true) => {}
            Ok(false) => {
                error!(root = ?store.root(), "backing store mounted by other but not memfs");
            }
            Err(err) => {
                error!(root = ?store.root(), error = %err, "backing store fs type check failed");
            }
        },
        Ok(false) => {
            error!(root = ?store.root(), "backing store mount point disappeared");
        }
        Err(err) => {
            error!(root = ?store.root(), error = %err, "backing store mount point error");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
