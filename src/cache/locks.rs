//! Key-striped readers-writer locks
//!
//! Admission, reads, and per-key eviction serialize through a small fixed
//! array of lock stripes; the stripe for a key is its CRC32 modulo the
//! stripe count. Cross-stripe operations run in parallel.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::key::BlockKey;

/// Default number of lock stripes
pub const DEFAULT_STRIPES: usize = 4;

/// Engine-wide key lock table.
pub struct KeyLocks {
    stripes: Vec<RwLock<()>>,
}

impl KeyLocks {
    /// Create a lock table with `count` stripes (at least one)
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        Self {
            stripes: (0..count).map(|_| RwLock::new(())).collect(),
        }
    }

    /// Number of stripes
    #[inline]
    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Stripe index for a key
    #[inline]
    pub fn stripe_for(&self, key: &BlockKey) -> usize {
        let crc = crc32c::crc32c(key.to_string().as_bytes());
        crc as usize % self.stripes.len()
    }

    /// Acquire the key's stripe in shared mode
    pub fn read(&self, key: &BlockKey) -> RwLockReadGuard<'_, ()> {
        self.stripes[self.stripe_for(key)].read()
    }

    /// Acquire the key's stripe in exclusive mode
    pub fn write(&self, key: &BlockKey) -> RwLockWriteGuard<'_, ()> {
        self.stripes[self.stripe_for(key)].write()
    }

    /// Acquire every stripe exclusively, quiescing all readers and writers.
    ///
    /// Stripes are taken in index order so concurrent `lock_all` callers
    /// cannot deadlock each other.
    pub fn lock_all(&self) -> Vec<RwLockWriteGuard<'_, ()>> {
        self.stripes.iter().map(|s| s.write()).collect()
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}

// =============================================================================
// Tests
// =============================================================================
