//! Error types for the cache engine

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur in the cache engine
#[derive(Error, Debug)]
pub enum CacheError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Backing Store Errors (fatal at startup)
    // =========================================================================
    /// Root path is mounted by something other than a memory filesystem
    #[error("backing store {path:?} already mounted by another device")]
    StoreOccupied { path: PathBuf },

    /// Root path is unmounted but contains leftover files
    #[error("backing store {path:?} is not an empty dir (mounted={mounted}, sentinel={sentinel})")]
    StoreDirty {
        path: PathBuf,
        mounted: bool,
        sentinel: bool,
    },

    /// Mounting or unmounting the memory filesystem failed
    #[error("mount operation on {path:?} failed: {reason}")]
    MountFailed { path: PathBuf, reason: String },

    // =========================================================================
    // Admission Rejections (surfaced to caller, not logged as errors)
    // =========================================================================
    /// Cache request carried no data sources
    #[error("cache request has no source data")]
    NoSources,

    /// Computed allocation size is zero
    #[error("alloc size is zero")]
    ZeroAllocSize,

    /// Request is malformed beyond the simple rejections above
    #[error("invalid cache request: {0}")]
    InvalidRequest(String),

    /// Entry weight exceeds the cache byte budget outright
    #[error("entry weight {weight} exceeds cache byte budget {max}")]
    OverWeight { weight: u64, max: u64 },

    // =========================================================================
    // Read-Path Outcomes
    // =========================================================================
    /// Key not present in the cache
    #[error("cache miss for key {key}")]
    CacheMiss { key: String },

    /// Key present but past its expiry
    #[error("cache entry expired for key {key}")]
    CacheExpired { key: String },

    /// Block exists but its materialization has not completed yet
    #[error("cache block {key} is not ready")]
    BlockNotReady { key: String },

    /// Block materialization latched a terminal failure
    #[error("cache block {key} init failed: {reason}")]
    BlockInitFailed { key: String, reason: String },

    /// Byte range falls outside the block's allocated size
    #[error("range [{offset}, {offset}+{size}) out of bounds for alloc size {alloc}")]
    OutOfBounds { offset: u64, size: u64, alloc: u64 },

    // =========================================================================
    // Maintenance Outcomes
    // =========================================================================
    /// Unexpected fault recovered inside peek
    #[error("cache block peek failed: {0}")]
    PeekFailed(String),

    /// A destructor returned an error during eviction
    #[error("evict failed for key {key}")]
    EvictFailed { key: String },

    /// Operation on a closed cache
    #[error("cache is closed")]
    Closed,

    /// Block key text did not parse
    #[error("invalid cache block key: {0}")]
    InvalidKey(String),

    /// Configuration rejected at construction
    #[error("configuration error: {0}")]
    Config(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = CacheError::OverWeight {
            weight: 2048,
            max: 1024,
        };
        assert_eq!(
            err.to_string(),
            "entry weight 2048 exceeds cache byte budget 1024"
        );

        let err = CacheError::CacheMiss {
            key: "vol/7#0#1".to_string(),
        };
        assert!(err.to_string().contains("vol/7#0#1"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: CacheError = io.into();
        assert!(matches!(err, CacheError::Io(_)));
    }
}
