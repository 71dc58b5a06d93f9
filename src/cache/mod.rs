//! Block-level read cache
//!
//! The cache materializes fixed-identity blocks of remote file data onto a
//! memory-backed filesystem and serves subsequent reads from them.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          CacheEngine                              │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  KeyLocks (4 stripes)  │  LruCache (count+byte+TTL)  │  Pipeline  │
//! │  ┌──────────────────┐  │  ┌───────────────────────┐  │  ┌──────┐  │
//! │  │ crc32 % stripes  │  │  │ key → CacheBlock      │  │  │ 1024 │  │
//! │  │ shared: read     │  │  │ destructors on evict  │  │  │ deep │  │
//! │  │ excl: admit/evict│  │  │ hit-rate statistics   │  │  │ 20 wk│  │
//! │  └──────────────────┘  │  └───────────────────────┘  │  └──────┘  │
//! │                        │            │                │            │
//! │                        │      CacheBlock files       │            │
//! │                        │   on the BackingStore mount │            │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A prepare request admits a block under its stripe lock, then posts a
//! task to the pipeline; a worker re-discovers the block and fills it from
//! its sources exactly once. A read takes the stripe lock shared, fetches
//! a fresh entry from the LRU, and reads from the block file.

pub mod block;
pub mod engine;
pub mod key;
pub mod locks;
pub mod lru;
mod pipeline;

pub use block::{compute_alloc_size, CacheBlock};
pub use engine::{CacheConfig, CacheEngine};
pub use key::BlockKey;
pub use locks::{KeyLocks, DEFAULT_STRIPES};
pub use lru::{LruCache, LruStatus};

/// Fixed size of the logical region a block caches (1 MiB)
pub const CACHE_BLOCK_SIZE: u64 = 1 << 20;

/// Default TTL applied when a request carries none
pub const DEFAULT_TTL_SECS: u64 = 3600;

/// Default prepare worker count
pub const DEFAULT_WORKERS: usize = 20;

/// Default prepare task queue depth
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// Default shutdown grace for in-flight workers
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2000;

// =============================================================================
// Tests
// =============================================================================
