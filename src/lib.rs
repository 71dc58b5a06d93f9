//! CacheStor - Block-Level Read Cache Engine
//!
//! A read cache that sits between a distributed filesystem's clients and
//! its durable storage. Logical read-source descriptors (volume, inode,
//! offset, version, backing extents) are materialized as fixed-identity
//! cache blocks on a memory-backed filesystem; subsequent reads are served
//! directly from those blocks.
//!
//! # Architecture
//!
//! ```text
//! RPC layer ──prepare──▶ CacheEngine ──admit──▶ LruCache ──▶ CacheBlock
//!                             │                                  ▲
//!                             └──task──▶ PrepareWorkers ──fill───┘
//!                                             │
//!                                     ReadExtentFn (host)
//! ```
//!
//! The engine owns a tmpfs mount (verified exclusive at startup, watched
//! at runtime, released on shutdown) and guarantees at-most-one
//! materialization per block identity through per-key stripe locks and a
//! one-shot init latch.
//!
//! The RPC surface, the extent reader, and the monitoring sink are
//! external collaborators reached through callbacks; the cache itself is
//! volatile by construction and re-materializes everything on restart.
//!
//! # Modules
//!
//! - [`cache`] - Engine, LRU index, blocks, key locks, prepare pipeline
//! - [`error`] - Error types
//! - [`proto`] - Wire shapes shared with the datanode protocol layer
//! - [`store`] - Backing-store lifecycle (tmpfs mount, sentinel, watchdog)

pub mod cache;
pub mod error;
pub mod proto;
pub mod store;

// Re-export commonly used types
pub use cache::{
    BlockKey, CacheBlock, CacheConfig, CacheEngine, KeyLocks, LruCache, CACHE_BLOCK_SIZE,
};
pub use error::{CacheError, Result};
pub use proto::{CacheAction, CacheRequest, CacheStatus, DataSource, MonitorFn, ReadExtentFn};
pub use store::{BackingStore, DirStore, TmpfsStore};
