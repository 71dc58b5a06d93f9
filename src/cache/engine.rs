//! Cache engine facade
//!
//! Wires the backing store, LRU index, key-stripe locks, and prepare
//! pipeline together and exposes the operations the datanode's RPC layer
//! calls: prepare, create, get-for-read, peek, the eviction family,
//! status, and startup/shutdown orchestration.
//!
//! Admission protocol: a block is found-or-created in the LRU under its
//! stripe's exclusive lock, then its backing file is created and sized
//! outside the lock so peers behind the same stripe never wait on
//! filesystem latency. Readers racing that window observe a coherent
//! `BlockNotReady` from the block's init latch.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::block::{compute_alloc_size, CacheBlock};
use super::key::BlockKey;
use super::locks::{KeyLocks, DEFAULT_STRIPES};
use super::lru::LruCache;
use super::pipeline::{self, PrepareTask};
use super::{DEFAULT_QUEUE_DEPTH, DEFAULT_SHUTDOWN_GRACE_MS, DEFAULT_TTL_SECS, DEFAULT_WORKERS};
use crate::error::{CacheError, Result};
use crate::proto::{CacheAction, CacheRequest, CacheStatus, MonitorFn, ReadExtentFn};
use crate::store::{self, BackingStore, TmpfsStore};

/// Process-wide diagnostic toggle; the only mutable global.
static STACK_CAPTURE_ENABLED: AtomicBool = AtomicBool::new(false);

/// Engine configuration, immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Backing store mount root
    pub root_path: PathBuf,
    /// Total size of the backing filesystem in bytes
    pub total: u64,
    /// Fraction of `total` available to cache entries (0 < r <= 1)
    pub max_use_ratio: f64,
    /// Maximum live entry count
    pub capacity: usize,
    /// TTL applied when a request carries none
    pub default_ttl_secs: u64,
    /// Prepare worker threads
    pub workers: usize,
    /// Key lock stripes
    pub stripes: usize,
    /// Prepare task queue depth
    pub queue_depth: usize,
    /// Shutdown grace for in-flight workers before the store is released
    pub shutdown_grace_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("/var/cache/cachestor"),
            total: 4 * 1024 * 1024 * 1024,
            max_use_ratio: 0.9,
            capacity: 4096,
            default_ttl_secs: DEFAULT_TTL_SECS,
            workers: DEFAULT_WORKERS,
            stripes: DEFAULT_STRIPES,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl CacheConfig {
    /// Validate at construction; the engine refuses to build otherwise.
    pub fn validate(&self) -> Result<()> {
        if self.root_path.as_os_str().is_empty() {
            return Err(CacheError::Config("root path is empty".to_string()));
        }
        if self.total == 0 {
            return Err(CacheError::Config("total size is zero".to_string()));
        }
        if !(self.max_use_ratio > 0.0 && self.max_use_ratio <= 1.0) {
            return Err(CacheError::Config(format!(
                "max use ratio {} outside (0, 1]",
                self.max_use_ratio
            )));
        }
        if self.capacity == 0 {
            return Err(CacheError::Config("capacity is zero".to_string()));
        }
        if self.default_ttl_secs == 0 {
            return Err(CacheError::Config("default ttl is zero".to_string()));
        }
        if self.workers == 0 || self.stripes == 0 || self.queue_depth == 0 {
            return Err(CacheError::Config(
                "workers, stripes and queue depth must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    /// Byte budget available to cache entries
    pub fn max_alloc(&self) -> u64 {
        (self.total as f64 * self.max_use_ratio) as u64
    }
}

/// Block-level read cache engine.
pub struct CacheEngine {
    config: CacheConfig,
    max_alloc: u64,
    store: Arc<dyn BackingStore>,
    lru: Arc<LruCache<Arc<CacheBlock>>>,
    locks: Arc<KeyLocks>,
    read_source: ReadExtentFn,
    monitor: MonitorFn,
    task_tx: Sender<PrepareTask>,
    task_rx: Receiver<PrepareTask>,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl CacheEngine {
    /// Build an engine over a tmpfs backing store at the configured root.
    pub fn new(config: CacheConfig, read_source: ReadExtentFn, monitor: MonitorFn) -> Result<Self> {
        let store = Arc::new(TmpfsStore::new(config.root_path.clone(), config.total));
        Self::with_store(config, store, read_source, monitor)
    }

    /// Build an engine over a caller-supplied backing store.
    pub fn with_store(
        config: CacheConfig,
        store: Arc<dyn BackingStore>,
        read_source: ReadExtentFn,
        monitor: MonitorFn,
    ) -> Result<Self> {
        config.validate()?;
        store.prepare()?;

        let max_alloc = config.max_alloc();
        let lru = Arc::new(LruCache::new(
            config.capacity,
            max_alloc,
            Box::new(|block: &Arc<CacheBlock>| {
                block.close();
                Ok(())
            }),
            Box::new(|block: &Arc<CacheBlock>| block.delete()),
        ));
        let locks = Arc::new(KeyLocks::new(config.stripes));
        let (task_tx, task_rx) = bounded(config.queue_depth);
        let (close_tx, close_rx) = bounded::<()>(0);

        Ok(Self {
            config,
            max_alloc,
            store,
            lru,
            locks,
            read_source,
            monitor,
            task_tx,
            task_rx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Spawn the mount watchdog and the prepare worker pool. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        store::spawn_watchdog(Arc::clone(&self.store), self.close_rx.clone());
        pipeline::spawn_workers(
            self.config.workers,
            self.task_rx.clone(),
            self.close_rx.clone(),
            Arc::clone(&self.lru),
            Arc::clone(&self.locks),
        );
        info!(workers = self.config.workers, "cache engine started");
    }

    /// Drain the cache, broadcast close to workers and the watchdog, wait
    /// the configured grace for in-flight materializations, then release
    /// the backing store.
    pub fn stop(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }
        let failed = self.lru.close();
        if !failed.is_empty() {
            warn!(failed = failed.len(), "cache entries failed destructors during close");
        }
        self.close_tx.lock().take();
        thread::sleep(Duration::from_millis(self.config.shutdown_grace_ms));
        info!(root = ?self.store.root(), "cache engine stopped, releasing backing store");
        self.store.release()
    }

    /// Ensure the request's block is admitted and queue its
    /// materialization. Success reports admission; a full task queue drops
    /// the task without failing the call.
    pub fn prepare(&self, req_id: i64, req: &CacheRequest) -> Result<()> {
        self.create_block(req)?;
        self.submit_prepare(req_id, req.clone());
        Ok(())
    }

    /// Queue a prepare task without blocking the admission path.
    pub fn submit_prepare(&self, req_id: i64, request: CacheRequest) {
        match self.task_tx.try_send(PrepareTask { req_id, request }) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => {
                warn!(req_id = task.req_id, "prepare task queue has been full");
            }
            Err(TrySendError::Disconnected(task)) => {
                warn!(req_id = task.req_id, "prepare workers are gone, dropping task");
            }
        }
    }

    /// Admit the request's block: find it or create, register, and size
    /// its backing file. On failure the key is evicted best-effort before
    /// the error propagates.
    pub fn create_block(&self, req: &CacheRequest) -> Result<Arc<CacheBlock>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }
        if req.sources.is_empty() {
            return Err(CacheError::NoSources);
        }
        let alloc = compute_alloc_size(&req.sources)?;
        let key = BlockKey::from_request(req);

        match self.create_block_inner(&key, req.ttl, alloc) {
            Ok(block) => Ok(block),
            Err(err) => {
                let _guard = self.locks.write(&key);
                self.lru.evict(&key);
                Err(err)
            }
        }
    }

    fn create_block_inner(&self, key: &BlockKey, ttl: i64, alloc: u64) -> Result<Arc<CacheBlock>> {
        let ttl = if ttl <= 0 {
            Duration::from_secs(self.config.default_ttl_secs)
        } else {
            Duration::from_secs(ttl as u64)
        };

        let (block, evicted) = {
            let _guard = self.locks.write(key);
            if let Some(existing) = self.lru.peek(key) {
                return Ok(existing);
            }
            let block = Arc::new(CacheBlock::new(
                self.store.root(),
                key.clone(),
                alloc,
                Arc::clone(&self.read_source),
            ));
            let evicted = self.lru.set(key.clone(), Arc::clone(&block), alloc, ttl)?;
            (block, evicted)
        };

        if evicted > 0 {
            (self.monitor)(key.volume(), CacheAction::CacheEvict, evicted);
        }

        // Filesystem work happens outside the stripe lock; racing readers
        // get BlockNotReady from the init latch, never a raw I/O error.
        block.init_storage()?;
        Ok(block)
    }

    /// Fetch a present, non-expired block for a read. An observed-expired
    /// entry emits a `CacheExpire` monitoring event; both expired and
    /// absent surface as `CacheMiss`.
    pub fn get_for_read(
        &self,
        volume: &str,
        inode: u64,
        offset: u64,
        version: u32,
        size: u64,
    ) -> Result<Arc<CacheBlock>> {
        let key = BlockKey::new(volume, inode, offset, version);
        let _guard = self.locks.read(&key);
        match self.lru.get(&key) {
            Ok(block) => Ok(block),
            Err(CacheError::CacheExpired { .. }) => {
                (self.monitor)(volume, CacheAction::CacheExpire, size);
                Err(CacheError::CacheMiss {
                    key: key.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Look up a block without touching LRU order or statistics. Panics in
    /// the lookup are recovered and reported as `PeekFailed`.
    pub fn peek(&self, key: &BlockKey) -> Result<Arc<CacheBlock>> {
        let looked_up = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.locks.read(key);
            self.lru.peek(key)
        }));
        match looked_up {
            Ok(Some(block)) => Ok(block),
            Ok(None) => Err(CacheError::CacheMiss {
                key: key.to_string(),
            }),
            Err(panic) => {
                let reason = panic_reason(&panic);
                if self.stack_enabled() {
                    error!(
                        key = %key,
                        reason = %reason,
                        backtrace = %std::backtrace::Backtrace::force_capture(),
                        "peek cache block panicked"
                    );
                } else {
                    error!(key = %key, reason = %reason, "peek cache block panicked");
                }
                Err(CacheError::PeekFailed(reason))
            }
        }
    }

    /// Evict every block of a volume. Returns the keys that failed.
    pub fn evict_volume(&self, volume: &str) -> Vec<BlockKey> {
        let mut failed = Vec::new();
        let mut all = 0usize;
        for key in self.lru.keys() {
            if key.volume() == volume {
                all += 1;
                let _guard = self.locks.write(&key);
                if !self.lru.evict(&key) {
                    failed.push(key);
                }
            }
        }
        warn!(volume, all, failed = failed.len(), "evict volume cache finished");
        failed
    }

    /// Evict every block of one inode. Returns the keys that failed.
    pub fn evict_inode(&self, volume: &str, inode: u64) -> Vec<BlockKey> {
        let mut failed = Vec::new();
        for key in self.lru.keys() {
            if key.volume() == volume && key.inode() == inode {
                let _guard = self.locks.write(&key);
                if !self.lru.evict(&key) {
                    failed.push(key);
                }
            }
        }
        warn!(volume, inode, failed = failed.len(), "evict inode cache finished");
        failed
    }

    /// Quiesce every stripe and drain the cache. Returns the keys that
    /// failed destructors.
    pub fn evict_all(&self) -> Vec<BlockKey> {
        let guards = self.locks.lock_all();
        let failed = self.lru.evict_all();
        drop(guards);
        warn!(failed = failed.len(), "evict all cache finished");
        failed
    }

    /// Engine status snapshot.
    pub fn status(&self) -> CacheStatus {
        let lru = self.lru.status();
        CacheStatus {
            max_alloc: self.max_alloc,
            has_alloc: lru.used,
            total: self.config.total,
            used: self.store.used_bytes(),
            num: lru.num,
            hit_rate: (self.lru.hit_rate() * 1e4 + 0.5).trunc() * 1e-4,
            evicts: self.lru.recent_evict(),
            capacity: self.config.capacity,
        }
    }

    /// Snapshot of cached keys in MRU-to-LRU order
    pub fn keys(&self) -> Vec<BlockKey> {
        self.lru.keys()
    }

    /// Engine configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Toggle diagnostic stack capture, process-wide.
    pub fn set_stack_enabled(&self, enable: bool) {
        STACK_CAPTURE_ENABLED.store(enable, Ordering::SeqCst);
    }

    /// Whether diagnostic stack capture is on
    pub fn stack_enabled(&self) -> bool {
        STACK_CAPTURE_ENABLED.load(Ordering::SeqCst)
    }
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================
