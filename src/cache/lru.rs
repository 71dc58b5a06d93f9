//! Capacity- and byte-bounded LRU index with TTL expiry
//!
//! Maps block keys to values under a single internal mutex: a hash index
//! over an intrusive doubly linked list kept in slab storage. Every removal
//! runs the configured destructor chain (`on_close`, then `on_delete`);
//! bulk evictions collect destructor failures instead of aborting.
//!
//! Expiry is lazy: `get` is the only operation that treats a stale entry
//! as an immediate eviction. `peek` reports fresh entries only and leaves
//! order, statistics, and stale entries untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use super::key::BlockKey;
use crate::error::{CacheError, Result};

/// Destructor hook invoked for a value leaving the cache
pub type Destructor<V> = Box<dyn Fn(&V) -> Result<()> + Send + Sync>;

/// Point-in-time usage snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LruStatus {
    /// Sum of live entry weights in bytes
    pub used: u64,
    /// Live entry count
    pub num: usize,
}

const NIL: usize = usize::MAX;

struct Node<V> {
    key: BlockKey,
    value: V,
    weight: u64,
    expires_at: Instant,
    prev: usize,
    next: usize,
}

struct Inner<V> {
    index: HashMap<BlockKey, usize>,
    nodes: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    used: u64,
    closed: bool,
}

impl<V> Inner<V> {
    fn new(capacity: usize) -> Self {
        Self {
            index: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            used: 0,
            closed: false,
        }
    }

    fn node(&self, idx: usize) -> &Node<V> {
        self.nodes[idx].as_ref().expect("live lru node")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<V> {
        self.nodes[idx].as_mut().expect("live lru node")
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let n = self.node(idx);
            (n.prev, n.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.node_mut(prev).next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.node_mut(next).prev = prev;
        }
        let n = self.node_mut(idx);
        n.prev = NIL;
        n.next = NIL;
    }

    fn link_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let n = self.node_mut(idx);
            n.prev = NIL;
            n.next = old_head;
        }
        if old_head != NIL {
            self.node_mut(old_head).prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head != idx {
            self.unlink(idx);
            self.link_front(idx);
        }
    }

    fn insert_front(&mut self, node: Node<V>) -> usize {
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        let (key, weight) = {
            let n = self.node(idx);
            (n.key.clone(), n.weight)
        };
        self.index.insert(key, idx);
        self.used += weight;
        self.link_front(idx);
        idx
    }

    fn remove(&mut self, idx: usize) -> Node<V> {
        self.unlink(idx);
        let node = self.nodes[idx].take().expect("live lru node");
        self.index.remove(&node.key);
        self.free.push(idx);
        self.used -= node.weight;
        node
    }
}

/// Combined capacity-bounded and byte-bounded LRU with per-entry expiry.
pub struct LruCache<V> {
    inner: Mutex<Inner<V>>,
    capacity: usize,
    max_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    recent_evict: AtomicU64,
    evict_failures: AtomicU64,
    on_close: Destructor<V>,
    on_delete: Destructor<V>,
}

impl<V: Clone> LruCache<V> {
    /// Create an index bounded to `capacity` entries and `max_bytes` total
    /// weight, with the destructor chain to run for every removed value.
    pub fn new(
        capacity: usize,
        max_bytes: u64,
        on_close: Destructor<V>,
        on_delete: Destructor<V>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::new(capacity)),
            capacity,
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            recent_evict: AtomicU64::new(0),
            evict_failures: AtomicU64::new(0),
            on_close,
            on_delete,
        }
    }

    /// Run the destructor chain; both hooks are attempted even if the
    /// first fails. Returns whether the whole chain succeeded.
    fn destruct(&self, key: &BlockKey, value: &V) -> bool {
        let mut ok = true;
        if let Err(err) = (self.on_close)(value) {
            warn!(key = %key, error = %err, "cache entry close hook failed");
            ok = false;
        }
        if let Err(err) = (self.on_delete)(value) {
            warn!(key = %key, error = %err, "cache entry delete hook failed");
            ok = false;
        }
        if !ok {
            self.evict_failures.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Insert or replace an entry, then evict from the LRU tail until both
    /// the count and byte bounds hold again. Returns the total weight
    /// evicted by this call.
    pub fn set(&self, key: BlockKey, value: V, weight: u64, ttl: Duration) -> Result<u64> {
        if weight > self.max_bytes {
            return Err(CacheError::OverWeight {
                weight,
                max: self.max_bytes,
            });
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CacheError::Closed);
        }

        // Same-key replacement releases the prior entry in place.
        if let Some(&idx) = inner.index.get(&key) {
            let old = inner.remove(idx);
            self.destruct(&old.key, &old.value);
        }

        inner.insert_front(Node {
            key,
            value,
            weight,
            expires_at: Instant::now() + ttl,
            prev: NIL,
            next: NIL,
        });

        let mut evicted = 0u64;
        while inner.index.len() > self.capacity || inner.used > self.max_bytes {
            let tail = inner.tail;
            let node = inner.remove(tail);
            self.destruct(&node.key, &node.value);
            evicted += node.weight;
        }

        if evicted > 0 {
            self.recent_evict.fetch_add(evicted, Ordering::Relaxed);
        }
        Ok(evicted)
    }

    /// Fetch a fresh entry, promoting it to MRU. An expired entry is
    /// removed on observation and reported as `CacheExpired`.
    pub fn get(&self, key: &BlockKey) -> Result<V> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CacheError::Closed);
        }

        let Some(&idx) = inner.index.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::CacheMiss {
                key: key.to_string(),
            });
        };

        if Instant::now() >= inner.node(idx).expires_at {
            let node = inner.remove(idx);
            self.destruct(&node.key, &node.value);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::CacheExpired {
                key: key.to_string(),
            });
        }

        inner.touch(idx);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(inner.node(idx).value.clone())
    }

    /// Look up a fresh entry without touching order, statistics, or
    /// expired entries.
    pub fn peek(&self, key: &BlockKey) -> Option<V> {
        let inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        let &idx = inner.index.get(key)?;
        let node = inner.node(idx);
        if Instant::now() >= node.expires_at {
            return None;
        }
        Some(node.value.clone())
    }

    /// Remove an entry if present, running its destructors. Returns false
    /// for absent keys and for destructor failures.
    pub fn evict(&self, key: &BlockKey) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        let Some(&idx) = inner.index.get(key) else {
            return false;
        };
        let node = inner.remove(idx);
        self.destruct(&node.key, &node.value)
    }

    /// Drain every entry, running destructors for each. Returns the keys
    /// whose destructor chain failed, for caller retry.
    pub fn evict_all(&self) -> Vec<BlockKey> {
        let mut inner = self.inner.lock();
        self.drain(&mut inner)
    }

    /// Drain the index and refuse all further operations.
    pub fn close(&self) -> Vec<BlockKey> {
        let mut inner = self.inner.lock();
        let failed = self.drain(&mut inner);
        inner.closed = true;
        failed
    }

    fn drain(&self, inner: &mut Inner<V>) -> Vec<BlockKey> {
        let mut failed = Vec::new();
        while inner.tail != NIL {
            let node = inner.remove(inner.tail);
            if !self.destruct(&node.key, &node.value) {
                failed.push(node.key);
            }
        }
        failed
    }

    /// Snapshot of keys in MRU-to-LRU order
    pub fn keys(&self) -> Vec<BlockKey> {
        let inner = self.inner.lock();
        let mut keys = Vec::with_capacity(inner.index.len());
        let mut idx = inner.head;
        while idx != NIL {
            let node = inner.node(idx);
            keys.push(node.key.clone());
            idx = node.next;
        }
        keys
    }

    /// Current usage
    pub fn status(&self) -> LruStatus {
        let inner = self.inner.lock();
        LruStatus {
            used: inner.used,
            num: inner.index.len(),
        }
    }

    /// Fresh-hit ratio over all `get` calls so far
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let total = hits + self.misses.load(Ordering::Relaxed) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Bytes evicted by `set` pressure since the previous call; drains.
    pub fn recent_evict(&self) -> u64 {
        self.recent_evict.swap(0, Ordering::Relaxed)
    }

    /// Number of removals whose destructor chain failed
    pub fn evict_failures(&self) -> u64 {
        self.evict_failures.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
