//! Asynchronous prepare pipeline
//!
//! A bounded task queue feeding a fixed pool of worker threads. Enqueue is
//! non-blocking by design: when the queue is full the task is dropped with
//! a warning and the admission path stays unblocked; the block will be
//! materialized by the first reader or the next prepare attempt.
//!
//! Workers re-discover the block through a stripe-locked `peek` so a
//! prepare task never promotes LRU order, then run the block's one-shot
//! materialization. On the engine's close broadcast workers exit without
//! draining the queue.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{select, Receiver};
use tracing::{debug, warn};

use super::block::CacheBlock;
use super::key::BlockKey;
use super::locks::KeyLocks;
use super::lru::LruCache;
use crate::proto::CacheRequest;

/// One queued materialization request.
pub(crate) struct PrepareTask {
    pub req_id: i64,
    pub request: CacheRequest,
}

/// Spawn the worker pool. Handles are returned for ownership; workers end
/// themselves on the close broadcast.
pub(crate) fn spawn_workers(
    workers: usize,
    tasks: Receiver<PrepareTask>,
    close: Receiver<()>,
    lru: Arc<LruCache<Arc<CacheBlock>>>,
    locks: Arc<KeyLocks>,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|id| {
            let tasks = tasks.clone();
            let close = close.clone();
            let lru = Arc::clone(&lru);
            let locks = Arc::clone(&locks);
            thread::Builder::new()
                .name(format!("cache-prepare-{id}"))
                .spawn(move || worker_loop(id, &tasks, &close, &lru, &locks))
                .expect("spawn prepare worker")
        })
        .collect()
}

fn worker_loop(
    id: usize,
    tasks: &Receiver<PrepareTask>,
    close: &Receiver<()>,
    lru: &LruCache<Arc<CacheBlock>>,
    locks: &KeyLocks,
) {
    loop {
        select! {
            recv(close) -> _ => {
                debug!(worker = id, "close prepare worker on cache engine stopping");
                return;
            }
            recv(tasks) -> msg => {
                let Ok(task) = msg else { return };
                run_task(&task, lru, locks);
            }
        }
    }
}

fn run_task(task: &PrepareTask, lru: &LruCache<Arc<CacheBlock>>, locks: &KeyLocks) {
    let key = BlockKey::from_request(&task.request);
    let block = {
        let _guard = locks.read(&key);
        lru.peek(&key)
    };
    match block {
        Some(block) => {
            if let Err(err) = block.init_once(&task.request.sources) {
                warn!(req_id = task.req_id, key = %key, error = %err, "prepare materialization failed");
            }
        }
        None => {
            warn!(req_id = task.req_id, key = %key, "cache block not found for prepare task");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::block::compute_alloc_size;
    use crate::error::Result as CacheResult;
    use crate::proto::{DataSource, ReadExtentFn};
    use crossbeam_channel::bounded;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn request(inode: u64) -> CacheRequest {
        CacheRequest {
            volume: "vol".to_string(),
            inode,
            fixed_file_offset: 0,
            version: 1,
            ttl: 0,
            sources: vec![DataSource {
                partition_id: 1,
                extent_id: 1,
                extent_offset: 0,
                size_in_block: 64,
                size: 64,
                hosts: Vec::new(),
            }],
        }
    }

    fn reader(calls: Arc<AtomicUsize>) -> ReadExtentFn {
        Arc::new(move |src, write| -> CacheResult<usize> {
            calls.fetch_add(1, Ordering::SeqCst);
            let data = vec![1u8; src.size_in_block as usize];
            write(&data, 0)?;
            Ok(data.len())
        })
    }

    fn noop_lru() -> Arc<LruCache<Arc<CacheBlock>>> {
        Arc::new(LruCache::new(
            16,
            1 << 20,
            Box::new(|b: &Arc<CacheBlock>| {
                b.close();
                Ok(())
            }),
            Box::new(|b: &Arc<CacheBlock>| b.delete()),
        ))
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_worker_materializes_admitted_block() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let req = request(1);
        let key = BlockKey::from_request(&req);
        let alloc = compute_alloc_size(&req.sources).unwrap();

        let lru = noop_lru();
        let locks = Arc::new(KeyLocks::default());
        let block = Arc::new(CacheBlock::new(
            dir.path(),
            key.clone(),
            alloc,
            reader(Arc::clone(&calls)),
        ));
        block.init_storage().unwrap();
        lru.set(
            key.clone(),
            Arc::clone(&block),
            alloc,
            Duration::from_secs(60),
        )
        .unwrap();

        let (task_tx, task_rx) = bounded(8);
        let (close_tx, close_rx) = bounded::<()>(0);
        let handles = spawn_workers(2, task_rx, close_rx, Arc::clone(&lru), locks);

        task_tx
            .send(PrepareTask {
                req_id: 1,
                request: req,
            })
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || block.is_ready()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(close_tx);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_missing_block_is_skipped() {
        let lru = noop_lru();
        let locks = Arc::new(KeyLocks::default());
        let (task_tx, task_rx) = bounded(8);
        let (close_tx, close_rx) = bounded::<()>(0);
        let handles = spawn_workers(1, task_rx, close_rx, lru, locks);

        // Never admitted; the worker logs and moves on.
        task_tx
            .send(PrepareTask {
                req_id: 7,
                request: request(99),
            })
            .unwrap();

        drop(close_tx);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_full_queue_rejects_without_blocking() {
        // No workers draining: the second try_send must fail fast.
        let (task_tx, _task_rx) = bounded(1);
        task_tx
            .try_send(PrepareTask {
                req_id: 1,
                request: request(1),
            })
            .unwrap();
        assert!(task_tx
            .try_send(PrepareTask {
                req_id: 2,
                request: request(2),
            })
            .is_err());
    }
}
