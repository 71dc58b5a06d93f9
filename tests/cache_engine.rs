//! Cache Engine Integration Tests
//!
//! End-to-end scenarios over the public API with a directory-backed store:
//! admission and read, count- and byte-bounded eviction, TTL expiry with
//! monitoring, concurrent prepare of one key, and shutdown cleanliness.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use cachestor::{
    BlockKey, CacheAction, CacheConfig, CacheEngine, CacheError, CacheRequest, DataSource,
    DirStore, MonitorFn, ReadExtentFn,
};

const KIB: u32 = 1024;

struct TestEngine {
    engine: CacheEngine,
    source_reads: Arc<AtomicUsize>,
    monitor_events: Arc<Mutex<Vec<(String, CacheAction, u64)>>>,
    root: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn test_engine(capacity: usize, max_alloc: u64, queue_depth: usize) -> TestEngine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("blockcache");
    let config = CacheConfig {
        root_path: root.clone(),
        total: max_alloc,
        max_use_ratio: 1.0,
        capacity,
        default_ttl_secs: 10,
        workers: 4,
        queue_depth,
        shutdown_grace_ms: 0,
        ..Default::default()
    };

    let source_reads = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&source_reads);
    let read_source: ReadExtentFn = Arc::new(move |src, write| {
        counter.fetch_add(1, Ordering::SeqCst);
        // Deterministic content: every byte is the extent id.
        let data = vec![src.extent_id as u8; src.size_in_block as usize];
        write(&data, 0)?;
        Ok(data.len())
    });

    let monitor_events = Arc::new(Mutex::new(Vec::new()));
    let events = Arc::clone(&monitor_events);
    let monitor: MonitorFn = Arc::new(move |volume, action, size| {
        events.lock().push((volume.to_string(), action, size));
    });

    let store = Arc::new(DirStore::new(root.clone()));
    let engine = CacheEngine::with_store(config, store, read_source, monitor).unwrap();
    engine.start();

    TestEngine {
        engine,
        source_reads,
        monitor_events,
        root,
        _dir: dir,
    }
}

fn request(volume: &str, inode: u64, size_in_block: u32, ttl: i64) -> CacheRequest {
    CacheRequest {
        volume: volume.to_string(),
        inode,
        fixed_file_offset: 0,
        version: 1,
        ttl,
        sources: vec![DataSource {
            partition_id: 1,
            extent_id: inode,
            extent_offset: 0,
            size_in_block,
            size: size_in_block,
            hosts: vec!["127.0.0.1:17030".to_string()],
        }],
    }
}

fn wait_ready(engine: &CacheEngine, key: &BlockKey) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(block) = engine.peek(key) {
            if block.is_ready() {
                return;
            }
        }
        assert!(Instant::now() < deadline, "block {key} never became ready");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_admission_and_read() {
    let t = test_engine(2, 1 << 20, 1024);
    let req = request("vol", 1, 64 * KIB, 0);

    t.engine.prepare(1, &req).unwrap();
    wait_ready(&t.engine, &BlockKey::from_request(&req));

    let block = t.engine.get_for_read("vol", 1, 0, 1, 64 * KIB as u64).unwrap();
    let mut buf = vec![0u8; 64 * KIB as usize];
    assert_eq!(block.read(0, &mut buf).unwrap(), 64 * KIB as usize);
    assert!(buf.iter().all(|b| *b == 1));

    let status = t.engine.status();
    assert_eq!(status.num, 1);
    assert_eq!(status.has_alloc, 64 * KIB as u64);

    t.engine.stop().unwrap();
}

#[test]
fn test_lru_eviction_under_count_pressure() {
    let t = test_engine(2, 1 << 20, 1024);
    let a = request("vol", 1, 400 * KIB, 0);
    let b = request("vol", 2, 400 * KIB, 0);
    let c = request("vol", 3, 400 * KIB, 0);

    let block_a = t.engine.create_block(&a).unwrap();
    t.engine.create_block(&b).unwrap();
    t.engine.create_block(&c).unwrap();

    // The tail (a) was evicted; its destructors removed the backing file.
    assert_eq!(t.engine.status().num, 2);
    assert!(!block_a.path().exists());
    assert!(!t
        .engine
        .keys()
        .contains(&BlockKey::from_request(&a)));
    assert!(matches!(
        t.engine.get_for_read("vol", 1, 0, 1, 64),
        Err(CacheError::CacheMiss { .. })
    ));

    t.engine.stop().unwrap();
}

#[test]
fn test_byte_budget_eviction() {
    let t = test_engine(10, 1 << 20, 1024);
    for inode in 1..=3 {
        t.engine
            .create_block(&request("vol", inode, 400 * KIB, 0))
            .unwrap();
    }

    let status = t.engine.status();
    assert!(status.has_alloc <= 1 << 20);
    assert_eq!(status.num, 2);
    // Oldest insert went first.
    assert!(matches!(
        t.engine.get_for_read("vol", 1, 0, 1, 64),
        Err(CacheError::CacheMiss { .. })
    ));
    t.engine.get_for_read("vol", 3, 0, 1, 64).unwrap();

    let events = t.monitor_events.lock();
    assert_eq!(
        events.as_slice(),
        &[("vol".to_string(), CacheAction::CacheEvict, 400 * KIB as u64)]
    );

    t.engine.stop().unwrap();
}

#[test]
fn test_ttl_expiry_emits_monitor_event() {
    let t = test_engine(4, 1 << 20, 1024);
    t.engine.create_block(&request("vol", 1, 64, 1)).unwrap();

    thread::sleep(Duration::from_millis(1200));
    assert!(matches!(
        t.engine.get_for_read("vol", 1, 0, 1, 64),
        Err(CacheError::CacheMiss { .. })
    ));
    assert_eq!(t.engine.status().num, 0);

    let events = t.monitor_events.lock();
    assert_eq!(
        events.as_slice(),
        &[("vol".to_string(), CacheAction::CacheExpire, 64)]
    );

    t.engine.stop().unwrap();
}

#[test]
fn test_concurrent_prepare_of_same_key() {
    let t = test_engine(4, 1 << 20, 1024);
    let req = request("vol", 1, 64 * KIB, 0);
    let engine = &t.engine;

    thread::scope(|s| {
        for req_id in 0..100 {
            let req = req.clone();
            s.spawn(move || engine.prepare(req_id, &req).unwrap());
        }
    });

    wait_ready(engine, &BlockKey::from_request(&req));
    assert_eq!(t.engine.status().num, 1);
    // One source, one read, however many prepares raced.
    assert_eq!(t.source_reads.load(Ordering::SeqCst), 1);

    t.engine.stop().unwrap();
}

#[test]
fn test_shutdown_cleanliness() {
    let t = test_engine(8, 1 << 20, 1024);
    let mut blocks = Vec::new();
    for inode in 1..=4 {
        let req = request("vol", inode, 64 * KIB, 0);
        t.engine.prepare(inode as i64, &req).unwrap();
        wait_ready(&t.engine, &BlockKey::from_request(&req));
        blocks.push(t.engine.get_for_read("vol", inode, 0, 1, 64).unwrap());
    }

    t.engine.stop().unwrap();

    // Store released: no block file remains reachable under the root.
    assert!(!t.root.exists());
    for block in &blocks {
        assert!(!block.path().exists());
        let mut buf = [0u8; 8];
        assert!(matches!(block.read(0, &mut buf), Err(CacheError::Closed)));
    }
    assert!(matches!(
        t.engine.get_for_read("vol", 1, 0, 1, 64),
        Err(CacheError::Closed)
    ));
}

#[test]
fn test_prepare_succeeds_when_queue_overflows() {
    // Worker pool deliberately too small for the burst; admission must
    // never block or fail on a full queue.
    let t = test_engine(64, 8 << 20, 1);
    for inode in 1..=16 {
        t.engine
            .prepare(inode as i64, &request("vol", inode, 4 * KIB, 0))
            .unwrap();
    }
    assert_eq!(t.engine.status().num, 16);

    // Dropped tasks are recoverable: a later prepare of the same key still
    // materializes it.
    let req = request("vol", 1, 4 * KIB, 0);
    t.engine.prepare(99, &req).unwrap();
    wait_ready(&t.engine, &BlockKey::from_request(&req));

    t.engine.stop().unwrap();
}

#[test]
fn test_evict_volume_after_eviction_pressure() {
    let t = test_engine(16, 8 << 20, 1024);
    t.engine.create_block(&request("vol-a", 1, 64, 0)).unwrap();
    t.engine.create_block(&request("vol-b", 1, 64, 0)).unwrap();

    let failed = t.engine.evict_volume("vol-a");
    assert!(failed.is_empty());
    assert_eq!(t.engine.keys(), vec![BlockKey::new("vol-b", 1, 0, 1)]);

    t.engine.stop().unwrap();
}
