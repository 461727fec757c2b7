//! Concurrency tests
//!
//! These tests verify:
//! - Disjoint concurrent inserts all land, across block splits
//! - Readers and scanners run alongside writers
//! - Read-modify-write operations are atomic per key
//! - Concurrent deletes with merges leave a consistent map
//! - Churn under a pinned snapshot keeps scans and point reads in agreement

use std::sync::Arc;
use std::thread;

use latticekv::{Config, Engine, Increment};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_shared_engine() -> Arc<Engine> {
    let config = Config::builder()
        .max_block_size(1024)
        .max_index_block_size(512)
        .build();
    Arc::new(Engine::open(config).unwrap())
}

fn thread_key(thread: usize, i: usize) -> Vec<u8> {
    format!("t{}-key{:05}", thread, i).into_bytes()
}

// =============================================================================
// Writer Tests
// =============================================================================

#[test]
fn test_concurrent_disjoint_inserts() {
    let engine = setup_shared_engine();
    let threads = 8;
    let per_thread = 1000;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..per_thread {
                    engine.put(&thread_key(t, i), format!("value{}", i).as_bytes(), 1, 0).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(engine.len().unwrap(), threads * per_thread);
    for t in 0..threads {
        for i in (0..per_thread).step_by(97) {
            assert_eq!(
                engine.get(&thread_key(t, i), 1).unwrap(),
                Some(format!("value{}", i).into_bytes())
            );
        }
    }
}

#[test]
fn test_concurrent_interleaved_inserts() {
    let engine = setup_shared_engine();
    let threads = 4;
    let per_thread = 1000;

    // Thread t writes every key i with i % threads == t, so all threads
    // contend on the same blocks.
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in (t..threads * per_thread).step_by(threads) {
                    engine.put(format!("key{:06}", i).as_bytes(), b"v", 1, 0).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let keys: Vec<Vec<u8>> = engine
        .scanner(None, None, false)
        .map(|item| item.unwrap().0.to_vec())
        .collect();
    assert_eq!(keys.len(), threads * per_thread);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(key, &format!("key{:06}", i).into_bytes());
    }
}

// =============================================================================
// Reader Tests
// =============================================================================

#[test]
fn test_scans_during_writes_stay_sorted() {
    let engine = setup_shared_engine();

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..1000 {
                    engine.put(&thread_key(t, i), b"v", 1, 0).unwrap();
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..2)
        .map(|r| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for _ in 0..20 {
                    let keys: Vec<Vec<u8>> = engine
                        .scanner(None, None, r == 1)
                        .map(|item| item.unwrap().0.to_vec())
                        .collect();
                    for pair in keys.windows(2) {
                        if r == 1 {
                            assert!(pair[0] > pair[1]);
                        } else {
                            assert!(pair[0] < pair[1]);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in writers.into_iter().chain(readers) {
        handle.join().unwrap();
    }
    assert_eq!(engine.len().unwrap(), 4000);
}

#[test]
fn test_concurrent_increments_are_atomic() {
    let engine = setup_shared_engine();
    let threads = 4;
    let per_thread = 250;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for _ in 0..per_thread {
                    // Every increment rewrites the record at version 1.
                    assert!(engine.execute(&mut Increment::new("shared", 1), 1).unwrap());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let value = engine.get(b"shared", 1).unwrap().unwrap();
    assert_eq!(i64::from_le_bytes(value.as_slice().try_into().unwrap()), (threads * per_thread) as i64);
}

// =============================================================================
// Delete Tests
// =============================================================================

#[test]
fn test_concurrent_deletes_with_merges() {
    let engine = setup_shared_engine();
    let threads = 4;
    let per_thread = 1000;
    for t in 0..threads {
        for i in 0..per_thread {
            engine.put(&thread_key(t, i), b"value", 1, 0).unwrap();
        }
    }
    let index_blocks = engine.index_block_count();

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..per_thread {
                    if i % 50 != 0 {
                        engine.delete(&thread_key(t, i), 2).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(engine.index_block_count() < index_blocks);
    assert_eq!(engine.len().unwrap(), threads * per_thread / 50);
    for t in 0..threads {
        for i in (0..per_thread).step_by(50) {
            assert!(engine.exists(&thread_key(t, i)).unwrap());
        }
    }
}

#[test]
fn test_concurrent_churn_under_pinned_snapshot() {
    let config = Config::builder()
        .max_block_size(512)
        .max_index_block_size(256)
        .build();
    let engine = Arc::new(Engine::open(config).unwrap());
    let threads = 6;
    let per_thread = 600;
    let rounds = 3;
    let pinned = engine.scanner_at(None, None, false, 0);

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for round in 0..rounds {
                    let version = engine.next_version();
                    for i in 0..per_thread {
                        let value = format!("round{}-{:040}", round, i);
                        engine.put(&thread_key(t, i), value.as_bytes(), version, 0).unwrap();
                    }
                    let version = engine.next_version();
                    for i in (0..per_thread).filter(|i| i % 3 != 0) {
                        engine.delete(&thread_key(t, i), version).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let check = |engine: &Engine| {
        let version = engine.last_version();
        let mut visible = 0;
        for t in 0..threads {
            for i in 0..per_thread {
                let value = engine.get(&thread_key(t, i), version).unwrap();
                if i % 3 == 0 {
                    let want = format!("round{}-{:040}", rounds - 1, i).into_bytes();
                    assert_eq!(value, Some(want));
                    visible += 1;
                } else {
                    assert_eq!(value, None, "t{} key {}", t, i);
                }
            }
        }
        assert_eq!(engine.scanner(None, None, false).count(), visible);
        assert_eq!(engine.scanner(None, None, true).count(), visible);
        assert_eq!(visible, threads * per_thread / 3);
    };

    assert!(engine.index_block_count() > 1);
    check(engine.as_ref());
    assert_eq!(pinned.count(), 0);
    engine.compact().unwrap();
    check(engine.as_ref());
}
