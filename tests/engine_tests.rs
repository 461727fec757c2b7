//! Tests for Engine point operations
//!
//! These tests verify:
//! - Basic get/put/delete/exists
//! - Round trips for embedded and externalized records
//! - Tombstone visibility and re-insertion
//! - Configuration validation
//! - Transparent block compression and application codecs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use latticekv::compression::Lz4Codec;
use latticekv::config::MAX_ADDRESSABLE_BLOCK;
use latticekv::{Codec, CodecType, Config, Engine, LatticeError, OpResult};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_engine() -> Engine {
    Engine::open(Config::default()).unwrap()
}

fn setup_engine_with_block_size(max_block_size: usize) -> Engine {
    let config = Config::builder().max_block_size(max_block_size).build();
    Engine::open(config).unwrap()
}

fn collect_keys(engine: &Engine) -> Vec<Vec<u8>> {
    engine
        .scanner(None, None, false)
        .map(|item| item.unwrap().0.to_vec())
        .collect()
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_engine_put_get() {
    let engine = setup_engine();

    engine.put(b"hello", b"world", 1, 0).unwrap();

    assert_eq!(engine.get(b"hello", 1).unwrap(), Some(b"world".to_vec()));
    assert_eq!(engine.get(b"hello", u64::MAX).unwrap(), Some(b"world".to_vec()));
}

#[test]
fn test_engine_get_nonexistent_key() {
    let engine = setup_engine();

    assert_eq!(engine.get(b"nonexistent", u64::MAX).unwrap(), None);
    assert!(!engine.exists(b"nonexistent").unwrap());
}

#[test]
fn test_engine_get_before_first_version() {
    let engine = setup_engine();

    engine.put(b"key", b"value", 10, 0).unwrap();

    assert_eq!(engine.get(b"key", 9).unwrap(), None);
    assert_eq!(engine.get(b"key", 10).unwrap(), Some(b"value".to_vec()));
}

#[test]
fn test_engine_overwrite_same_version() {
    let engine = setup_engine();

    engine.put(b"key", b"first", 5, 0).unwrap();
    engine.put(b"key", b"second", 5, 0).unwrap();

    assert_eq!(engine.get(b"key", 5).unwrap(), Some(b"second".to_vec()));
    assert_eq!(engine.len().unwrap(), 1);
}

#[test]
fn test_engine_newer_version_wins() {
    let engine = setup_engine();

    engine.put(b"key", b"old", 1, 0).unwrap();
    engine.put(b"key", b"new", 2, 0).unwrap();

    assert_eq!(engine.get(b"key", u64::MAX).unwrap(), Some(b"new".to_vec()));
}

#[test]
fn test_engine_get_entry_carries_expire() {
    let engine = setup_engine();

    engine.put(b"session", b"token", 3, 1_700_000_000).unwrap();

    let entry = engine.get_entry(b"session", u64::MAX).unwrap().unwrap();
    assert_eq!(entry.value, b"token".to_vec());
    assert_eq!(entry.version, 3);
    assert_eq!(entry.expire, 1_700_000_000);
}

#[test]
fn test_engine_exists() {
    let engine = setup_engine();

    engine.put(b"present", b"1", 1, 0).unwrap();

    assert!(engine.exists(b"present").unwrap());
    assert!(!engine.exists(b"absent").unwrap());
}

// =============================================================================
// Round-Trip Tests
// =============================================================================

#[test]
fn test_round_trip_value_sizes() {
    let engine = setup_engine();
    let half = engine.config().max_block_size / 2;
    let sizes = [0, 1, 100, half - 30, half - 1, half, half + 1, 4096, 10_000];

    for (i, &size) in sizes.iter().enumerate() {
        let key = format!("value-size-{:02}", i);
        let value: Vec<u8> = (0..size).map(|b| (b % 251) as u8).collect();
        engine.put(key.as_bytes(), &value, 1, 0).unwrap();
    }
    for (i, &size) in sizes.iter().enumerate() {
        let key = format!("value-size-{:02}", i);
        let value: Vec<u8> = (0..size).map(|b| (b % 251) as u8).collect();
        assert_eq!(engine.get(key.as_bytes(), 1).unwrap(), Some(value), "size {}", size);
    }
}

#[test]
fn test_round_trip_key_sizes() {
    let engine = setup_engine();
    let half = engine.config().max_block_size / 2;
    let sizes = [1, 100, half - 1, half, half + 1, 10_000];

    for &size in &sizes {
        let key = vec![b'k'; size];
        engine.put(&key, format!("v{}", size).as_bytes(), 1, 0).unwrap();
    }
    for &size in &sizes {
        let key = vec![b'k'; size];
        assert_eq!(
            engine.get(&key, 1).unwrap(),
            Some(format!("v{}", size).into_bytes()),
            "size {}",
            size
        );
    }
    assert_eq!(engine.len().unwrap(), sizes.len());
}

#[test]
fn test_round_trip_empty_key() {
    let engine = setup_engine();

    engine.put(b"", b"empty key", 1, 0).unwrap();
    engine.put(b"a", b"a", 1, 0).unwrap();

    assert_eq!(engine.get(b"", 1).unwrap(), Some(b"empty key".to_vec()));
    assert_eq!(collect_keys(&engine), vec![b"".to_vec(), b"a".to_vec()]);
}

#[test]
fn test_round_trip_small_blocks() {
    let engine = setup_engine_with_block_size(512);

    for i in 0..200 {
        let value = vec![b'x'; i * 3];
        engine.put(format!("key{:04}", i).as_bytes(), &value, 1, 0).unwrap();
    }
    for i in 0..200 {
        let value = vec![b'x'; i * 3];
        assert_eq!(engine.get(format!("key{:04}", i).as_bytes(), 1).unwrap(), Some(value));
    }
}

// =============================================================================
// Delete / Tombstone Tests
// =============================================================================

#[test]
fn test_delete_hides_key() {
    let engine = setup_engine();

    engine.put(b"key", b"value", 1, 0).unwrap();
    assert_eq!(engine.delete(b"key", 2).unwrap(), OpResult::Ok);

    assert_eq!(engine.get(b"key", 2).unwrap(), None);
    assert_eq!(engine.get(b"key", 100).unwrap(), None);
    assert!(!engine.exists(b"key").unwrap());
}

#[test]
fn test_delete_nonexistent_key() {
    let engine = setup_engine();

    engine.put(b"other", b"value", 1, 0).unwrap();

    assert_eq!(engine.delete(b"missing", 2).unwrap(), OpResult::NotFound);
    assert_eq!(engine.get(b"other", 2).unwrap(), Some(b"value".to_vec()));
}

#[test]
fn test_delete_twice() {
    let engine = setup_engine();

    engine.put(b"key", b"value", 1, 0).unwrap();

    assert_eq!(engine.delete(b"key", 2).unwrap(), OpResult::Ok);
    assert_eq!(engine.delete(b"key", 3).unwrap(), OpResult::NotFound);
}

#[test]
fn test_put_after_delete() {
    let engine = setup_engine();

    engine.put(b"key", b"value1", 1, 0).unwrap();
    engine.delete(b"key", 2).unwrap();
    engine.put(b"key", b"value2", 3, 0).unwrap();

    assert_eq!(engine.get(b"key", 3).unwrap(), Some(b"value2".to_vec()));
    assert_eq!(engine.len().unwrap(), 1);
}

#[test]
fn test_delete_keeps_neighbours() {
    let engine = setup_engine_with_block_size(512);

    for i in 0..100 {
        engine.put(format!("key{:03}", i).as_bytes(), b"value", 1, 0).unwrap();
    }
    for i in (0..100).step_by(2) {
        assert_eq!(engine.delete(format!("key{:03}", i).as_bytes(), 2).unwrap(), OpResult::Ok);
    }

    for i in 0..100 {
        let expected = if i % 2 == 0 { None } else { Some(b"value".to_vec()) };
        assert_eq!(engine.get(format!("key{:03}", i).as_bytes(), 2).unwrap(), expected);
    }
    assert_eq!(engine.len().unwrap(), 50);
}

#[test]
fn test_delete_frees_external_records() {
    let engine = setup_engine();
    let big = vec![7u8; 5000];

    for i in 0..10 {
        engine.put(format!("big{}", i).as_bytes(), &big, 1, 0).unwrap();
    }
    assert_eq!(engine.memory_stats().external_count, 10);

    for i in 0..10 {
        engine.delete(format!("big{}", i).as_bytes(), 2).unwrap();
    }
    assert_eq!(engine.memory_stats().external_count, 0);
    assert_eq!(engine.memory_stats().external, 0);
}

// =============================================================================
// Concrete Scenario
// =============================================================================

#[test]
fn test_thousand_keys_in_string_order() {
    let engine = setup_engine();

    for i in 1..=1000 {
        let version = engine.next_version();
        engine
            .put(format!("KEY{}", i).as_bytes(), format!("VALUE{}", i).as_bytes(), version, 0)
            .unwrap();
    }

    let mut expected: Vec<String> = (1..=1000).map(|i| format!("KEY{}", i)).collect();
    expected.sort();
    let keys: Vec<String> = collect_keys(&engine)
        .into_iter()
        .map(|k| String::from_utf8(k).unwrap())
        .collect();
    assert_eq!(keys.len(), 1000);
    assert_eq!(&keys[..4], &["KEY1", "KEY10", "KEY100", "KEY1000"]);
    assert_eq!(keys[4], "KEY101");
    assert_eq!(keys, expected);

    for i in 1..=500 {
        let version = engine.next_version();
        assert_eq!(engine.delete(format!("KEY{}", i).as_bytes(), version).unwrap(), OpResult::Ok);
    }

    let mut remaining: Vec<String> = (501..=1000).map(|i| format!("KEY{}", i)).collect();
    remaining.sort();
    let keys: Vec<String> = collect_keys(&engine)
        .into_iter()
        .map(|k| String::from_utf8(k).unwrap())
        .collect();
    assert_eq!(keys, remaining);
}

// =============================================================================
// Configuration Tests
// =============================================================================

#[test]
fn test_open_rejects_invalid_config() {
    let too_large = Config::builder().max_block_size(70_000).build();
    assert!(matches!(Engine::open(too_large), Err(LatticeError::Config(_))));

    let too_small = Config::builder().max_block_size(64).build();
    assert!(matches!(Engine::open(too_small), Err(LatticeError::Config(_))));

    let unsorted = Config::builder().block_ratios(vec![0.5, 0.25, 1.0]).build();
    assert!(matches!(Engine::open(unsorted), Err(LatticeError::Config(_))));

    let no_stripes = Config::builder().lock_stripes(0).build();
    assert!(matches!(Engine::open(no_stripes), Err(LatticeError::Config(_))));

    let bad_merge = Config::builder().merge_ratio(0.0).build();
    assert!(matches!(Engine::open(bad_merge), Err(LatticeError::Config(_))));

    let index_too_large = Config::builder().max_index_block_size(200_000).build();
    assert!(matches!(Engine::open(index_too_large), Err(LatticeError::Config(_))));
}

#[test]
fn test_long_keys_with_largest_index_block() {
    let config = Config::builder().max_index_block_size(MAX_ADDRESSABLE_BLOCK).build();
    let engine = Engine::open(config).unwrap();
    let embedded = vec![b'e'; 30_000];
    let external = vec![b'x'; 40_000];

    engine.put(&embedded, b"embedded", 1, 0).unwrap();
    engine.put(&external, b"external", 1, 0).unwrap();

    assert_eq!(engine.get(&embedded, 1).unwrap(), Some(b"embedded".to_vec()));
    assert_eq!(engine.get(&external, 1).unwrap(), Some(b"external".to_vec()));
    assert_eq!(collect_keys(&engine), vec![embedded, external]);
}

// =============================================================================
// Compression Tests
// =============================================================================

#[test]
fn test_lz4_engine_round_trip() {
    let config = Config::builder().max_block_size(1024).codec(CodecType::Lz4).build();
    let engine = Engine::open(config).unwrap();

    for i in 0..300 {
        engine
            .put(format!("key{:04}", i).as_bytes(), b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", 1, 0)
            .unwrap();
    }
    for i in (0..300).step_by(3) {
        engine.delete(format!("key{:04}", i).as_bytes(), 2).unwrap();
    }

    for i in 0..300 {
        let expected = if i % 3 == 0 {
            None
        } else {
            Some(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec())
        };
        assert_eq!(engine.get(format!("key{:04}", i).as_bytes(), 2).unwrap(), expected);
    }
    assert_eq!(engine.len().unwrap(), 200);
}

/// LZ4 that counts the blocks it compresses
#[derive(Default)]
struct CountingCodec {
    compressed: AtomicUsize,
}

impl Codec for CountingCodec {
    fn compress(&self, input: &[u8]) -> latticekv::Result<Vec<u8>> {
        self.compressed.fetch_add(1, Ordering::Relaxed);
        Lz4Codec.compress(input)
    }

    fn decompress(&self, input: &[u8], expected_len: usize) -> latticekv::Result<Vec<u8>> {
        Lz4Codec.decompress(input, expected_len)
    }

    fn name(&self) -> &'static str {
        "counting-lz4"
    }
}

struct RejectingCodec;

impl Codec for RejectingCodec {
    fn compress(&self, _input: &[u8]) -> latticekv::Result<Vec<u8>> {
        Err(LatticeError::Compression("codec offline".into()))
    }

    fn decompress(&self, _input: &[u8], _expected_len: usize) -> latticekv::Result<Vec<u8>> {
        Err(LatticeError::Decompression("codec offline".into()))
    }

    fn name(&self) -> &'static str {
        "rejecting"
    }
}

#[test]
fn test_application_codec_round_trip() {
    let codec = Arc::new(CountingCodec::default());
    let config = Config::builder().max_block_size(1024).build();
    let engine = Engine::open_with_codec(config, codec.clone()).unwrap();

    for i in 0..200 {
        engine
            .put(format!("key{:04}", i).as_bytes(), b"bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb", 1, 0)
            .unwrap();
    }
    for i in (0..200).step_by(4) {
        engine.delete(format!("key{:04}", i).as_bytes(), 2).unwrap();
    }

    assert!(codec.compressed.load(Ordering::Relaxed) > 0);
    for i in 0..200 {
        let expected = (i % 4 != 0).then(|| b"bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".to_vec());
        assert_eq!(engine.get(format!("key{:04}", i).as_bytes(), 2).unwrap(), expected);
    }
    assert_eq!(engine.len().unwrap(), 150);
}

#[test]
fn test_codec_failure_surfaces_from_put() {
    let engine = Engine::open_with_codec(Config::default(), Arc::new(RejectingCodec)).unwrap();

    let result = engine.put(b"key", b"value", 1, 0);
    assert!(matches!(result, Err(LatticeError::Compression(_))));
    // The record stays readable uncompressed.
    assert_eq!(engine.get(b"key", 1).unwrap(), Some(b"value".to_vec()));
}
