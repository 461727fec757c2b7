//! Tests for read-modify-write operations
//!
//! These tests verify:
//! - Stock counter operations through `Engine::execute`
//! - Aborted operations write nothing
//! - Floor lookups and multi-key updates

use latticekv::{Config, Engine, Found, Increment, IncrementFloat, Operation, Update};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_engine() -> Engine {
    Engine::open(Config::default()).unwrap()
}

fn read_i64(engine: &Engine, key: &[u8]) -> Option<i64> {
    engine
        .get(key, u64::MAX)
        .unwrap()
        .map(|v| i64::from_le_bytes(v.as_slice().try_into().unwrap()))
}

/// Records what it was handed and writes a marker next to it
struct FloorProbe {
    key: Vec<u8>,
    seen: Option<Found>,
}

impl Operation for FloorProbe {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn floor(&self) -> bool {
        true
    }

    fn execute(&mut self, found: Option<&Found>) -> Option<Vec<Update>> {
        self.seen = found.cloned();
        let found = found?;
        let mut marker = found.key.clone();
        marker.extend_from_slice(b"-seen");
        Some(vec![Update::Put {
            key: marker,
            value: found.value.clone(),
            expire: 0,
        }])
    }
}

/// Moves a value from one key to another
struct Rename {
    from: Vec<u8>,
    to: Vec<u8>,
}

impl Operation for Rename {
    fn key(&self) -> &[u8] {
        &self.from
    }

    fn execute(&mut self, found: Option<&Found>) -> Option<Vec<Update>> {
        let found = found?;
        Some(vec![
            Update::Delete { key: self.from.clone() },
            Update::Put {
                key: self.to.clone(),
                value: found.value.clone(),
                expire: found.expire,
            },
        ])
    }
}

// =============================================================================
// Counter Tests
// =============================================================================

#[test]
fn test_increment_creates_counter() {
    let engine = setup_engine();

    let mut op = Increment::new("counter", 5);
    assert!(engine.execute(&mut op, 1).unwrap());

    assert_eq!(op.result(), Some(5));
    assert_eq!(read_i64(&engine, b"counter"), Some(5));
}

#[test]
fn test_increment_accumulates() {
    let engine = setup_engine();

    for version in 1..=10 {
        let mut op = Increment::new("counter", 2);
        engine.execute(&mut op, version).unwrap();
    }
    let mut op = Increment::new("counter", -6);
    engine.execute(&mut op, 11).unwrap();

    assert_eq!(op.result(), Some(14));
    assert_eq!(read_i64(&engine, b"counter"), Some(14));
}

#[test]
fn test_increment_float() {
    let engine = setup_engine();

    engine.execute(&mut IncrementFloat::new("ratio", 1.5), 1).unwrap();
    let mut op = IncrementFloat::new("ratio", 0.25);
    engine.execute(&mut op, 2).unwrap();

    assert_eq!(op.result(), Some(1.75));
    let stored = engine.get(b"ratio", u64::MAX).unwrap().unwrap();
    assert_eq!(f32::from_le_bytes(stored.as_slice().try_into().unwrap()), 1.75);
}

#[test]
fn test_aborted_operation_writes_nothing() {
    let engine = setup_engine();
    engine.put(b"counter", b"not a number", 1, 0).unwrap();

    let mut op = Increment::new("counter", 1);
    assert!(!engine.execute(&mut op, 2).unwrap());

    assert_eq!(engine.get(b"counter", u64::MAX).unwrap(), Some(b"not a number".to_vec()));
}

#[test]
fn test_increment_after_delete_restarts() {
    let engine = setup_engine();

    engine.execute(&mut Increment::new("counter", 7), 1).unwrap();
    engine.delete(b"counter", 2).unwrap();
    engine.execute(&mut Increment::new("counter", 1), 3).unwrap();

    assert_eq!(read_i64(&engine, b"counter"), Some(1));
}

// =============================================================================
// Custom Operation Tests
// =============================================================================

#[test]
fn test_floor_operation() {
    let engine = setup_engine();
    engine.put(b"b", b"bee", 1, 0).unwrap();
    engine.put(b"d", b"dee", 1, 0).unwrap();

    let mut probe = FloorProbe {
        key: b"c".to_vec(),
        seen: None,
    };
    assert!(engine.execute(&mut probe, 2).unwrap());

    assert_eq!(probe.seen.unwrap().key, b"b".to_vec());
    assert_eq!(engine.get(b"b-seen", u64::MAX).unwrap(), Some(b"bee".to_vec()));
}

#[test]
fn test_floor_operation_below_first_key() {
    let engine = setup_engine();
    engine.put(b"m", b"em", 1, 0).unwrap();

    let mut probe = FloorProbe {
        key: b"a".to_vec(),
        seen: None,
    };
    assert!(!engine.execute(&mut probe, 2).unwrap());
    assert!(probe.seen.is_none());
}

#[test]
fn test_multi_key_update() {
    let engine = setup_engine();
    engine.put(b"old-name", b"payload", 1, 99).unwrap();

    let mut op = Rename {
        from: b"old-name".to_vec(),
        to: b"new-name".to_vec(),
    };
    assert!(engine.execute(&mut op, 2).unwrap());

    assert_eq!(engine.get(b"old-name", u64::MAX).unwrap(), None);
    let entry = engine.get_entry(b"new-name", u64::MAX).unwrap().unwrap();
    assert_eq!(entry.value, b"payload".to_vec());
    assert_eq!(entry.expire, 99);
}

#[test]
fn test_execute_missing_key_aborts() {
    let engine = setup_engine();

    let mut op = Rename {
        from: b"nothing".to_vec(),
        to: b"elsewhere".to_vec(),
    };
    assert!(!engine.execute(&mut op, 1).unwrap());
    assert!(engine.is_empty().unwrap());
}
