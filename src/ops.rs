//! Read-Modify-Write Operations
//!
//! An [`Operation`] is handed the record visible at its key while the
//! owning index block is exclusively locked, and answers with the updates
//! to write. Compound field updates (counters and the like) are built on
//! top of this without a separate transaction layer.
//!
//! ```text
//! Engine::execute(op)
//!     │
//!     ├─ lock index block owning op.key()
//!     ├─ found = visible record (or floor record)
//!     ├─ updates = op.execute(found)      None => abort
//!     └─ write updates, release
//! ```

/// The record an operation runs against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Found {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: u64,
    pub expire: u64,
}

/// One write produced by an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Put { key: Vec<u8>, value: Vec<u8>, expire: u64 },
    Delete { key: Vec<u8> },
}

impl Update {
    pub fn key(&self) -> &[u8] {
        match self {
            Update::Put { key, .. } | Update::Delete { key } => key,
        }
    }
}

/// Atomic read-modify-write over one key
pub trait Operation {
    /// Key the operation is routed by
    fn key(&self) -> &[u8];

    /// Run against the greatest visible key not above `key()` instead of
    /// `key()` itself. The search stays inside the owning index block.
    fn floor(&self) -> bool {
        false
    }

    /// Compute the writes. `None` aborts without writing anything.
    fn execute(&mut self, found: Option<&Found>) -> Option<Vec<Update>>;
}

// =============================================================================
// Stock Operations
// =============================================================================

/// Adds to a counter stored as a little-endian `i64`. A missing key
/// counts from zero.
#[derive(Debug, Clone)]
pub struct Increment {
    key: Vec<u8>,
    delta: i64,
    result: Option<i64>,
}

impl Increment {
    pub fn new(key: impl Into<Vec<u8>>, delta: i64) -> Self {
        Self {
            key: key.into(),
            delta,
            result: None,
        }
    }

    /// Counter value after the last successful run
    pub fn result(&self) -> Option<i64> {
        self.result
    }
}

impl Operation for Increment {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&Found>) -> Option<Vec<Update>> {
        let current = match found {
            Some(found) => i64::from_le_bytes(found.value.as_slice().try_into().ok()?),
            None => 0,
        };
        let next = current.wrapping_add(self.delta);
        self.result = Some(next);
        Some(vec![Update::Put {
            key: self.key.clone(),
            value: next.to_le_bytes().to_vec(),
            expire: found.map_or(0, |f| f.expire),
        }])
    }
}

/// Adds to a counter stored as a little-endian `f32`
#[derive(Debug, Clone)]
pub struct IncrementFloat {
    key: Vec<u8>,
    delta: f32,
    result: Option<f32>,
}

impl IncrementFloat {
    pub fn new(key: impl Into<Vec<u8>>, delta: f32) -> Self {
        Self {
            key: key.into(),
            delta,
            result: None,
        }
    }

    pub fn result(&self) -> Option<f32> {
        self.result
    }
}

impl Operation for IncrementFloat {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&Found>) -> Option<Vec<Update>> {
        let current = match found {
            Some(found) => f32::from_le_bytes(found.value.as_slice().try_into().ok()?),
            None => 0.0,
        };
        let next = current + self.delta;
        self.result = Some(next);
        Some(vec![Update::Put {
            key: self.key.clone(),
            value: next.to_le_bytes().to_vec(),
            expire: found.map_or(0, |f| f.expire),
        }])
    }
}
