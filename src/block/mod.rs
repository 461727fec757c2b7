//! Block Layer
//!
//! Two-level page structure beneath the top directory:
//!
//! ```text
//!   IndexBlock ── [dir rec]──►DataBlock [rec][rec][rec]...
//!              ── [dir rec]──►DataBlock [rec][rec]...
//!              ── [dir rec]──►DataBlock ...
//! ```
//!
//! ## Responsibilities
//! - `data_block`: sorted record runs, growth, compaction, split, merge
//! - `index_block`: directory of data blocks, routing, split, merge
//! - `lock`: stripe locks and split/merge sequence validation

pub(crate) mod data_block;
pub(crate) mod index_block;
pub(crate) mod lock;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::compression::Codec;
use crate::config::Config;
use crate::engine::snapshot::Snapshots;
use crate::error::{LatticeError, Result};
use crate::memory::Arena;
use crate::record::Op;

pub use data_block::OpResult;

/// State shared by every block of one engine
pub(crate) struct BlockContext {
    pub config: Config,
    pub arena: Arena,
    pub codec: Option<Arc<dyn Codec>>,
    pub stripes: lock::LockStripes,
    pub snapshots: Snapshots,
    next_block_id: AtomicU64,
}

impl BlockContext {
    pub fn new(config: Config) -> Self {
        let codec = config.codec.codec();
        Self::with_codec(config, codec)
    }

    /// Context compressing with `codec` regardless of `config.codec`
    pub fn with_codec(config: Config, codec: Option<Arc<dyn Codec>>) -> Self {
        Self {
            codec,
            stripes: lock::LockStripes::new(config.lock_stripes),
            arena: Arena::new(),
            snapshots: Snapshots::new(),
            next_block_id: AtomicU64::new(1),
            config,
        }
    }

    pub fn next_block_id(&self) -> u64 {
        self.next_block_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn codec(&self) -> Result<&dyn Codec> {
        self.codec
            .as_deref()
            .ok_or_else(|| LatticeError::Corruption("compressed block without a codec".into()))
    }
}

/// One record copied out of a block for iteration
#[derive(Debug, Clone)]
pub(crate) struct ScanRecord {
    pub key: Bytes,
    pub value: Bytes,
    pub version: u64,
    pub op: Op,
    pub expire: u64,
}

/// Resolves the visible record of one key while walking records in
/// descending order, where a key's versions arrive oldest first.
#[derive(Debug)]
pub(crate) struct Pending {
    pub key: Bytes,
    latest: Option<ScanRecord>,
}

impl Pending {
    pub fn new(key: Bytes) -> Self {
        Self { key, latest: None }
    }

    pub fn offer(&mut self, record: ScanRecord, read_version: u64) {
        if record.version <= read_version {
            self.latest = Some(record);
        }
    }

    /// The visible put, if the newest readable record is not a tombstone
    pub fn resolve(self) -> Option<ScanRecord> {
        self.latest.filter(|record| record.op == Op::Put)
    }
}
