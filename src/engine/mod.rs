//! Engine Module
//!
//! The top directory and the public API of the store.
//!
//! ## Responsibilities
//! - Route every operation to the index block owning its key
//! - Split full index blocks and publish the new half
//! - Remove emptied index blocks and merge sparse neighbours
//! - Retry operations that raced a structural change
//!
//! ## Concurrency Model
//!
//! ```text
//!   directory: RwLock<BTreeMap<lower key, IndexBlock>>
//!        │ read: route(key) -> (block, seq)
//!        ▼
//!   IndexBlock stripe lock (validated against seq)
//!        │
//!        ▼
//!   DataBlocks (only touched under the index block lock)
//! ```
//!
//! Lock order is directory first, then index blocks. Nothing acquires the
//! directory lock while holding an index block lock, so a structural change
//! (which holds both) can never deadlock with a point operation.

pub mod scanner;
pub(crate) mod snapshot;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;
use parking_lot::RwLock;

use crate::block::data_block::Lookup;
use crate::block::index_block::{IndexBlock, IndexDelete, IndexInner, IndexWriteGuard};
use crate::block::{BlockContext, OpResult, ScanRecord};
use crate::compression::Codec;
use crate::config::Config;
use crate::error::{BlockError, BlockResult, LatticeError, Result};
use crate::memory::MemoryStats;
use crate::ops::{Found, Operation, Update};
use crate::record::{NewRecord, Op, RecordKey};

pub use scanner::Scanner;

/// A visible value with its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub value: Vec<u8>,
    pub version: u64,
    pub expire: u64,
}

/// Routed index block with the sequence it was observed at
type Routed = (Arc<IndexBlock>, u64);

/// The storage engine
pub struct Engine {
    ctx: Arc<BlockContext>,

    /// Index blocks keyed by their routing key. The first one is keyed by
    /// `RecordKey::min()` and is never removed.
    directory: RwLock<BTreeMap<RecordKey, Arc<IndexBlock>>>,

    /// Highest version seen or handed out
    sequence: AtomicU64,
}

impl Engine {
    /// Create an empty engine
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        Self::with_context(BlockContext::new(config))
    }

    /// Create an empty engine compressing data blocks with `codec`. The
    /// configured codec type is ignored.
    pub fn open_with_codec(config: Config, codec: Arc<dyn Codec>) -> Result<Self> {
        config.validate()?;
        Self::with_context(BlockContext::with_codec(config, Some(codec)))
    }

    fn with_context(ctx: BlockContext) -> Result<Self> {
        let ctx = Arc::new(ctx);

        let inner = IndexInner::new(&ctx)?;
        let first = Arc::new(IndexBlock::new(Arc::clone(&ctx), RecordKey::min(), inner, true));
        let mut directory = BTreeMap::new();
        directory.insert(RecordKey::min(), first);

        tracing::info!(
            max_block_size = ctx.config.max_block_size,
            max_index_block_size = ctx.config.max_index_block_size,
            codec = ctx.codec.as_deref().map_or("none", |codec| codec.name()),
            "opened engine"
        );
        Ok(Self {
            ctx,
            directory: RwLock::new(directory),
            sequence: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    // =========================================================================
    // Versions
    // =========================================================================

    /// Hand out a version above every version seen so far
    pub fn next_version(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Highest version written or handed out
    pub fn last_version(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    fn observe(&self, version: u64) {
        self.sequence.fetch_max(version, Ordering::AcqRel);
    }

    fn watermark(&self) -> u64 {
        self.ctx.snapshots.watermark()
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Index block whose range holds `target`
    fn route(&self, target: &RecordKey) -> BlockResult<Routed> {
        let directory = self.directory.read();
        let block = directory
            .range(..=target)
            .next_back()
            .map(|(_, block)| block)
            .or_else(|| directory.values().next())
            .ok_or_else(|| LatticeError::Corruption("top directory is empty".into()))?;
        Ok((Arc::clone(block), block.seq()))
    }

    /// Index block holding the records just below `target`
    fn route_before(&self, target: &RecordKey) -> Option<Routed> {
        let directory = self.directory.read();
        directory
            .range(..target)
            .next_back()
            .map(|(_, block)| (Arc::clone(block), block.seq()))
    }

    fn route_last(&self) -> Option<Routed> {
        let directory = self.directory.read();
        directory
            .values()
            .next_back()
            .map(|block| (Arc::clone(block), block.seq()))
    }

    fn next_index(&self, block: &IndexBlock) -> Option<Routed> {
        let directory = self.directory.read();
        directory
            .range((Bound::Excluded(block.lower()), Bound::Unbounded))
            .next()
            .map(|(_, next)| (Arc::clone(next), next.seq()))
    }

    /// Run `op` until it stops racing structural changes
    fn with_retry<T>(&self, mut op: impl FnMut() -> BlockResult<T>) -> Result<T> {
        let backoff = Backoff::new();
        let mut attempts = 0u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(BlockError::Fatal(err)) => return Err(err),
                Err(BlockError::Retry) => {
                    attempts += 1;
                    if let Some(max) = self.ctx.config.max_retries {
                        if attempts > max {
                            return Err(LatticeError::RetryLimitExceeded(max));
                        }
                    }
                    tracing::trace!(attempts, "retrying after structural change");
                    backoff.snooze();
                }
            }
        }
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    /// Value of `key` as of `version`
    pub fn get(&self, key: &[u8], version: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.get_entry(key, version)?.map(|entry| entry.value))
    }

    /// Value of `key` as of `version` with its version and expiration
    pub fn get_entry(&self, key: &[u8], version: u64) -> Result<Option<Entry>> {
        let target = RecordKey::new(key, version, Op::Delete);
        self.with_retry(|| {
            let (mut block, mut seq) = self.route(&target)?;
            let mut hop = false;
            loop {
                let lookup = {
                    let guard = block.read(Some(seq))?;
                    if hop {
                        // Only a run straddling the boundary continues here.
                        if !guard.first_key().is_some_and(|first| first.key == key) {
                            return Ok(None);
                        }
                    } else if !guard.covers(&target) {
                        return Err(BlockError::Retry);
                    }
                    guard.get(&self.ctx, key, version)?
                };
                match lookup {
                    Lookup::Value { value, version, expire } => {
                        return Ok(Some(Entry { value, version, expire }));
                    }
                    Lookup::Absent => return Ok(None),
                    Lookup::Exhausted => match self.next_index(&block) {
                        Some((next, next_seq)) => {
                            block = next;
                            seq = next_seq;
                            hop = true;
                        }
                        None => return Ok(None),
                    },
                }
            }
        })
    }

    /// Whether `key` has a visible value at the latest version
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get_entry(key, u64::MAX)?.is_some())
    }

    /// Write `value` under `key` at `version`. A record already stored at
    /// the same key and version is replaced.
    pub fn put(&self, key: &[u8], value: &[u8], version: u64, expire: u64) -> Result<()> {
        let record = NewRecord {
            key,
            value,
            version,
            op: Op::Put,
            expire,
        };
        self.write_record(&record)?;
        self.observe(version);
        Ok(())
    }

    fn write_record(&self, record: &NewRecord<'_>) -> Result<()> {
        let target = RecordKey::new(record.key, record.version, record.op);
        self.with_retry(|| {
            let mut allow_expand = false;
            loop {
                let (block, seq) = self.route(&target)?;
                let stored = {
                    let mut guard = block.write(Some(seq))?;
                    if !guard.covers(&target) {
                        return Err(BlockError::Retry);
                    }
                    guard.put(&self.ctx, record, self.watermark(), allow_expand)?
                };
                if stored {
                    return Ok(());
                }
                if !self.split_index_block(&block, seq)? {
                    allow_expand = true;
                }
            }
        })
    }

    /// Tombstone `key` at `version`
    pub fn delete(&self, key: &[u8], version: u64) -> Result<OpResult> {
        let target = RecordKey::new(key, version, Op::Delete);
        let (result, owner) = self.with_retry(|| {
            let mut allow_expand = false;
            loop {
                let (block, seq) = self.route(&target)?;
                let next = self.next_index(&block);
                let outcome = {
                    let mut guard = block.write(Some(seq))?;
                    if !guard.covers(&target) {
                        return Err(BlockError::Retry);
                    }
                    self.delete_in(&mut guard, next.as_ref(), key, version, allow_expand)?
                };
                match outcome {
                    IndexDelete::Done(result) => return Ok((result, block)),
                    IndexDelete::LookAhead => return Ok((OpResult::NotFound, block)),
                    IndexDelete::SplitRequired => {
                        if !self.split_index_block(&block, seq)? {
                            allow_expand = true;
                        }
                    }
                }
            }
        })?;

        self.observe(version);
        if result == OpResult::Ok {
            self.try_merge_index(&owner)?;
        }
        Ok(result)
    }

    /// Delete inside the locked index block covering the tombstone. When
    /// the key's versions run on into `next`, only the existence check
    /// looks there; the tombstone still lands in `guard`.
    fn delete_in(
        &self,
        guard: &mut IndexWriteGuard<'_>,
        next: Option<&Routed>,
        key: &[u8],
        version: u64,
        allow_expand: bool,
    ) -> BlockResult<IndexDelete> {
        let watermark = self.watermark();
        match guard.delete(&self.ctx, key, version, watermark, allow_expand)? {
            IndexDelete::LookAhead => match self.look_ahead(guard, next, key, version)? {
                Lookup::Value { .. } => Ok(guard.tombstone(&self.ctx, key, version, watermark, allow_expand)?),
                _ => Ok(IndexDelete::Done(OpResult::NotFound)),
            },
            outcome => Ok(outcome),
        }
    }

    /// Lookup of `key` in the index block after `held`, for a run that
    /// reaches the end of `held`. Never blocks on the neighbour.
    fn look_ahead(
        &self,
        held: &IndexWriteGuard<'_>,
        next: Option<&Routed>,
        key: &[u8],
        version: u64,
    ) -> BlockResult<Lookup> {
        let Some((next, next_seq)) = next else {
            return if held.upper().is_none() {
                Ok(Lookup::Absent)
            } else {
                Err(BlockError::Retry)
            };
        };
        if held.upper() != Some(next.lower()) {
            return Err(BlockError::Retry);
        }
        let next_guard = next.try_read_beside(held, Some(*next_seq))?;
        if !next_guard.first_key().is_some_and(|first| first.key == key) {
            return Ok(Lookup::Absent);
        }
        Ok(next_guard.get(&self.ctx, key, version)?)
    }

    /// Tombstone every visible key in `[start, end)` as of `version`.
    /// Returns the number of keys deleted.
    pub fn delete_range(&self, start: &[u8], end: Option<&[u8]>, version: u64) -> Result<u64> {
        if end.is_some_and(|end| end <= start) {
            return Ok(0);
        }
        let mut from = start.to_vec();
        let mut cursor = RecordKey::new(start, u64::MAX, Op::Delete);
        let mut skip: Option<Vec<u8>> = None;
        let mut total = 0;

        loop {
            // A tombstone for the routing key's own key sorts below this
            // block; the point path places it in the block before.
            let (block, _) = self.with_retry(|| self.route(&cursor))?;
            let lower = block.lower();
            if lower.key >= from
                && end.map_or(true, |end| lower.key.as_slice() < end)
                && skip.as_deref() != Some(lower.key.as_slice())
                && RecordKey::new(&lower.key, version, Op::Delete) < *lower
            {
                if self.delete(&lower.key, version)? == OpResult::Ok {
                    total += 1;
                }
                skip = Some(lower.key.clone());
            }

            let (step, upper, block) = self.with_retry(|| {
                let (block, seq) = self.route(&cursor)?;
                let (step, upper) = {
                    let mut guard = block.write(Some(seq))?;
                    if !guard.covers(&cursor) {
                        return Err(BlockError::Retry);
                    }
                    let step = guard.delete_range(&self.ctx, &from, end, version, skip.as_deref(), self.watermark())?;
                    (step, guard.upper().cloned())
                };
                Ok((step, upper, block))
            })?;
            total += step.deleted;
            self.try_merge_index(&block)?;

            if let Some(key) = step.point_delete {
                if self.delete(&key, version)? == OpResult::Ok {
                    total += 1;
                }
                cursor = RecordKey::new(&key, u64::MAX, Op::Delete);
                from = key.clone();
                skip = Some(key);
                continue;
            }
            if step.past_end {
                break;
            }
            match upper {
                Some(upper) if end.map_or(true, |end| upper.key.as_slice() < end) => {
                    from = upper.key.clone();
                    cursor = upper;
                    skip = step.last_decided;
                }
                _ => break,
            }
        }

        self.observe(version);
        tracing::debug!(deleted = total, "deleted range");
        Ok(total)
    }

    // =========================================================================
    // Read-Modify-Write
    // =========================================================================

    /// Run `op` against the record visible at its key as of `version` and
    /// write its updates at `version`. Returns false when the operation
    /// aborted.
    ///
    /// Updates owned by the same index block are written before its lock
    /// is released; others follow as ordinary writes.
    pub fn execute<O: Operation + ?Sized>(&self, op: &mut O, version: u64) -> Result<bool> {
        let key = op.key().to_vec();
        let target = RecordKey::new(&key, version, Op::Delete);

        let deferred = self.with_retry(|| {
            let ((block, seq), next) = {
                let routed = self.route(&target)?;
                let next = self.next_index(&routed.0);
                (routed, next)
            };
            let mut guard = block.write(Some(seq))?;
            if !guard.covers(&target) {
                return Err(BlockError::Retry);
            }

            let found = if op.floor() {
                guard.floor(&self.ctx, &key, version)?.map(found_from_scan)
            } else {
                match guard.get(&self.ctx, &key, version)? {
                    Lookup::Value { value, version, expire } => Some(Found {
                        key: key.clone(),
                        value,
                        version,
                        expire,
                    }),
                    Lookup::Absent => None,
                    Lookup::Exhausted => match self.look_ahead(&guard, next.as_ref(), &key, version)? {
                        Lookup::Value { value, version, expire } => Some(Found {
                            key: key.clone(),
                            value,
                            version,
                            expire,
                        }),
                        _ => None,
                    },
                }
            };

            let Some(updates) = op.execute(found.as_ref()) else {
                return Ok(None);
            };
            let watermark = self.watermark();
            let mut deferred = Vec::new();
            for update in updates {
                if !guard.covers(&RecordKey::new(update.key(), version, Op::Delete)) {
                    deferred.push(update);
                    continue;
                }
                let applied = match &update {
                    Update::Put { key, value, expire } => {
                        let record = NewRecord {
                            key,
                            value,
                            version,
                            op: Op::Put,
                            expire: *expire,
                        };
                        guard.put(&self.ctx, &record, watermark, true)?
                    }
                    Update::Delete { key } => {
                        self.delete_in(&mut guard, next.as_ref(), key, version, true)? != IndexDelete::SplitRequired
                    }
                };
                if !applied {
                    deferred.push(update);
                }
            }
            Ok(Some(deferred))
        })?;

        let Some(deferred) = deferred else {
            return Ok(false);
        };
        for update in deferred {
            match update {
                Update::Put { key, value, expire } => self.put(&key, &value, version, expire)?,
                Update::Delete { key } => {
                    self.delete(&key, version)?;
                }
            }
        }
        self.observe(version);
        Ok(true)
    }

    // =========================================================================
    // Scanners
    // =========================================================================

    /// Ordered cursor over `[start, stop)` at the latest version
    pub fn scanner(&self, start: Option<&[u8]>, stop: Option<&[u8]>, reverse: bool) -> Scanner<'_> {
        self.scanner_at(start, stop, reverse, self.last_version())
    }

    /// Ordered cursor over `[start, stop)` as of `version`. Records the
    /// cursor can see are kept until it is dropped.
    pub fn scanner_at(&self, start: Option<&[u8]>, stop: Option<&[u8]>, reverse: bool, version: u64) -> Scanner<'_> {
        Scanner::new(self, start, stop, reverse, version)
    }

    /// Forward cursor over every key starting with `prefix`
    pub fn prefix_scanner(&self, prefix: &[u8]) -> Scanner<'_> {
        let stop = prefix_successor(prefix);
        self.scanner(Some(prefix), stop.as_deref(), false)
    }

    // =========================================================================
    // Structural Maintenance
    // =========================================================================

    /// Split a full index block and publish its upper half. Returns false
    /// when the block has a single data block and cannot split.
    fn split_index_block(&self, block: &Arc<IndexBlock>, seq: u64) -> BlockResult<bool> {
        let mut directory = self.directory.write();
        let mut guard = block.write(Some(seq))?;
        if !guard.can_split() {
            return Ok(false);
        }
        let right_inner = guard.split(&self.ctx)?;
        let lower = right_inner
            .first_key()
            .ok_or_else(|| LatticeError::Corruption("index split produced an empty block".into()))?;
        let (left_blocks, right_blocks) = (guard.num_blocks(), right_inner.num_blocks());
        let (left_bytes, right_bytes) = (guard.data_size(), right_inner.data_size());
        let right = Arc::new(IndexBlock::new(Arc::clone(&self.ctx), lower.clone(), right_inner, false));
        guard.bump();
        directory.insert(lower, Arc::clone(&right));
        right.publish();

        tracing::debug!(
            block_id = block.id(),
            new_block_id = right.id(),
            left_blocks,
            right_blocks,
            left_bytes,
            right_bytes,
            index_blocks = directory.len(),
            "split index block"
        );
        Ok(true)
    }

    /// Remove `block` when empty, else merge it with a sparse neighbour
    fn try_merge_index(&self, block: &Arc<IndexBlock>) -> Result<()> {
        let sparse = match block.read(None) {
            Ok(guard) => guard.should_merge(&self.ctx),
            Err(BlockError::Retry) => return Ok(()),
            Err(BlockError::Fatal(err)) => return Err(err),
        };
        if !sparse {
            return Ok(());
        }
        match self.merge_index(block) {
            Ok(()) | Err(BlockError::Retry) => Ok(()),
            Err(BlockError::Fatal(err)) => Err(err),
        }
    }

    fn merge_index(&self, block: &Arc<IndexBlock>) -> BlockResult<()> {
        let mut directory = self.directory.write();
        if !directory.get(block.lower()).is_some_and(|b| Arc::ptr_eq(b, block)) {
            return Ok(());
        }
        let prev = directory
            .range(..block.lower())
            .next_back()
            .map(|(_, b)| Arc::clone(b));
        let next = directory
            .range((Bound::Excluded(block.lower()), Bound::Unbounded))
            .next()
            .map(|(_, b)| Arc::clone(b));

        if let Some(prev) = &prev {
            let (mut left, mut this) = IndexBlock::write_pair(prev, None, block, None)?;
            if this.is_empty() {
                let upper = this.take_upper();
                left.set_upper(upper);
                this.invalidate();
                left.bump();
                drop((left, this));
                directory.remove(block.lower());
                tracing::debug!(block_id = block.id(), "removed empty index block");
                return Ok(());
            }
        }

        if let Some(next) = &next {
            let (mut this, mut right) = IndexBlock::write_pair(block, None, next, None)?;
            if this.merge(&self.ctx, &mut right)? {
                right.invalidate();
                this.bump();
                drop((this, right));
                directory.remove(next.lower());
                tracing::debug!(block_id = block.id(), absorbed = next.id(), "merged index block with next");
                return Ok(());
            }
        }

        if let Some(prev) = &prev {
            let (mut left, mut this) = IndexBlock::write_pair(prev, None, block, None)?;
            if left.merge(&self.ctx, &mut this)? {
                this.invalidate();
                left.bump();
                drop((left, this));
                directory.remove(block.lower());
                tracing::debug!(block_id = prev.id(), absorbed = block.id(), "merged index block with previous");
            }
        }
        Ok(())
    }

    /// Compact every data block at the current watermark, then merge
    /// sparse index blocks
    pub fn compact(&self) -> Result<()> {
        let blocks: Vec<Arc<IndexBlock>> = self.directory.read().values().cloned().collect();
        for block in &blocks {
            let result = block.write(None).and_then(|mut guard| {
                guard.compact(&self.ctx, self.watermark())?;
                Ok(())
            });
            match result {
                Ok(()) | Err(BlockError::Retry) => {}
                Err(BlockError::Fatal(err)) => return Err(err),
            }
        }
        for block in &blocks {
            self.try_merge_index(block)?;
        }
        tracing::debug!(
            index_blocks = self.index_block_count(),
            data_blocks = self.data_block_count(),
            "compacted engine"
        );
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn memory_stats(&self) -> MemoryStats {
        self.ctx.arena.stats()
    }

    /// Scanners currently pinning a version
    pub fn active_snapshots(&self) -> usize {
        self.ctx.snapshots.count()
    }

    pub fn index_block_count(&self) -> usize {
        self.directory.read().len()
    }

    pub fn data_block_count(&self) -> usize {
        let blocks: Vec<Arc<IndexBlock>> = self.directory.read().values().cloned().collect();
        blocks
            .iter()
            .filter_map(|block| block.read(None).ok().map(|guard| guard.num_blocks()))
            .sum()
    }

    /// Smallest visible key
    pub fn first_key(&self) -> Result<Option<Vec<u8>>> {
        Ok(self
            .scanner(None, None, false)
            .next()
            .transpose()?
            .map(|(key, _)| key.to_vec()))
    }

    /// Number of visible keys. Walks the whole map.
    pub fn len(&self) -> Result<usize> {
        self.scanner(None, None, false)
            .try_fold(0, |count, item| item.map(|_| count + 1))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.first_key()?.is_none())
    }
}

fn found_from_scan(record: ScanRecord) -> Found {
    Found {
        key: record.key.to_vec(),
        value: record.value.to_vec(),
        version: record.version,
        expire: record.expire,
    }
}

/// Smallest key greater than every key starting with `prefix`
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut stop = prefix.to_vec();
    while let Some(last) = stop.pop() {
        if last < u8::MAX {
            stop.push(last + 1);
            return Some(stop);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"abc"), Some(b"abd".to_vec()));
        assert_eq!(prefix_successor(b"ab\xff"), Some(b"ac".to_vec()));
        assert_eq!(prefix_successor(b"\xff\xff"), None);
        assert_eq!(prefix_successor(b""), None);
    }

    #[test]
    fn test_versions_are_monotonic() {
        let engine = Engine::open(Config::default()).unwrap();
        assert_eq!(engine.last_version(), 0);
        engine.put(b"k", b"v", 41, 0).unwrap();
        assert_eq!(engine.last_version(), 41);
        assert_eq!(engine.next_version(), 42);
        engine.put(b"k", b"v", 7, 0).unwrap();
        assert_eq!(engine.last_version(), 42);
    }
}
