//! Index Block
//!
//! A mid-level page: one buffer of directory records, one per child data
//! block, sorted by the data blocks' first records.
//!
//! ## Responsibilities
//! - Route point operations to the owning data block, looking ahead to the
//!   next block when a key's versions continue there
//! - Split full data blocks and register new ones, or report that the
//!   index block itself must split
//! - Keep directory keys equal to the data blocks' first records
//! - Merge sparse neighbours, ranged deletion, scan batches
//!
//! ## Concurrency
//! An `IndexBlock` is shared through the top directory. Its buffer sits in
//! an `UnsafeCell` and is only reached through [`IndexReadGuard`] /
//! [`IndexWriteGuard`], which hold the block's stripe lock and have
//! validated its split/merge sequence.

use std::cell::UnsafeCell;
use std::cmp::Ordering as CmpOrdering;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::data_block::{self, DataBlock, Lookup, MergeSide, OpResult};
use super::lock::{StripeGuard, Versioned};
use super::{BlockContext, Pending, ScanRecord};
use crate::error::{BlockResult, LatticeError, Result};
use crate::memory::{self, MemoryKind};
use crate::record::{
    decode_directory, directory_len_at, directory_record_len, encode_directory_key,
    free_external_key, DirRef, NewRecord, Op, RecordKey, STATIC_PREFIX,
};

/// Outcome of a delete routed to one index block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexDelete {
    Done(OpResult),
    /// No room for another directory record; split this index block
    SplitRequired,
    /// The key's visible version may start the next index block
    LookAhead,
}

/// Outcome of a ranged delete over one index block
#[derive(Debug, Default)]
pub(crate) struct IndexRange {
    pub deleted: u64,
    pub last_decided: Option<Vec<u8>>,
    /// Key to delete on the point path before resuming
    pub point_delete: Option<Vec<u8>>,
    pub past_end: bool,
}

// =============================================================================
// Shared Handle
// =============================================================================

/// Index block as stored in the top directory
pub(crate) struct IndexBlock {
    id: u64,
    /// Routing key: the smallest record this block may hold. Fixed for the
    /// block's lifetime.
    lower: RecordKey,
    seq: AtomicU64,
    valid: AtomicBool,
    thread_safe: AtomicBool,
    ctx: Arc<BlockContext>,
    inner: UnsafeCell<IndexInner>,
}

// SAFETY: `inner` is only accessed through guards holding the block's
// stripe lock, or before the block is published.
unsafe impl Send for IndexBlock {}
unsafe impl Sync for IndexBlock {}

impl Versioned for IndexBlock {
    fn id(&self) -> u64 {
        self.id
    }

    fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn is_thread_safe(&self) -> bool {
        self.thread_safe.load(Ordering::Acquire)
    }
}

impl IndexBlock {
    /// Wrap a directory buffer. Unpublished blocks skip locking until
    /// [`IndexBlock::publish`].
    pub fn new(ctx: Arc<BlockContext>, lower: RecordKey, inner: IndexInner, published: bool) -> Self {
        Self {
            id: ctx.next_block_id(),
            lower,
            seq: AtomicU64::new(0),
            valid: AtomicBool::new(true),
            thread_safe: AtomicBool::new(!published),
            ctx,
            inner: UnsafeCell::new(inner),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn lower(&self) -> &RecordKey {
        &self.lower
    }

    pub fn seq(&self) -> u64 {
        Versioned::seq(self)
    }

    pub fn publish(&self) {
        self.thread_safe.store(false, Ordering::Release);
    }

    pub fn read(&self, expected_seq: Option<u64>) -> BlockResult<IndexReadGuard<'_>> {
        let lock = self.ctx.stripes.read(self, expected_seq)?;
        Ok(IndexReadGuard { block: self, _lock: lock })
    }

    /// Non-blocking shared access while `held`, a neighbour, is locked
    pub fn try_read_beside<'a>(
        &'a self,
        held: &IndexWriteGuard<'_>,
        expected_seq: Option<u64>,
    ) -> BlockResult<IndexReadGuard<'a>> {
        let lock = self.ctx.stripes.try_read_beside(self, expected_seq, held.block)?;
        Ok(IndexReadGuard { block: self, _lock: lock })
    }

    pub fn write(&self, expected_seq: Option<u64>) -> BlockResult<IndexWriteGuard<'_>> {
        let lock = self.ctx.stripes.write(self, expected_seq)?;
        Ok(IndexWriteGuard { block: self, _lock: lock })
    }

    /// Exclusive access to two blocks, locked in stripe order
    pub fn write_pair<'a>(
        left: &'a IndexBlock,
        left_seq: Option<u64>,
        right: &'a IndexBlock,
        right_seq: Option<u64>,
    ) -> BlockResult<(IndexWriteGuard<'a>, IndexWriteGuard<'a>)> {
        let (l, r) = left.ctx.stripes.write_pair(left, left_seq, right, right_seq)?;
        Ok((
            IndexWriteGuard { block: left, _lock: l },
            IndexWriteGuard { block: right, _lock: r },
        ))
    }
}

impl Drop for IndexBlock {
    fn drop(&mut self) {
        let ctx = Arc::clone(&self.ctx);
        if let Err(err) = self.inner.get_mut().free(&ctx, true) {
            tracing::warn!(block_id = self.id, error = %err, "failed to free index block");
        }
    }
}

/// Shared access to an index block's directory
pub(crate) struct IndexReadGuard<'a> {
    block: &'a IndexBlock,
    _lock: StripeGuard<'a>,
}

impl IndexReadGuard<'_> {
    pub fn covers(&self, target: &RecordKey) -> bool {
        covers(self.block, self, target)
    }
}

impl Deref for IndexReadGuard<'_> {
    type Target = IndexInner;

    fn deref(&self) -> &IndexInner {
        // SAFETY: the stripe lock is held (or the block is unpublished).
        unsafe { &*self.block.inner.get() }
    }
}

/// Exclusive access to an index block's directory
pub(crate) struct IndexWriteGuard<'a> {
    block: &'a IndexBlock,
    _lock: StripeGuard<'a>,
}

impl IndexWriteGuard<'_> {
    pub fn covers(&self, target: &RecordKey) -> bool {
        covers(self.block, self, target)
    }

    /// Record a structural change, failing concurrent optimistic readers
    pub fn bump(&self) {
        self.block.seq.fetch_add(1, Ordering::AcqRel);
    }

    /// Retire the block; every later lock attempt retries
    pub fn invalidate(&self) {
        self.block.valid.store(false, Ordering::Release);
        self.bump();
    }
}

impl Deref for IndexWriteGuard<'_> {
    type Target = IndexInner;

    fn deref(&self) -> &IndexInner {
        // SAFETY: the exclusive stripe lock is held.
        unsafe { &*self.block.inner.get() }
    }
}

impl DerefMut for IndexWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut IndexInner {
        // SAFETY: the exclusive stripe lock is held.
        unsafe { &mut *self.block.inner.get() }
    }
}

fn covers(block: &IndexBlock, inner: &IndexInner, target: &RecordKey) -> bool {
    block.lower <= *target && inner.upper.as_ref().map_or(true, |upper| target < upper)
}

// =============================================================================
// Directory Buffer
// =============================================================================

/// The directory records of one index block
pub(crate) struct IndexInner {
    buf: Option<NonNull<u8>>,
    block_size: usize,
    data_size: usize,
    num_blocks: usize,
    /// Routing key of the next index block, `None` for the last one
    upper: Option<RecordKey>,
}

impl IndexInner {
    pub fn new(ctx: &BlockContext) -> Result<Self> {
        Self::with_capacity(ctx, ctx.config.max_index_block_size)
    }

    fn with_capacity(ctx: &BlockContext, size: usize) -> Result<Self> {
        let ptr = ctx.arena.allocate(size, MemoryKind::Index)?;
        Ok(Self {
            buf: Some(ptr),
            block_size: size,
            data_size: 0,
            num_blocks: 0,
            upper: None,
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn is_empty(&self) -> bool {
        self.num_blocks == 0
    }

    pub fn upper(&self) -> Option<&RecordKey> {
        self.upper.as_ref()
    }

    pub fn set_upper(&mut self, upper: Option<RecordKey>) {
        self.upper = upper;
    }

    pub fn take_upper(&mut self) -> Option<RecordKey> {
        self.upper.take()
    }

    fn bytes(&self) -> &[u8] {
        match self.buf {
            // SAFETY: live buffer holding `data_size` bytes of records.
            Some(ptr) => unsafe { memory::bytes(ptr, self.data_size) },
            None => &[],
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self.buf {
            // SAFETY: live buffer of `block_size` bytes, exclusively ours.
            Some(ptr) => unsafe { memory::bytes_mut(ptr, self.block_size) },
            None => &mut [],
        }
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    fn dir(&self, off: usize) -> DirRef<'_> {
        decode_directory(self.bytes(), off)
    }

    fn offsets(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.num_blocks);
        let mut off = 0;
        while off < self.data_size {
            out.push(off);
            off += directory_len_at(self.bytes(), off);
        }
        out
    }

    fn next_offset(&self, off: usize) -> Option<usize> {
        let next = off + directory_len_at(self.bytes(), off);
        (next < self.data_size).then_some(next)
    }

    fn prev_offset(&self, off: usize) -> Option<usize> {
        let mut prev = None;
        let mut cur = 0;
        while cur < off {
            prev = Some(cur);
            cur += directory_len_at(self.bytes(), cur);
        }
        prev
    }

    fn last_offset(&self) -> Option<usize> {
        self.offsets().last().copied()
    }

    fn offset_of(&self, addr: u64) -> Option<usize> {
        self.offsets()
            .into_iter()
            .find(|&off| DataBlock::load(&self.bytes()[off..off + STATIC_PREFIX], off).is_ok_and(|b| b.addr() == addr))
    }

    pub fn first_key(&self) -> Option<RecordKey> {
        (self.num_blocks > 0).then(|| self.dir(0).record_key())
    }

    /// Rightmost directory record not greater than the target, `None` when
    /// the target sorts before the first one
    pub fn search(&self, key: &[u8], version: u64, op: Op) -> Option<usize> {
        let mut found = None;
        let mut off = 0;
        while off < self.data_size {
            let dir = self.dir(off);
            if dir.cmp_to(key, version, op) == CmpOrdering::Greater {
                break;
            }
            found = Some(off);
            off += dir.len;
        }
        found
    }

    /// Like `search`, falling back to the first block
    fn locate(&self, key: &[u8], version: u64, op: Op) -> Option<usize> {
        self.search(key, version, op)
            .or_else(|| (self.num_blocks > 0).then_some(0))
    }

    fn block_at(&self, off: usize) -> Result<DataBlock> {
        let bytes = self.bytes();
        if off + STATIC_PREFIX > bytes.len() {
            return Err(LatticeError::Corruption(format!(
                "directory offset {} past end {}",
                off,
                bytes.len()
            )));
        }
        DataBlock::load(&bytes[off..off + STATIC_PREFIX], off)
    }

    fn store_block(&mut self, ctx: &BlockContext, block: &mut DataBlock) -> Result<()> {
        // A failed seal leaves the raw block registered and readable.
        self.store_header(block);
        block.seal(ctx)?;
        self.store_header(block);
        Ok(())
    }

    fn store_header(&mut self, block: &DataBlock) {
        let off = block.index_offset;
        block.store(&mut self.bytes_mut()[off..off + STATIC_PREFIX]);
    }

    /// Whether the record after `block` may share its last key
    fn tail_continues(&self, ctx: &BlockContext, block: &DataBlock) -> Result<bool> {
        match self.next_offset(block.index_offset) {
            None => Ok(true),
            Some(next) => {
                let next_key = self.dir(next).key;
                Ok(block.last_key(ctx)?.is_some_and(|last| last == next_key))
            }
        }
    }

    // =========================================================================
    // Directory Maintenance
    // =========================================================================

    fn has_room(&self, ctx: &BlockContext, key_len: usize) -> bool {
        self.data_size + directory_record_len(key_len, ctx.config.max_index_block_size) <= self.block_size
    }

    /// Grow the buffer in place by `required` bytes, rounded up to the
    /// expansion step. The step never exceeds one index block.
    fn expand(&mut self, ctx: &BlockContext, required: usize) -> Result<()> {
        let Some(ptr) = self.buf else {
            return Err(LatticeError::Corruption("expand of a freed index block".into()));
        };
        let step = ctx.config.expansion_size.min(ctx.config.max_index_block_size);
        let grow = required.max(step);
        // SAFETY: `ptr` holds exactly `block_size` bytes of this arena.
        let grown = unsafe {
            ctx.arena
                .reallocate(ptr, self.block_size, self.block_size + grow, MemoryKind::Index)?
        };
        self.buf = Some(grown);
        self.block_size += grow;
        tracing::debug!(size = self.block_size, "expanded index block");
        Ok(())
    }

    fn reserve(&mut self, ctx: &BlockContext, bytes: usize) -> Result<()> {
        let needed = self.data_size + bytes;
        if needed > self.block_size {
            self.expand(ctx, needed - self.block_size)?;
        }
        Ok(())
    }

    /// Register a data block under `first`. Returns the offset of
    /// the new directory record, or `None` when there is no room and
    /// `allow_expand` is off.
    fn insert_block(
        &mut self,
        ctx: &BlockContext,
        block: &DataBlock,
        first: &RecordKey,
        allow_expand: bool,
    ) -> Result<Option<usize>> {
        let mut record = vec![0u8; STATIC_PREFIX];
        block.store(&mut record);
        let external = encode_directory_key(&mut record, first, ctx.config.max_index_block_size, &ctx.arena)?;

        if self.data_size + record.len() > self.block_size {
            if !allow_expand {
                return Ok(None);
            }
            self.reserve(ctx, record.len())?;
        }
        let pos = match self.search(&first.key, first.version, first.op) {
            Some(off) => off + directory_len_at(self.bytes(), off),
            None => 0,
        };
        let data_size = self.data_size;
        let buf = self.bytes_mut();
        buf.copy_within(pos..data_size, pos + record.len());
        buf[pos..pos + record.len()].copy_from_slice(&record);
        self.data_size += record.len();
        self.num_blocks += 1;
        if let Some(ext) = external {
            ext.commit();
        }
        Ok(Some(pos))
    }

    /// Allocate a block holding just `record` and register it
    fn insert_new_block(
        &mut self,
        ctx: &BlockContext,
        record: &NewRecord<'_>,
        watermark: u64,
        allow_expand: bool,
    ) -> Result<bool> {
        if !allow_expand && !self.has_room(ctx, record.key.len()) {
            return Ok(false);
        }
        let mut block = DataBlock::allocate(ctx, data_block::encoded_len(ctx, record))?;
        if !block.put(ctx, record, watermark, true)? {
            block.free(ctx)?;
            return Err(LatticeError::Corruption("record does not fit an empty block".into()));
        }
        let first = RecordKey::new(record.key, record.version, record.op);
        let Some(off) = self.insert_block(ctx, &block, &first, allow_expand)? else {
            block.free(ctx)?;
            return Ok(false);
        };
        block.index_offset = off;
        self.store_block(ctx, &mut block)?;
        tracing::trace!(blocks = self.num_blocks, "registered new data block");
        Ok(true)
    }

    /// Drop the directory record at `off` without touching the data block
    fn remove_directory(&mut self, ctx: &BlockContext, off: usize) {
        let dir = self.dir(off);
        let (len, external) = (dir.len, dir.external);
        let data_size = self.data_size;
        self.bytes_mut().copy_within(off + len..data_size, off);
        self.data_size -= len;
        self.num_blocks -= 1;
        if let Some(ptr) = external {
            // SAFETY: the directory record owning this key is gone.
            unsafe { free_external_key(&ctx.arena, ptr) };
        }
    }

    fn remove_block(&mut self, ctx: &BlockContext, off: usize) -> Result<()> {
        self.block_at(off)?.free(ctx)?;
        self.remove_directory(ctx, off);
        tracing::trace!(blocks = self.num_blocks, "removed empty data block");
        Ok(())
    }

    /// Rewrite the key of the directory record at `off`, growing the buffer
    /// when the new key is longer. Later offsets shift.
    fn update_first_key(&mut self, ctx: &BlockContext, off: usize, key: &RecordKey) -> Result<()> {
        let (old_len, old_external) = {
            let dir = self.dir(off);
            (dir.len, dir.external)
        };
        let mut encoded = Vec::new();
        let external = encode_directory_key(&mut encoded, key, ctx.config.max_index_block_size, &ctx.arena)?;
        let new_len = STATIC_PREFIX + encoded.len();
        if new_len > old_len {
            self.reserve(ctx, new_len - old_len)?;
        }

        let data_size = self.data_size;
        let buf = self.bytes_mut();
        buf.copy_within(off + old_len..data_size, off + new_len);
        buf[off + STATIC_PREFIX..off + new_len].copy_from_slice(&encoded);
        self.data_size = data_size + new_len - old_len;

        if let Some(ext) = external {
            ext.commit();
        }
        if let Some(ptr) = old_external {
            // SAFETY: the replaced key is no longer referenced.
            unsafe { free_external_key(&ctx.arena, ptr) };
        }
        Ok(())
    }

    /// Bring the directory key of a non-empty block in line with its first
    /// record
    fn sync_first_key(&mut self, ctx: &BlockContext, block: &DataBlock) -> Result<()> {
        if let Some(first) = block.first_key(ctx)? {
            let off = block.index_offset;
            let dir = self.dir(off);
            if dir.cmp_to(&first.key, first.version, first.op) != CmpOrdering::Equal {
                self.update_first_key(ctx, off, &first)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    pub fn get(&self, ctx: &BlockContext, key: &[u8], version: u64) -> Result<Lookup> {
        let Some(mut off) = self.locate(key, version, Op::Delete) else {
            return Ok(Lookup::Exhausted);
        };
        loop {
            match self.block_at(off)?.get(ctx, key, version)? {
                Lookup::Exhausted => match self.next_offset(off) {
                    Some(next) if self.dir(next).key == key => off = next,
                    Some(_) => return Ok(Lookup::Absent),
                    None => return Ok(Lookup::Exhausted),
                },
                found => return Ok(found),
            }
        }
    }

    /// Greatest visible record with a key not above `key`, within this block
    pub fn floor(&self, ctx: &BlockContext, key: &[u8], version: u64) -> Result<Option<ScanRecord>> {
        let Some(mut off) = self.locate(key, 0, Op::Put) else {
            return Ok(None);
        };
        let mut pending: Option<Pending> = None;
        loop {
            let records = self
                .block_at(off)?
                .collect(ctx, |r| r.cmp_to(key, 0, Op::Put) != CmpOrdering::Greater)?;
            for record in records.into_iter().rev() {
                if pending.as_ref().map_or(true, |p| p.key != record.key) {
                    if let Some(found) = pending.take().and_then(Pending::resolve) {
                        return Ok(Some(found));
                    }
                    pending = Some(Pending::new(record.key.clone()));
                }
                if let Some(p) = pending.as_mut() {
                    p.offer(record, version);
                }
            }
            match self.prev_offset(off) {
                Some(prev) => off = prev,
                None => break,
            }
        }
        Ok(pending.and_then(Pending::resolve))
    }

    /// Write `record`. Returns false when a new directory record is needed
    /// and does not fit; with `allow_expand` the buffer grows instead.
    pub fn put(
        &mut self,
        ctx: &BlockContext,
        record: &NewRecord<'_>,
        watermark: u64,
        allow_expand: bool,
    ) -> Result<bool> {
        if self.num_blocks == 0 {
            return self.insert_new_block(ctx, record, watermark, allow_expand);
        }
        loop {
            let off = self
                .locate(record.key, record.version, record.op)
                .ok_or_else(|| LatticeError::Corruption("index block lost its data blocks".into()))?;
            let mut block = self.block_at(off)?;
            let tail = self.tail_continues(ctx, &block)?;
            if block.put(ctx, record, watermark, tail)? {
                self.store_block(ctx, &mut block)?;
                self.sync_first_key(ctx, &block)?;
                return Ok(true);
            }

            if block.can_split() && !block.is_larger_than_max(ctx, record)? {
                let (_, _, key_len) = block.split_point(ctx)?;
                if !self.has_room(ctx, key_len) {
                    if !allow_expand {
                        self.store_block(ctx, &mut block)?;
                        return Ok(false);
                    }
                    self.reserve(ctx, directory_record_len(key_len, ctx.config.max_index_block_size))?;
                }
                self.split_block(ctx, &mut block)?;
                continue;
            }

            self.store_block(ctx, &mut block)?;
            return self.insert_new_block(ctx, record, watermark, allow_expand);
        }
    }

    /// Split `block` and register its right half; room must be reserved
    fn split_block(&mut self, ctx: &BlockContext, block: &mut DataBlock) -> Result<()> {
        let mut right = block.split(ctx)?;
        self.store_header(block);
        let first = right
            .first_key(ctx)?
            .ok_or_else(|| LatticeError::Corruption("split produced an empty block".into()))?;
        let Some(off) = self.insert_block(ctx, &right, &first, true)? else {
            right.free(ctx)?;
            return Err(LatticeError::Corruption("no room reserved for split block".into()));
        };
        right.index_offset = off;
        self.store_block(ctx, &mut right)?;
        self.store_block(ctx, block)?;
        tracing::debug!(
            left_records = block.num_records(),
            right_records = right.num_records(),
            blocks = self.num_blocks,
            "split data block"
        );
        Ok(())
    }

    pub fn delete(
        &mut self,
        ctx: &BlockContext,
        key: &[u8],
        version: u64,
        watermark: u64,
        allow_expand: bool,
    ) -> Result<IndexDelete> {
        let Some(mut off) = self.locate(key, version, Op::Delete) else {
            return Ok(IndexDelete::LookAhead);
        };
        loop {
            let mut block = self.block_at(off)?;
            // Find the block that decides visibility before writing anything.
            match block.get(ctx, key, version)? {
                Lookup::Value { .. } => {}
                Lookup::Absent => return Ok(IndexDelete::Done(OpResult::NotFound)),
                Lookup::Exhausted => match self.next_offset(off) {
                    Some(next) if self.dir(next).key == key => {
                        off = next;
                        continue;
                    }
                    Some(_) => return Ok(IndexDelete::Done(OpResult::NotFound)),
                    None => return Ok(IndexDelete::LookAhead),
                },
            }

            let tail = self.tail_continues(ctx, &block)?;
            let result = block.delete(ctx, key, version, watermark, tail)?;
            self.store_block(ctx, &mut block)?;
            match result {
                OpResult::Ok => {
                    self.after_delete(ctx, block)?;
                    return Ok(IndexDelete::Done(OpResult::Ok));
                }
                OpResult::NotFound => return Ok(IndexDelete::Done(OpResult::NotFound)),
                OpResult::SplitRequired => {
                    let (_, _, key_len) = block.split_point(ctx)?;
                    if !self.has_room(ctx, key_len) {
                        if !allow_expand {
                            return Ok(IndexDelete::SplitRequired);
                        }
                        self.reserve(ctx, directory_record_len(key_len, ctx.config.max_index_block_size))?;
                    }
                    self.split_block(ctx, &mut block)?;
                    off = self.locate(key, version, Op::Delete).unwrap_or(0);
                }
                OpResult::ParentSplitRequired => {
                    // The tombstone goes into a fresh block of its own.
                    let tombstone = NewRecord {
                        key,
                        value: &[],
                        version,
                        op: Op::Delete,
                        expire: 0,
                    };
                    if !self.insert_new_block(ctx, &tombstone, watermark, allow_expand)? {
                        return Ok(IndexDelete::SplitRequired);
                    }
                    return Ok(IndexDelete::Done(OpResult::Ok));
                }
            }
        }
    }

    /// Write a tombstone for a key whose visible version lives in the next
    /// index block. The tombstone sorts below that block's lower key, so
    /// it belongs here.
    pub fn tombstone(
        &mut self,
        ctx: &BlockContext,
        key: &[u8],
        version: u64,
        watermark: u64,
        allow_expand: bool,
    ) -> Result<IndexDelete> {
        let record = NewRecord {
            key,
            value: &[],
            version,
            op: Op::Delete,
            expire: 0,
        };
        if self.put(ctx, &record, watermark, allow_expand)? {
            Ok(IndexDelete::Done(OpResult::Ok))
        } else {
            Ok(IndexDelete::SplitRequired)
        }
    }

    fn after_delete(&mut self, ctx: &BlockContext, block: DataBlock) -> Result<()> {
        if block.is_empty() {
            return self.remove_block(ctx, block.index_offset);
        }
        self.sync_first_key(ctx, &block)?;
        if block.should_merge(ctx) {
            self.try_merge_adjacent_blocks(ctx, block.index_offset)?;
        }
        Ok(())
    }

    /// Merge the sparse block at `off` into its next sibling, else its
    /// previous one, when the combined payload fits one block
    pub fn try_merge_adjacent_blocks(&mut self, ctx: &BlockContext, off: usize) -> Result<bool> {
        let max = ctx.config.max_block_size;
        if let Some(next) = self.next_offset(off) {
            let mut left = self.block_at(off)?;
            let mut right = self.block_at(next)?;
            if left.data_size() + right.data_size() <= max && left.merge(ctx, &mut right, MergeSide::Right)? {
                self.store_block(ctx, &mut left)?;
                right.release(ctx);
                self.remove_directory(ctx, next);
                tracing::debug!(blocks = self.num_blocks, "merged data block with next");
                return Ok(true);
            }
        }
        if let Some(prev) = self.prev_offset(off) {
            let mut left = self.block_at(prev)?;
            let mut block = self.block_at(off)?;
            if left.data_size() + block.data_size() <= max && block.merge(ctx, &mut left, MergeSide::Left)? {
                left.release(ctx);
                self.remove_directory(ctx, prev);
                block.index_offset = prev;
                self.store_block(ctx, &mut block)?;
                self.sync_first_key(ctx, &block)?;
                tracing::debug!(blocks = self.num_blocks, "merged data block with previous");
                return Ok(true);
            }
        }
        Ok(false)
    }

    // =========================================================================
    // Ranged Delete
    // =========================================================================

    /// Tombstone visible keys in `[from, end)` held by this index block.
    ///
    /// First-key updates and empty-block removals are deferred until the
    /// walk is over so that offsets stay valid while it runs.
    pub fn delete_range(
        &mut self,
        ctx: &BlockContext,
        from: &[u8],
        end: Option<&[u8]>,
        version: u64,
        skip: Option<&[u8]>,
        watermark: u64,
    ) -> Result<IndexRange> {
        let mut result = IndexRange::default();
        let Some(mut off) = self.locate(from, u64::MAX, Op::Delete) else {
            return Ok(result);
        };
        let mut skip = skip.map(<[u8]>::to_vec);
        let mut updates = Vec::new();
        let mut removals = Vec::new();

        loop {
            let mut block = self.block_at(off)?;
            let tail = self.tail_continues(ctx, &block)?;
            let outcome = block.delete_range(ctx, from, end, version, skip.as_deref(), watermark, tail)?;
            self.store_block(ctx, &mut block)?;
            result.deleted += outcome.deleted;
            if outcome.no_room.is_some() {
                result.point_delete = outcome.no_room;
                break;
            }
            if block.is_empty() {
                removals.push(block.addr());
            } else if outcome.changed {
                updates.push(off);
            }
            skip = outcome.last_decided;
            if outcome.past_end {
                result.past_end = true;
                break;
            }
            match self.next_offset(off) {
                Some(next) => off = next,
                None => break,
            }
        }
        result.last_decided = skip;

        for off in updates.into_iter().rev() {
            let block = self.block_at(off)?;
            self.sync_first_key(ctx, &block)?;
        }
        for addr in removals {
            if let Some(off) = self.offset_of(addr) {
                self.remove_block(ctx, off)?;
            }
        }
        Ok(result)
    }

    // =========================================================================
    // Split / Merge
    // =========================================================================

    pub fn can_split(&self) -> bool {
        self.num_blocks >= 2
    }

    /// Move the upper half of the directory records, by count, into a new
    /// buffer
    pub fn split(&mut self, ctx: &BlockContext) -> Result<IndexInner> {
        let offsets = self.offsets();
        if offsets.len() < 2 {
            return Err(LatticeError::Corruption("split of an index block with one data block".into()));
        }
        let mid = offsets.len() / 2;
        let at = offsets[mid];
        let right_len = self.data_size - at;

        let mut right = IndexInner::with_capacity(ctx, right_len.max(ctx.config.max_index_block_size))?;
        right.bytes_mut()[..right_len].copy_from_slice(&self.bytes()[at..]);
        right.data_size = right_len;
        right.num_blocks = offsets.len() - mid;
        right.upper = self.upper.take();

        self.data_size = at;
        self.num_blocks = mid;
        self.upper = right.first_key();
        Ok(right)
    }

    pub fn should_merge(&self, ctx: &BlockContext) -> bool {
        (self.data_size as f64) < ctx.config.merge_ratio * ctx.config.max_index_block_size as f64
    }

    /// Append the directory records of the next index block. Both must be
    /// under the merge threshold. On success `right` is left empty and must
    /// be retired.
    pub fn merge(&mut self, ctx: &BlockContext, right: &mut IndexInner) -> Result<bool> {
        let combined = self.data_size + right.data_size;
        if !(self.should_merge(ctx) && right.should_merge(ctx)) || combined > ctx.config.max_index_block_size {
            return Ok(false);
        }
        self.reserve(ctx, right.data_size)?;
        let at = self.data_size;
        self.bytes_mut()[at..combined].copy_from_slice(right.bytes());
        self.data_size = combined;
        self.num_blocks += right.num_blocks;
        self.upper = right.upper.take();
        right.free(ctx, false)?;
        Ok(true)
    }

    /// Compact every child data block, dropping blocks left empty
    pub fn compact(&mut self, ctx: &BlockContext, watermark: u64) -> Result<()> {
        for off in self.offsets().into_iter().rev() {
            let mut block = self.block_at(off)?;
            let tail = self.tail_continues(ctx, &block)?;
            block.compact(ctx, watermark, tail)?;
            self.store_block(ctx, &mut block)?;
            if block.is_empty() {
                self.remove_block(ctx, off)?;
            } else {
                self.sync_first_key(ctx, &block)?;
            }
        }
        Ok(())
    }

    /// Release the buffer; `with_children` also frees every data block and
    /// directory key it references
    pub fn free(&mut self, ctx: &BlockContext, with_children: bool) -> Result<()> {
        let Some(ptr) = self.buf else {
            return Ok(());
        };
        if with_children {
            for off in self.offsets() {
                self.block_at(off)?.free(ctx)?;
                if let Some(key) = self.dir(off).external {
                    // SAFETY: the directory is going away with its keys.
                    unsafe { free_external_key(&ctx.arena, key) };
                }
            }
        }
        // SAFETY: `ptr` holds exactly `block_size` bytes and is forgotten here.
        unsafe { ctx.arena.free(ptr, self.block_size, MemoryKind::Index) };
        self.buf = None;
        self.data_size = 0;
        self.num_blocks = 0;
        Ok(())
    }

    // =========================================================================
    // Scan Batches
    // =========================================================================

    /// Records of the first data block holding anything after `after`
    /// (or at it, when `inclusive`), in ascending order
    pub fn collect_forward(
        &self,
        ctx: &BlockContext,
        after: &RecordKey,
        inclusive: bool,
    ) -> Result<Option<Vec<ScanRecord>>> {
        let Some(mut off) = self.locate(&after.key, after.version, after.op) else {
            return Ok(None);
        };
        loop {
            let batch = self.block_at(off)?.collect(ctx, |r| {
                match r.cmp_to(&after.key, after.version, after.op) {
                    CmpOrdering::Greater => true,
                    CmpOrdering::Equal => inclusive,
                    CmpOrdering::Less => false,
                }
            })?;
            if !batch.is_empty() {
                return Ok(Some(batch));
            }
            match self.next_offset(off) {
                Some(next) => off = next,
                None => return Ok(None),
            }
        }
    }

    /// Records of the last data block holding anything before `before`
    /// (everything when `None`), in descending order
    pub fn collect_backward(&self, ctx: &BlockContext, before: Option<&RecordKey>) -> Result<Option<Vec<ScanRecord>>> {
        let start = match before {
            Some(b) => self.locate(&b.key, b.version, b.op),
            None => self.last_offset(),
        };
        let Some(mut off) = start else {
            return Ok(None);
        };
        loop {
            let mut batch = self.block_at(off)?.collect(ctx, |r| {
                before.map_or(true, |b| r.cmp_to(&b.key, b.version, b.op) == CmpOrdering::Less)
            })?;
            if !batch.is_empty() {
                batch.reverse();
                return Ok(Some(batch));
            }
            match self.prev_offset(off) {
                Some(prev) => off = prev,
                None => return Ok(None),
            }
        }
    }
}
