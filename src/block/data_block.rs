//! Data Block
//!
//! A leaf page: one buffer holding a sorted, contiguous run of data
//! records. The block's header lives in the static prefix of its
//! directory record, so a `DataBlock` is a transient view loaded from the
//! owning index block and stored back after mutation.
//!
//! ## Responsibilities
//! - Versioned get/put/delete over sorted records
//! - Growth through the configured capacity ratios, in-place compaction
//!   of obsolete versions and tombstones
//! - Split at the record-count midpoint, merge with an adjacent block
//! - Transparent compression at rest
//!
//! ## Key runs
//! All records of one key are adjacent and ordered newest first. Every
//! mutation rewrites the run of the key it touches, dropping what no
//! reader can see any more:
//!
//! ```text
//!   watermark = 10
//!   run before:  (k,14,PUT) (k,9,PUT) (k,3,PUT)
//!   put (k,12):  (k,14,PUT) (k,12,PUT)          (k,9) and (k,3) shadowed
//! ```

use std::borrow::Cow;
use std::cmp::Ordering;
use std::ptr::NonNull;

use bytes::Bytes;

use super::{BlockContext, ScanRecord};
use crate::error::{LatticeError, Result};
use crate::memory::{self, MemoryKind};
use crate::record::{
    self, encode_record, free_external_record, read_u16, read_u32, read_u64, write_u16, write_u32,
    write_u64, ExternalBuf, NewRecord, Op, RecordIter, RecordKey, RecordRef, INT_SIZE,
    PREFIX_ADDRESS, PREFIX_BLOCK_SIZE, PREFIX_COMPRESSED, PREFIX_DATA_SIZE, PREFIX_DELETED,
    PREFIX_RECORDS, PREFIX_RESERVED, STATIC_PREFIX,
};

/// Result of a delete at block level and of the public delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    /// A visible value was deleted
    Ok,
    /// Nothing visible to delete
    NotFound,
    /// The block must split before the tombstone fits
    SplitRequired,
    /// The block cannot split; the owner must place the tombstone elsewhere
    ParentSplitRequired,
}

/// Result of a point lookup inside one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Lookup {
    Value { value: Vec<u8>, version: u64, expire: u64 },
    /// Key absent or hidden by a tombstone
    Absent,
    /// No record at or after the target here; the next block decides
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeSide {
    /// The other block holds smaller keys
    Left,
    /// The other block holds larger keys
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rewrite {
    Applied,
    /// Shadowed by a newer record every reader already sees
    Obsolete,
    NoRoom,
}

/// Outcome of a ranged delete over one block
#[derive(Debug, Default)]
pub(crate) struct BlockRange {
    pub deleted: u64,
    pub changed: bool,
    /// Key of the last run when its visibility was settled in this block
    pub last_decided: Option<Vec<u8>>,
    /// First key whose tombstone did not fit; nothing was changed
    pub no_room: Option<Vec<u8>>,
    /// A key at or past the range end was seen
    pub past_end: bool,
}

/// One record of a key run, detached from the block buffer
struct RunEntry {
    version: u64,
    op: Op,
    encoded: Vec<u8>,
    external: Option<NonNull<u8>>,
}

impl RunEntry {
    fn from_ref(buf: &[u8], record: &RecordRef<'_>) -> Self {
        Self {
            version: record.version,
            op: record.op,
            encoded: buf[record.offset..record.offset + record.len].to_vec(),
            external: record.external,
        }
    }
}

/// Which records of a run, newest first, anyone can still read.
///
/// Everything older than the first record at or below the watermark is
/// shadowed. That record itself goes too when it is a tombstone and no
/// older record of the key can follow the run.
fn retained(versions: &[(u64, Op)], watermark: u64, may_continue: bool) -> Vec<bool> {
    let mut keep = vec![true; versions.len()];
    let mut anchor = None;
    for (i, &(version, _)) in versions.iter().enumerate() {
        if anchor.is_some() {
            keep[i] = false;
        } else if version <= watermark {
            anchor = Some(i);
        }
    }
    if let Some(i) = anchor {
        if versions[i].1 == Op::Delete && !may_continue {
            keep[i] = false;
        }
    }
    keep
}

/// Records that are tombstones or older versions
fn garbage(versions: impl Iterator<Item = (usize, Op)>) -> usize {
    versions.filter(|&(pos, op)| pos > 0 || op == Op::Delete).count()
}

fn garbage_in(buf: &[u8]) -> usize {
    let mut count = 0;
    let mut previous: Option<&[u8]> = None;
    for record in RecordIter::new(buf) {
        if previous == Some(record.key) || record.op == Op::Delete {
            count += 1;
        }
        previous = Some(record.key);
    }
    count
}

/// Transient view of one data block
#[derive(Debug)]
pub(crate) struct DataBlock {
    ptr: NonNull<u8>,
    block_size: usize,
    data_size: usize,
    num_records: usize,
    compressed: bool,
    num_deleted: usize,
    /// Offset of the owning directory record inside its index block
    pub index_offset: usize,
}

impl DataBlock {
    /// Allocate an empty block able to hold `needed` bytes
    pub fn allocate(ctx: &BlockContext, needed: usize) -> Result<Self> {
        let size = ctx.config.block_capacity_for(needed);
        let ptr = ctx.arena.allocate(size, MemoryKind::Data)?;
        Ok(Self {
            ptr,
            block_size: size,
            data_size: 0,
            num_records: 0,
            compressed: false,
            num_deleted: 0,
            index_offset: 0,
        })
    }

    /// Load the header from a directory record's static prefix
    pub fn load(prefix: &[u8], index_offset: usize) -> Result<Self> {
        let ptr = memory::addr_to_ptr(read_u64(prefix, PREFIX_ADDRESS)).ok_or_else(|| {
            LatticeError::Corruption(format!(
                "directory record at offset {} has no data block",
                index_offset
            ))
        })?;
        Ok(Self {
            ptr,
            block_size: read_u16(prefix, PREFIX_BLOCK_SIZE) as usize,
            data_size: read_u16(prefix, PREFIX_DATA_SIZE) as usize,
            num_records: read_u16(prefix, PREFIX_RECORDS) as usize,
            compressed: prefix[PREFIX_COMPRESSED] != 0,
            num_deleted: read_u16(prefix, PREFIX_DELETED) as usize,
            index_offset,
        })
    }

    /// Write the header into a directory record's static prefix
    pub fn store(&self, prefix: &mut [u8]) {
        debug_assert!(prefix.len() >= STATIC_PREFIX);
        write_u64(prefix, PREFIX_ADDRESS, memory::ptr_to_addr(self.ptr));
        write_u16(prefix, PREFIX_BLOCK_SIZE, self.block_size as u16);
        write_u16(prefix, PREFIX_DATA_SIZE, self.data_size as u16);
        write_u16(prefix, PREFIX_RECORDS, self.num_records as u16);
        prefix[PREFIX_COMPRESSED] = self.compressed as u8;
        for at in PREFIX_RESERVED {
            prefix[at] = 0;
        }
        write_u16(prefix, PREFIX_DELETED, self.num_deleted as u16);
    }

    pub fn addr(&self) -> u64 {
        memory::ptr_to_addr(self.ptr)
    }

    pub fn num_records(&self) -> usize {
        self.num_records
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn is_empty(&self) -> bool {
        self.num_records == 0
    }

    // =========================================================================
    // Raw Access
    // =========================================================================
    //
    // The buffer is only touched while the owning index block's stripe lock
    // is held, which is what makes these views sound.

    fn raw(&self) -> &[u8] {
        debug_assert!(!self.compressed);
        // SAFETY: live block buffer of at least `data_size` bytes, guarded
        // by the owning index block's lock.
        unsafe { memory::bytes(self.ptr, self.data_size) }
    }

    fn raw_mut(&mut self) -> &mut [u8] {
        debug_assert!(!self.compressed);
        // SAFETY: as above, and `&mut self` implies the exclusive lock.
        unsafe { memory::bytes_mut(self.ptr, self.block_size) }
    }

    /// The uncompressed payload. Compressed blocks are inflated into a copy.
    pub fn records(&self, ctx: &BlockContext) -> Result<Cow<'_, [u8]>> {
        if !self.compressed {
            return Ok(Cow::Borrowed(self.raw()));
        }
        // SAFETY: see `raw`; a compressed buffer is `[len:u32][payload]`.
        let buf = unsafe { memory::bytes(self.ptr, self.block_size) };
        let packed_len = read_u32(buf, 0) as usize;
        let payload = ctx
            .codec()?
            .decompress(&buf[INT_SIZE..INT_SIZE + packed_len], self.data_size)?;
        Ok(Cow::Owned(payload))
    }

    // =========================================================================
    // Compression
    // =========================================================================

    /// Inflate a compressed block in place so it can be mutated
    pub fn unseal(&mut self, ctx: &BlockContext) -> Result<()> {
        if !self.compressed {
            return Ok(());
        }
        let payload = self.records(ctx)?.into_owned();
        let capacity = ctx.config.block_capacity_for(self.data_size);
        let ptr = ctx.arena.allocate(capacity, MemoryKind::Data)?;
        // SAFETY: fresh allocation of `capacity >= payload.len()` bytes.
        let buf = unsafe { memory::bytes_mut(ptr, capacity) };
        buf[..payload.len()].copy_from_slice(&payload);
        // SAFETY: the compressed buffer is replaced and never used again.
        unsafe { ctx.arena.free(self.ptr, self.block_size, MemoryKind::Data) };
        self.ptr = ptr;
        self.block_size = capacity;
        self.compressed = false;
        Ok(())
    }

    /// Compress the block at rest when the codec actually saves space
    pub fn seal(&mut self, ctx: &BlockContext) -> Result<()> {
        let codec = match ctx.codec.as_deref() {
            Some(codec) if !self.compressed && self.data_size > 0 => codec,
            _ => return Ok(()),
        };
        let packed = codec.compress(self.raw())?;
        let packed_len = u32::try_from(packed.len()).map_err(|_| {
            LatticeError::Compression(format!("{} produced {} bytes", codec.name(), packed.len()))
        })?;
        let size = packed.len() + INT_SIZE;
        if size >= self.data_size {
            return Ok(());
        }
        let ptr = ctx.arena.allocate(size, MemoryKind::Data)?;
        // SAFETY: fresh allocation of `size` bytes.
        let buf = unsafe { memory::bytes_mut(ptr, size) };
        write_u32(buf, 0, packed_len);
        buf[INT_SIZE..].copy_from_slice(&packed);
        // SAFETY: the raw buffer is replaced and never used again.
        unsafe { ctx.arena.free(self.ptr, self.block_size, MemoryKind::Data) };
        self.ptr = ptr;
        self.block_size = size;
        self.compressed = true;
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn first_key(&self, ctx: &BlockContext) -> Result<Option<RecordKey>> {
        let payload = self.records(ctx)?;
        Ok(RecordIter::new(&payload).next().map(|r| r.record_key()))
    }

    pub fn last_key(&self, ctx: &BlockContext) -> Result<Option<Vec<u8>>> {
        let payload = self.records(ctx)?;
        Ok(RecordIter::new(&payload).last().map(|r| r.key.to_vec()))
    }

    /// Whether every record sorts before the target
    pub fn is_larger_than_max(&self, ctx: &BlockContext, record: &NewRecord<'_>) -> Result<bool> {
        let payload = self.records(ctx)?;
        Ok(match RecordIter::new(&payload).last() {
            Some(last) => last.cmp_to(record.key, record.version, record.op) == Ordering::Less,
            None => true,
        })
    }

    pub fn can_split(&self) -> bool {
        self.num_records >= 2
    }

    pub fn should_merge(&self, ctx: &BlockContext) -> bool {
        (self.data_size as f64) < ctx.config.merge_ratio * ctx.config.max_block_size as f64
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    pub fn get(&self, ctx: &BlockContext, key: &[u8], version: u64) -> Result<Lookup> {
        let payload = self.records(ctx)?;
        for record in RecordIter::new(&payload) {
            if record.cmp_to(key, version, Op::Delete) == Ordering::Less {
                continue;
            }
            if record.key != key || record.op == Op::Delete {
                return Ok(Lookup::Absent);
            }
            return Ok(Lookup::Value {
                value: record.value.to_vec(),
                version: record.version,
                expire: record.expire,
            });
        }
        Ok(Lookup::Exhausted)
    }

    /// Insert `record`, replacing any record of the same key and version.
    ///
    /// Returns false when the block cannot hold it even after growing and
    /// compacting. `tail_continues` says whether the record after this
    /// block may share its last key.
    pub fn put(
        &mut self,
        ctx: &BlockContext,
        record: &NewRecord<'_>,
        watermark: u64,
        tail_continues: bool,
    ) -> Result<bool> {
        let outcome = self.rewrite_run(ctx, record, watermark, tail_continues, false)?;
        Ok(outcome != Rewrite::NoRoom)
    }

    pub fn delete(
        &mut self,
        ctx: &BlockContext,
        key: &[u8],
        version: u64,
        watermark: u64,
        tail_continues: bool,
    ) -> Result<OpResult> {
        let visible = {
            let payload = self.records(ctx)?;
            RecordIter::new(&payload)
                .find(|r| r.cmp_to(key, version, Op::Delete) != Ordering::Less)
                .filter(|r| r.key == key)
                .map(|r| r.op)
        };
        if visible != Some(Op::Put) {
            return Ok(OpResult::NotFound);
        }

        let tombstone = NewRecord {
            key,
            value: &[],
            version,
            op: Op::Delete,
            expire: 0,
        };
        match self.rewrite_run(ctx, &tombstone, watermark, tail_continues, false)? {
            Rewrite::NoRoom if self.can_split() => Ok(OpResult::SplitRequired),
            Rewrite::NoRoom => Ok(OpResult::ParentSplitRequired),
            Rewrite::Applied | Rewrite::Obsolete => Ok(OpResult::Ok),
        }
    }

    /// Byte range and records of the run for `key`. An absent key yields
    /// an empty range at its insertion point.
    fn key_run(&self, key: &[u8]) -> (usize, usize, Vec<RunEntry>) {
        let buf = self.raw();
        let (mut start, mut end) = (self.data_size, self.data_size);
        let mut entries = Vec::new();
        for record in RecordIter::new(buf) {
            match record.key.cmp(key) {
                Ordering::Less => continue,
                Ordering::Equal => {
                    if entries.is_empty() {
                        start = record.offset;
                    }
                    end = record.offset + record.len;
                    entries.push(RunEntry::from_ref(buf, &record));
                }
                Ordering::Greater => {
                    if entries.is_empty() {
                        start = record.offset;
                        end = record.offset;
                    }
                    break;
                }
            }
        }
        (start, end, entries)
    }

    fn rewrite_run(
        &mut self,
        ctx: &BlockContext,
        record: &NewRecord<'_>,
        watermark: u64,
        tail_continues: bool,
        compacted: bool,
    ) -> Result<Rewrite> {
        self.unseal(ctx)?;
        let max = ctx.config.max_block_size;
        let (start, end, old) = self.key_run(record.key);
        let may_continue = tail_continues && end == self.data_size;

        let mut fresh = Vec::new();
        let guard = encode_record(&mut fresh, record, max, &ctx.arena)?;

        // New record slots in newest first; an equal version is replaced.
        let mut slots: Vec<Option<&RunEntry>> = Vec::with_capacity(old.len() + 1);
        let mut replaced = Vec::new();
        let mut placed = false;
        for entry in &old {
            if entry.version == record.version {
                replaced.push(entry);
                if !placed {
                    slots.push(None);
                    placed = true;
                }
                continue;
            }
            if !placed && record.version > entry.version {
                slots.push(None);
                placed = true;
            }
            slots.push(Some(entry));
        }
        if !placed {
            slots.push(None);
        }

        let versions: Vec<(u64, Op)> = slots
            .iter()
            .map(|slot| match slot {
                Some(entry) => (entry.version, entry.op),
                None => (record.version, record.op),
            })
            .collect();
        let keep = retained(&versions, watermark, may_continue);
        let new_kept = slots.iter().zip(&keep).any(|(slot, &k)| slot.is_none() && k);
        if !new_kept && record.op == Op::Put {
            return Ok(Rewrite::Obsolete);
        }

        let mut run = Vec::with_capacity(fresh.len() + end - start);
        let mut dropped: Vec<NonNull<u8>> = replaced.iter().filter_map(|e| e.external).collect();
        let mut kept_ops = Vec::new();
        for (slot, &k) in slots.iter().zip(&keep) {
            match (slot, k) {
                (Some(entry), true) => {
                    run.extend_from_slice(&entry.encoded);
                    kept_ops.push(entry.op);
                }
                (Some(entry), false) => dropped.extend(entry.external),
                (None, true) => {
                    run.extend_from_slice(&fresh);
                    kept_ops.push(record.op);
                }
                (None, false) => {}
            }
        }

        let new_size = self.data_size - (end - start) + run.len();
        if !self.ensure_capacity(ctx, new_size)? {
            if !compacted && self.num_deleted > 0 {
                self.compact(ctx, watermark, tail_continues)?;
                let fill = self.data_size as f64 / max as f64;
                if fill < ctx.config.split_ratio {
                    return self.rewrite_run(ctx, record, watermark, tail_continues, true);
                }
            }
            return Ok(Rewrite::NoRoom);
        }

        let data_size = self.data_size;
        let buf = self.raw_mut();
        buf.copy_within(end..data_size, start + run.len());
        buf[start..start + run.len()].copy_from_slice(&run);

        let old_garbage = garbage(old.iter().enumerate().map(|(i, e)| (i, e.op)));
        let new_garbage = garbage(kept_ops.iter().copied().enumerate());
        self.data_size = new_size;
        self.num_records = self.num_records - old.len() + kept_ops.len();
        self.num_deleted = (self.num_deleted + new_garbage).saturating_sub(old_garbage);

        if new_kept {
            if let Some(ext) = guard {
                ext.commit();
            }
        }
        for ptr in dropped {
            // SAFETY: the record owning this buffer was just removed.
            unsafe { free_external_record(&ctx.arena, ptr) };
        }
        Ok(Rewrite::Applied)
    }

    /// Make room for `needed` bytes, growing by at least the expansion step
    fn ensure_capacity(&mut self, ctx: &BlockContext, needed: usize) -> Result<bool> {
        if needed <= self.block_size {
            return Ok(true);
        }
        let max = ctx.config.max_block_size;
        if needed > max || self.block_size >= max {
            return Ok(false);
        }
        let grow = (needed - self.block_size).max(ctx.config.expansion_size);
        let new_size = (self.block_size + grow).min(max);
        // SAFETY: `ptr` holds exactly `block_size` bytes of this arena.
        self.ptr = unsafe {
            ctx.arena
                .reallocate(self.ptr, self.block_size, new_size, MemoryKind::Data)?
        };
        self.block_size = new_size;
        Ok(true)
    }

    /// Drop every record no reader can see
    pub fn compact(&mut self, ctx: &BlockContext, watermark: u64, tail_continues: bool) -> Result<()> {
        self.unseal(ctx)?;
        let (out, records, dropped) = {
            let buf = self.raw();
            let all: Vec<RecordRef<'_>> = RecordIter::new(buf).collect();
            let mut out = Vec::with_capacity(buf.len());
            let mut records = 0;
            let mut dropped = Vec::new();
            let mut start = 0;
            while start < all.len() {
                let mut end = start + 1;
                while end < all.len() && all[end].key == all[start].key {
                    end += 1;
                }
                let run = &all[start..end];
                let versions: Vec<(u64, Op)> = run.iter().map(|r| (r.version, r.op)).collect();
                let keep = retained(&versions, watermark, tail_continues && end == all.len());
                for (record, k) in run.iter().zip(keep) {
                    if k {
                        out.extend_from_slice(&buf[record.offset..record.offset + record.len]);
                        records += 1;
                    } else {
                        dropped.extend(record.external);
                    }
                }
                start = end;
            }
            (out, records, dropped)
        };

        let before = self.num_records;
        self.raw_mut()[..out.len()].copy_from_slice(&out);
        self.data_size = out.len();
        self.num_records = records;
        self.num_deleted = garbage_in(self.raw());
        for ptr in dropped {
            // SAFETY: the record owning this buffer was compacted away.
            unsafe { free_external_record(&ctx.arena, ptr) };
        }
        tracing::trace!(before, after = records, "compacted data block");
        Ok(())
    }

    // =========================================================================
    // Split / Merge
    // =========================================================================

    /// Split position: the key boundary closest to the record-count
    /// midpoint, or the midpoint itself inside a single-key block.
    /// Returns (byte offset, record index, key length).
    pub fn split_point(&self, ctx: &BlockContext) -> Result<(usize, usize, usize)> {
        let payload = self.records(ctx)?;
        let all: Vec<RecordRef<'_>> = RecordIter::new(&payload).collect();
        if all.len() < 2 {
            return Err(LatticeError::Corruption("split of a block with fewer than two records".into()));
        }
        let mid = all.len() / 2;
        let index = (1..all.len())
            .filter(|&i| all[i].key != all[i - 1].key)
            .min_by_key(|&i| i.abs_diff(mid))
            .unwrap_or(mid);
        Ok((all[index].offset, index, all[index].key.len()))
    }

    /// Move the upper half of the records into a new block
    pub fn split(&mut self, ctx: &BlockContext) -> Result<DataBlock> {
        self.unseal(ctx)?;
        let (offset, index, _) = self.split_point(ctx)?;
        let right_len = self.data_size - offset;

        let mut right = DataBlock::allocate(ctx, right_len)?;
        right.raw_mut()[..right_len].copy_from_slice(&self.raw()[offset..]);
        right.data_size = right_len;
        right.num_records = self.num_records - index;
        right.num_deleted = garbage_in(right.raw());

        self.data_size = offset;
        self.num_records = index;
        self.num_deleted = garbage_in(self.raw());

        tracing::trace!(
            left = self.num_records,
            right = right.num_records,
            bytes = right_len,
            "split data block"
        );
        Ok(right)
    }

    /// Absorb an adjacent block when the combined payload fits the maximum
    /// block size. On success `other` must be released by the caller.
    pub fn merge(&mut self, ctx: &BlockContext, other: &mut DataBlock, side: MergeSide) -> Result<bool> {
        let combined = self.data_size + other.data_size;
        if combined > ctx.config.max_block_size {
            return Ok(false);
        }
        self.unseal(ctx)?;
        other.unseal(ctx)?;
        if combined > self.block_size {
            let target = ctx.config.block_capacity_for(combined);
            // SAFETY: `ptr` holds exactly `block_size` bytes of this arena.
            self.ptr = unsafe {
                ctx.arena
                    .reallocate(self.ptr, self.block_size, target, MemoryKind::Data)?
            };
            self.block_size = target;
        }

        let mine = self.data_size;
        let theirs = other.data_size;
        let buf = self.raw_mut();
        match side {
            MergeSide::Right => buf[mine..combined].copy_from_slice(other.raw()),
            MergeSide::Left => {
                buf.copy_within(0..mine, theirs);
                buf[..theirs].copy_from_slice(other.raw());
            }
        }
        self.data_size = combined;
        self.num_records += other.num_records;
        self.num_deleted += other.num_deleted;
        Ok(true)
    }

    // =========================================================================
    // Ranged Delete
    // =========================================================================

    /// Tombstone every visible key in `[start, end)` as of `version`.
    ///
    /// `skip` names a key whose visibility was already settled in the
    /// previous block. Nothing is changed when the result does not fit;
    /// `no_room` then names the first key that needed a tombstone.
    #[allow(clippy::too_many_arguments)]
    pub fn delete_range(
        &mut self,
        ctx: &BlockContext,
        start: &[u8],
        end: Option<&[u8]>,
        version: u64,
        skip: Option<&[u8]>,
        watermark: u64,
        tail_continues: bool,
    ) -> Result<BlockRange> {
        self.unseal(ctx)?;
        let max = ctx.config.max_block_size;
        let mut outcome = BlockRange::default();
        let mut guards: Vec<ExternalBuf> = Vec::new();
        let mut dropped: Vec<NonNull<u8>> = Vec::new();
        let mut out = Vec::with_capacity(self.data_size);
        let mut records = 0;
        let mut first_tombstoned: Option<Vec<u8>> = None;

        {
            let buf = self.raw();
            let all: Vec<RecordRef<'_>> = RecordIter::new(buf).collect();
            let mut first = 0;
            while first < all.len() {
                let mut last = first + 1;
                while last < all.len() && all[last].key == all[first].key {
                    last += 1;
                }
                let run = &all[first..last];
                let key = run[0].key;
                let is_tail = last == all.len();
                first = last;

                let past_end = end.is_some_and(|e| key >= e);
                outcome.past_end |= past_end;
                let settled = if key < start || past_end {
                    None
                } else if skip == Some(key) {
                    Some(Op::Delete)
                } else {
                    run.iter().find(|r| r.version <= version).map(|r| r.op)
                };
                if is_tail && key >= start && !past_end {
                    outcome.last_decided = settled.map(|_| key.to_vec());
                }
                if settled != Some(Op::Put) || skip == Some(key) {
                    for r in run {
                        out.extend_from_slice(&buf[r.offset..r.offset + r.len]);
                    }
                    records += run.len();
                    continue;
                }

                let tombstone = NewRecord {
                    key,
                    value: &[],
                    version,
                    op: Op::Delete,
                    expire: 0,
                };
                let mut encoded = Vec::new();
                let guard = encode_record(&mut encoded, &tombstone, max, &ctx.arena)?;

                // (version, op, bytes, external) newest first, tombstone as `None`
                let mut slots: Vec<(u64, Op, Option<&RecordRef<'_>>)> = Vec::with_capacity(run.len() + 1);
                let mut placed = false;
                for r in run {
                    if r.version == version {
                        dropped.extend(r.external);
                        continue;
                    }
                    if !placed && version > r.version {
                        slots.push((version, Op::Delete, None));
                        placed = true;
                    }
                    slots.push((r.version, r.op, Some(r)));
                }
                if !placed {
                    slots.push((version, Op::Delete, None));
                }

                let versions: Vec<(u64, Op)> = slots.iter().map(|s| (s.0, s.1)).collect();
                let keep = retained(&versions, watermark, tail_continues && is_tail);
                let mut tombstone_kept = false;
                for (slot, k) in slots.iter().zip(keep) {
                    match (slot.2, k) {
                        (Some(r), true) => {
                            out.extend_from_slice(&buf[r.offset..r.offset + r.len]);
                            records += 1;
                        }
                        (Some(r), false) => dropped.extend(r.external),
                        (None, true) => {
                            out.extend_from_slice(&encoded);
                            records += 1;
                            tombstone_kept = true;
                        }
                        (None, false) => {}
                    }
                }
                if tombstone_kept {
                    guards.extend(guard);
                }
                if first_tombstoned.is_none() {
                    first_tombstoned = Some(key.to_vec());
                }
                outcome.deleted += 1;
                outcome.changed = true;
            }
        }

        if !outcome.changed {
            return Ok(outcome);
        }
        if !self.ensure_capacity(ctx, out.len())? {
            // Guards drop here, releasing any tombstone buffers.
            return Ok(BlockRange {
                no_room: first_tombstoned,
                ..BlockRange::default()
            });
        }

        self.raw_mut()[..out.len()].copy_from_slice(&out);
        self.data_size = out.len();
        self.num_records = records;
        self.num_deleted = garbage_in(self.raw());
        for guard in guards {
            guard.commit();
        }
        for ptr in dropped {
            // SAFETY: the record owning this buffer was just removed.
            unsafe { free_external_record(&ctx.arena, ptr) };
        }
        Ok(outcome)
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Copy out the records accepted by `filter`, in block order. Inline
    /// keys and values are slices of one shared copy of the payload.
    pub fn collect(
        &self,
        ctx: &BlockContext,
        filter: impl Fn(&RecordRef<'_>) -> bool,
    ) -> Result<Vec<ScanRecord>> {
        let payload = self.records(ctx)?;
        if !RecordIter::new(&payload).any(|r| filter(&r)) {
            return Ok(Vec::new());
        }
        let shared = Bytes::copy_from_slice(&payload);
        let mut out = Vec::new();
        for r in RecordIter::new(&payload).filter(|r| filter(r)) {
            let (key, value) = match r.key_offset {
                Some(at) => {
                    let value_at = at + r.key.len();
                    (
                        shared.slice(at..value_at),
                        shared.slice(value_at..value_at + r.value.len()),
                    )
                }
                None => (Bytes::copy_from_slice(r.key), Bytes::copy_from_slice(r.value)),
            };
            out.push(ScanRecord {
                key,
                value,
                version: r.version,
                op: r.op,
                expire: r.expire,
            });
        }
        Ok(out)
    }

    // =========================================================================
    // Release
    // =========================================================================

    /// Free the block and every external buffer its records own
    pub fn free(self, ctx: &BlockContext) -> Result<()> {
        let externals: Vec<NonNull<u8>> = {
            let payload = self.records(ctx)?;
            RecordIter::new(&payload).filter_map(|r| r.external).collect()
        };
        for ptr in externals {
            // SAFETY: the block is being freed with all its records.
            unsafe { free_external_record(&ctx.arena, ptr) };
        }
        self.release(ctx);
        Ok(())
    }

    /// Free only the buffer; its records now live elsewhere
    pub fn release(self, ctx: &BlockContext) {
        // SAFETY: `ptr` holds exactly `block_size` bytes and is dropped here.
        unsafe { ctx.arena.free(self.ptr, self.block_size, MemoryKind::Data) };
    }
}

/// In-block size of the record a put would write
pub(crate) fn encoded_len(ctx: &BlockContext, record: &NewRecord<'_>) -> usize {
    record::record_len(record.key.len(), record.value.len(), ctx.config.max_block_size)
}
