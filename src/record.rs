//! Record Codec
//!
//! Binary layouts shared by data blocks and index blocks.
//!
//! ## Data record
//! ```text
//! embedded:  [key_len:2][val_len:2][key][value][version:8][type:1][expire:8]
//! external:  [0:2][0:2][address:8][version:8][type:1][expire:8]
//!                         │
//!                         └──► [key_len:u32][val_len:u32][key][value]
//! ```
//!
//! ## Directory record (one per data block, inside an index block)
//! ```text
//! [static prefix:19][key_len:2][key | address:8][version:8][type:1]
//!                                     │
//!                                     └──► [key_len:i32][key]
//! ```
//!
//! The static prefix is the data block header:
//! `address:8 block_size:2 data_size:2 records:2 seq:1 compressed:1
//! thread_safe:1 deleted:2`.
//!
//! All integers are little-endian.

use std::cmp::Ordering;
use std::ptr::NonNull;

use crate::error::Result;
use crate::memory::{self, Arena, MemoryKind};

// =============================================================================
// Layout Constants
// =============================================================================

pub const KEY_SIZE_LENGTH: usize = 2;
pub const VALUE_SIZE_LENGTH: usize = 2;
pub const VERSION_SIZE: usize = 8;
pub const TYPE_SIZE: usize = 1;
pub const EXPIRE_SIZE: usize = 8;
pub const ADDRESS_SIZE: usize = 8;
pub const INT_SIZE: usize = 4;

/// Fixed bytes of a data record around its key and value
pub const RECORD_OVERHEAD: usize =
    KEY_SIZE_LENGTH + VALUE_SIZE_LENGTH + VERSION_SIZE + TYPE_SIZE + EXPIRE_SIZE;

/// In-block size of an externalized data record
pub const EXTERNAL_RECORD_SIZE: usize = RECORD_OVERHEAD + ADDRESS_SIZE;

/// Data block header stored at the head of every directory record
pub const STATIC_PREFIX: usize = 19;

/// Fixed bytes of a directory record around its key
pub const DIRECTORY_OVERHEAD: usize = STATIC_PREFIX + KEY_SIZE_LENGTH + VERSION_SIZE + TYPE_SIZE;

/// Size of a directory record whose key is externalized
pub const EXTERNAL_DIRECTORY_SIZE: usize = DIRECTORY_OVERHEAD + ADDRESS_SIZE;

pub(crate) const PREFIX_ADDRESS: usize = 0;
pub(crate) const PREFIX_BLOCK_SIZE: usize = 8;
pub(crate) const PREFIX_DATA_SIZE: usize = 10;
pub(crate) const PREFIX_RECORDS: usize = 12;
pub(crate) const PREFIX_COMPRESSED: usize = 15;
pub(crate) const PREFIX_DELETED: usize = 17;

/// Always zero. A data block has no lock or sequence of its own; the
/// owning index block's stripe lock and sequence cover it.
pub(crate) const PREFIX_RESERVED: [usize; 2] = [14, 16];

// =============================================================================
// Ordering
// =============================================================================

/// Record type. Tombstones sort before puts at the same version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Op {
    Delete = 0,
    Put = 1,
}

impl Op {
    pub fn from_u8(byte: u8) -> Self {
        if byte == Op::Delete as u8 {
            Op::Delete
        } else {
            Op::Put
        }
    }
}

/// Total order over records: key ascending, version descending, then type.
pub fn compare(a_key: &[u8], a_version: u64, a_op: Op, b_key: &[u8], b_version: u64, b_op: Op) -> Ordering {
    a_key
        .cmp(b_key)
        .then_with(|| b_version.cmp(&a_version))
        .then_with(|| a_op.cmp(&b_op))
}

/// Owned `(key, version, type)` triple, the unit every search compares on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub key: Vec<u8>,
    pub version: u64,
    pub op: Op,
}

impl RecordKey {
    pub fn new(key: &[u8], version: u64, op: Op) -> Self {
        Self {
            key: key.to_vec(),
            version,
            op,
        }
    }

    /// Sorts before every record
    pub fn min() -> Self {
        Self {
            key: Vec::new(),
            version: u64::MAX,
            op: Op::Delete,
        }
    }

    pub fn cmp_parts(&self, key: &[u8], version: u64, op: Op) -> Ordering {
        compare(&self.key, self.version, self.op, key, version, op)
    }
}

impl Ord for RecordKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_parts(&other.key, other.version, other.op)
    }
}

impl PartialOrd for RecordKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// =============================================================================
// Field Access
// =============================================================================

pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

pub(crate) fn write_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn write_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(raw)
}

pub(crate) fn write_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

// =============================================================================
// External Buffers
// =============================================================================

/// Owns an externalized key or key/value buffer until it is committed into
/// a block. Dropping an uncommitted buffer frees it.
pub(crate) struct ExternalBuf {
    arena: Arena,
    ptr: NonNull<u8>,
    size: usize,
}

impl ExternalBuf {
    /// `[key_len:u32][val_len:u32][key][value]`
    pub fn record(arena: &Arena, key: &[u8], value: &[u8]) -> Result<Self> {
        let size = 2 * INT_SIZE + key.len() + value.len();
        let ptr = arena.allocate(size, MemoryKind::External)?;
        // SAFETY: freshly allocated, `size` bytes, exclusively ours.
        let buf = unsafe { memory::bytes_mut(ptr, size) };
        write_u32(buf, 0, key.len() as u32);
        write_u32(buf, INT_SIZE, value.len() as u32);
        buf[2 * INT_SIZE..2 * INT_SIZE + key.len()].copy_from_slice(key);
        buf[2 * INT_SIZE + key.len()..].copy_from_slice(value);
        Ok(Self {
            arena: arena.clone(),
            ptr,
            size,
        })
    }

    /// `[key_len:i32][key]`
    pub fn key(arena: &Arena, key: &[u8]) -> Result<Self> {
        let size = INT_SIZE + key.len();
        let ptr = arena.allocate(size, MemoryKind::External)?;
        // SAFETY: freshly allocated, `size` bytes, exclusively ours.
        let buf = unsafe { memory::bytes_mut(ptr, size) };
        write_u32(buf, 0, key.len() as u32);
        buf[INT_SIZE..].copy_from_slice(key);
        Ok(Self {
            arena: arena.clone(),
            ptr,
            size,
        })
    }

    pub fn addr(&self) -> u64 {
        memory::ptr_to_addr(self.ptr)
    }

    /// Hand ownership to the record that now references the buffer
    pub fn commit(self) -> NonNull<u8> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for ExternalBuf {
    fn drop(&mut self) {
        // SAFETY: never committed, so nothing else references it.
        unsafe { self.arena.free(self.ptr, self.size, MemoryKind::External) };
    }
}

/// # Safety
/// `ptr` must be a live external record buffer.
unsafe fn external_record<'a>(ptr: NonNull<u8>) -> (&'a [u8], &'a [u8]) {
    let header = memory::bytes(ptr, 2 * INT_SIZE);
    let key_len = read_u32(header, 0) as usize;
    let value_len = read_u32(header, INT_SIZE) as usize;
    let whole = memory::bytes(ptr, 2 * INT_SIZE + key_len + value_len);
    let body = &whole[2 * INT_SIZE..];
    body.split_at(key_len)
}

/// # Safety
/// `ptr` must be a live external key buffer.
unsafe fn external_key<'a>(ptr: NonNull<u8>) -> &'a [u8] {
    let key_len = read_u32(memory::bytes(ptr, INT_SIZE), 0) as usize;
    &memory::bytes(ptr, INT_SIZE + key_len)[INT_SIZE..]
}

/// # Safety
/// `ptr` must be a live external record buffer owned by the caller.
pub(crate) unsafe fn free_external_record(arena: &Arena, ptr: NonNull<u8>) {
    let (key, value) = external_record(ptr);
    let size = 2 * INT_SIZE + key.len() + value.len();
    arena.free(ptr, size, MemoryKind::External);
}

/// # Safety
/// `ptr` must be a live external key buffer owned by the caller.
pub(crate) unsafe fn free_external_key(arena: &Arena, ptr: NonNull<u8>) {
    let size = INT_SIZE + external_key(ptr).len();
    arena.free(ptr, size, MemoryKind::External);
}

// =============================================================================
// Data Records
// =============================================================================

/// Records whose encoded size reaches half a block live outside it.
/// Empty keys are always externalized since `key_len == 0` is the marker.
pub fn must_externalize(key_len: usize, value_len: usize, max_block_size: usize) -> bool {
    key_len == 0 || key_len + value_len + RECORD_OVERHEAD >= max_block_size / 2
}

/// In-block size of a data record
pub fn record_len(key_len: usize, value_len: usize, max_block_size: usize) -> usize {
    if must_externalize(key_len, value_len, max_block_size) {
        EXTERNAL_RECORD_SIZE
    } else {
        RECORD_OVERHEAD + key_len + value_len
    }
}

/// Decoded view of one data record.
///
/// For externalized records `key` and `value` point into the external
/// buffer, which lives as long as the record itself.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordRef<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub version: u64,
    pub op: Op,
    pub expire: u64,
    pub external: Option<NonNull<u8>>,
    /// Offset of the record inside its block
    pub offset: usize,
    /// Offset of the inline key, `None` when externalized
    pub key_offset: Option<usize>,
    pub len: usize,
}

impl<'a> RecordRef<'a> {
    pub fn cmp_to(&self, key: &[u8], version: u64, op: Op) -> Ordering {
        compare(self.key, self.version, self.op, key, version, op)
    }

    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(self.key, self.version, self.op)
    }
}

/// Decode the record at `off`.
///
/// The external buffer, if any, must be live while the view is used.
pub(crate) fn decode_record(buf: &[u8], off: usize) -> RecordRef<'_> {
    let key_len = read_u16(buf, off) as usize;
    let value_len = read_u16(buf, off + KEY_SIZE_LENGTH) as usize;
    let body = off + KEY_SIZE_LENGTH + VALUE_SIZE_LENGTH;

    let (key, value, external, key_offset, tail) = if key_len == 0 {
        let ptr = memory::addr_to_ptr(read_u64(buf, body));
        // SAFETY: an externalized record owns a live buffer at this address.
        let (key, value) = match ptr {
            Some(p) => unsafe { external_record(p) },
            None => (&[][..], &[][..]),
        };
        (key, value, ptr, None, body + ADDRESS_SIZE)
    } else {
        let key = &buf[body..body + key_len];
        let value = &buf[body + key_len..body + key_len + value_len];
        (key, value, None, Some(body), body + key_len + value_len)
    };

    RecordRef {
        key,
        value,
        version: read_u64(buf, tail),
        op: Op::from_u8(buf[tail + VERSION_SIZE]),
        expire: read_u64(buf, tail + VERSION_SIZE + TYPE_SIZE),
        external,
        offset: off,
        key_offset,
        len: tail + VERSION_SIZE + TYPE_SIZE + EXPIRE_SIZE - off,
    }
}

/// A record about to be written
#[derive(Debug, Clone, Copy)]
pub(crate) struct NewRecord<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub version: u64,
    pub op: Op,
    pub expire: u64,
}

/// Append the encoding of `record` to `out`.
///
/// Returns the external buffer when the record was externalized; the caller
/// commits it once the bytes are in place, or drops it to roll back.
pub(crate) fn encode_record(
    out: &mut Vec<u8>,
    record: &NewRecord<'_>,
    max_block_size: usize,
    arena: &Arena,
) -> Result<Option<ExternalBuf>> {
    let external = if must_externalize(record.key.len(), record.value.len(), max_block_size) {
        let ext = ExternalBuf::record(arena, record.key, record.value)?;
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&ext.addr().to_le_bytes());
        Some(ext)
    } else {
        out.extend_from_slice(&(record.key.len() as u16).to_le_bytes());
        out.extend_from_slice(&(record.value.len() as u16).to_le_bytes());
        out.extend_from_slice(record.key);
        out.extend_from_slice(record.value);
        None
    };
    out.extend_from_slice(&record.version.to_le_bytes());
    out.push(record.op as u8);
    out.extend_from_slice(&record.expire.to_le_bytes());
    Ok(external)
}

/// Walks the records of a block payload in order
pub(crate) struct RecordIter<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> RecordIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = RecordRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.off >= self.buf.len() {
            return None;
        }
        let record = decode_record(self.buf, self.off);
        self.off += record.len;
        Some(record)
    }
}

// =============================================================================
// Directory Records
// =============================================================================

pub fn directory_key_external(key_len: usize, max_index_block_size: usize) -> bool {
    key_len == 0 || key_len + DIRECTORY_OVERHEAD >= max_index_block_size / 2
}

pub fn directory_record_len(key_len: usize, max_index_block_size: usize) -> usize {
    if directory_key_external(key_len, max_index_block_size) {
        EXTERNAL_DIRECTORY_SIZE
    } else {
        DIRECTORY_OVERHEAD + key_len
    }
}

/// Decoded view of one directory record
#[derive(Debug, Clone, Copy)]
pub(crate) struct DirRef<'a> {
    pub key: &'a [u8],
    pub version: u64,
    pub op: Op,
    pub external: Option<NonNull<u8>>,
    pub len: usize,
}

impl<'a> DirRef<'a> {
    pub fn cmp_to(&self, key: &[u8], version: u64, op: Op) -> Ordering {
        compare(self.key, self.version, self.op, key, version, op)
    }

    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(self.key, self.version, self.op)
    }
}

pub(crate) fn directory_len_at(buf: &[u8], off: usize) -> usize {
    match read_u16(buf, off + STATIC_PREFIX) as usize {
        0 => EXTERNAL_DIRECTORY_SIZE,
        key_len => DIRECTORY_OVERHEAD + key_len,
    }
}

pub(crate) fn decode_directory(buf: &[u8], off: usize) -> DirRef<'_> {
    let key_len = read_u16(buf, off + STATIC_PREFIX) as usize;
    let body = off + STATIC_PREFIX + KEY_SIZE_LENGTH;
    let (key, external, tail) = if key_len == 0 {
        let ptr = memory::addr_to_ptr(read_u64(buf, body));
        // SAFETY: an externalized directory key owns a live buffer.
        let key = match ptr {
            Some(p) => unsafe { external_key(p) },
            None => &[][..],
        };
        (key, ptr, body + ADDRESS_SIZE)
    } else {
        (&buf[body..body + key_len], None, body + key_len)
    };
    DirRef {
        key,
        version: read_u64(buf, tail),
        op: Op::from_u8(buf[tail + VERSION_SIZE]),
        external,
        len: tail + VERSION_SIZE + TYPE_SIZE - off,
    }
}

/// Append `[key_len][key | address][version][type]`, the part of a
/// directory record that follows the static prefix.
pub(crate) fn encode_directory_key(
    out: &mut Vec<u8>,
    key: &RecordKey,
    max_index_block_size: usize,
    arena: &Arena,
) -> Result<Option<ExternalBuf>> {
    let external = if directory_key_external(key.key.len(), max_index_block_size) {
        let ext = ExternalBuf::key(arena, &key.key)?;
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&ext.addr().to_le_bytes());
        Some(ext)
    } else {
        out.extend_from_slice(&(key.key.len() as u16).to_le_bytes());
        out.extend_from_slice(&key.key);
        None
    };
    out.extend_from_slice(&key.version.to_le_bytes());
    out.push(key.op as u8);
    Ok(external)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(arena: &Arena, key: &[u8], value: &[u8], max: usize) -> (Vec<u8>, Option<ExternalBuf>) {
        let mut out = Vec::new();
        let record = NewRecord {
            key,
            value,
            version: 7,
            op: Op::Put,
            expire: 99,
        };
        let ext = encode_record(&mut out, &record, max, arena).unwrap();
        (out, ext)
    }

    #[test]
    fn test_embedded_record_layout() {
        let arena = Arena::new();
        let (buf, ext) = encode(&arena, b"KEY1", b"VALUE1", 4096);
        assert!(ext.is_none());
        assert_eq!(buf.len(), RECORD_OVERHEAD + 4 + 6);

        let record = decode_record(&buf, 0);
        assert_eq!(record.key, b"KEY1");
        assert_eq!(record.value, b"VALUE1");
        assert_eq!(record.version, 7);
        assert_eq!(record.op, Op::Put);
        assert_eq!(record.expire, 99);
        assert_eq!(record.key_offset, Some(4));
        assert_eq!(record.len, buf.len());
    }

    #[test]
    fn test_externalization_threshold() {
        let max = 4096;
        let below = max / 2 - RECORD_OVERHEAD - 1;
        assert!(!must_externalize(1, below - 1, max));
        assert!(must_externalize(1, below, max));
        assert!(must_externalize(0, 0, max));
    }

    #[test]
    fn test_external_record_round_trip() {
        let arena = Arena::new();
        let value = vec![0xAB; 5000];
        let (buf, ext) = encode(&arena, b"big", &value, 4096);
        assert_eq!(buf.len(), EXTERNAL_RECORD_SIZE);
        let ext = ext.unwrap();

        let record = decode_record(&buf, 0);
        assert_eq!(record.key, b"big");
        assert_eq!(record.value, &value[..]);
        assert!(record.external.is_some());
        assert_eq!(record.key_offset, None);

        // dropping the uncommitted guard releases the buffer
        drop(ext);
        assert_eq!(arena.stats().external_count, 0);
    }

    #[test]
    fn test_committed_external_freed_explicitly() {
        let arena = Arena::new();
        let (buf, ext) = encode(&arena, b"", b"empty key", 4096);
        let ptr = ext.unwrap().commit();
        assert_eq!(arena.stats().external_count, 1);

        let record = decode_record(&buf, 0);
        assert_eq!(record.key, b"");
        assert_eq!(record.value, b"empty key");

        unsafe { free_external_record(&arena, ptr) };
        assert_eq!(arena.stats().allocated, 0);
    }

    #[test]
    fn test_directory_key_layout() {
        let arena = Arena::new();
        let key = RecordKey::new(b"KEY42", 3, Op::Delete);
        let mut buf = vec![0u8; STATIC_PREFIX];
        assert!(encode_directory_key(&mut buf, &key, 4096, &arena).unwrap().is_none());

        assert_eq!(buf.len(), directory_record_len(5, 4096));
        assert_eq!(directory_len_at(&buf, 0), buf.len());
        let dir = decode_directory(&buf, 0);
        assert_eq!(dir.record_key(), key);
    }

    #[test]
    fn test_directory_key_externalized() {
        let arena = Arena::new();
        let key = RecordKey::new(&[b'x'; 3000], 1, Op::Put);
        let mut buf = vec![0u8; STATIC_PREFIX];
        let ext = encode_directory_key(&mut buf, &key, 4096, &arena).unwrap().unwrap();
        let ptr = ext.commit();

        assert_eq!(buf.len(), EXTERNAL_DIRECTORY_SIZE);
        let dir = decode_directory(&buf, 0);
        assert_eq!(dir.key, &key.key[..]);
        assert_eq!(dir.external, Some(ptr));

        unsafe { free_external_key(&arena, ptr) };
        assert_eq!(arena.stats().external_count, 0);
    }

    #[test]
    fn test_total_order() {
        let newer = RecordKey::new(b"a", 9, Op::Put);
        let older = RecordKey::new(b"a", 2, Op::Put);
        let tombstone = RecordKey::new(b"a", 9, Op::Delete);
        let next_key = RecordKey::new(b"b", 100, Op::Put);

        assert!(newer < older);
        assert!(tombstone < newer);
        assert!(older < next_key);
        assert!(RecordKey::min() < tombstone);
        assert!(RecordKey::min() < RecordKey::new(b"", 0, Op::Delete));
    }
}
