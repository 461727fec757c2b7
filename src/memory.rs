//! Memory Arena
//!
//! Thin wrapper over the global allocator that hands out raw, 8-byte
//! aligned buffers for index blocks, data blocks and externalized
//! keys/values, and keeps process-wide accounting of what is live.
//!
//! ## Responsibilities
//! - Allocate, reallocate and free off-heap buffers
//! - Count bytes per [`MemoryKind`] and the number of external buffers
//! - Provide the unsafe-boundary helpers used to view raw buffers as slices
//!
//! Every allocation is single-owner: whoever stores the pointer frees it,
//! exactly once, with the size it was allocated with.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{LatticeError, Result};

const ALIGNMENT: usize = 8;

/// What an allocation is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Index block buffer
    Index,
    /// Data block buffer
    Data,
    /// Externalized key or key/value pair
    External,
}

/// Point-in-time copy of the arena counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes currently allocated, all kinds
    pub allocated: u64,
    /// Bytes held by index block buffers
    pub index: u64,
    /// Bytes held by data block buffers
    pub data: u64,
    /// Bytes held by externalized keys/values
    pub external: u64,
    /// Number of live external buffers
    pub external_count: u64,
}

#[derive(Debug, Default)]
struct Counters {
    allocated: AtomicU64,
    index: AtomicU64,
    data: AtomicU64,
    external: AtomicU64,
    external_count: AtomicU64,
}

/// Shared off-heap allocator handle
#[derive(Debug, Clone, Default)]
pub struct Arena {
    counters: Arc<Counters>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed buffer of `size` bytes
    pub fn allocate(&self, size: usize, kind: MemoryKind) -> Result<NonNull<u8>> {
        let layout = Self::layout(size)?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(LatticeError::AllocationFailed { size })?;
        self.account(kind, size as i64);
        if kind == MemoryKind::External {
            self.counters.external_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(ptr)
    }

    /// Resize a buffer, preserving its first `min(old_size, new_size)` bytes
    ///
    /// # Safety
    /// `ptr` must come from this arena with exactly `old_size` bytes and must
    /// not be used after this call returns `Ok`.
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        kind: MemoryKind,
    ) -> Result<NonNull<u8>> {
        let layout = Self::layout(old_size)?;
        Self::layout(new_size)?;
        let raw = alloc::realloc(ptr.as_ptr(), layout, new_size.max(1));
        let new_ptr = NonNull::new(raw).ok_or(LatticeError::AllocationFailed { size: new_size })?;
        self.account(kind, new_size as i64 - old_size as i64);
        Ok(new_ptr)
    }

    /// Release a buffer
    ///
    /// # Safety
    /// `ptr` must come from this arena with exactly `size` bytes and must not
    /// be used again.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize, kind: MemoryKind) {
        if let Ok(layout) = Self::layout(size) {
            alloc::dealloc(ptr.as_ptr(), layout);
            self.account(kind, -(size as i64));
            if kind == MemoryKind::External {
                self.counters.external_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            allocated: self.counters.allocated.load(Ordering::Relaxed),
            index: self.counters.index.load(Ordering::Relaxed),
            data: self.counters.data.load(Ordering::Relaxed),
            external: self.counters.external.load(Ordering::Relaxed),
            external_count: self.counters.external_count.load(Ordering::Relaxed),
        }
    }

    fn layout(size: usize) -> Result<Layout> {
        Layout::from_size_align(size.max(1), ALIGNMENT)
            .map_err(|_| LatticeError::AllocationFailed { size })
    }

    fn account(&self, kind: MemoryKind, delta: i64) {
        let counter = match kind {
            MemoryKind::Index => &self.counters.index,
            MemoryKind::Data => &self.counters.data,
            MemoryKind::External => &self.counters.external,
        };
        for c in [counter, &self.counters.allocated] {
            if delta >= 0 {
                c.fetch_add(delta as u64, Ordering::Relaxed);
            } else {
                c.fetch_sub(delta.unsigned_abs(), Ordering::Relaxed);
            }
        }
    }
}

// =============================================================================
// Raw Buffer Access
// =============================================================================

/// View `len` bytes at `ptr`.
///
/// # Safety
/// The buffer must be live for `'a` and not mutated while the slice exists.
pub(crate) unsafe fn bytes<'a>(ptr: NonNull<u8>, len: usize) -> &'a [u8] {
    std::slice::from_raw_parts(ptr.as_ptr(), len)
}

/// Mutable view of `len` bytes at `ptr`.
///
/// # Safety
/// The buffer must be live for `'a` and exclusively accessed through the
/// returned slice.
pub(crate) unsafe fn bytes_mut<'a>(ptr: NonNull<u8>, len: usize) -> &'a mut [u8] {
    std::slice::from_raw_parts_mut(ptr.as_ptr(), len)
}

pub(crate) fn ptr_to_addr(ptr: NonNull<u8>) -> u64 {
    ptr.as_ptr() as usize as u64
}

pub(crate) fn addr_to_ptr(addr: u64) -> Option<NonNull<u8>> {
    NonNull::new(addr as usize as *mut u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free_accounting() {
        let arena = Arena::new();
        let ptr = arena.allocate(128, MemoryKind::Data).unwrap();
        let stats = arena.stats();
        assert_eq!(stats.allocated, 128);
        assert_eq!(stats.data, 128);

        unsafe { arena.free(ptr, 128, MemoryKind::Data) };
        assert_eq!(arena.stats(), MemoryStats::default());
    }

    #[test]
    fn test_reallocate_preserves_prefix() {
        let arena = Arena::new();
        let ptr = arena.allocate(16, MemoryKind::Index).unwrap();
        unsafe { bytes_mut(ptr, 16) }.copy_from_slice(&[7u8; 16]);

        let grown = unsafe { arena.reallocate(ptr, 16, 64, MemoryKind::Index) }.unwrap();
        assert_eq!(unsafe { bytes(grown, 16) }, &[7u8; 16]);
        assert_eq!(arena.stats().index, 64);

        unsafe { arena.free(grown, 64, MemoryKind::Index) };
        assert_eq!(arena.stats().allocated, 0);
    }

    #[test]
    fn test_external_count() {
        let arena = Arena::new();
        let a = arena.allocate(10, MemoryKind::External).unwrap();
        let b = arena.allocate(20, MemoryKind::External).unwrap();
        assert_eq!(arena.stats().external_count, 2);
        assert_eq!(arena.stats().external, 30);

        unsafe {
            arena.free(a, 10, MemoryKind::External);
            arena.free(b, 20, MemoryKind::External);
        }
        assert_eq!(arena.stats().external_count, 0);
    }

    #[test]
    fn test_address_round_trip() {
        let arena = Arena::new();
        let ptr = arena.allocate(8, MemoryKind::Data).unwrap();
        assert_eq!(addr_to_ptr(ptr_to_addr(ptr)), Some(ptr));
        assert_eq!(addr_to_ptr(0), None);
        unsafe { arena.free(ptr, 8, MemoryKind::Data) };
    }
}
