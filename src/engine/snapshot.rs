//! Snapshot registry
//!
//! Readers that need a stable view (scanners, pinned reads) register the
//! version they read at. The smallest registered version is the
//! watermark: compaction keeps every record a registered reader can still
//! see.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::BlockContext;

/// Registered read versions with reference counts
#[derive(Debug)]
pub(crate) struct Snapshots {
    active: Mutex<BTreeMap<u64, usize>>,
    /// Cached minimum, `u64::MAX` when nothing is registered
    watermark: AtomicU64,
}

impl Snapshots {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(BTreeMap::new()),
            watermark: AtomicU64::new(u64::MAX),
        }
    }

    pub fn register(&self, version: u64) {
        let mut active = self.active.lock();
        *active.entry(version).or_insert(0) += 1;
        self.refresh(&active);
    }

    pub fn unregister(&self, version: u64) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                active.remove(&version);
            }
        }
        self.refresh(&active);
    }

    fn refresh(&self, active: &BTreeMap<u64, usize>) {
        let min = active.keys().next().copied().unwrap_or(u64::MAX);
        self.watermark.store(min, Ordering::Release);
    }

    /// Oldest version a registered reader may still read
    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }

    pub fn count(&self) -> usize {
        self.active.lock().values().sum()
    }
}

/// Keeps one version registered until dropped
pub(crate) struct SnapshotGuard {
    ctx: Arc<BlockContext>,
    version: u64,
}

impl SnapshotGuard {
    pub fn new(ctx: Arc<BlockContext>, version: u64) -> Self {
        ctx.snapshots.register(version);
        Self { ctx, version }
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        self.ctx.snapshots.unregister(self.version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_tracks_minimum() {
        let snapshots = Snapshots::new();
        assert_eq!(snapshots.watermark(), u64::MAX);

        snapshots.register(10);
        snapshots.register(5);
        snapshots.register(5);
        assert_eq!(snapshots.watermark(), 5);

        snapshots.unregister(5);
        assert_eq!(snapshots.watermark(), 5);
        snapshots.unregister(5);
        assert_eq!(snapshots.watermark(), 10);

        snapshots.unregister(10);
        assert_eq!(snapshots.watermark(), u64::MAX);
        assert_eq!(snapshots.count(), 0);
    }
}
