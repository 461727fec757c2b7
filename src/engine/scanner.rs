//! Scanners
//!
//! Ordered cursors over the whole map. A scanner copies one data block
//! worth of records at a time, under the owning index block's read lock,
//! and re-routes from the top directory for every batch. A split or merge
//! between batches therefore only changes where the next batch comes
//! from, never what it contains.
//!
//! ```text
//!   forward:  cursor ──► route(cursor) ──► first block with records > cursor
//!   reverse:  cursor ──► route_before(cursor) ──► last block with records < cursor
//! ```

use std::collections::VecDeque;

use bytes::Bytes;

use super::snapshot::SnapshotGuard;
use super::Engine;
use crate::block::{Pending, ScanRecord};
use crate::error::{BlockError, Result};
use crate::record::{Op, RecordKey};

/// Where the next batch starts
#[derive(Debug, Clone)]
enum Position {
    /// Records at or after this key
    From(RecordKey),
    /// Records strictly after this key
    After(RecordKey),
    /// Records strictly before this key, or the end of the map
    Before(Option<RecordKey>),
}

enum Step {
    Batch(Vec<ScanRecord>),
    Continue(Position),
    Done,
}

/// Cursor over visible key/value pairs in `[start, stop)`
pub struct Scanner<'a> {
    engine: &'a Engine,
    snapshot: SnapshotGuard,
    start: Option<Vec<u8>>,
    stop: Option<Vec<u8>>,
    reverse: bool,
    position: Position,
    ready: VecDeque<(Bytes, Bytes)>,
    /// Forward: key whose visibility is already settled
    decided: Option<Bytes>,
    /// Reverse: key whose versions are still arriving
    pending: Option<Pending>,
    done: bool,
}

impl<'a> Scanner<'a> {
    pub(crate) fn new(
        engine: &'a Engine,
        start: Option<&[u8]>,
        stop: Option<&[u8]>,
        reverse: bool,
        version: u64,
    ) -> Self {
        let position = if reverse {
            Position::Before(stop.map(|stop| RecordKey::new(stop, u64::MAX, Op::Delete)))
        } else {
            Position::From(RecordKey::new(start.unwrap_or_default(), u64::MAX, Op::Delete))
        };
        let empty = matches!((start, stop), (Some(start), Some(stop)) if stop <= start);
        Self {
            engine,
            snapshot: SnapshotGuard::new(std::sync::Arc::clone(&engine.ctx), version),
            start: start.map(<[u8]>::to_vec),
            stop: stop.map(<[u8]>::to_vec),
            reverse,
            position,
            ready: VecDeque::new(),
            decided: None,
            pending: None,
            done: empty,
        }
    }

    /// Version the scanner reads at
    pub fn version(&self) -> u64 {
        self.snapshot.version()
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    // =========================================================================
    // Batches
    // =========================================================================

    fn fetch(&self, position: &Position) -> Result<Step> {
        let engine = self.engine;
        engine.with_retry(|| match position {
            Position::From(key) | Position::After(key) => {
                let inclusive = matches!(position, Position::From(_));
                let (block, seq) = engine.route(key)?;
                let guard = block.read(Some(seq))?;
                if !guard.covers(key) {
                    return Err(BlockError::Retry);
                }
                match guard.collect_forward(&engine.ctx, key, inclusive)? {
                    Some(batch) => Ok(Step::Batch(batch)),
                    None => Ok(guard
                        .upper()
                        .cloned()
                        .map_or(Step::Done, |upper| Step::Continue(Position::From(upper)))),
                }
            }
            Position::Before(before) => {
                let routed = match before {
                    Some(before) => engine.route_before(before),
                    None => engine.route_last(),
                };
                let Some((block, seq)) = routed else {
                    return Ok(Step::Done);
                };
                let guard = block.read(Some(seq))?;
                let reaches = match (before, guard.upper()) {
                    (_, None) => true,
                    (Some(before), Some(upper)) => before <= upper,
                    (None, Some(_)) => false,
                };
                if !reaches {
                    return Err(BlockError::Retry);
                }
                match guard.collect_backward(&engine.ctx, before.as_ref())? {
                    Some(batch) => Ok(Step::Batch(batch)),
                    None if *block.lower() == RecordKey::min() => Ok(Step::Done),
                    None => Ok(Step::Continue(Position::Before(Some(block.lower().clone())))),
                }
            }
        })
    }

    /// Load and filter batches until something is ready or the range ends
    fn fill(&mut self) -> Result<()> {
        while self.ready.is_empty() && !self.done {
            match self.fetch(&self.position)? {
                Step::Batch(batch) => {
                    if let Some(last) = batch.last() {
                        let key = RecordKey::new(&last.key, last.version, last.op);
                        self.position = if self.reverse {
                            Position::Before(Some(key))
                        } else {
                            Position::After(key)
                        };
                    }
                    if self.reverse {
                        self.accept_backward(batch);
                    } else {
                        self.accept_forward(batch);
                    }
                }
                Step::Continue(position) => self.position = position,
                Step::Done => {
                    self.done = true;
                    if let Some(found) = self.pending.take().and_then(Pending::resolve) {
                        self.ready.push_back((found.key, found.value));
                    }
                }
            }
        }
        Ok(())
    }

    /// Ascending records: a key's versions arrive newest first
    fn accept_forward(&mut self, batch: Vec<ScanRecord>) {
        let read_version = self.snapshot.version();
        for record in batch {
            if self.stop.as_deref().is_some_and(|stop| record.key.as_ref() >= stop) {
                self.done = true;
                return;
            }
            if self.decided.as_ref() == Some(&record.key) || record.version > read_version {
                continue;
            }
            self.decided = Some(record.key.clone());
            if record.op == Op::Put {
                self.ready.push_back((record.key, record.value));
            }
        }
    }

    /// Descending records: a key's versions arrive oldest first
    fn accept_backward(&mut self, batch: Vec<ScanRecord>) {
        let read_version = self.snapshot.version();
        for record in batch {
            if self.start.as_deref().is_some_and(|start| record.key.as_ref() < start) {
                self.done = true;
                break;
            }
            if self.pending.as_ref().map_or(true, |pending| pending.key != record.key) {
                if let Some(found) = self.pending.take().and_then(Pending::resolve) {
                    self.ready.push_back((found.key, found.value));
                }
                self.pending = Some(Pending::new(record.key.clone()));
            }
            if let Some(pending) = self.pending.as_mut() {
                pending.offer(record, read_version);
            }
        }
        if self.done {
            if let Some(found) = self.pending.take().and_then(Pending::resolve) {
                self.ready.push_back((found.key, found.value));
            }
        }
    }
}

impl Iterator for Scanner<'_> {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.ready.is_empty() {
            if let Err(err) = self.fill() {
                self.done = true;
                return Some(Err(err));
            }
        }
        self.ready.pop_front().map(Ok)
    }
}
