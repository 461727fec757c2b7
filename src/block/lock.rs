//! Locking / Versioning Protocol
//!
//! A fixed array of striped read-write locks guards index blocks (and,
//! through them, their data blocks). Each block also carries a
//! split/merge sequence that is bumped on every structural change.
//!
//! ```text
//! read:   snapshot seq ─► lock stripe (shared)    ─► valid? seq same? ─► go
//! write:  snapshot seq ─► lock stripe (exclusive) ─► valid? seq same? ─► mutate, bump
//!                                                        │
//!                                                        └─ no ─► Retry
//! ```

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{BlockError, BlockResult};

/// Something guarded by the stripe protocol
pub(crate) trait Versioned {
    fn id(&self) -> u64;
    fn seq(&self) -> u64;
    fn is_valid(&self) -> bool;
    /// Blocks not yet visible to other threads skip locking
    fn is_thread_safe(&self) -> bool;
}

/// Fixed-size array of stripe locks
pub(crate) struct LockStripes {
    locks: Box<[RwLock<()>]>,
}

impl LockStripes {
    pub fn new(count: usize) -> Self {
        let locks = (0..count.max(1)).map(|_| RwLock::new(())).collect();
        Self { locks }
    }

    pub fn stripe_of(&self, id: u64) -> usize {
        let mixed = id.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        ((mixed >> 32) as usize) % self.locks.len()
    }

    pub fn read<B: Versioned>(&self, block: &B, expected_seq: Option<u64>) -> BlockResult<StripeGuard<'_>> {
        if block.is_thread_safe() {
            return Ok(StripeGuard::Unlocked);
        }
        let guard = self.locks[self.stripe_of(block.id())].read();
        check(block, expected_seq)?;
        Ok(StripeGuard::Read(guard))
    }

    pub fn write<B: Versioned>(&self, block: &B, expected_seq: Option<u64>) -> BlockResult<StripeGuard<'_>> {
        if block.is_thread_safe() {
            return Ok(StripeGuard::Unlocked);
        }
        let guard = self.locks[self.stripe_of(block.id())].write();
        check(block, expected_seq)?;
        Ok(StripeGuard::Write(guard))
    }

    /// Shared lock without blocking; `Retry` when the stripe is busy
    pub fn try_read<B: Versioned>(&self, block: &B, expected_seq: Option<u64>) -> BlockResult<StripeGuard<'_>> {
        if block.is_thread_safe() {
            return Ok(StripeGuard::Unlocked);
        }
        let guard = self.locks[self.stripe_of(block.id())]
            .try_read()
            .ok_or(BlockError::Retry)?;
        check(block, expected_seq)?;
        Ok(StripeGuard::Read(guard))
    }

    /// `try_read` for a neighbour of `held`, whose stripe the caller holds
    /// exclusively. A neighbour on that same stripe is already covered.
    pub fn try_read_beside<A: Versioned, B: Versioned>(
        &self,
        block: &A,
        expected_seq: Option<u64>,
        held: &B,
    ) -> BlockResult<StripeGuard<'_>> {
        if !block.is_thread_safe() && self.stripe_of(block.id()) == self.stripe_of(held.id()) {
            check(block, expected_seq)?;
            return Ok(StripeGuard::Unlocked);
        }
        self.try_read(block, expected_seq)
    }

    /// Exclusive locks on two blocks, taken in stripe order. Blocks that
    /// share a stripe are covered by a single lock.
    pub fn write_pair<A: Versioned, B: Versioned>(
        &self,
        left: &A,
        left_seq: Option<u64>,
        right: &B,
        right_seq: Option<u64>,
    ) -> BlockResult<(StripeGuard<'_>, StripeGuard<'_>)> {
        let ls = self.stripe_of(left.id());
        let rs = self.stripe_of(right.id());
        let (lg, rg) = if ls == rs {
            (StripeGuard::Write(self.locks[ls].write()), StripeGuard::Unlocked)
        } else if ls < rs {
            let lg = self.locks[ls].write();
            (StripeGuard::Write(lg), StripeGuard::Write(self.locks[rs].write()))
        } else {
            let rg = self.locks[rs].write();
            (StripeGuard::Write(self.locks[ls].write()), StripeGuard::Write(rg))
        };
        check(left, left_seq)?;
        check(right, right_seq)?;
        Ok((lg, rg))
    }
}

fn check<B: Versioned>(block: &B, expected_seq: Option<u64>) -> BlockResult<()> {
    if !block.is_valid() {
        return Err(BlockError::Retry);
    }
    match expected_seq {
        Some(seq) if seq != block.seq() => Err(BlockError::Retry),
        _ => Ok(()),
    }
}

/// Held stripe lock, if any
pub(crate) enum StripeGuard<'a> {
    Read(RwLockReadGuard<'a, ()>),
    Write(RwLockWriteGuard<'a, ()>),
    Unlocked,
}
