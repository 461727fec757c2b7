//! # LatticeKV
//!
//! An embedded, off-heap storage engine for an ordered, multi-version
//! key-value map:
//! - Two-level block structure (index blocks over data blocks) in
//!   manually managed memory
//! - Versioned records with tombstones and snapshot-aware compaction
//! - Striped locks with optimistic split/merge validation
//! - Forward, reverse and prefix scanners
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine API                           │
//! │     get / put / delete / delete_range / execute / scan       │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                Top Directory (sorted map)                    │
//! │              routing key -> IndexBlock                       │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │  stripe lock + seq check
//!          ┌────────────┴────────────┐
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │ IndexBlock  │          │ IndexBlock  │ ...
//!   └──────┬──────┘          └──────┬──────┘
//!          ▼                        ▼
//!   [DataBlock][DataBlock]   [DataBlock][DataBlock] ...
//!          │
//!          ▼
//!   Arena (off-heap buffers, external keys/values)
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod memory;
pub mod compression;
pub mod record;
pub(crate) mod block;
pub mod engine;
pub mod ops;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{LatticeError, Result};
pub use config::Config;
pub use compression::{Codec, CodecType};
pub use memory::MemoryStats;
pub use block::OpResult;
pub use engine::{Engine, Entry, Scanner};
pub use ops::{Found, Increment, IncrementFloat, Operation, Update};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of LatticeKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
