//! Error types for LatticeKV
//!
//! Provides a unified error type for all engine operations, plus the
//! crate-internal `BlockError` used to unwind structural races back to
//! the top directory.

use thiserror::Error;

/// Result type alias using LatticeError
pub type Result<T> = std::result::Result<T, LatticeError>;

/// Unified error type for LatticeKV operations
#[derive(Debug, Error)]
pub enum LatticeError {
    // -------------------------------------------------------------------------
    // Memory Errors
    // -------------------------------------------------------------------------
    #[error("Allocation of {size} bytes failed")]
    AllocationFailed { size: usize },

    // -------------------------------------------------------------------------
    // Codec Errors
    // -------------------------------------------------------------------------
    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    // -------------------------------------------------------------------------
    // Structure Errors
    // -------------------------------------------------------------------------
    #[error("Block structure corrupted: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Operation Errors
    // -------------------------------------------------------------------------
    #[error("Operation gave up after {0} retries")]
    RetryLimitExceeded(u32),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Outcome of a block-level step that may have raced a structural change.
///
/// `Retry` means the caller must re-resolve from the top directory.
#[derive(Debug)]
pub(crate) enum BlockError {
    Retry,
    Fatal(LatticeError),
}

impl From<LatticeError> for BlockError {
    fn from(err: LatticeError) -> Self {
        BlockError::Fatal(err)
    }
}

pub(crate) type BlockResult<T> = std::result::Result<T, BlockError>;
