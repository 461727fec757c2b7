//! Configuration for LatticeKV
//!
//! Centralized configuration with sensible defaults.

use crate::compression::CodecType;
use crate::error::{LatticeError, Result};
use crate::record::EXTERNAL_RECORD_SIZE;

/// Largest data or index block the 2-byte size and key length fields can
/// describe.
pub const MAX_ADDRESSABLE_BLOCK: usize = u16::MAX as usize;

/// Main configuration for a LatticeKV engine
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Block Geometry
    // -------------------------------------------------------------------------
    /// Maximum size of a data block (in bytes)
    pub max_block_size: usize,

    /// Size an index block is allocated with and split above (in bytes)
    pub max_index_block_size: usize,

    /// Allowed data block capacities as fractions of `max_block_size`,
    /// ascending. New and split blocks take the smallest one that fits.
    pub block_ratios: Vec<f64>,

    /// Minimum growth step when a block reallocates (in bytes)
    pub expansion_size: usize,

    // -------------------------------------------------------------------------
    // Split / Merge Thresholds
    // -------------------------------------------------------------------------
    /// Fill ratio below which a block is considered for merging
    pub merge_ratio: f64,

    /// Fill ratio at or above which a full block is split rather than
    /// compacted in place
    pub split_ratio: f64,

    // -------------------------------------------------------------------------
    // Concurrency
    // -------------------------------------------------------------------------
    /// Number of striped read-write locks guarding index blocks
    pub lock_stripes: usize,

    /// Upper bound on structural-race retries per operation (None = unbounded)
    pub max_retries: Option<u32>,

    // -------------------------------------------------------------------------
    // Compression
    // -------------------------------------------------------------------------
    /// Codec applied to data blocks at rest
    pub codec: CodecType,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_block_size: 4096,
            max_index_block_size: 4096,
            block_ratios: vec![0.25, 0.5, 0.75, 1.0],
            expansion_size: 512,
            merge_ratio: 0.25,
            split_ratio: 0.75,
            lock_stripes: 11113, // prime
            max_retries: None,
            codec: CodecType::None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check that the knobs describe a usable block geometry
    pub fn validate(&self) -> Result<()> {
        if self.max_block_size > MAX_ADDRESSABLE_BLOCK {
            return Err(LatticeError::Config(format!(
                "max_block_size {} exceeds {}",
                self.max_block_size, MAX_ADDRESSABLE_BLOCK
            )));
        }
        // Room for at least two externalized records, so any block can split.
        if self.max_block_size < 4 * EXTERNAL_RECORD_SIZE {
            return Err(LatticeError::Config(format!(
                "max_block_size {} is too small",
                self.max_block_size
            )));
        }
        if self.max_index_block_size > MAX_ADDRESSABLE_BLOCK {
            return Err(LatticeError::Config(format!(
                "max_index_block_size {} exceeds {}",
                self.max_index_block_size, MAX_ADDRESSABLE_BLOCK
            )));
        }
        if self.max_index_block_size < 256 {
            return Err(LatticeError::Config(format!(
                "max_index_block_size {} is too small",
                self.max_index_block_size
            )));
        }
        if self.block_ratios.is_empty() {
            return Err(LatticeError::Config("block_ratios is empty".into()));
        }
        let mut previous = 0.0;
        for &ratio in &self.block_ratios {
            if ratio <= previous || ratio > 1.0 {
                return Err(LatticeError::Config(format!(
                    "block ratio {} must be ascending and within (0, 1]",
                    ratio
                )));
            }
            previous = ratio;
        }
        for (name, ratio) in [("merge_ratio", self.merge_ratio), ("split_ratio", self.split_ratio)] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(LatticeError::Config(format!(
                    "{} {} must be within (0, 1]",
                    name, ratio
                )));
            }
        }
        if self.lock_stripes == 0 {
            return Err(LatticeError::Config("lock_stripes must be non-zero".into()));
        }
        Ok(())
    }

    /// Smallest allowed data block capacity that holds `needed` bytes
    pub(crate) fn block_capacity_for(&self, needed: usize) -> usize {
        self.block_ratios
            .iter()
            .map(|ratio| (self.max_block_size as f64 * ratio) as usize)
            .find(|&size| size >= needed)
            .unwrap_or(self.max_block_size)
            .max(needed)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the maximum data block size (in bytes)
    pub fn max_block_size(mut self, size: usize) -> Self {
        self.config.max_block_size = size;
        self
    }

    /// Set the index block size (in bytes)
    pub fn max_index_block_size(mut self, size: usize) -> Self {
        self.config.max_index_block_size = size;
        self
    }

    /// Set the data block capacity ratios
    pub fn block_ratios(mut self, ratios: impl Into<Vec<f64>>) -> Self {
        self.config.block_ratios = ratios.into();
        self
    }

    /// Set the minimum reallocation step (in bytes)
    pub fn expansion_size(mut self, size: usize) -> Self {
        self.config.expansion_size = size;
        self
    }

    /// Set the merge threshold
    pub fn merge_ratio(mut self, ratio: f64) -> Self {
        self.config.merge_ratio = ratio;
        self
    }

    /// Set the split threshold
    pub fn split_ratio(mut self, ratio: f64) -> Self {
        self.config.split_ratio = ratio;
        self
    }

    /// Set the number of lock stripes
    pub fn lock_stripes(mut self, count: usize) -> Self {
        self.config.lock_stripes = count;
        self
    }

    /// Bound the number of retries per operation
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = Some(retries);
        self
    }

    /// Set the data block codec
    pub fn codec(mut self, codec: CodecType) -> Self {
        self.config.codec = codec;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
