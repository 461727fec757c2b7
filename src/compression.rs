//! Compression hook for data blocks
//!
//! A data block may be kept compressed at rest. The block layer only sees
//! the [`Codec`] trait; the record format is always the uncompressed one
//! once a block has been decompressed for access. Applications can supply
//! their own codec through [`Engine::open_with_codec`](crate::Engine::open_with_codec).

use std::sync::Arc;

use crate::error::{LatticeError, Result};

/// Pluggable block codec
pub trait Codec: Send + Sync {
    /// Compress a block payload
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>>;

    /// Restore a payload that was `expected_len` bytes before compression
    fn decompress(&self, input: &[u8], expected_len: usize) -> Result<Vec<u8>>;

    fn name(&self) -> &'static str;
}

/// Codec selection knob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecType {
    /// Blocks are never compressed
    #[default]
    None,
    /// LZ4 block format
    Lz4,
}

impl CodecType {
    /// Instantiate the codec, `None` when compression is disabled
    pub fn codec(self) -> Option<Arc<dyn Codec>> {
        match self {
            CodecType::None => None,
            CodecType::Lz4 => Some(Arc::new(Lz4Codec)),
        }
    }
}

/// LZ4 block codec
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::block::compress(input))
    }

    fn decompress(&self, input: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let out = lz4_flex::block::decompress(input, expected_len)
            .map_err(|e| LatticeError::Decompression(e.to_string()))?;
        if out.len() != expected_len {
            return Err(LatticeError::Decompression(format!(
                "expected {} bytes, got {}",
                expected_len,
                out.len()
            )));
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "lz4"
    }
}
