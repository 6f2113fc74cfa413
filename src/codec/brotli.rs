//! Brotli compression backend.

use brotli::{CompressorWriter, Decompressor};
use std::io::{Read, Write};

use crate::error::{OffloadError, Result};

/// Brotli compression quality (0-11, higher = better compression, slower)
const DEFAULT_QUALITY: u32 = 9;

/// Window size for Brotli (larger = better compression for large tensors)
const DEFAULT_WINDOW_SIZE: u32 = 22;

/// Brotli codec
#[derive(Debug, Clone)]
pub struct BrotliCodec {
    /// Compression quality (0-11)
    pub quality: u32,
    /// Window size (10-24)
    pub window_size: u32,
}

impl Default for BrotliCodec {
    fn default() -> Self {
        Self {
            quality: DEFAULT_QUALITY,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

impl BrotliCodec {
    /// Create new Brotli codec with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create codec with custom quality
    pub fn with_quality(quality: u32) -> Self {
        Self {
            quality: quality.min(11),
            ..Default::default()
        }
    }

    /// Compress bytes to Brotli format
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut compressed = Vec::new();
        {
            let mut writer =
                CompressorWriter::new(&mut compressed, 4096, self.quality, self.window_size);
            writer
                .write_all(data)
                .map_err(|e| OffloadError::Compression(e.to_string()))?;
        }
        Ok(compressed)
    }

    /// Decompress Brotli bytes, reading at most `limit` bytes of output
    pub fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        let mut decompressor = Decompressor::new(data, 4096).take((limit as u64).saturating_add(1));
        let mut decompressed = Vec::new();
        decompressor
            .read_to_end(&mut decompressed)
            .map_err(|e| OffloadError::Decompression(format!("brotli: {e}")))?;
        if decompressed.len() > limit {
            return Err(OffloadError::Decompression(format!(
                "brotli: output exceeds {limit} bytes"
            )));
        }
        Ok(decompressed)
    }
}
