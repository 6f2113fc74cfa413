//! Zlib (deflate) compression backend.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{OffloadError, Result};

/// Zlib codec
#[derive(Debug, Clone)]
pub struct ZlibCodec {
    /// Compression level (0-9)
    pub level: u32,
}

impl Default for ZlibCodec {
    fn default() -> Self {
        Self { level: 6 }
    }
}

impl ZlibCodec {
    /// Create codec with custom level
    pub fn with_level(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }

    /// Compress bytes
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(data)
            .map_err(|e| OffloadError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| OffloadError::Compression(e.to_string()))
    }

    /// Decompress bytes, failing once the output grows past `limit`.
    pub fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(data).take((limit as u64).saturating_add(1));
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| OffloadError::Decompression(format!("zlib: {e}")))?;
        if out.len() > limit {
            return Err(OffloadError::Decompression(format!(
                "zlib: output exceeds {limit} bytes"
            )));
        }
        Ok(out)
    }
}
