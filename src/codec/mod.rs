//! Compression adapter for assembled payloads.
//!
//! Every packed payload is wrapped in a small envelope so the receiving side
//! can pick the right backend and verify the result:
//!
//! ```text
//! "OFZ" <algorithm:u8> <varint original_len> <crc32:u32 BE> <compressed body>
//! ```
//!
//! | Algorithm | Tag | Best For                              |
//! |-----------|-----|---------------------------------------|
//! | `None`    | 0   | Already-dense payloads, debugging     |
//! | `Brotli`  | 1   | Sparse activations (ReLU outputs)     |
//! | `Zlib`    | 2   | Low-latency links, cheap edge CPUs    |
//!
//! Packing bytes is always lossless. Tensors can additionally be narrowed to
//! f16 with [`Precision::Half`] before packing; that mode is lossy and only
//! used when configured.
//!
//! # Usage
//!
//! ```rust,ignore
//! use offload::codec::{Algorithm, Compressor};
//!
//! let compressor = Compressor::new(Algorithm::Brotli);
//! let packed = compressor.pack(&activations)?;
//! assert_eq!(compressor.unpack(&packed)?, activations);
//! ```

mod algorithm;
mod brotli;
mod zlib;

pub use algorithm::Algorithm;
pub use brotli::BrotliCodec;
pub use zlib::ZlibCodec;

use crate::config::CompressionConfig;
use crate::error::{OffloadError, Result};
use crate::inference::{Precision, Tensor};
use crate::protocol::varint::{read_varint, write_varint};

/// Envelope magic
pub const ENVELOPE_MAGIC: &[u8; 3] = b"OFZ";

/// Largest payload an envelope may expand to unless configured otherwise
pub const DEFAULT_MAX_UNPACKED_BYTES: usize = 256 * 1024 * 1024; // 256 MiB

/// Packs and unpacks payloads.
#[derive(Debug, Clone)]
pub struct Compressor {
    algorithm: Algorithm,
    precision: Precision,
    max_unpacked_bytes: usize,
    brotli: BrotliCodec,
    zlib: ZlibCodec,
}

impl Default for Compressor {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            precision: Precision::default(),
            max_unpacked_bytes: DEFAULT_MAX_UNPACKED_BYTES,
            brotli: BrotliCodec::default(),
            zlib: ZlibCodec::default(),
        }
    }
}

impl Compressor {
    /// Compressor using `algorithm` at default levels, full precision.
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            ..Default::default()
        }
    }

    /// Build from configuration.
    pub fn from_config(config: &CompressionConfig) -> Self {
        let mut compressor = Self::new(config.algorithm)
            .with_precision(config.precision)
            .with_max_unpacked_bytes(config.max_unpacked_bytes);
        if let Some(level) = config.level {
            compressor = compressor.with_level(level);
        }
        compressor
    }

    /// Set the compression level for the selected backend.
    pub fn with_level(mut self, level: u32) -> Self {
        match self.algorithm {
            Algorithm::Brotli => self.brotli = BrotliCodec::with_quality(level),
            Algorithm::Zlib => self.zlib = ZlibCodec::with_level(level),
            Algorithm::None => {},
        }
        self
    }

    /// Set tensor precision used by [`Compressor::pack_tensor`].
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    /// Cap the size an envelope may declare for its original payload.
    pub fn with_max_unpacked_bytes(mut self, max_unpacked_bytes: usize) -> Self {
        self.max_unpacked_bytes = max_unpacked_bytes;
        self
    }

    /// Algorithm used for packing
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Tensor precision used for packing
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Compress `data` into an envelope.
    pub fn pack(&self, data: &[u8]) -> Result<Vec<u8>> {
        let body = match self.algorithm {
            Algorithm::None => data.to_vec(),
            Algorithm::Brotli => self.brotli.compress(data)?,
            Algorithm::Zlib => self.zlib.compress(data)?,
        };

        let mut out = Vec::with_capacity(body.len() + 16);
        out.extend_from_slice(ENVELOPE_MAGIC);
        out.push(self.algorithm.tag());
        write_varint(&mut out, data.len() as u64);
        out.extend_from_slice(&crc32fast::hash(data).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Open an envelope. The algorithm comes from the envelope, not from
    /// this compressor's configuration.
    pub fn unpack(&self, packed: &[u8]) -> Result<Vec<u8>> {
        let rest = packed
            .strip_prefix(ENVELOPE_MAGIC.as_slice())
            .ok_or_else(|| OffloadError::Decompression("Missing envelope magic".to_string()))?;
        let (&tag, rest) = rest
            .split_first()
            .ok_or_else(|| OffloadError::Decompression("Truncated envelope".to_string()))?;
        let algorithm = Algorithm::from_tag(tag)
            .ok_or_else(|| OffloadError::Decompression(format!("Unknown algorithm tag {tag}")))?;
        let (original_len, used) =
            read_varint(rest).map_err(|e| OffloadError::Decompression(e.to_string()))?;
        let rest = &rest[used..];
        if rest.len() < 4 {
            return Err(OffloadError::Decompression("Truncated envelope".to_string()));
        }
        let (crc, body) = rest.split_at(4);
        let expected_crc = u32::from_be_bytes([crc[0], crc[1], crc[2], crc[3]]);

        let limit = usize::try_from(original_len)
            .ok()
            .filter(|&len| len <= self.max_unpacked_bytes)
            .ok_or_else(|| {
                OffloadError::Decompression(format!(
                    "Envelope declares {original_len} bytes, limit is {}",
                    self.max_unpacked_bytes
                ))
            })?;

        // Backends stop reading one byte past the declared length
        let data = match algorithm {
            Algorithm::None => body.to_vec(),
            Algorithm::Brotli => self.brotli.decompress(body, limit)?,
            Algorithm::Zlib => self.zlib.decompress(body, limit)?,
        };

        if data.len() as u64 != original_len {
            return Err(OffloadError::Decompression(format!(
                "Length mismatch: envelope says {original_len}, got {}",
                data.len()
            )));
        }
        if crc32fast::hash(&data) != expected_crc {
            return Err(OffloadError::Decompression("Checksum mismatch".to_string()));
        }
        Ok(data)
    }

    /// Encode a tensor at the configured precision and pack it.
    pub fn pack_tensor(&self, tensor: &Tensor) -> Result<Vec<u8>> {
        self.pack(&tensor.to_bytes(self.precision))
    }
}

/// Check whether `data` starts with a compression envelope.
pub fn is_packed(data: &[u8]) -> bool {
    data.starts_with(ENVELOPE_MAGIC) && data.len() > ENVELOPE_MAGIC.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [Algorithm; 3] = [Algorithm::None, Algorithm::Brotli, Algorithm::Zlib];

    #[test]
    fn test_unpack_detects_algorithm() {
        let data = b"relu relu relu relu relu relu".to_vec();
        let packed = Compressor::new(Algorithm::Zlib).pack(&data).unwrap();
        // A brotli-configured compressor still opens a zlib envelope.
        let unpacked = Compressor::new(Algorithm::Brotli).unpack(&packed).unwrap();
        assert_eq!(unpacked, data);
        assert!(is_packed(&packed));
    }

    #[test]
    fn test_corruption_detected() {
        let compressor = Compressor::new(Algorithm::None);
        let mut packed = compressor.pack(b"abcdef").unwrap();
        let last = packed.len() - 1;
        packed[last] ^= 0xFF;
        assert!(matches!(
            compressor.unpack(&packed),
            Err(OffloadError::Decompression(_))
        ));
    }

    #[test]
    fn test_truncation_detected() {
        for algo in ALL {
            let compressor = Compressor::new(algo);
            let data: Vec<u8> = (0..2048u32).map(|i| (i * 7 % 251) as u8).collect();
            let packed = compressor.pack(&data).unwrap();
            let cut = &packed[..packed.len() - packed.len() / 3];
            assert!(compressor.unpack(cut).is_err(), "{algo}");
        }
    }

    #[test]
    fn test_not_an_envelope() {
        let compressor = Compressor::default();
        assert!(compressor.unpack(b"plain bytes").is_err());
        assert!(compressor.unpack(b"OFZ").is_err());
        assert!(compressor.unpack(b"OFZ\x07\x00\x00\x00\x00\x00").is_err());
    }

    #[test]
    fn test_tensor_full_precision_exact() {
        let tensor = Tensor::new(vec![1, 4, 2], (0..8).map(|i| i as f32 / 3.0).collect()).unwrap();
        let compressor = Compressor::new(Algorithm::Brotli);
        let packed = compressor.pack_tensor(&tensor).unwrap();
        let raw = compressor.unpack(&packed).unwrap();
        assert_eq!(Tensor::from_bytes(&raw).unwrap(), tensor);
    }

    #[test]
    fn test_tensor_half_precision_is_opt_in() {
        assert_eq!(Compressor::default().precision(), Precision::Full);
        let tensor = Tensor::new(vec![3], vec![1.0, 0.5, 0.25]).unwrap();
        let compressor = Compressor::new(Algorithm::Zlib).with_precision(Precision::Half);
        let packed = compressor.pack_tensor(&tensor).unwrap();
        // These values are exactly representable in f16.
        let raw = compressor.unpack(&packed).unwrap();
        assert_eq!(Tensor::from_bytes(&raw).unwrap(), tensor);
    }

    /// Envelope with a forged `original_len` around a real compressed body.
    fn forged(algorithm: Algorithm, declared: u64, data: &[u8]) -> Vec<u8> {
        let packed = Compressor::new(algorithm).pack(data).unwrap();
        let (_, used) = read_varint(&packed[4..]).unwrap();
        let mut out = packed[..4].to_vec();
        write_varint(&mut out, declared);
        out.extend_from_slice(&packed[4 + used..]);
        out
    }

    #[test]
    fn test_inflation_stops_at_declared_length() {
        let zeros = vec![0u8; 4 * 1024 * 1024];
        for algo in [Algorithm::Brotli, Algorithm::Zlib] {
            let packed = forged(algo, 1, &zeros);
            assert!(packed.len() < zeros.len() / 100);
            match Compressor::default().unpack(&packed) {
                Err(OffloadError::Decompression(msg)) => {
                    assert!(msg.contains("exceeds 1 bytes"), "{algo}: {msg}")
                },
                other => panic!("{algo}: expected decompression error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_declared_length_over_limit_rejected() {
        let data = vec![7u8; 2048];
        let compressor = Compressor::new(Algorithm::Zlib).with_max_unpacked_bytes(1024);
        let packed = compressor.pack(&data).unwrap();
        assert!(matches!(
            compressor.unpack(&packed),
            Err(OffloadError::Decompression(msg)) if msg.contains("limit is 1024")
        ));

        let forged = forged(Algorithm::Zlib, u64::MAX, &data);
        assert!(Compressor::default().unpack(&forged).is_err());

        // At the limit is fine
        let compressor = compressor.with_max_unpacked_bytes(data.len());
        assert_eq!(compressor.unpack(&packed).unwrap(), data);
    }

    proptest! {
        #[test]
        fn prop_pack_unpack_roundtrip(data in prop::collection::vec(any::<u8>(), 0..4096), algo_idx in 0usize..3) {
            let compressor = Compressor::new(ALL[algo_idx]);
            let packed = compressor.pack(&data).unwrap();
            prop_assert_eq!(compressor.unpack(&packed).unwrap(), data);
        }
    }
}
