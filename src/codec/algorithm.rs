//! Compression algorithm selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{OffloadError, Result};

/// Available compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Stored as-is inside the envelope (checksum still applies)
    None,
    /// Brotli (high ratio, slower)
    #[default]
    Brotli,
    /// Zlib/deflate (fast, moderate ratio)
    Zlib,
}

impl Algorithm {
    /// Envelope tag byte for this algorithm
    pub fn tag(&self) -> u8 {
        match self {
            Algorithm::None => 0,
            Algorithm::Brotli => 1,
            Algorithm::Zlib => 2,
        }
    }

    /// Parse algorithm from an envelope tag byte
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Algorithm::None),
            1 => Some(Algorithm::Brotli),
            2 => Some(Algorithm::Zlib),
            _ => None,
        }
    }

    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::None => "NONE",
            Algorithm::Brotli => "BROTLI",
            Algorithm::Zlib => "ZLIB",
        }
    }

    /// Highest accepted level for this algorithm
    pub fn max_level(&self) -> u32 {
        match self {
            Algorithm::None => 0,
            Algorithm::Brotli => 11,
            Algorithm::Zlib => 9,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Algorithm {
    type Err = OffloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" | "stored" => Ok(Algorithm::None),
            "brotli" | "br" => Ok(Algorithm::Brotli),
            "zlib" | "deflate" => Ok(Algorithm::Zlib),
            _ => Err(OffloadError::Config(format!("Unknown algorithm: {s}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_stable() {
        for algo in [Algorithm::None, Algorithm::Brotli, Algorithm::Zlib] {
            assert_eq!(Algorithm::from_tag(algo.tag()), Some(algo));
        }
        assert_eq!(Algorithm::from_tag(9), None);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("BR".parse::<Algorithm>().unwrap(), Algorithm::Brotli);
        assert_eq!("deflate".parse::<Algorithm>().unwrap(), Algorithm::Zlib);
        assert!("lz77".parse::<Algorithm>().is_err());
    }
}
