// rust/hgdata-core/src/store/codec.rs

//! Chunk compression and checksums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;
use std::str::FromStr;

use twox_hash::XxHash64;

use crate::error::{DataError, Result};

/// Compression applied to every chunk of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Compression {
    #[default]
    None,
    Lz4,
    /// Zstandard at the given level.
    Zstd(i32),
}

impl Compression {
    /// Builds a compression setting from its configured name and level.
    pub fn from_config(name: &str, level: i32) -> Result<Self> {
        match name.parse()? {
            Compression::Zstd(_) => Ok(Compression::Zstd(level)),
            other => Ok(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Zstd(_) => "zstd",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Compression::None)
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Compression::Zstd(level) => zstd::encode_all(data, *level)
                .map_err(|e| DataError::format(format!("zstd compression failed: {e}"))),
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| DataError::format(format!("lz4 decompression failed: {e}"))),
            Compression::Zstd(_) => zstd::decode_all(data)
                .map_err(|e| DataError::format(format!("zstd decompression failed: {e}"))),
        }
    }
}

impl FromStr for Compression {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd(3)),
            other => Err(DataError::config(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::Zstd(level) => write!(f, "zstd({level})"),
            other => f.write_str(other.name()),
        }
    }
}

/// XXHash64 checksum of `data`.
pub fn checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> Vec<u8> {
        // Repetitive so every codec actually shrinks it.
        (0..4096u32).map(|i| (i % 17) as u8).collect()
    }

    #[test]
    fn test_all_codecs_restore_input() {
        let data = sample_data();
        for compression in [Compression::None, Compression::Lz4, Compression::Zstd(3)] {
            let stored = compression.compress(&data).unwrap();
            if !compression.is_none() {
                assert!(stored.len() < data.len(), "{compression} did not compress");
            }
            assert_eq!(compression.decompress(&stored).unwrap(), data);
        }
    }

    #[test]
    fn test_corrupt_input_is_format_error() {
        let err = Compression::Zstd(1).decompress(b"not zstd").unwrap_err();
        assert!(matches!(err, DataError::Format { .. }));
    }

    #[test]
    fn test_from_config() {
        assert_eq!(
            Compression::from_config("zstd", 9).unwrap(),
            Compression::Zstd(9)
        );
        assert_eq!(Compression::from_config("lz4", 9).unwrap(), Compression::Lz4);
        assert!(Compression::from_config("gzip", 1).is_err());
    }

    #[test]
    fn test_checksum_is_stable() {
        assert_eq!(checksum(b"abc"), checksum(b"abc"));
        assert_ne!(checksum(b"abc"), checksum(b"abd"));
    }
}
