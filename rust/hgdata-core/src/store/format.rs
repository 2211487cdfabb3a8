// rust/hgdata-core/src/store/format.rs

//! Store manifest format.
//!
//! The manifest is the only mutable metadata of a store. It is written as:
//! ```text
//! +--------------------+
//! | Body length (u32)  |  <- little-endian
//! +--------------------+
//! | Body (bincode)     |  <- StoreManifest
//! +--------------------+
//! | Checksum (u64)     |  <- XXHash64 of the body, little-endian
//! +--------------------+
//! ```
//! Replacing the manifest file is the commit point of every write.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::array::FieldSpec;
use crate::error::{DataError, Result};

use super::codec::{checksum, Compression};

/// One run of consecutive samples stored as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Byte offset of the chunk in the field's data file.
    pub offset: u64,
    /// Length of the chunk as stored (after compression).
    pub stored_len: u64,
    /// Index of the first sample in the chunk.
    pub first_sample: u64,
    /// Number of samples in the chunk.
    pub samples: u64,
    /// XXHash64 of the uncompressed chunk bytes.
    pub checksum: u64,
}

impl ChunkInfo {
    pub fn end_sample(&self) -> u64 {
        self.first_sample + self.samples
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldManifest {
    pub spec: FieldSpec,
    /// Number of committed samples.
    pub len: u64,
    pub compression: Compression,
    pub chunks: Vec<ChunkInfo>,
}

impl FieldManifest {
    pub fn new(spec: FieldSpec, compression: Compression) -> Self {
        Self {
            spec,
            len: 0,
            compression,
            chunks: Vec::new(),
        }
    }

    /// Returns the index of the chunk holding `sample`.
    pub fn chunk_for(&self, sample: u64) -> Option<usize> {
        let idx = self
            .chunks
            .partition_point(|chunk| chunk.end_sample() <= sample);
        (idx < self.chunks.len()).then_some(idx)
    }

    /// Physical end of the data file as described by the chunk table.
    pub fn data_end(&self) -> u64 {
        self.chunks
            .iter()
            .map(|c| c.offset + c.stored_len)
            .max()
            .unwrap_or(0)
    }

    /// Total stored bytes.
    pub fn stored_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.stored_len).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupManifest {
    pub fields: BTreeMap<String, FieldManifest>,
}

/// Committed metadata of a whole store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreManifest {
    /// Magic bytes identifying a store manifest ("HGS1")
    pub magic: [u8; 4],
    /// Format version number
    pub version: u32,
    /// Incremented on every commit.
    pub generation: u64,
    pub groups: BTreeMap<String, GroupManifest>,
}

impl Default for StoreManifest {
    fn default() -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            generation: 0,
            groups: BTreeMap::new(),
        }
    }
}

impl StoreManifest {
    /// Magic bytes for store manifests
    pub const MAGIC: [u8; 4] = *b"HGS1";

    /// Current format version
    pub const VERSION: u32 = 1;

    /// Serializes the manifest with its length prefix and checksum trailer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)
            .map_err(|e| DataError::format(format!("failed to serialize manifest: {e}")))?;

        let mut out = Vec::with_capacity(4 + body.len() + 8);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&checksum(&body).to_le_bytes());
        Ok(out)
    }

    /// Parses and validates manifest bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(DataError::format("manifest too small"));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&data[..4]);
        let body_len = u32::from_le_bytes(len_bytes) as usize;

        if data.len() != 4 + body_len + 8 {
            return Err(DataError::format(format!(
                "manifest truncated: expected {} bytes, got {}",
                4 + body_len + 8,
                data.len()
            )));
        }

        let body = &data[4..4 + body_len];
        let mut sum_bytes = [0u8; 8];
        sum_bytes.copy_from_slice(&data[4 + body_len..]);
        let expected = u64::from_le_bytes(sum_bytes);
        let actual = checksum(body);
        if expected != actual {
            return Err(DataError::format(format!(
                "manifest checksum mismatch: expected {expected:#x}, got {actual:#x}"
            )));
        }

        let manifest: StoreManifest = bincode::deserialize(body)
            .map_err(|e| DataError::format(format!("failed to deserialize manifest: {e}")))?;

        if manifest.magic != Self::MAGIC {
            return Err(DataError::format(format!(
                "invalid magic bytes: expected {:?}, got {:?}",
                Self::MAGIC,
                manifest.magic
            )));
        }
        if manifest.version != Self::VERSION {
            return Err(DataError::format(format!(
                "unsupported version: expected {}, got {}",
                Self::VERSION,
                manifest.version
            )));
        }

        Ok(manifest)
    }
}
