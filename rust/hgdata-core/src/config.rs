// rust/hgdata-core/src/config.rs

//! Configuration management.
//!
//! Every knob of the store, saver, parser and prefetch pool lives here and
//! is passed to constructors explicitly. Configuration can be parsed from
//! TOML, overridden from `HGD_*` environment variables, and validated.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{DataError, Result};

/// Names of the supported chunk compression algorithms.
pub const COMPRESSION_ALGORITHMS: [&str; 3] = ["none", "lz4", "zstd"];

// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub storage: StorageConfig,
    pub saver: SaverConfig,
    pub parser: ParserConfig,
    pub prefetch: PrefetchConfig,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Directory that holds one sub-directory per store.
    pub base_path: PathBuf,
    // Buffer size in bytes for I/O operations.
    pub buffer_size: usize,
    // Whether to use memory-mapped I/O for reads.
    pub use_mmap: bool,
    // File size threshold (bytes) above which to use mmap.
    pub mmap_threshold: u64,
    /// Whether chunk checksums are verified on every read.
    pub verify_checksums: bool,
}

/// Producer-side options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaverConfig {
    /// Chunk compression: "none", "lz4" or "zstd".
    pub compression: String,
    /// Compression level (zstd only).
    pub compression_level: i32,
    /// Target uncompressed size of one chunk in bytes.
    pub chunk_bytes: usize,
    /// Replace an existing store instead of failing.
    pub overwrite: bool,
}

/// Consumer-side options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Group to read. When unset, the store must contain exactly one group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Samples per batch.
    pub batch_size: usize,
    /// Drop the short batch at the end of each epoch.
    pub drop_last: bool,
    /// Reshuffle sample order every epoch.
    pub shuffle: bool,
    /// Seed for shuffling and preprocessing randomness.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Background batch preparation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Number of worker threads; 0 prepares batches on the caller's thread.
    pub workers: usize,
    /// Maximum number of batches planned ahead of the consumer.
    pub depth: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./data"),
            buffer_size: 64 * 1024, // 64 KB
            use_mmap: true,
            mmap_threshold: 1024 * 1024, // 1 MB
            verify_checksums: true,
        }
    }
}

impl Default for SaverConfig {
    fn default() -> Self {
        Self {
            compression: "none".to_string(),
            compression_level: 3,
            chunk_bytes: 1024 * 1024, // 1 MB
            overwrite: false,
        }
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            group: None,
            batch_size: 32,
            drop_last: false,
            shuffle: false,
            seed: None,
        }
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            depth: 4,
        }
    }
}

impl SaverConfig {
    /// Validate saver configuration.
    pub fn validate(&self) -> Result<()> {
        if !COMPRESSION_ALGORITHMS.contains(&self.compression.as_str()) {
            return Err(DataError::config(format!(
                "saver.compression must be one of: {}",
                COMPRESSION_ALGORITHMS.join(", ")
            )));
        }
        if self.chunk_bytes == 0 {
            return Err(DataError::config("saver.chunk_bytes must be greater than 0"));
        }
        Ok(())
    }
}

impl ParserConfig {
    /// Creates a parser configuration with the given batch size.
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Default::default()
        }
    }

    /// Validate parser configuration.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DataError::config("parser.batch_size must be greater than 0"));
        }
        if matches!(&self.group, Some(g) if g.is_empty()) {
            return Err(DataError::config("parser.group must not be empty"));
        }
        Ok(())
    }
}

impl PrefetchConfig {
    /// Validate prefetch configuration.
    pub fn validate(&self) -> Result<()> {
        if self.workers > 0 && self.depth == 0 {
            return Err(DataError::config(
                "prefetch.depth must be greater than 0 when workers are enabled",
            ));
        }
        Ok(())
    }
}

impl FromStr for DataConfig {
    type Err = DataError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| DataError::config_with_source("failed to parse TOML config", e))
    }
}

impl DataConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DataError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Variables are prefixed with `HGD_` and name the section and the field:
    // - `HGD_STORAGE_BASE_PATH` overrides `storage.base_path`
    // - `HGD_SAVER_COMPRESSION` overrides `saver.compression`
    // - `HGD_PARSER_BATCH_SIZE` overrides `parser.batch_size`
    // - `HGD_PREFETCH_WORKERS` overrides `prefetch.workers`
    //
    // Values that fail to parse are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Storage overrides
        if let Ok(val) = std::env::var("HGD_STORAGE_BASE_PATH") {
            self.storage.base_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("HGD_STORAGE_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.storage.buffer_size = v;
            }
        }
        if let Ok(val) = std::env::var("HGD_STORAGE_USE_MMAP") {
            if let Ok(v) = val.parse() {
                self.storage.use_mmap = v;
            }
        }
        if let Ok(val) = std::env::var("HGD_STORAGE_MMAP_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.storage.mmap_threshold = v;
            }
        }
        if let Ok(val) = std::env::var("HGD_STORAGE_VERIFY_CHECKSUMS") {
            if let Ok(v) = val.parse() {
                self.storage.verify_checksums = v;
            }
        }

        // Saver overrides
        if let Ok(val) = std::env::var("HGD_SAVER_COMPRESSION") {
            self.saver.compression = val.to_lowercase();
        }
        if let Ok(val) = std::env::var("HGD_SAVER_COMPRESSION_LEVEL") {
            if let Ok(v) = val.parse() {
                self.saver.compression_level = v;
            }
        }
        if let Ok(val) = std::env::var("HGD_SAVER_CHUNK_BYTES") {
            if let Ok(v) = val.parse() {
                self.saver.chunk_bytes = v;
            }
        }
        if let Ok(val) = std::env::var("HGD_SAVER_OVERWRITE") {
            if let Ok(v) = val.parse() {
                self.saver.overwrite = v;
            }
        }

        // Parser overrides
        if let Ok(val) = std::env::var("HGD_PARSER_GROUP") {
            self.parser.group = Some(val);
        }
        if let Ok(val) = std::env::var("HGD_PARSER_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.parser.batch_size = v;
            }
        }
        if let Ok(val) = std::env::var("HGD_PARSER_DROP_LAST") {
            if let Ok(v) = val.parse() {
                self.parser.drop_last = v;
            }
        }
        if let Ok(val) = std::env::var("HGD_PARSER_SHUFFLE") {
            if let Ok(v) = val.parse() {
                self.parser.shuffle = v;
            }
        }
        if let Ok(val) = std::env::var("HGD_PARSER_SEED") {
            if let Ok(v) = val.parse() {
                self.parser.seed = Some(v);
            }
        }

        // Prefetch overrides
        if let Ok(val) = std::env::var("HGD_PREFETCH_WORKERS") {
            if let Ok(v) = val.parse() {
                self.prefetch.workers = v;
            }
        }
        if let Ok(val) = std::env::var("HGD_PREFETCH_DEPTH") {
            if let Ok(v) = val.parse() {
                self.prefetch.depth = v;
            }
        }

        self
    }

    // Validate all configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.storage.buffer_size == 0 {
            return Err(DataError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }
        self.saver.validate()?;
        self.parser.validate()?;
        self.prefetch.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = DataConfig::default();

        assert_eq!(config.storage.base_path, PathBuf::from("./data"));
        assert_eq!(config.storage.buffer_size, 64 * 1024);
        assert!(config.storage.use_mmap);
        assert!(config.storage.verify_checksums);

        assert_eq!(config.saver.compression, "none");
        assert_eq!(config.saver.chunk_bytes, 1024 * 1024);
        assert!(!config.saver.overwrite);

        assert!(config.parser.group.is_none());
        assert_eq!(config.parser.batch_size, 32);
        assert!(!config.parser.drop_last);
        assert!(!config.parser.shuffle);
        assert!(config.parser.seed.is_none());

        assert_eq!(config.prefetch.workers, 0);
        assert_eq!(config.prefetch.depth, 4);
    }

    #[test]
    fn test_default_validates() {
        assert!(DataConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_str_partial() {
        let toml = r#"
            [parser]
            batch_size = 256
            group = "train"
        "#;
        let config: DataConfig = toml.parse().unwrap();

        assert_eq!(config.parser.batch_size, 256);
        assert_eq!(config.parser.group.as_deref(), Some("train"));
        // Other fields keep their defaults
        assert!(!config.parser.shuffle);
        assert_eq!(config.saver.compression, "none");
    }

    #[test]
    fn test_from_str_full() {
        let toml = r#"
            [storage]
            base_path = "/data/stores"
            buffer_size = 131072
            use_mmap = false
            mmap_threshold = 2097152
            verify_checksums = false

            [saver]
            compression = "zstd"
            compression_level = 5
            chunk_bytes = 65536
            overwrite = true

            [parser]
            group = "test"
            batch_size = 10
            drop_last = true
            shuffle = true
            seed = 42

            [prefetch]
            workers = 3
            depth = 8
        "#;

        let config: DataConfig = toml.parse().unwrap();

        assert_eq!(config.storage.base_path, PathBuf::from("/data/stores"));
        assert!(!config.storage.use_mmap);
        assert!(!config.storage.verify_checksums);
        assert_eq!(config.saver.compression, "zstd");
        assert_eq!(config.saver.compression_level, 5);
        assert_eq!(config.saver.chunk_bytes, 65536);
        assert!(config.saver.overwrite);
        assert_eq!(config.parser.group.as_deref(), Some("test"));
        assert_eq!(config.parser.batch_size, 10);
        assert!(config.parser.drop_last);
        assert!(config.parser.shuffle);
        assert_eq!(config.parser.seed, Some(42));
        assert_eq!(config.prefetch.workers, 3);
        assert_eq!(config.prefetch.depth, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<DataConfig, _> = "invalid = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [storage]
            base_path = "/tmp/stores"
            "#
        )
        .unwrap();

        let config = DataConfig::from_file(file.path()).unwrap();
        assert_eq!(config.storage.base_path, PathBuf::from("/tmp/stores"));
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[parser]\nbatch_size = 0").unwrap();
        assert!(DataConfig::from_file(file.path()).is_err());
        assert!(DataConfig::from_file("/nonexistent/config.toml").is_err());
    }

    #[test]
    fn test_validate_invalid_values() {
        let mut config = DataConfig::default();
        config.saver.compression = "gzip".to_string();
        assert!(config.validate().is_err());

        let mut config = DataConfig::default();
        config.saver.chunk_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = DataConfig::default();
        config.parser.group = Some(String::new());
        assert!(config.validate().is_err());

        let mut config = DataConfig::default();
        config.prefetch.workers = 2;
        config.prefetch.depth = 0;
        assert!(config.validate().is_err());

        let mut config = DataConfig::default();
        config.storage.buffer_size = 0;
        assert!(config.validate().is_err());
    }

    fn clear_hgd_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("HGD_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Environment variables are process-global, so all override checks live
    // in one test.
    #[test]
    fn test_env_overrides() {
        clear_hgd_env_vars();

        std::env::set_var("HGD_STORAGE_BASE_PATH", "/env/path");
        std::env::set_var("HGD_SAVER_COMPRESSION", "LZ4");
        std::env::set_var("HGD_PARSER_BATCH_SIZE", "128");
        std::env::set_var("HGD_PARSER_SEED", "7");
        std::env::set_var("HGD_PREFETCH_WORKERS", "2");

        let config = DataConfig::default().with_env_overrides();

        assert_eq!(config.storage.base_path, PathBuf::from("/env/path"));
        assert_eq!(config.saver.compression, "lz4");
        assert_eq!(config.parser.batch_size, 128);
        assert_eq!(config.parser.seed, Some(7));
        assert_eq!(config.prefetch.workers, 2);

        clear_hgd_env_vars();

        std::env::set_var("HGD_PARSER_BATCH_SIZE", "not_a_number");
        let config = DataConfig::default().with_env_overrides();
        assert_eq!(config.parser.batch_size, 32);

        clear_hgd_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut original = DataConfig::default();
        original.parser.seed = Some(99);
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: DataConfig = toml_str.parse().unwrap();

        assert_eq!(original.storage.base_path, parsed.storage.base_path);
        assert_eq!(original.parser.seed, parsed.parser.seed);
        assert_eq!(original.saver.compression, parsed.saver.compression);
    }
}
