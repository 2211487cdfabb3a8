// rust/hgdata-core/src/storage/mod.rs

//! Storage abstraction for hierarchical array stores.
//!
//! Stores are built on top of a small object-storage interface so the same
//! store code can run against the local filesystem or against memory.
//!
//! # Example
//!
//! ```no_run
//! use hgdata_core::config::StorageConfig;
//! use hgdata_core::storage::{LocalStorage, StorageBackend};
//! use std::io::Write;
//! use std::path::Path;
//!
//! let config = StorageConfig::default();
//! let storage = LocalStorage::new(&config).unwrap();
//!
//! let mut writer = storage.open_write(Path::new("example.bin")).unwrap();
//! writer.write_all(b"Hello, world!").unwrap();
//! writer.finish().unwrap();
//!
//! let mut reader = storage.open_read(Path::new("example.bin")).unwrap();
//! let hello = reader.read_range(0, 5).unwrap();
//! assert_eq!(hello, b"Hello");
//! ```

mod local;
mod memory;
mod traits;

pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use traits::{ObjectMeta, StorageBackend, StorageReader, StorageWriter};
