// rust/hgdata-core/src/lib.rs

//! Hierarchical Data - Core Library
//!
//! This crate stores named n-dimensional arrays in groups on disk and feeds
//! them back as training batches. It provides the store format, a chunked
//! [`Saver`], and a [`Parser`] that cycles over epochs with optional
//! shuffling, per-sample preprocessing and background prefetching.

pub mod array;
pub mod config;
pub mod error;
pub mod parser;
pub mod saver;
pub mod storage;
pub mod store;

// Re-export commonly used types for convenience
pub use array::{ArrayData, Dtype, Element, FieldSpec};
pub use config::DataConfig;
pub use error::{BoxError, DataError, Result};
pub use storage::{LocalStorage, MemoryStorage, ObjectMeta, StorageBackend, StorageReader, StorageWriter};

pub use store::{Compression, Store, StoreOptions, StoreWriter, WriteMode};

pub use saver::{save_store, SaveSummary, Saver};

pub use parser::{Batch, BatchStream, FnPreprocessor, Parser, Preprocessor, SampleContext};
