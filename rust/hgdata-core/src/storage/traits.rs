// rust/hgdata-core/src/storage/traits.rs

//! Storage abstraction traits.
//!
//! Stores never touch the filesystem directly; they go through these traits
//! so the same store code runs against local disk or memory.

use std::io::{Read, Seek, Write};
use std::path::Path;

use crate::error::Result;

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Size of the object in bytes.
    pub size: u64,
    /// Whether this object is a directory.
    pub is_dir: bool,
}

/// A handle for reading from storage.
pub trait StorageReader: Read + Seek + Send {
    /// Returns the total size of the object in bytes.
    fn size(&self) -> u64;

    /// Reads exactly `length` bytes starting at `start`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the range is out of bounds.
    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>>;
}

/// A handle for writing to storage.
pub trait StorageWriter: Write + Send {
    /// Flushes buffered bytes and forces them to durable storage.
    ///
    /// The writer stays usable afterwards.
    fn sync(&mut self) -> Result<()>;

    /// Finishes the write operation, ensuring all data is persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or sync fails.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// The core storage backend trait.
///
/// # Object Safety
///
/// This trait is object-safe and can be used with `Arc<dyn StorageBackend>`.
pub trait StorageBackend: Send + Sync {
    /// Checks if an object exists at the given path.
    fn exists(&self, path: &Path) -> Result<bool>;

    /// Retrieves metadata for an object.
    ///
    /// # Errors
    ///
    /// Returns an error if the object doesn't exist or metadata cannot be read.
    fn metadata(&self, path: &Path) -> Result<ObjectMeta>;

    /// Opens an object for reading.
    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>>;

    /// Opens an object for writing, truncating any existing content.
    ///
    /// Parent directories will be created if they don't exist.
    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;

    /// Opens an object for appending, creating it if it doesn't exist.
    fn open_append(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;

    /// Creates an empty object only if nothing exists at `path`.
    ///
    /// Returns `false` when the object already exists. The check and the
    /// creation are a single atomic step, which makes this usable as a lock.
    fn create_exclusive(&self, path: &Path) -> Result<bool>;

    /// Deletes an object or a directory tree.
    fn delete(&self, path: &Path) -> Result<()>;

    /// Renames an object or directory from one path to another.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Creates a directory and all parent directories.
    fn create_dir_all(&self, path: &Path) -> Result<()>;
}
