// rust/hgdata-core/src/store/writer.rs

//! Single-writer handle for building and extending stores.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::array::{ArrayData, FieldSpec};
use crate::error::{DataError, Result};
use crate::storage::{StorageBackend, StorageWriter};

use super::codec::{checksum, Compression};
use super::format::{ChunkInfo, FieldManifest, StoreManifest};
use super::{
    commit_manifest, data_path, lock_path, read_manifest, retired_path, staging_path,
    validate_group_name, validate_name,
};

/// How a [`StoreWriter`] treats an existing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Build a new store; fails if one already exists.
    Create,
    /// Build a new store that replaces any existing one on close.
    Overwrite,
    /// Extend an existing store in place.
    Append,
}

/// The lock object of a store, removed when dropped.
struct StoreLock {
    storage: Arc<dyn StorageBackend>,
    path: PathBuf,
}

impl StoreLock {
    fn acquire(storage: &Arc<dyn StorageBackend>, name: &str) -> Result<Self> {
        let path = lock_path(name);
        if !storage.create_exclusive(&path)? {
            return Err(DataError::store_access(
                name,
                format!("locked by another writer ({})", path.display()),
            ));
        }
        Ok(Self {
            storage: Arc::clone(storage),
            path,
        })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = self.storage.delete(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "Failed to release store lock");
        }
    }
}

type FieldKey = (String, String);

/// Exclusive write access to a store.
///
/// In [`WriteMode::Create`] and [`WriteMode::Overwrite`] the store is built
/// in a staging directory and published by [`close`](Self::close); readers
/// keep seeing the previous state until then. In [`WriteMode::Append`] new
/// chunks go after the current end of each data file and become visible on
/// every [`flush`](Self::flush).
///
/// Dropping a writer without closing it abandons uncommitted changes.
pub struct StoreWriter {
    storage: Arc<dyn StorageBackend>,
    name: String,
    mode: WriteMode,
    root: PathBuf,
    manifest: StoreManifest,
    compression: Compression,
    files: HashMap<FieldKey, Box<dyn StorageWriter>>,
    file_ends: HashMap<FieldKey, u64>,
    dirty: bool,
    closed: bool,
    lock: Option<StoreLock>,
}

impl std::fmt::Debug for StoreWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreWriter")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("generation", &self.manifest.generation)
            .field("closed", &self.closed)
            .finish()
    }
}

impl StoreWriter {
    /// Opens store `name` for writing.
    ///
    /// # Errors
    ///
    /// - `StoreAccess` if another writer holds the lock
    /// - `StoreExists` for `Create` when the store already exists
    /// - `StoreNotFound` for `Append` when the store does not exist
    pub fn open(storage: Arc<dyn StorageBackend>, name: &str, mode: WriteMode) -> Result<Self> {
        validate_name("store", name)?;
        let lock = StoreLock::acquire(&storage, name)?;

        let final_root = PathBuf::from(name);
        recover_interrupted_publish(storage.as_ref(), name)?;

        let (root, manifest) = match mode {
            WriteMode::Create | WriteMode::Overwrite => {
                if mode == WriteMode::Create && storage.exists(&final_root)? {
                    return Err(DataError::store_exists(name));
                }

                let staging = staging_path(name);
                if storage.exists(&staging)? {
                    warn!(store = name, "Removing stale staging directory");
                    storage.delete(&staging)?;
                }
                storage.create_dir_all(&staging)?;

                // Carry the generation forward so readers can tell stores apart.
                let generation = match read_manifest(storage.as_ref(), &final_root) {
                    Ok(Some(previous)) => previous.generation,
                    _ => 0,
                };
                let manifest = StoreManifest {
                    generation,
                    ..Default::default()
                };
                (staging, manifest)
            }
            WriteMode::Append => {
                let manifest = read_manifest(storage.as_ref(), &final_root)?
                    .ok_or_else(|| DataError::store_not_found(name))?;
                (final_root, manifest)
            }
        };

        info!(store = name, ?mode, "Opened store for writing");

        Ok(Self {
            storage,
            name: name.to_string(),
            mode,
            root,
            manifest,
            compression: Compression::None,
            files: HashMap::new(),
            file_ends: HashMap::new(),
            dirty: false,
            closed: false,
            lock: Some(lock),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Compression for fields created from now on.
    pub fn set_compression(&mut self, compression: Compression) {
        self.compression = compression;
    }

    /// Creates group `name` if it does not exist.
    pub fn group(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        validate_group_name(name)?;
        if !self.manifest.groups.contains_key(name) {
            self.manifest.groups.insert(name.to_string(), Default::default());
            self.dirty = true;
        }
        Ok(())
    }

    /// Creates an empty field, creating its group if needed.
    ///
    /// Creating a field that already exists with the same spec is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the field exists with a different spec.
    pub fn create_field(&mut self, group: &str, field: &str, spec: FieldSpec) -> Result<()> {
        validate_name("field", field)?;
        self.group(group)?;

        let fields = &mut self
            .manifest
            .groups
            .get_mut(group)
            .ok_or_else(|| DataError::group_not_found(&self.name, group))?
            .fields;

        match fields.get(field) {
            Some(existing) if existing.spec == spec => Ok(()),
            Some(existing) => Err(DataError::shape_mismatch(format!(
                "field '{group}/{field}' is {}, cannot redefine as {spec}",
                existing.spec
            ))),
            None => {
                debug!(group, field, %spec, compression = %self.compression, "Created field");
                fields.insert(field.to_string(), FieldManifest::new(spec, self.compression));
                self.dirty = true;
                Ok(())
            }
        }
    }

    /// Returns the spec and current (uncommitted) length of a field.
    pub fn field(&self, group: &str, field: &str) -> Option<(&FieldSpec, u64)> {
        self.manifest
            .groups
            .get(group)
            .and_then(|g| g.fields.get(field))
            .map(|f| (&f.spec, f.len))
    }

    /// Appends the samples of `data` as one chunk and returns the new field
    /// length.
    pub fn append(&mut self, group: &str, field: &str, data: &ArrayData) -> Result<u64> {
        let spec = data.field_spec()?;
        match self.field(group, field) {
            Some((existing, _)) if *existing != spec => {
                return Err(DataError::shape_mismatch(format!(
                    "field '{group}/{field}' is {existing}, got samples of {spec}"
                )));
            }
            Some(_) => {}
            None => {
                if !self.manifest.groups.contains_key(group) {
                    return Err(DataError::group_not_found(&self.name, group));
                }
                return Err(DataError::field_not_found(group, field));
            }
        }
        self.append_bytes(group, field, &data.to_le_bytes(), data.num_samples() as u64)
    }

    /// Appends `samples` encoded samples as one chunk and returns the new
    /// field length.
    pub fn append_bytes(
        &mut self,
        group: &str,
        field: &str,
        bytes: &[u8],
        samples: u64,
    ) -> Result<u64> {
        self.ensure_open()?;

        let group_manifest = self
            .manifest
            .groups
            .get_mut(group)
            .ok_or_else(|| DataError::group_not_found(&self.name, group))?;
        let field_manifest = group_manifest
            .fields
            .get_mut(field)
            .ok_or_else(|| DataError::field_not_found(group, field))?;

        let expected = samples * field_manifest.spec.sample_bytes() as u64;
        if bytes.len() as u64 != expected {
            return Err(DataError::shape_mismatch(format!(
                "{} bytes do not hold {samples} samples of {} ({expected} bytes)",
                bytes.len(),
                field_manifest.spec
            )));
        }
        if samples == 0 {
            return Ok(field_manifest.len);
        }

        let stored = field_manifest.compression.compress(bytes)?;
        let key = (group.to_string(), field.to_string());
        let path = data_path(&self.root, group, field);

        if !self.files.contains_key(&key) {
            // Append after whatever is physically in the file, including
            // bytes of chunks that were never committed.
            let end = if self.storage.exists(&path)? {
                self.storage.metadata(&path)?.size
            } else {
                0
            };
            let writer = self.storage.open_append(&path)?;
            self.files.insert(key.clone(), writer);
            self.file_ends.insert(key.clone(), end);
        }

        let offset = self.file_ends.get(&key).copied().unwrap_or(0);
        if let Some(writer) = self.files.get_mut(&key) {
            writer.write_all(&stored).map_err(|e| {
                DataError::storage_with_source(&path, "failed to write chunk", e)
            })?;
        }
        self.file_ends.insert(key, offset + stored.len() as u64);

        field_manifest.chunks.push(ChunkInfo {
            offset,
            stored_len: stored.len() as u64,
            first_sample: field_manifest.len,
            samples,
            checksum: checksum(bytes),
        });
        field_manifest.len += samples;
        self.dirty = true;

        debug!(
            group,
            field,
            samples,
            stored = stored.len(),
            len = field_manifest.len,
            "Wrote chunk"
        );
        Ok(field_manifest.len)
    }

    /// Syncs data files and commits the manifest.
    ///
    /// In append mode this makes the appended samples visible to readers
    /// that open the store afterwards.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.dirty {
            return Ok(());
        }

        for writer in self.files.values_mut() {
            writer.sync()?;
        }

        self.manifest.generation += 1;
        commit_manifest(self.storage.as_ref(), &self.root, &self.manifest)?;
        self.dirty = false;

        debug!(
            store = %self.name,
            generation = self.manifest.generation,
            "Committed manifest"
        );
        Ok(())
    }

    /// Commits outstanding changes, publishes a staged store and releases the
    /// lock. Calling `close` again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        // A staged store always gets a manifest, even when nothing was written.
        if self.mode != WriteMode::Append {
            self.dirty = true;
        }
        self.flush()?;

        for (_, writer) in self.files.drain() {
            writer.finish()?;
        }
        self.file_ends.clear();

        if self.mode != WriteMode::Append {
            self.publish()?;
        }

        self.closed = true;
        self.lock = None;
        info!(
            store = %self.name,
            generation = self.manifest.generation,
            "Closed store writer"
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn publish(&mut self) -> Result<()> {
        let final_root = PathBuf::from(&self.name);
        let retired = retired_path(&self.name);

        let replaced = self.storage.exists(&final_root)?;
        if replaced {
            if self.storage.exists(&retired)? {
                self.storage.delete(&retired)?;
            }
            self.storage.rename(&final_root, &retired)?;
        }
        self.storage.rename(&self.root, &final_root)?;
        self.root = final_root;

        if replaced {
            if let Err(e) = self.storage.delete(&retired) {
                warn!(store = %self.name, error = %e, "Failed to remove replaced store");
            }
        }

        info!(store = %self.name, replaced, "Published store");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(DataError::closed(format!("writer for store '{}'", self.name)));
        }
        Ok(())
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Drop open data files before touching the directory they live in.
        self.files.clear();

        match self.mode {
            WriteMode::Create | WriteMode::Overwrite => {
                warn!(store = %self.name, "Store writer dropped without close; discarding staged store");
                if let Err(e) = self.storage.delete(&self.root) {
                    warn!(store = %self.name, error = %e, "Failed to remove staging directory");
                }
            }
            WriteMode::Append if self.dirty => {
                warn!(store = %self.name, "Store writer dropped with unflushed appends");
            }
            WriteMode::Append => {}
        }
    }
}

/// Puts a replaced store back if a previous publish stopped between its two
/// renames.
fn recover_interrupted_publish(storage: &dyn StorageBackend, name: &str) -> Result<()> {
    let final_root = PathBuf::from(name);
    let retired = retired_path(name);
    if !storage.exists(&retired)? {
        return Ok(());
    }
    if storage.exists(&final_root)? {
        warn!(store = name, "Removing leftover replaced store");
        storage.delete(&retired)
    } else {
        warn!(store = name, "Restoring store from interrupted publish");
        storage.rename(&retired, &final_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Dtype;
    use crate::store::{Store, StoreOptions};
    use crate::storage::MemoryStorage;
    use ndarray::{ArrayD, IxDyn};
    use std::path::Path;

    fn values(values: &[f64]) -> ArrayData {
        ArrayD::from_shape_vec(IxDyn(&[values.len(), 1]), values.to_vec())
            .unwrap()
            .into()
    }

    fn spec() -> FieldSpec {
        FieldSpec::new(Dtype::F64, vec![1])
    }

    fn setup() -> (MemoryStorage, Arc<dyn StorageBackend>) {
        let storage = MemoryStorage::new();
        let shared: Arc<dyn StorageBackend> = Arc::new(storage.clone());
        (storage, shared)
    }

    fn read_all(storage: &Arc<dyn StorageBackend>, field: &str) -> ArrayData {
        let store = Store::open(Arc::clone(storage), "s", &StoreOptions::default()).unwrap();
        let len = store.field_info("g", field).unwrap().len;
        store.read_array("g", field, 0, len).unwrap()
    }

    #[test]
    fn test_create_publishes_on_close() {
        let (memory, storage) = setup();
        let mut writer = StoreWriter::open(Arc::clone(&storage), "s", WriteMode::Create).unwrap();
        writer.create_field("g", "v", spec()).unwrap();
        assert_eq!(writer.append("g", "v", &values(&[1.0, 2.0])).unwrap(), 2);
        writer.flush().unwrap();

        // Flushed into staging, not visible yet.
        assert!(Store::open(Arc::clone(&storage), "s", &StoreOptions::default()).is_err());
        assert!(memory.get(".s.lock").is_some());

        writer.close().unwrap();
        writer.close().unwrap();

        assert_eq!(read_all(&storage, "v"), values(&[1.0, 2.0]));
        assert!(memory.get(".s.lock").is_none());
        assert!(!storage.exists(&staging_path("s")).unwrap());
    }

    #[test]
    fn test_lock_conflict() {
        let (_, storage) = setup();
        let _writer = StoreWriter::open(Arc::clone(&storage), "s", WriteMode::Create).unwrap();
        let err = StoreWriter::open(Arc::clone(&storage), "s", WriteMode::Overwrite).unwrap_err();
        assert!(matches!(err, DataError::StoreAccess { .. }));
    }

    #[test]
    fn test_create_on_existing_store() {
        let (_, storage) = setup();
        StoreWriter::open(Arc::clone(&storage), "s", WriteMode::Create)
            .unwrap()
            .close()
            .unwrap();

        let err = StoreWriter::open(Arc::clone(&storage), "s", WriteMode::Create).unwrap_err();
        assert!(matches!(err, DataError::StoreExists { .. }));
        // The failed open released the lock.
        assert!(StoreWriter::open(Arc::clone(&storage), "s", WriteMode::Overwrite).is_ok());
    }

    #[test]
    fn test_append_on_missing_store() {
        let (_, storage) = setup();
        let err = StoreWriter::open(storage, "s", WriteMode::Append).unwrap_err();
        assert!(matches!(err, DataError::StoreNotFound { .. }));
    }

    #[test]
    fn test_drop_without_close_keeps_previous_state() {
        let (_, storage) = setup();
        let mut writer = StoreWriter::open(Arc::clone(&storage), "s", WriteMode::Create).unwrap();
        writer.create_field("g", "v", spec()).unwrap();
        writer.append("g", "v", &values(&[1.0])).unwrap();
        writer.close().unwrap();

        let mut writer = StoreWriter::open(Arc::clone(&storage), "s", WriteMode::Overwrite).unwrap();
        writer.create_field("g", "v", spec()).unwrap();
        writer.append("g", "v", &values(&[9.0, 9.0])).unwrap();
        writer.flush().unwrap();
        drop(writer);

        assert_eq!(read_all(&storage, "v"), values(&[1.0]));
        assert!(!storage.exists(&staging_path("s")).unwrap());
        assert!(StoreWriter::open(storage, "s", WriteMode::Append).is_ok());
    }

    #[test]
    fn test_overwrite_replaces_store() {
        let (_, storage) = setup();
        let mut writer = StoreWriter::open(Arc::clone(&storage), "s", WriteMode::Create).unwrap();
        writer.create_field("g", "old", spec()).unwrap();
        writer.close().unwrap();

        let mut writer = StoreWriter::open(Arc::clone(&storage), "s", WriteMode::Overwrite).unwrap();
        writer.create_field("g", "new", spec()).unwrap();
        writer.append("g", "new", &values(&[3.0])).unwrap();
        writer.close().unwrap();

        let store = Store::open(Arc::clone(&storage), "s", &StoreOptions::default()).unwrap();
        assert_eq!(store.group("g").unwrap().field_names(), vec!["new"]);
        assert!(!storage.exists(&retired_path("s")).unwrap());
    }

    #[test]
    fn test_append_visible_after_flush() {
        let (_, storage) = setup();
        let mut writer = StoreWriter::open(Arc::clone(&storage), "s", WriteMode::Create).unwrap();
        writer.create_field("g", "v", spec()).unwrap();
        writer.append("g", "v", &values(&[1.0])).unwrap();
        writer.close().unwrap();

        let mut writer = StoreWriter::open(Arc::clone(&storage), "s", WriteMode::Append).unwrap();
        writer.append("g", "v", &values(&[2.0, 3.0])).unwrap();
        assert_eq!(read_all(&storage, "v"), values(&[1.0]));

        writer.flush().unwrap();
        assert_eq!(read_all(&storage, "v"), values(&[1.0, 2.0, 3.0]));

        // Unflushed appends are lost on drop; the committed state stays readable.
        writer.append("g", "v", &values(&[4.0])).unwrap();
        drop(writer);
        assert_eq!(read_all(&storage, "v"), values(&[1.0, 2.0, 3.0]));

        // A later append skips the orphaned bytes.
        let mut writer = StoreWriter::open(Arc::clone(&storage), "s", WriteMode::Append).unwrap();
        writer.append("g", "v", &values(&[5.0])).unwrap();
        writer.close().unwrap();
        assert_eq!(read_all(&storage, "v"), values(&[1.0, 2.0, 3.0, 5.0]));
    }

    #[test]
    fn test_field_spec_is_fixed() {
        let (_, storage) = setup();
        let mut writer = StoreWriter::open(storage, "s", WriteMode::Create).unwrap();
        writer.create_field("g", "v", spec()).unwrap();
        writer.create_field("g", "v", spec()).unwrap();

        let err = writer
            .create_field("g", "v", FieldSpec::new(Dtype::F32, vec![1]))
            .unwrap_err();
        assert!(matches!(err, DataError::ShapeMismatch { .. }));

        let wrong: ArrayData = ArrayD::<f64>::zeros(IxDyn(&[2, 3])).into();
        assert!(matches!(
            writer.append("g", "v", &wrong),
            Err(DataError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            writer.append("g", "missing", &values(&[1.0])),
            Err(DataError::FieldNotFound { .. })
        ));
        assert!(matches!(
            writer.append_bytes("g", "v", &[0u8; 7], 1),
            Err(DataError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_interrupted_publish_is_recovered() {
        let (memory, storage) = setup();
        let mut writer = StoreWriter::open(Arc::clone(&storage), "s", WriteMode::Create).unwrap();
        writer.create_field("g", "v", spec()).unwrap();
        writer.append("g", "v", &values(&[7.0])).unwrap();
        writer.close().unwrap();

        // Simulate a crash after the old store was moved aside.
        storage.rename(Path::new("s"), &retired_path("s")).unwrap();
        assert!(memory.get("s/MANIFEST").is_none());

        let writer = StoreWriter::open(Arc::clone(&storage), "s", WriteMode::Append).unwrap();
        drop(writer);
        assert_eq!(read_all(&storage, "v"), values(&[7.0]));
    }
}
