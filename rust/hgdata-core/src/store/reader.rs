// rust/hgdata-core/src/store/reader.rs

//! Read handle for committed stores.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::array::{ArrayData, FieldSpec};
use crate::config::StorageConfig;
use crate::error::{DataError, Result};
use crate::storage::{StorageBackend, StorageReader};

use super::codec::{checksum, Compression};
use super::format::{ChunkInfo, FieldManifest, GroupManifest, StoreManifest};
use super::{data_path, read_manifest, validate_name};

/// Options for opening a store for reading.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Verify each chunk's checksum when it is read.
    pub verify_checksums: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            verify_checksums: true,
        }
    }
}

impl From<&StorageConfig> for StoreOptions {
    fn from(config: &StorageConfig) -> Self {
        Self {
            verify_checksums: config.verify_checksums,
        }
    }
}

/// Summary of a field as committed in the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    pub spec: FieldSpec,
    pub len: u64,
    pub compression: Compression,
    pub chunks: usize,
    pub stored_bytes: u64,
}

impl FieldInfo {
    fn new(name: &str, manifest: &FieldManifest) -> Self {
        Self {
            name: name.to_string(),
            spec: manifest.spec.clone(),
            len: manifest.len,
            compression: manifest.compression,
            chunks: manifest.chunks.len(),
            stored_bytes: manifest.stored_bytes(),
        }
    }
}

/// Result of [`Store::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub groups: usize,
    pub fields: usize,
    pub chunks: usize,
    pub samples: u64,
    pub stored_bytes: u64,
}

/// A view of one group of an open store.
#[derive(Clone, Copy)]
pub struct Group<'a> {
    store: &'a Store,
    name: &'a str,
    manifest: &'a GroupManifest,
}

impl<'a> Group<'a> {
    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn field_names(&self) -> Vec<&'a str> {
        self.manifest.fields.keys().map(String::as_str).collect()
    }

    pub fn fields(&self) -> Vec<FieldInfo> {
        self.manifest
            .fields
            .iter()
            .map(|(name, field)| FieldInfo::new(name, field))
            .collect()
    }

    pub fn field(&self, name: &str) -> Result<FieldInfo> {
        self.manifest
            .fields
            .get(name)
            .map(|field| FieldInfo::new(name, field))
            .ok_or_else(|| DataError::field_not_found(self.name, name))
    }

    /// Reads `count` samples of `field` starting at `start` as raw bytes.
    pub fn read_slice(&self, field: &str, start: u64, count: u64) -> Result<Vec<u8>> {
        self.store.read_slice(self.name, field, start, count)
    }

    /// Reads `count` samples of `field` starting at `start` as an array.
    pub fn read_array(&self, field: &str, start: u64, count: u64) -> Result<ArrayData> {
        self.store.read_array(self.name, field, start, count)
    }
}

struct CachedChunk {
    index: usize,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct FieldState {
    reader: Option<Box<dyn StorageReader>>,
    cache: Option<CachedChunk>,
}

impl FieldState {
    fn reader(
        &mut self,
        storage: &dyn StorageBackend,
        path: &Path,
    ) -> Result<&mut Box<dyn StorageReader>> {
        let reader = match self.reader.take() {
            Some(reader) => reader,
            None => storage.open_read(path)?,
        };
        Ok(self.reader.insert(reader))
    }
}

struct FieldHandle {
    path: PathBuf,
    state: Mutex<FieldState>,
}

impl FieldHandle {
    fn lock(&self) -> MutexGuard<'_, FieldState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Read-only handle on the committed state of a store.
///
/// The manifest is loaded and every data file opened once at open; later
/// commits by a writer, including an overwrite, are not observed until the
/// store is opened again. `Store` is `Send + Sync`. Reads of the same field
/// are serialized, reads of different fields are not.
pub struct Store {
    storage: Arc<dyn StorageBackend>,
    name: String,
    root: PathBuf,
    manifest: StoreManifest,
    options: StoreOptions,
    handles: Mutex<HashMap<(String, String), Arc<FieldHandle>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.name)
            .field("generation", &self.manifest.generation)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Store {
    /// Opens the committed state of store `name`.
    ///
    /// # Errors
    ///
    /// Returns `StoreNotFound` if nothing was ever committed under `name`,
    /// `Format` if the manifest is corrupt and `Storage` if the manifest or a
    /// data file cannot be read.
    pub fn open(
        storage: Arc<dyn StorageBackend>,
        name: &str,
        options: &StoreOptions,
    ) -> Result<Self> {
        validate_name("store", name)?;
        let root = PathBuf::from(name);

        let manifest = read_manifest(storage.as_ref(), &root)?
            .ok_or_else(|| DataError::store_not_found(name))?;

        // Data files are opened with the manifest; an overwrite published
        // later leaves this snapshot readable.
        let mut handles = HashMap::new();
        for (group_name, group) in &manifest.groups {
            for (field_name, field) in &group.fields {
                let path = data_path(&root, group_name, field_name);
                let mut state = FieldState::default();
                if !field.chunks.is_empty() {
                    state.reader = Some(storage.open_read(&path)?);
                }
                handles.insert(
                    (group_name.clone(), field_name.clone()),
                    Arc::new(FieldHandle {
                        path,
                        state: Mutex::new(state),
                    }),
                );
            }
        }

        info!(
            store = name,
            generation = manifest.generation,
            groups = manifest.groups.len(),
            "Opened store"
        );

        Ok(Self {
            storage,
            name: name.to_string(),
            root,
            manifest,
            options: options.clone(),
            handles: Mutex::new(handles),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Commit counter of the loaded manifest.
    pub fn generation(&self) -> u64 {
        self.manifest.generation
    }

    pub fn group_names(&self) -> Vec<&str> {
        self.manifest.groups.keys().map(String::as_str).collect()
    }

    pub fn group<'a>(&'a self, name: &'a str) -> Result<Group<'a>> {
        let manifest = self
            .manifest
            .groups
            .get(name)
            .ok_or_else(|| DataError::group_not_found(&self.name, name))?;
        Ok(Group {
            store: self,
            name,
            manifest,
        })
    }

    pub fn field_info(&self, group: &str, field: &str) -> Result<FieldInfo> {
        self.field_manifest(group, field)
            .map(|manifest| FieldInfo::new(field, manifest))
    }

    /// Checks that a field exists and its data file is open.
    pub fn bind_field(&self, group: &str, field: &str) -> Result<()> {
        self.ensure_open()?;
        let manifest = self.field_manifest(group, field)?;
        if manifest.chunks.is_empty() {
            return Ok(());
        }
        let handle = self.handle(group, field);
        let mut state = handle.lock();
        state.reader(self.storage.as_ref(), &handle.path)?;
        debug!(store = %self.name, group, field, "Bound field reader");
        Ok(())
    }

    /// Reads `count` samples of a field starting at `start` as raw
    /// little-endian bytes.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if `start + count` exceeds the field length.
    pub fn read_slice(&self, group: &str, field: &str, start: u64, count: u64) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let manifest = self.field_manifest(group, field)?;
        let end = start
            .checked_add(count)
            .filter(|&end| end <= manifest.len)
            .ok_or_else(|| DataError::out_of_range(field, start, count, manifest.len))?;

        let sample_bytes = manifest.spec.sample_bytes() as u64;
        let mut out = Vec::with_capacity((count * sample_bytes) as usize);
        if count == 0 {
            return Ok(out);
        }

        let handle = self.handle(group, field);
        let mut state = handle.lock();
        let direct = manifest.compression.is_none() && !self.options.verify_checksums;

        let mut position = start;
        while position < end {
            let index = manifest.chunk_for(position).ok_or_else(|| {
                DataError::format(format!(
                    "no chunk holds sample {position} of field '{group}/{field}'"
                ))
            })?;
            let chunk = &manifest.chunks[index];
            let until = end.min(chunk.end_sample());
            let lo = (position - chunk.first_sample) * sample_bytes;
            let hi = (until - chunk.first_sample) * sample_bytes;

            if direct {
                let reader = state.reader(self.storage.as_ref(), &handle.path)?;
                out.extend_from_slice(&reader.read_range(chunk.offset + lo, (hi - lo) as usize)?);
            } else {
                let bytes = self.load_chunk(&mut state, &handle.path, manifest, index, field)?;
                out.extend_from_slice(&bytes[lo as usize..hi as usize]);
            }
            position = until;
        }

        Ok(out)
    }

    /// Reads `count` samples of a field starting at `start` as an array of
    /// shape `[count, sample_shape..]`.
    pub fn read_array(&self, group: &str, field: &str, start: u64, count: u64) -> Result<ArrayData> {
        let bytes = self.read_slice(group, field, start, count)?;
        let spec = &self.field_manifest(group, field)?.spec;
        ArrayData::from_le_bytes(spec.dtype, &sample_axis_shape(spec, count), &bytes)
    }

    /// Reads arbitrary samples of a field, in the order given.
    ///
    /// Runs of consecutive indices are read with a single slice read.
    pub fn read_indices(&self, group: &str, field: &str, indices: &[u64]) -> Result<ArrayData> {
        let spec = &self.field_manifest(group, field)?.spec;
        let mut bytes = Vec::with_capacity(indices.len() * spec.sample_bytes());

        let mut i = 0;
        while i < indices.len() {
            let start = indices[i];
            let mut run = 1;
            while i + run < indices.len() && indices[i + run] == start + run as u64 {
                run += 1;
            }
            bytes.extend_from_slice(&self.read_slice(group, field, start, run as u64)?);
            i += run;
        }

        ArrayData::from_le_bytes(
            spec.dtype,
            &sample_axis_shape(spec, indices.len() as u64),
            &bytes,
        )
    }

    /// Checks every chunk of every field against its checksum.
    ///
    /// # Errors
    ///
    /// Returns a `Format` error naming the first inconsistent or corrupt
    /// chunk.
    pub fn verify(&self) -> Result<VerifyReport> {
        self.ensure_open()?;
        let mut report = VerifyReport {
            groups: self.manifest.groups.len(),
            ..Default::default()
        };

        for (group_name, group) in &self.manifest.groups {
            for (field_name, field) in &group.fields {
                verify_chunk_table(group_name, field_name, field)?;

                if !field.chunks.is_empty() {
                    let handle = self.handle(group_name, field_name);
                    let mut state = handle.lock();
                    let reader = state.reader(self.storage.as_ref(), &handle.path)?;
                    for (index, chunk) in field.chunks.iter().enumerate() {
                        let stored = reader.read_range(chunk.offset, chunk.stored_len as usize)?;
                        decode_chunk(field, chunk, index, &stored, true, field_name)?;
                        report.chunks += 1;
                    }
                }

                report.fields += 1;
                report.samples += field.len;
                report.stored_bytes += field.stored_bytes();
                debug!(group = %group_name, field = %field_name, chunks = field.chunks.len(), "Verified field");
            }
        }

        info!(
            store = %self.name,
            fields = report.fields,
            chunks = report.chunks,
            "Store verified"
        );
        Ok(report)
    }

    /// Closes the store. Later reads fail with `Closed`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.handles
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            debug!(store = %self.name, "Closed store");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DataError::closed(format!("store '{}'", self.name)));
        }
        Ok(())
    }

    fn field_manifest(&self, group: &str, field: &str) -> Result<&FieldManifest> {
        let group_manifest = self
            .manifest
            .groups
            .get(group)
            .ok_or_else(|| DataError::group_not_found(&self.name, group))?;
        group_manifest
            .fields
            .get(field)
            .ok_or_else(|| DataError::field_not_found(group, field))
    }

    fn handle(&self, group: &str, field: &str) -> Arc<FieldHandle> {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles
            .entry((group.to_string(), field.to_string()))
            .or_insert_with(|| {
                Arc::new(FieldHandle {
                    path: data_path(&self.root, group, field),
                    state: Mutex::new(FieldState::default()),
                })
            })
            .clone()
    }

    fn load_chunk<'s>(
        &self,
        state: &'s mut FieldState,
        path: &Path,
        manifest: &FieldManifest,
        index: usize,
        field: &str,
    ) -> Result<&'s [u8]> {
        let cached = match state.cache.take() {
            Some(cached) if cached.index == index => cached,
            _ => {
                let chunk = &manifest.chunks[index];
                let reader = state.reader(self.storage.as_ref(), path)?;
                let stored = reader.read_range(chunk.offset, chunk.stored_len as usize)?;
                let bytes = decode_chunk(
                    manifest,
                    chunk,
                    index,
                    &stored,
                    self.options.verify_checksums,
                    field,
                )?;
                CachedChunk { index, bytes }
            }
        };
        Ok(state.cache.insert(cached).bytes.as_slice())
    }
}

fn sample_axis_shape(spec: &FieldSpec, count: u64) -> Vec<usize> {
    let mut shape = Vec::with_capacity(spec.sample_shape.len() + 1);
    shape.push(count as usize);
    shape.extend_from_slice(&spec.sample_shape);
    shape
}

fn decode_chunk(
    manifest: &FieldManifest,
    chunk: &ChunkInfo,
    index: usize,
    stored: &[u8],
    verify: bool,
    field: &str,
) -> Result<Vec<u8>> {
    let bytes = manifest.compression.decompress(stored)?;

    let expected_len = chunk.samples * manifest.spec.sample_bytes() as u64;
    if bytes.len() as u64 != expected_len {
        return Err(DataError::format(format!(
            "chunk {index} of field '{field}' holds {} bytes, expected {expected_len}",
            bytes.len()
        )));
    }

    if verify {
        let actual = checksum(&bytes);
        if actual != chunk.checksum {
            return Err(DataError::format(format!(
                "checksum mismatch in chunk {index} of field '{field}': expected {:#x}, got {actual:#x}",
                chunk.checksum
            )));
        }
    }

    Ok(bytes)
}

fn verify_chunk_table(group: &str, field: &str, manifest: &FieldManifest) -> Result<()> {
    let mut next = 0;
    for (index, chunk) in manifest.chunks.iter().enumerate() {
        if chunk.first_sample != next || chunk.samples == 0 {
            return Err(DataError::format(format!(
                "chunk {index} of field '{group}/{field}' starts at sample {} (expected {next})",
                chunk.first_sample
            )));
        }
        next = chunk.end_sample();
    }
    if next != manifest.len {
        return Err(DataError::format(format!(
            "chunks of field '{group}/{field}' cover {next} samples, manifest says {}",
            manifest.len
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Dtype;
    use crate::store::{StoreWriter, WriteMode};
    use crate::storage::MemoryStorage;
    use ndarray::{ArrayD, IxDyn};

    fn ramp(start: i32, n: usize) -> ArrayData {
        let values: Vec<i32> = (start..start + (n * 2) as i32).collect();
        ArrayD::from_shape_vec(IxDyn(&[n, 2]), values).unwrap().into()
    }

    /// Store "s" with group "train", field "X" of i32[2], written as three
    /// chunks of 4, 4 and 2 samples.
    fn build_store(compression: Compression) -> MemoryStorage {
        let storage = MemoryStorage::new();
        let mut writer =
            StoreWriter::open(Arc::new(storage.clone()), "s", WriteMode::Create).unwrap();
        writer.set_compression(compression);
        writer
            .create_field("train", "X", FieldSpec::new(Dtype::I32, vec![2]))
            .unwrap();
        writer.append("train", "X", &ramp(0, 4)).unwrap();
        writer.append("train", "X", &ramp(8, 4)).unwrap();
        writer.append("train", "X", &ramp(16, 2)).unwrap();
        writer.close().unwrap();
        storage
    }

    fn open(storage: &MemoryStorage, verify: bool) -> Store {
        let options = StoreOptions {
            verify_checksums: verify,
        };
        Store::open(Arc::new(storage.clone()), "s", &options).unwrap()
    }

    #[test]
    fn test_open_missing_store() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        let err = Store::open(storage, "missing", &StoreOptions::default()).unwrap_err();
        assert!(matches!(err, DataError::StoreNotFound { name } if name == "missing"));
    }

    #[test]
    fn test_groups_and_fields() {
        let store = open(&build_store(Compression::None), true);

        assert_eq!(store.group_names(), vec!["train"]);
        let group = store.group("train").unwrap();
        assert_eq!(group.field_names(), vec!["X"]);

        let info = group.field("X").unwrap();
        assert_eq!(info.len, 10);
        assert_eq!(info.chunks, 3);
        assert_eq!(info.spec, FieldSpec::new(Dtype::I32, vec![2]));

        assert!(matches!(
            store.group("test"),
            Err(DataError::GroupNotFound { .. })
        ));
        assert!(matches!(
            group.field("Y"),
            Err(DataError::FieldNotFound { .. })
        ));
    }

    #[test]
    fn test_slices_across_chunks() {
        for compression in [Compression::None, Compression::Lz4, Compression::Zstd(1)] {
            for verify in [false, true] {
                let store = open(&build_store(compression), verify);

                // Samples 3..7 span the first two chunks.
                let array = store.read_array("train", "X", 3, 4).unwrap();
                assert_eq!(array, ramp(6, 4), "{compression} verify={verify}");

                let all = store.read_array("train", "X", 0, 10).unwrap();
                assert_eq!(all.shape(), &[10, 2]);
                assert_eq!(all.as_i32().unwrap()[[9, 1]], 19);
            }
        }
    }

    #[test]
    fn test_out_of_range() {
        let store = open(&build_store(Compression::None), true);
        let err = store.read_slice("train", "X", 8, 3).unwrap_err();
        assert!(matches!(
            err,
            DataError::OutOfRange {
                start: 8,
                count: 3,
                len: 10,
                ..
            }
        ));
        assert!(store.read_slice("train", "X", 10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_read_indices_keeps_order() {
        let store = open(&build_store(Compression::Lz4), true);
        let array = store.read_indices("train", "X", &[9, 0, 1, 2, 5]).unwrap();
        let values = array.as_i32().unwrap();
        assert_eq!(values.shape(), &[5, 2]);
        assert_eq!(values[[0, 0]], 18);
        assert_eq!(values[[1, 0]], 0);
        assert_eq!(values[[3, 1]], 5);
        assert_eq!(values[[4, 0]], 10);
    }

    #[test]
    fn test_corruption_detected() {
        let storage = build_store(Compression::None);
        let mut data = storage.get("s/train/X.dat").unwrap();
        data[0] ^= 0xFF;
        storage.put("s/train/X.dat", data);

        let store = open(&storage, true);
        assert!(matches!(
            store.read_slice("train", "X", 0, 1),
            Err(DataError::Format { .. })
        ));
        assert!(store.verify().is_err());
        // The untouched chunks still read fine.
        assert!(store.read_slice("train", "X", 4, 6).is_ok());

        // Without verification the direct path returns the corrupted bytes.
        let unverified = open(&storage, false);
        assert!(unverified.read_slice("train", "X", 0, 1).is_ok());
    }

    #[test]
    fn test_verify_report() {
        let store = open(&build_store(Compression::Zstd(3)), true);
        let report = store.verify().unwrap();
        assert_eq!(report.groups, 1);
        assert_eq!(report.fields, 1);
        assert_eq!(report.chunks, 3);
        assert_eq!(report.samples, 10);
    }

    #[test]
    fn test_close_rejects_reads() {
        let store = open(&build_store(Compression::None), true);
        store.bind_field("train", "X").unwrap();
        store.close();
        store.close();
        assert!(store.is_closed());
        assert!(matches!(
            store.read_slice("train", "X", 0, 1),
            Err(DataError::Closed { .. })
        ));
    }

    #[test]
    fn test_snapshot_survives_overwrite() {
        let storage = build_store(Compression::None);
        let verified = open(&storage, true);
        let unverified = open(&storage, false);

        let mut writer =
            StoreWriter::open(Arc::new(storage.clone()), "s", WriteMode::Overwrite).unwrap();
        writer
            .create_field("train", "X", FieldSpec::new(Dtype::I32, vec![2]))
            .unwrap();
        writer.append("train", "X", &ramp(100, 10)).unwrap();
        writer.close().unwrap();

        for store in [&verified, &unverified] {
            assert_eq!(store.read_array("train", "X", 0, 10).unwrap(), ramp(0, 10));
            assert!(store.verify().is_ok());
        }
        let reopened = open(&storage, true);
        assert_eq!(reopened.read_array("train", "X", 0, 10).unwrap(), ramp(100, 10));
    }

    #[test]
    fn test_missing_data_file_is_storage_error() {
        let storage = build_store(Compression::None);
        storage.delete(Path::new("s/train/X.dat")).unwrap();

        let err = Store::open(Arc::new(storage), "s", &StoreOptions::default()).unwrap_err();
        assert!(matches!(err, DataError::Storage { .. }));
    }
}
