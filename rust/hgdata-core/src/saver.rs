// rust/hgdata-core/src/saver.rs

//! Producer side: writing arrays into a new store.
//!
//! A [`Saver`] buffers samples per field and writes them as fixed-size
//! chunks. Nothing is visible to readers until [`Saver::close`] publishes
//! the store.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hgdata_core::config::{SaverConfig, StorageConfig};
//! use hgdata_core::saver::Saver;
//! use hgdata_core::storage::LocalStorage;
//! use ndarray::{ArrayD, IxDyn};
//!
//! let storage = Arc::new(LocalStorage::new(&StorageConfig::default()).unwrap());
//! let mut saver = Saver::begin(storage, "mnist-train", &SaverConfig::default()).unwrap();
//!
//! let images = ArrayD::<f32>::zeros(IxDyn(&[64, 28, 28, 1]));
//! let labels = ArrayD::<u8>::zeros(IxDyn(&[64]));
//! saver
//!     .write("train", vec![("X", images.into()), ("Y", labels.into())])
//!     .unwrap();
//!
//! let summary = saver.close().unwrap();
//! assert_eq!(summary.samples("train", "X"), Some(64));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::array::{ArrayData, FieldSpec};
use crate::config::SaverConfig;
use crate::error::{DataError, Result};
use crate::storage::StorageBackend;
use crate::store::{Compression, StoreWriter, WriteMode};

/// Sample counts of a published store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveSummary {
    pub store: String,
    /// group -> field -> number of samples
    pub groups: BTreeMap<String, BTreeMap<String, u64>>,
}

impl SaveSummary {
    pub fn samples(&self, group: &str, field: &str) -> Option<u64> {
        self.groups.get(group)?.get(field).copied()
    }
}

struct FieldBuffer {
    spec: FieldSpec,
    samples_per_chunk: u64,
    pending: Vec<u8>,
    pending_samples: u64,
}

impl FieldBuffer {
    fn new(spec: FieldSpec, chunk_bytes: usize) -> Self {
        let sample_bytes = spec.sample_bytes();
        let samples_per_chunk = if sample_bytes == 0 {
            u64::MAX
        } else {
            (chunk_bytes / sample_bytes).max(1) as u64
        };
        Self {
            spec,
            samples_per_chunk,
            pending: Vec::new(),
            pending_samples: 0,
        }
    }
}

/// A write session for one store.
pub struct Saver {
    writer: StoreWriter,
    chunk_bytes: usize,
    /// Field names of each group, fixed by the group's first write.
    layouts: BTreeMap<String, Vec<String>>,
    buffers: BTreeMap<(String, String), FieldBuffer>,
    summary: Option<SaveSummary>,
}

impl std::fmt::Debug for Saver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saver")
            .field("writer", &self.writer)
            .field("chunk_bytes", &self.chunk_bytes)
            .field("groups", &self.layouts)
            .field("closed", &self.summary.is_some())
            .finish()
    }
}

impl Saver {
    /// Starts a write session for store `name`.
    ///
    /// # Errors
    ///
    /// Returns `StoreExists` if the store exists and `config.overwrite` is
    /// not set, `StoreAccess` if another writer holds the store and `Config`
    /// for an invalid configuration.
    pub fn begin(storage: Arc<dyn StorageBackend>, name: &str, config: &SaverConfig) -> Result<Self> {
        config.validate()?;
        let compression = Compression::from_config(&config.compression, config.compression_level)?;
        let mode = if config.overwrite {
            WriteMode::Overwrite
        } else {
            WriteMode::Create
        };

        let mut writer = StoreWriter::open(storage, name, mode)?;
        writer.set_compression(compression);

        info!(store = name, %compression, chunk_bytes = config.chunk_bytes, "Started save session");

        Ok(Self {
            writer,
            chunk_bytes: config.chunk_bytes,
            layouts: BTreeMap::new(),
            buffers: BTreeMap::new(),
            summary: None,
        })
    }

    /// Appends samples to the fields of `group`.
    ///
    /// All arrays must have the same number of samples. The first write to a
    /// group fixes its field names; the first write of a field fixes its
    /// dtype and sample shape.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` for unequal sample counts, a changed field set
    /// or a changed field spec.
    pub fn write<S: AsRef<str>>(&mut self, group: &str, fields: Vec<(S, ArrayData)>) -> Result<()> {
        if self.summary.is_some() {
            return Err(DataError::closed(format!("saver for store '{}'", self.writer.name())));
        }
        if fields.is_empty() {
            return Err(DataError::shape_mismatch(format!(
                "write to group '{group}' has no fields"
            )));
        }

        let count = fields[0].1.num_samples();
        let mut names = Vec::with_capacity(fields.len());
        let mut specs = Vec::with_capacity(fields.len());
        for (name, data) in &fields {
            let name = name.as_ref();
            let spec = data.field_spec()?;
            if data.num_samples() != count {
                return Err(DataError::shape_mismatch(format!(
                    "field '{name}' has {} samples, expected {count}",
                    data.num_samples()
                )));
            }
            if names.contains(&name.to_string()) {
                return Err(DataError::shape_mismatch(format!(
                    "field '{name}' given twice"
                )));
            }
            names.push(name.to_string());
            specs.push(spec);
        }

        if let Some(layout) = self.layouts.get(group) {
            let mut expected = layout.clone();
            let mut given = names.clone();
            expected.sort();
            given.sort();
            if expected != given {
                return Err(DataError::shape_mismatch(format!(
                    "group '{group}' holds fields {layout:?}, write has {names:?}"
                )));
            }
        }
        for (name, spec) in names.iter().zip(&specs) {
            if let Some(buffer) = self.buffers.get(&(group.to_string(), name.clone())) {
                if buffer.spec != *spec {
                    return Err(DataError::shape_mismatch(format!(
                        "field '{group}/{name}' is {}, got samples of {spec}",
                        buffer.spec
                    )));
                }
            }
        }

        // Everything is validated; from here on the write cannot be rejected.
        if !self.layouts.contains_key(group) {
            for (name, spec) in names.iter().zip(&specs) {
                self.writer.create_field(group, name, spec.clone())?;
                self.buffers.insert(
                    (group.to_string(), name.clone()),
                    FieldBuffer::new(spec.clone(), self.chunk_bytes),
                );
            }
            self.layouts.insert(group.to_string(), names.clone());
        }

        for (name, (_, data)) in names.iter().zip(fields) {
            let key = (group.to_string(), name.clone());
            if let Some(buffer) = self.buffers.get_mut(&key) {
                buffer.pending.extend_from_slice(&data.to_le_bytes());
                buffer.pending_samples += count as u64;
            }
            self.drain_full_chunks(&key)?;
        }

        debug!(group, samples = count, fields = names.len(), "Buffered samples");
        Ok(())
    }

    /// Writes all buffered samples and commits them to the staged store.
    pub fn flush(&mut self) -> Result<()> {
        let keys: Vec<_> = self.buffers.keys().cloned().collect();
        for key in keys {
            self.drain_full_chunks(&key)?;
            self.write_pending(&key)?;
        }
        self.writer.flush()
    }

    /// Flushes and publishes the store. Calling `close` again returns the
    /// same summary.
    pub fn close(&mut self) -> Result<SaveSummary> {
        if let Some(summary) = &self.summary {
            return Ok(summary.clone());
        }

        self.flush()?;
        self.writer.close()?;

        let mut summary = SaveSummary {
            store: self.writer.name().to_string(),
            groups: BTreeMap::new(),
        };
        for (group, fields) in &self.layouts {
            let counts = summary.groups.entry(group.clone()).or_default();
            for field in fields {
                let len = self.writer.field(group, field).map_or(0, |(_, len)| len);
                counts.insert(field.clone(), len);
            }
        }

        info!(store = %summary.store, groups = summary.groups.len(), "Saved store");
        self.summary = Some(summary.clone());
        Ok(summary)
    }

    fn drain_full_chunks(&mut self, key: &(String, String)) -> Result<()> {
        let Some(buffer) = self.buffers.get_mut(key) else {
            return Ok(());
        };
        if buffer.pending_samples < buffer.samples_per_chunk {
            return Ok(());
        }

        let chunk_len = buffer.samples_per_chunk as usize * buffer.spec.sample_bytes();
        let mut offset = 0;
        while buffer.pending_samples >= buffer.samples_per_chunk {
            self.writer.append_bytes(
                &key.0,
                &key.1,
                &buffer.pending[offset..offset + chunk_len],
                buffer.samples_per_chunk,
            )?;
            offset += chunk_len;
            buffer.pending_samples -= buffer.samples_per_chunk;
        }
        buffer.pending.drain(..offset);
        Ok(())
    }

    fn write_pending(&mut self, key: &(String, String)) -> Result<()> {
        let Some(buffer) = self.buffers.get_mut(key) else {
            return Ok(());
        };
        if buffer.pending_samples == 0 {
            return Ok(());
        }
        self.writer
            .append_bytes(&key.0, &key.1, &buffer.pending, buffer.pending_samples)?;
        buffer.pending.clear();
        buffer.pending_samples = 0;
        Ok(())
    }
}

/// Writes a whole store from `(group, fields)` batches and publishes it.
pub fn save_store<I, S>(
    storage: Arc<dyn StorageBackend>,
    name: &str,
    config: &SaverConfig,
    batches: I,
) -> Result<SaveSummary>
where
    I: IntoIterator<Item = (String, Vec<(S, ArrayData)>)>,
    S: AsRef<str>,
{
    let mut saver = Saver::begin(storage, name, config)?;
    for (group, fields) in batches {
        saver.write(&group, fields)?;
    }
    saver.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Dtype;
    use crate::store::{Store, StoreOptions};
    use crate::storage::MemoryStorage;
    use ndarray::{ArrayD, IxDyn};

    fn features(start: i64, n: usize) -> ArrayData {
        let values: Vec<i64> = (start..start + n as i64).collect();
        ArrayD::from_shape_vec(IxDyn(&[n, 1]), values).unwrap().into()
    }

    fn labels(n: usize) -> ArrayData {
        ArrayD::<u8>::ones(IxDyn(&[n])).into()
    }

    fn small_chunks() -> SaverConfig {
        SaverConfig {
            // Four i64 samples per chunk.
            chunk_bytes: 32,
            ..Default::default()
        }
    }

    fn memory() -> Arc<dyn StorageBackend> {
        Arc::new(MemoryStorage::new())
    }

    #[test]
    fn test_samples_are_chunked() {
        let storage = memory();
        let mut saver = Saver::begin(Arc::clone(&storage), "s", &small_chunks()).unwrap();
        saver.write("train", vec![("X", features(0, 3)), ("Y", labels(3))]).unwrap();
        saver.write("train", vec![("Y", labels(7)), ("X", features(3, 7))]).unwrap();
        let summary = saver.close().unwrap();

        assert_eq!(summary.samples("train", "X"), Some(10));
        assert_eq!(summary.samples("train", "Y"), Some(10));
        assert_eq!(saver.close().unwrap(), summary);

        let store = Store::open(storage, "s", &StoreOptions::default()).unwrap();
        let x = store.field_info("train", "X").unwrap();
        // 4 + 4 + 2 samples
        assert_eq!(x.chunks, 3);
        assert_eq!(x.spec, FieldSpec::new(Dtype::I64, vec![1]));
        assert_eq!(store.read_array("train", "X", 0, 10).unwrap(), features(0, 10));

        // 32 single-byte labels fit in one chunk.
        assert_eq!(store.field_info("train", "Y").unwrap().chunks, 1);
    }

    #[test]
    fn test_unequal_sample_counts() {
        let mut saver = Saver::begin(memory(), "s", &SaverConfig::default()).unwrap();
        let err = saver
            .write("train", vec![("X", features(0, 3)), ("Y", labels(2))])
            .unwrap_err();
        assert!(matches!(err, DataError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_field_set_and_spec_are_fixed() {
        let mut saver = Saver::begin(memory(), "s", &SaverConfig::default()).unwrap();
        saver.write("train", vec![("X", features(0, 2))]).unwrap();

        let err = saver
            .write("train", vec![("X", features(0, 2)), ("Y", labels(2))])
            .unwrap_err();
        assert!(matches!(err, DataError::ShapeMismatch { .. }));

        let floats: ArrayData = ArrayD::<f32>::zeros(IxDyn(&[2, 1])).into();
        let err = saver.write("train", vec![("X", floats)]).unwrap_err();
        assert!(matches!(err, DataError::ShapeMismatch { .. }));

        // Other groups have their own layout.
        saver.write("test", vec![("Y", labels(1))]).unwrap();
    }

    #[test]
    fn test_existing_store_requires_overwrite() {
        let storage = memory();
        let batches = vec![("train".to_string(), vec![("X", features(0, 4))])];
        save_store(Arc::clone(&storage), "s", &SaverConfig::default(), batches.clone()).unwrap();

        let err = Saver::begin(Arc::clone(&storage), "s", &SaverConfig::default()).unwrap_err();
        assert!(matches!(err, DataError::StoreExists { .. }));

        let config = SaverConfig {
            overwrite: true,
            compression: "zstd".to_string(),
            ..Default::default()
        };
        let summary = save_store(storage, "s", &config, batches).unwrap();
        assert_eq!(summary.samples("train", "X"), Some(4));
    }

    #[test]
    fn test_dropped_session_publishes_nothing() {
        let storage = memory();
        let mut saver = Saver::begin(Arc::clone(&storage), "s", &small_chunks()).unwrap();
        saver.write("train", vec![("X", features(0, 9))]).unwrap();
        saver.flush().unwrap();
        drop(saver);

        let err = Store::open(storage, "s", &StoreOptions::default()).unwrap_err();
        assert!(matches!(err, DataError::StoreNotFound { .. }));
    }

    #[test]
    fn test_write_after_close() {
        let mut saver = Saver::begin(memory(), "s", &SaverConfig::default()).unwrap();
        saver.close().unwrap();
        assert!(matches!(
            saver.write("train", vec![("X", features(0, 1))]),
            Err(DataError::Closed { .. })
        ));
    }
}
