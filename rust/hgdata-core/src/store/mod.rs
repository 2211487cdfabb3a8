// rust/hgdata-core/src/store/mod.rs

//! Hierarchical array store.
//!
//! A store is a directory under the storage base path:
//! ```text
//! <name>/MANIFEST                 committed metadata (see `format`)
//! <name>/<group path>/<field>.dat concatenated chunks of one field
//! .<name>.lock                    held by the single writer
//! .<name>.staging/                store being built by create/overwrite
//! ```
//! Readers ([`Store`]) only ever look at the committed manifest. Writers
//! ([`StoreWriter`]) make their changes visible by replacing it.

mod codec;
mod format;
mod reader;
mod writer;

pub use codec::{checksum, Compression};
pub use format::{ChunkInfo, FieldManifest, GroupManifest, StoreManifest};
pub use reader::{FieldInfo, Group, Store, StoreOptions, VerifyReport};
pub use writer::{StoreWriter, WriteMode};

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use crate::error::{DataError, Result};
use crate::storage::StorageBackend;

pub(crate) const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TMP_FILE: &str = "MANIFEST.tmp";
const DATA_EXTENSION: &str = "dat";

pub(crate) fn manifest_path(root: &Path) -> PathBuf {
    root.join(MANIFEST_FILE)
}

pub(crate) fn data_path(root: &Path, group: &str, field: &str) -> PathBuf {
    root.join(group).join(format!("{field}.{DATA_EXTENSION}"))
}

pub(crate) fn lock_path(name: &str) -> PathBuf {
    PathBuf::from(format!(".{name}.lock"))
}

pub(crate) fn staging_path(name: &str) -> PathBuf {
    PathBuf::from(format!(".{name}.staging"))
}

pub(crate) fn retired_path(name: &str) -> PathBuf {
    PathBuf::from(format!(".{name}.old"))
}

fn check_segment(kind: &str, name: &str, segment: &str) -> Result<()> {
    if segment.is_empty() || segment.starts_with('.') || segment.contains('\\') {
        return Err(DataError::config(format!("invalid {kind} name '{name}'")));
    }
    Ok(())
}

/// Store and field names are single path segments.
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.contains('/') {
        return Err(DataError::config(format!(
            "{kind} name '{name}' must not contain '/'"
        )));
    }
    check_segment(kind, name, name)
}

/// Group names may be nested with '/'.
pub(crate) fn validate_group_name(name: &str) -> Result<()> {
    for segment in name.split('/') {
        check_segment("group", name, segment)?;
    }
    let all_normal = Path::new(name)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !all_normal {
        return Err(DataError::config(format!("invalid group name '{name}'")));
    }
    Ok(())
}

/// Reads the committed manifest under `root`, if there is one.
pub(crate) fn read_manifest(
    storage: &dyn StorageBackend,
    root: &Path,
) -> Result<Option<StoreManifest>> {
    let path = manifest_path(root);
    if !storage.exists(&path)? {
        return Ok(None);
    }

    let mut reader = storage.open_read(&path)?;
    let mut data = Vec::with_capacity(reader.size() as usize);
    reader
        .read_to_end(&mut data)
        .map_err(|e| DataError::storage_with_source(&path, "failed to read manifest", e))?;

    StoreManifest::decode(&data).map(Some)
}

/// Replaces the manifest under `root` atomically.
pub(crate) fn commit_manifest(
    storage: &dyn StorageBackend,
    root: &Path,
    manifest: &StoreManifest,
) -> Result<()> {
    let bytes = manifest.encode()?;
    let tmp_path = root.join(MANIFEST_TMP_FILE);

    let mut writer = storage.open_write(&tmp_path)?;
    writer
        .write_all(&bytes)
        .map_err(|e| DataError::storage_with_source(&tmp_path, "failed to write manifest", e))?;
    writer.sync()?;
    writer.finish()?;

    storage.rename(&tmp_path, &manifest_path(root))
}
