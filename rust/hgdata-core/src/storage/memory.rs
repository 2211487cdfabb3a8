// rust/hgdata-core/src/storage/memory.rs

//! In-memory storage backend.
//!
//! Objects live in a shared map keyed by normalized path. Bytes written
//! through a writer become visible on `sync`/`finish`, which makes the
//! backend behave like a disk with write-back caching. Useful for tests and
//! for throwaway datasets that never need to hit the filesystem.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{ObjectMeta, StorageBackend, StorageReader, StorageWriter};
use crate::error::{DataError, Result};

#[derive(Default)]
struct MemoryState {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
}

impl MemoryState {
    fn add_parents(&mut self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir.as_os_str().is_empty() {
                break;
            }
            self.dirs.insert(dir.to_path_buf());
            current = dir.parent();
        }
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.dirs.contains(path)
    }
}

/// Storage backend that keeps every object in memory.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    /// Creates an empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the committed bytes of an object, if it exists.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.lock().files.get(&normalize(path.as_ref())).cloned()
    }

    /// Stores an object directly, bypassing writers.
    pub fn put(&self, path: impl AsRef<Path>, data: Vec<u8>) {
        let path = normalize(path.as_ref());
        let mut state = self.lock();
        state.add_parents(&path);
        state.files.insert(path, data);
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves plain data behind, so the
        // poisoned state is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            _ => {}
        }
    }
    out
}

impl StorageBackend for MemoryStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        let path = normalize(path);
        let state = self.lock();
        Ok(path.as_os_str().is_empty() || state.files.contains_key(&path) || state.is_dir(&path))
    }

    fn metadata(&self, path: &Path) -> Result<ObjectMeta> {
        let path = normalize(path);
        let state = self.lock();
        if let Some(data) = state.files.get(&path) {
            return Ok(ObjectMeta {
                size: data.len() as u64,
                is_dir: false,
            });
        }
        if state.is_dir(&path) {
            return Ok(ObjectMeta {
                size: 0,
                is_dir: true,
            });
        }
        Err(DataError::storage(path, "not found"))
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        let path = normalize(path);
        let data = self
            .lock()
            .files
            .get(&path)
            .cloned()
            .ok_or_else(|| DataError::storage(&path, "not found"))?;

        Ok(Box::new(MemoryReader {
            size: data.len() as u64,
            data: Cursor::new(data),
            path,
        }))
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        let path = normalize(path);
        {
            let mut state = self.lock();
            if state.is_dir(&path) {
                return Err(DataError::storage(&path, "path is a directory"));
            }
            state.add_parents(&path);
            state.files.insert(path.clone(), Vec::new());
        }

        Ok(Box::new(MemoryWriter {
            storage: self.clone(),
            path,
            pending: Vec::new(),
        }))
    }

    fn open_append(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        let path = normalize(path);
        {
            let mut state = self.lock();
            if state.is_dir(&path) {
                return Err(DataError::storage(&path, "path is a directory"));
            }
            state.add_parents(&path);
            state.files.entry(path.clone()).or_default();
        }

        Ok(Box::new(MemoryWriter {
            storage: self.clone(),
            path,
            pending: Vec::new(),
        }))
    }

    fn create_exclusive(&self, path: &Path) -> Result<bool> {
        let path = normalize(path);
        let mut state = self.lock();
        if state.files.contains_key(&path) || state.is_dir(&path) {
            return Ok(false);
        }
        state.add_parents(&path);
        state.files.insert(path, Vec::new());
        Ok(true)
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let path = normalize(path);
        let mut state = self.lock();

        if state.files.remove(&path).is_some() {
            return Ok(());
        }
        if !state.is_dir(&path) {
            return Err(DataError::storage(&path, "not found"));
        }

        state.files.retain(|p, _| !p.starts_with(&path));
        state.dirs.retain(|p| !p.starts_with(&path));
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = normalize(from);
        let to = normalize(to);
        let mut state = self.lock();

        if let Some(data) = state.files.remove(&from) {
            state.add_parents(&to);
            state.files.insert(to, data);
            return Ok(());
        }

        if !state.is_dir(&from) {
            return Err(DataError::storage(&from, "not found"));
        }

        let target_has_children = state
            .files
            .keys()
            .chain(state.dirs.iter())
            .any(|p| p.starts_with(&to) && p != &to);
        if target_has_children {
            return Err(DataError::storage(&to, "destination directory is not empty"));
        }

        let moved_files: Vec<_> = state
            .files
            .keys()
            .filter(|p| p.starts_with(&from))
            .cloned()
            .collect();
        for old in moved_files {
            if let Some(data) = state.files.remove(&old) {
                let new = to.join(old.strip_prefix(&from).unwrap_or(&old));
                state.files.insert(new, data);
            }
        }

        let moved_dirs: Vec<_> = state
            .dirs
            .iter()
            .filter(|p| p.starts_with(&from))
            .cloned()
            .collect();
        for old in moved_dirs {
            state.dirs.remove(&old);
            let new = to.join(old.strip_prefix(&from).unwrap_or(&old));
            state.dirs.insert(new);
        }

        state.add_parents(&to);
        state.dirs.insert(to);
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let path = normalize(path);
        if path.as_os_str().is_empty() {
            return Ok(());
        }
        let mut state = self.lock();
        if state.files.contains_key(&path) {
            return Err(DataError::storage(&path, "path is a file"));
        }
        state.add_parents(&path);
        state.dirs.insert(path);
        Ok(())
    }
}

struct MemoryReader {
    data: Cursor<Vec<u8>>,
    size: u64,
    path: PathBuf,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.data.read(buf)
    }
}

impl Seek for MemoryReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.data.seek(pos)
    }
}

impl StorageReader for MemoryReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        let bytes = self.data.get_ref();
        let start = start as usize;
        let end = start + length;
        if end > bytes.len() {
            return Err(DataError::storage(
                &self.path,
                format!("read range {start}..{end} exceeds size {}", bytes.len()),
            ));
        }
        Ok(bytes[start..end].to_vec())
    }
}

struct MemoryWriter {
    storage: MemoryStorage,
    path: PathBuf,
    pending: Vec<u8>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageWriter for MemoryWriter {
    fn sync(&mut self) -> Result<()> {
        let mut state = self.storage.lock();
        let file = state
            .files
            .get_mut(&self.path)
            .ok_or_else(|| DataError::storage(&self.path, "object was removed while open"))?;
        file.append(&mut self.pending);
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_visible_after_sync() {
        let storage = MemoryStorage::new();
        let mut writer = storage.open_write(Path::new("a/b.bin")).unwrap();
        writer.write_all(b"hello").unwrap();

        assert_eq!(storage.get("a/b.bin").unwrap(), b"");
        writer.sync().unwrap();
        assert_eq!(storage.get("a/b.bin").unwrap(), b"hello");

        writer.write_all(b"!").unwrap();
        writer.finish().unwrap();
        assert_eq!(storage.get("a/b.bin").unwrap(), b"hello!");
        assert!(storage.metadata(Path::new("a")).unwrap().is_dir);
    }

    #[test]
    fn test_append_keeps_existing_bytes() {
        let storage = MemoryStorage::new();
        storage.put("x.bin", b"abc".to_vec());

        let mut writer = storage.open_append(Path::new("x.bin")).unwrap();
        writer.write_all(b"de").unwrap();
        writer.finish().unwrap();

        let mut reader = storage.open_read(Path::new("x.bin")).unwrap();
        assert_eq!(reader.read_range(1, 4).unwrap(), b"bcde");
        assert!(reader.read_range(3, 5).is_err());
    }

    #[test]
    fn test_rename_directory_tree() {
        let storage = MemoryStorage::new();
        storage.put(".s.staging/MANIFEST", b"m".to_vec());
        storage.put(".s.staging/train/X.dat", b"x".to_vec());

        storage
            .rename(Path::new(".s.staging"), Path::new("s"))
            .unwrap();

        assert_eq!(storage.get("s/train/X.dat").unwrap(), b"x");
        assert!(!storage.exists(Path::new(".s.staging")).unwrap());
        assert!(storage.metadata(Path::new("s/train")).unwrap().is_dir);
        assert_eq!(storage.get("s/MANIFEST").unwrap(), b"m");
    }

    #[test]
    fn test_rename_onto_non_empty_directory_fails() {
        let storage = MemoryStorage::new();
        storage.put("a/f", vec![1]);
        storage.put("b/f", vec![2]);
        assert!(storage.rename(Path::new("a"), Path::new("b")).is_err());
    }

    #[test]
    fn test_create_exclusive_and_delete() {
        let storage = MemoryStorage::new();
        assert!(storage.create_exclusive(Path::new("s.lock")).unwrap());
        assert!(!storage.create_exclusive(Path::new("s.lock")).unwrap());
        storage.delete(Path::new("s.lock")).unwrap();
        assert!(!storage.exists(Path::new("s.lock")).unwrap());
    }
}
