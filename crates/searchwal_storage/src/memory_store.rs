//! In-memory segment store.

use crate::error::{StorageError, StorageResult};
use crate::segment::{FileId, SegmentStore};
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
struct MemoryFile {
    data: Vec<u8>,
    stamp: u64,
}

/// A segment store that keeps every index file in memory.
///
/// Used for tests, for standbys in examples, and by the core crate as the
/// private overlay a transaction reads its own writes from.
///
/// # Example
///
/// ```rust
/// use searchwal_storage::{FileId, InMemorySegmentStore, SegmentStore};
///
/// let store = InMemorySegmentStore::new();
/// store.replace_file(FileId::new(1), b"postings").unwrap();
/// store.set_applied_lsn(FileId::new(1), 42).unwrap();
/// assert_eq!(store.applied_lsn(FileId::new(1)).unwrap(), 42);
/// ```
#[derive(Debug, Default)]
pub struct InMemorySegmentStore {
    files: RwLock<BTreeMap<FileId, MemoryFile>>,
}

impl InMemorySegmentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an independent deep copy of this store, stamps included.
    ///
    /// A fork taken from a primary is a valid base snapshot for a standby.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            files: RwLock::new(self.files.read().clone()),
        }
    }

    /// Returns the bytes of every file, keyed by ID.
    #[must_use]
    pub fn contents(&self) -> BTreeMap<FileId, Vec<u8>> {
        self.files
            .read()
            .iter()
            .map(|(id, file)| (*id, file.data.clone()))
            .collect()
    }

    /// Returns the stamp of every file, keyed by ID.
    #[must_use]
    pub fn stamps(&self) -> BTreeMap<FileId, u64> {
        self.files
            .read()
            .iter()
            .map(|(id, file)| (*id, file.stamp))
            .collect()
    }
}

impl SegmentStore for InMemorySegmentStore {
    fn allocate_segment(&self, file: FileId, len: u64) -> StorageResult<()> {
        let too_large = |reason: String| {
            StorageError::invalid_input(format!(
                "cannot hold {len} bytes of {file} in memory: {reason}"
            ))
        };
        let size = usize::try_from(len).map_err(|e| too_large(e.to_string()))?;
        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|e| too_large(e.to_string()))?;
        data.resize(size, 0);

        self.files.write().entry(file).or_default().data = data;
        Ok(())
    }

    fn write_range(&self, file: FileId, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut files = self.files.write();
        let entry = files.get_mut(&file).ok_or(StorageError::FileNotFound(file))?;
        let size = entry.data.len() as u64;
        if offset > size {
            return Err(StorageError::out_of_bounds(
                file,
                offset,
                data.len() as u64,
                size,
            ));
        }

        let start = offset as usize;
        let end = start + data.len();
        if end > entry.data.len() {
            entry.data.resize(end, 0);
        }
        entry.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn truncate_file(&self, file: FileId, len: u64) -> StorageResult<()> {
        let mut files = self.files.write();
        let entry = files.get_mut(&file).ok_or(StorageError::FileNotFound(file))?;
        let size = entry.data.len() as u64;
        if len > size {
            return Err(StorageError::out_of_bounds(file, len, 0, size));
        }
        entry.data.truncate(len as usize);
        Ok(())
    }

    fn remove_file(&self, file: FileId) -> StorageResult<bool> {
        Ok(self.files.write().remove(&file).is_some())
    }

    fn read_range(&self, file: FileId, offset: u64, len: u64) -> StorageResult<Vec<u8>> {
        let files = self.files.read();
        let entry = files.get(&file).ok_or(StorageError::FileNotFound(file))?;
        let size = entry.data.len() as u64;
        let end = offset.saturating_add(len);
        if end > size {
            return Err(StorageError::out_of_bounds(file, offset, len, size));
        }
        Ok(entry.data[offset as usize..end as usize].to_vec())
    }

    fn file_len(&self, file: FileId) -> StorageResult<Option<u64>> {
        Ok(self.files.read().get(&file).map(|f| f.data.len() as u64))
    }

    fn file_ids(&self) -> StorageResult<Vec<FileId>> {
        Ok(self.files.read().keys().copied().collect())
    }

    fn applied_lsn(&self, file: FileId) -> StorageResult<u64> {
        Ok(self.files.read().get(&file).map_or(0, |f| f.stamp))
    }

    fn set_applied_lsn(&self, file: FileId, lsn: u64) -> StorageResult<()> {
        let mut files = self.files.write();
        let entry = files.get_mut(&file).ok_or(StorageError::FileNotFound(file))?;
        entry.stamp = lsn;
        Ok(())
    }

    fn sync_file(&self, _file: FileId) -> StorageResult<()> {
        Ok(())
    }
}
