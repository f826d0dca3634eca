//! In-memory log backend for testing.

use crate::error::{StorageError, StorageResult};
use crate::log::LogBackend;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Default)]
struct LogBytes {
    data: Vec<u8>,
    /// Length covered by the last successful flush.
    durable_len: usize,
}

/// An in-memory log backend.
///
/// Clones share the same bytes, so a test can keep a handle, drop the
/// writer, and reopen the log as a restarted process would.
///
/// Bytes appended after the last `flush` are volatile: [`InMemoryLog::crash`]
/// discards them, simulating power loss before the log reached disk.
///
/// # Example
///
/// ```rust
/// use searchwal_storage::{InMemoryLog, LogBackend};
///
/// let mut log = InMemoryLog::new();
/// log.append(b"durable").unwrap();
/// log.flush().unwrap();
/// log.append(b" lost").unwrap();
/// log.crash();
/// assert_eq!(log.data(), b"durable");
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryLog {
    inner: Arc<RwLock<LogBytes>>,
}

impl InMemoryLog {
    /// Creates a new empty in-memory log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a log whose entire contents are already durable.
    ///
    /// Useful for recovery tests that start from hand-made bytes.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        let durable_len = data.len();
        Self {
            inner: Arc::new(RwLock::new(LogBytes { data, durable_len })),
        }
    }

    /// Returns a copy of all bytes, durable or not.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.inner.read().data.clone()
    }

    /// Returns the number of bytes covered by the last flush.
    #[must_use]
    pub fn durable_len(&self) -> u64 {
        self.inner.read().durable_len as u64
    }

    /// Drops every byte appended since the last flush.
    pub fn crash(&self) {
        let mut inner = self.inner.write();
        let keep = inner.durable_len;
        inner.data.truncate(keep);
    }

    /// Overwrites bytes in place, bypassing the append-only contract.
    ///
    /// Only tests use this, to model bit rot or a torn write.
    pub fn corrupt_at(&self, offset: usize, bytes: &[u8]) {
        let mut inner = self.inner.write();
        let end = (offset + bytes.len()).min(inner.data.len());
        if offset < end {
            inner.data[offset..end].copy_from_slice(&bytes[..end - offset]);
        }
    }
}

impl LogBackend for InMemoryLog {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let inner = self.inner.read();
        let size = inner.data.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(len);

        if offset > size || end > inner.data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(inner.data[start..end].to_vec())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let mut inner = self.inner.write();
        let offset = inner.data.len() as u64;
        inner.data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        let mut inner = self.inner.write();
        inner.durable_len = inner.data.len();
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.inner.read().data.len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.flush()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let current = inner.data.len() as u64;

        if new_size > current {
            return Err(StorageError::invalid_input(format!(
                "cannot truncate log to {new_size} bytes, it holds {current}"
            )));
        }

        inner.data.truncate(new_size as usize);
        inner.durable_len = inner.durable_len.min(new_size as usize);
        Ok(())
    }
}
