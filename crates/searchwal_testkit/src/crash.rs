//! Crash injection for the host log and for index storage.
//!
//! Both wrappers share their control state between clones, so a test can
//! hand one clone to the writer and keep another to pull the plug.
//!
//! ## Crash points
//!
//! | Wrapper | Knob | Simulates |
//! |---|---|---|
//! | [`CrashableLog`] | [`CrashableLog::crash_at_size`] | power loss in the middle of an append |
//! | [`CrashableLog`] | [`CrashableLog::set_fail_on_flush`] | a log that cannot be made durable |
//! | [`CrashableStore`] | [`CrashableStore::crash_after_writes`] | power loss after the commit is durable but before its data reached the index |

use parking_lot::Mutex;
use searchwal_storage::{
    FileId, InMemoryLog, InMemorySegmentStore, LogBackend, SegmentStore, StorageError,
    StorageResult,
};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

fn simulated(what: &str) -> StorageError {
    StorageError::Io(io::Error::other(format!("simulated crash during {what}")))
}

#[derive(Debug)]
struct LogControl {
    crash_at_size: AtomicU64,
    crashed: AtomicBool,
    fail_on_flush: AtomicBool,
}

impl Default for LogControl {
    fn default() -> Self {
        Self {
            crash_at_size: AtomicU64::new(u64::MAX),
            crashed: AtomicBool::new(false),
            fail_on_flush: AtomicBool::new(false),
        }
    }
}

/// An in-memory log that can fail appends and flushes on demand.
///
/// # Example
///
/// ```rust
/// use searchwal_storage::LogBackend;
/// use searchwal_testkit::CrashableLog;
///
/// let mut log = CrashableLog::new();
/// log.crash_at_size(4);
/// assert!(log.append(b"torn write").is_err());
/// assert_eq!(log.inner().data(), b"torn");
/// assert!(log.has_crashed());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CrashableLog {
    inner: InMemoryLog,
    control: Arc<LogControl>,
}

impl CrashableLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing log.
    #[must_use]
    pub fn wrap(inner: InMemoryLog) -> Self {
        Self {
            inner,
            control: Arc::default(),
        }
    }

    /// Returns a handle to the underlying bytes.
    #[must_use]
    pub fn inner(&self) -> InMemoryLog {
        self.inner.clone()
    }

    /// Makes an append fail once the log would grow past `size` bytes.
    ///
    /// The append that crosses the limit writes its first bytes up to the
    /// limit and then fails, leaving a partial frame behind.
    pub fn crash_at_size(&self, size: u64) {
        self.control.crash_at_size.store(size, Ordering::SeqCst);
    }

    /// Sets whether flush and sync fail.
    pub fn set_fail_on_flush(&self, fail: bool) {
        self.control.fail_on_flush.store(fail, Ordering::SeqCst);
    }

    /// Clears every injected failure.
    pub fn reset(&self) {
        self.control.crash_at_size.store(u64::MAX, Ordering::SeqCst);
        self.control.crashed.store(false, Ordering::SeqCst);
        self.control.fail_on_flush.store(false, Ordering::SeqCst);
    }

    /// Returns whether an injected failure fired.
    #[must_use]
    pub fn has_crashed(&self) -> bool {
        self.control.crashed.load(Ordering::SeqCst)
    }

    /// Drops every byte that was never flushed, as a restart would.
    pub fn power_loss(&self) {
        self.inner.crash();
    }

    fn check_flush(&self, what: &str) -> StorageResult<()> {
        if self.control.fail_on_flush.load(Ordering::SeqCst) {
            self.control.crashed.store(true, Ordering::SeqCst);
            return Err(simulated(what));
        }
        Ok(())
    }
}

impl LogBackend for CrashableLog {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let current = self.inner.size()?;
        let limit = self.control.crash_at_size.load(Ordering::SeqCst);

        if current >= limit {
            self.control.crashed.store(true, Ordering::SeqCst);
            return Err(simulated("append"));
        }
        if current + data.len() as u64 > limit {
            self.control.crashed.store(true, Ordering::SeqCst);
            let partial = (limit - current) as usize;
            self.inner.append(&data[..partial])?;
            return Err(simulated("partial append"));
        }

        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.check_flush("flush")?;
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.check_flush("sync")?;
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

/// Index storage that stops accepting changes after a budget of writes.
///
/// Every mutating call spends one unit of the budget; once it is spent the
/// call fails without touching the inner store. Reads always succeed, so
/// the store can be inspected after the crash.
#[derive(Debug, Clone, Default)]
pub struct CrashableStore {
    inner: Arc<InMemorySegmentStore>,
    budget: Arc<Mutex<Option<u64>>>,
    crashed: Arc<AtomicBool>,
}

impl CrashableStore {
    /// Creates an empty store with no crash armed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn inner(&self) -> &Arc<InMemorySegmentStore> {
        &self.inner
    }

    /// Allows `writes` more mutating calls, then fails every further one.
    pub fn crash_after_writes(&self, writes: u64) {
        *self.budget.lock() = Some(writes);
    }

    /// Disarms the crash.
    pub fn reset(&self) {
        *self.budget.lock() = None;
        self.crashed.store(false, Ordering::SeqCst);
    }

    /// Returns whether a write was refused.
    #[must_use]
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    fn spend(&self, what: &str) -> StorageResult<()> {
        let mut budget = self.budget.lock();
        match budget.as_mut() {
            Some(0) => {
                self.crashed.store(true, Ordering::SeqCst);
                Err(simulated(what))
            }
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl SegmentStore for CrashableStore {
    fn allocate_segment(&self, file: FileId, len: u64) -> StorageResult<()> {
        self.spend("allocate")?;
        self.inner.allocate_segment(file, len)
    }

    fn write_range(&self, file: FileId, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.spend("write")?;
        self.inner.write_range(file, offset, data)
    }

    fn truncate_file(&self, file: FileId, len: u64) -> StorageResult<()> {
        self.spend("truncate")?;
        self.inner.truncate_file(file, len)
    }

    fn remove_file(&self, file: FileId) -> StorageResult<bool> {
        self.spend("remove")?;
        self.inner.remove_file(file)
    }

    fn read_range(&self, file: FileId, offset: u64, len: u64) -> StorageResult<Vec<u8>> {
        self.inner.read_range(file, offset, len)
    }

    fn file_len(&self, file: FileId) -> StorageResult<Option<u64>> {
        self.inner.file_len(file)
    }

    fn file_ids(&self) -> StorageResult<Vec<FileId>> {
        self.inner.file_ids()
    }

    fn applied_lsn(&self, file: FileId) -> StorageResult<u64> {
        self.inner.applied_lsn(file)
    }

    fn set_applied_lsn(&self, file: FileId, lsn: u64) -> StorageResult<()> {
        self.spend("stamp")?;
        self.inner.set_applied_lsn(file, lsn)
    }

    fn sync_file(&self, file: FileId) -> StorageResult<()> {
        self.spend("sync")?;
        self.inner.sync_file(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_append_leaves_prefix() {
        let mut log = CrashableLog::new();
        log.append(b"abcd").unwrap();
        log.crash_at_size(6);

        assert!(log.append(b"efgh").is_err());
        assert!(log.has_crashed());
        assert_eq!(log.inner().data(), b"abcdef");
        assert!(log.append(b"x").is_err());

        log.reset();
        log.append(b"x").unwrap();
        assert_eq!(log.size().unwrap(), 7);
    }

    #[test]
    fn failed_flush_keeps_bytes_volatile() {
        let mut log = CrashableLog::new();
        let handle = log.clone();
        log.append(b"commit").unwrap();
        handle.set_fail_on_flush(true);

        assert!(log.flush().is_err());
        assert!(log.sync().is_err());
        handle.power_loss();
        assert!(log.inner().data().is_empty());
    }

    #[test]
    fn store_refuses_writes_after_budget() {
        let store = CrashableStore::new();
        let file = FileId::new(1);
        store.crash_after_writes(2);

        store.allocate_segment(file, 0).unwrap();
        store.write_range(file, 0, b"ok").unwrap();
        assert!(store.write_range(file, 2, b"lost").is_err());
        assert!(store.has_crashed());
        assert_eq!(store.read_file(file).unwrap().unwrap(), b"ok");

        store.reset();
        store.write_range(file, 2, b"!").unwrap();
        assert_eq!(store.inner().read_file(file).unwrap().unwrap(), b"ok!");
    }
}
