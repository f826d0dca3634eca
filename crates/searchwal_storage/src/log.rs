//! The byte store under the host log.

use crate::error::StorageResult;

/// Append-only bytes holding the host log.
///
/// A backend knows nothing about frames, LSNs or checksums; `searchwal_core`
/// lays those over it. What it must guarantee:
///
/// | Operation | Guarantee |
/// |---|---|
/// | `append` | bytes land at the current end, which is returned |
/// | `read_at` | sees every appended byte, flushed or not |
/// | `flush` | appended bytes survive a crash once it returns |
/// | `truncate` | only ever shrinks; used to cut a torn tail |
///
/// Bytes appended but not flushed may be partly or wholly lost in a crash.
/// That is exactly the torn tail the log reader tolerates.
pub trait LogBackend: Send + Sync {
    /// Reads `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReadPastEnd`](crate::StorageError::ReadPastEnd)
    /// if the range is not fully inside the log, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the position it starts at.
    ///
    /// # Errors
    ///
    /// Returns an I/O error. Part of `data` may have been written.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Makes everything appended so far durable.
    ///
    /// # Errors
    ///
    /// Returns an I/O error; the durable prefix is then unknown.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the log length, which is where the next append goes.
    ///
    /// # Errors
    ///
    /// Returns an I/O error.
    fn size(&self) -> StorageResult<u64>;

    /// Like `flush`, but also makes the length itself durable.
    ///
    /// # Errors
    ///
    /// Returns an I/O error.
    fn sync(&mut self) -> StorageResult<()>;

    /// Cuts the log back to `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` is past the end, or an I/O error.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
