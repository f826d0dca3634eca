//! Segment store trait definition.

use crate::error::StorageResult;
use std::fmt;

/// Identifier of one physical index file (segment, lexicon, postings...).
///
/// The search engine decides what each file holds; storage only sees bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u32);

impl FileId {
    /// Creates a new file ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file:{}", self.0)
    }
}

/// Native file primitives of the external search-storage engine.
///
/// This is the narrow capability the redo path is allowed to use. It is
/// implemented by the storage collaborator and injected wherever index
/// files are mutated, so neither the writer nor the redo engine embeds
/// storage details.
///
/// Every file carries an *applied LSN stamp*: the position of the last log
/// record whose effect the file reflects. Stamps are raw `u64`s here; the
/// core crate gives them meaning.
///
/// # Invariants
///
/// - `allocate_segment` leaves the file exactly `len` zero bytes long
/// - `write_range` never writes past `offset + data.len()` and may only
///   start at or before the current end of the file
/// - `truncate_file` never grows a file
/// - stamps survive `sync_file`; a removed file loses its stamp
pub trait SegmentStore: Send + Sync {
    /// Creates the file, or resets an existing one, to `len` zero bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or sized.
    fn allocate_segment(&self, file: FileId, len: u64) -> StorageResult<()>;

    /// Writes `data` at `offset`, extending the file if the write runs past its end.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or `offset` is beyond its end.
    fn write_range(&self, file: FileId, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Shrinks the file to `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or shorter than `len`.
    fn truncate_file(&self, file: FileId, len: u64) -> StorageResult<()>;

    /// Removes the file and its stamp.
    ///
    /// Returns `false` if the file did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if removal fails.
    fn remove_file(&self, file: FileId) -> StorageResult<bool>;

    /// Reads `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or the range is out of bounds.
    fn read_range(&self, file: FileId, offset: u64, len: u64) -> StorageResult<Vec<u8>>;

    /// Returns the file length, or `None` if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the length cannot be determined.
    fn file_len(&self, file: FileId) -> StorageResult<Option<u64>>;

    /// Lists all existing files in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be enumerated.
    fn file_ids(&self) -> StorageResult<Vec<FileId>>;

    /// Returns the applied LSN stamp of a file (0 when unstamped or missing).
    ///
    /// # Errors
    ///
    /// Returns an error if the stamp cannot be read.
    fn applied_lsn(&self, file: FileId) -> StorageResult<u64>;

    /// Records the applied LSN stamp of an existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or the stamp cannot be stored.
    fn set_applied_lsn(&self, file: FileId, lsn: u64) -> StorageResult<()>;

    /// Makes the file's bytes and stamp durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync_file(&self, file: FileId) -> StorageResult<()>;

    /// Reads a whole file, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn read_file(&self, file: FileId) -> StorageResult<Option<Vec<u8>>> {
        match self.file_len(file)? {
            Some(len) => self.read_range(file, 0, len).map(Some),
            None => Ok(None),
        }
    }

    /// Replaces the file's contents with `data`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be reset or written.
    fn replace_file(&self, file: FileId, data: &[u8]) -> StorageResult<()> {
        self.allocate_segment(file, 0)?;
        self.write_range(file, 0, data)
    }
}
