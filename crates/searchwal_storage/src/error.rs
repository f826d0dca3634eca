//! Error types for storage operations.

use crate::segment::FileId;
use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of the log.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Attempted to read or write outside an index file.
    #[error("range out of bounds in {file}: offset {offset}, len {len}, file size {size}")]
    RangeOutOfBounds {
        /// The index file.
        file: FileId,
        /// The requested offset.
        offset: u64,
        /// The requested length.
        len: u64,
        /// The current file size.
        size: u64,
    },

    /// The index file does not exist.
    #[error("index file not found: {0}")]
    FileNotFound(FileId),

    /// The storage is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The storage directory is held by another process.
    #[error("storage locked: {0}")]
    Locked(String),
}

impl StorageError {
    pub(crate) fn out_of_bounds(file: FileId, offset: u64, len: u64, size: u64) -> Self {
        Self::RangeOutOfBounds {
            file,
            offset,
            len,
            size,
        }
    }

    pub(crate) fn invalid_input(message: String) -> Self {
        Self::Io(io::Error::new(io::ErrorKind::InvalidInput, message))
    }
}
