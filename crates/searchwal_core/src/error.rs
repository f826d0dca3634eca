//! Error types for searchwal core.

use crate::types::{FileId, ResourceManagerId, TransactionId};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in searchwal core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] searchwal_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record failed its checksum or length checks inside the established
    /// part of the log.
    #[error("corrupt log record at offset {offset}: {reason}")]
    CorruptRecord {
        /// Log position where the damaged frame starts.
        offset: u64,
        /// What was wrong with it.
        reason: String,
    },

    /// A record at the current end of the log is incomplete.
    ///
    /// This is the expected result of a crash mid-append and is not fatal.
    #[error("torn record at log tail, offset {offset}")]
    TornTailRecord {
        /// Log position where the incomplete frame starts.
        offset: u64,
    },

    /// A record type or format version this build does not understand.
    #[error("unsupported record type {type_byte} (format version {version})")]
    UnsupportedRecordType {
        /// The raw type byte.
        type_byte: u8,
        /// The frame format version.
        version: u16,
    },

    /// Records arrived out of order, with a gap, or storage is ahead of
    /// its log.
    #[error("ordering violation: {message}")]
    OrderingViolation {
        /// Description of the violation.
        message: String,
    },

    /// A log record could not be made durable before its data change.
    #[error("write ordering failure: {message}")]
    WriteOrderingFailure {
        /// Description of the failure.
        message: String,
    },

    /// A record names a resource manager that is not registered.
    #[error("unknown resource manager {0}")]
    UnknownResourceManager(ResourceManagerId),

    /// Two resource managers were registered under the same ID.
    #[error("resource manager {0} registered twice")]
    DuplicateResourceManager(ResourceManagerId),

    /// The transaction already committed, aborted, or failed.
    #[error("transaction {0} is not active")]
    TransactionNotActive(TransactionId),

    /// Another active transaction owns the file.
    #[error("{file} is locked by {owner}")]
    FileLocked {
        /// The contended file.
        file: FileId,
        /// The transaction holding it.
        owner: TransactionId,
    },

    /// A record payload exceeds what a frame can carry.
    #[error("record payload of {size} bytes exceeds maximum of {max} bytes")]
    RecordTooLarge {
        /// Payload size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A change would grow an index file past the configured limit.
    #[error("{file} would grow to {size} bytes, limit is {max} bytes")]
    FileTooLarge {
        /// The file being changed.
        file: FileId,
        /// Size the change asks for.
        size: u64,
        /// Configured maximum.
        max: u64,
    },

    /// Replay stopped after a fatal error and refuses further records.
    #[error("replay halted: {reason}")]
    ReplayHalted {
        /// The error that halted replay.
        reason: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a corrupt record error.
    pub fn corrupt_record(offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptRecord {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates an ordering violation error.
    pub fn ordering_violation(message: impl Into<String>) -> Self {
        Self::OrderingViolation {
            message: message.into(),
        }
    }

    /// Creates a write ordering failure error.
    pub fn write_ordering_failure(message: impl Into<String>) -> Self {
        Self::WriteOrderingFailure {
            message: message.into(),
        }
    }

    /// Creates a replay halted error.
    pub fn replay_halted(reason: impl Into<String>) -> Self {
        Self::ReplayHalted {
            reason: reason.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns `true` if the error leaves the index untrustworthy until it
    /// is rebuilt.
    ///
    /// Torn tails are not fatal: replay stops cleanly and resumes once the
    /// record is complete.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CorruptRecord { .. }
                | Self::UnsupportedRecordType { .. }
                | Self::OrderingViolation { .. }
                | Self::UnknownResourceManager(_)
                | Self::ReplayHalted { .. }
        )
    }

    /// Returns the log position a record error refers to, if any.
    #[must_use]
    pub fn offset(&self) -> Option<u64> {
        match self {
            Self::CorruptRecord { offset, .. } | Self::TornTailRecord { offset } => Some(*offset),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_follows_error_class() {
        assert!(CoreError::corrupt_record(10, "crc").is_fatal());
        assert!(!CoreError::TornTailRecord { offset: 10 }.is_fatal());
        assert!(CoreError::UnsupportedRecordType {
            type_byte: 99,
            version: 1
        }
        .is_fatal());
        assert!(CoreError::ordering_violation("gap").is_fatal());
        assert!(!CoreError::write_ordering_failure("flush failed").is_fatal());
    }

    #[test]
    fn offsets_are_exposed() {
        assert_eq!(CoreError::corrupt_record(42, "x").offset(), Some(42));
        assert_eq!(CoreError::invalid_operation("x").offset(), None);
    }
}
