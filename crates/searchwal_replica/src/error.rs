//! Error types for the replica apply loop.

use searchwal_core::CoreError;
use std::io;
use thiserror::Error;

/// Result type for replica operations.
pub type ReplicaResult<T> = Result<T, ReplicaError>;

/// Errors that can occur while applying the log on a replica.
#[derive(Error, Debug)]
pub enum ReplicaError {
    /// Error from the log or the redo engine.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Error from index storage.
    #[error("storage error: {0}")]
    Storage(#[from] searchwal_storage::StorageError),

    /// I/O error while persisting the cursor.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The persisted cursor state could not be encoded or decoded.
    #[error("cursor state error: {0}")]
    CursorState(String),

    /// The replica hit a fatal error earlier and its index must be rebuilt
    /// from a fresh base backup.
    #[error("replica needs rebuild: {reason}")]
    NeedsRebuild {
        /// The error that made the index untrustworthy.
        reason: String,
    },

    /// The loop stopped after an error; reopen it to retry.
    #[error("apply loop halted: {reason}")]
    Halted {
        /// Why the loop halted.
        reason: String,
    },
}

impl ReplicaError {
    /// Creates a cursor state error.
    pub fn cursor_state(message: impl Into<String>) -> Self {
        Self::CursorState(message.into())
    }

    /// Returns true if the index can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        match self {
            ReplicaError::Core(e) => e.is_fatal(),
            ReplicaError::NeedsRebuild { .. } => true,
            _ => false,
        }
    }
}
