//! CLI command implementations.

pub mod catch_up;
pub mod dump_wal;
pub mod recover;
pub mod status;
pub mod verify;

use searchwal_core::wal::LogReader;
use searchwal_core::{CoreError, LogRecord};
use searchwal_storage::{FileLog, LogBackend, StorageError};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the log file inside a data directory.
pub const WAL_FILE: &str = "search.wal";
/// Name of the index directory inside a data directory.
pub const INDEX_DIR: &str = "index";
/// Where `recover` keeps its replay cursor.
pub const RECOVERY_CURSOR_FILE: &str = "recovery.json";
/// Where a standby keeps its replica state.
pub const REPLICA_STATE_FILE: &str = "replica.json";

/// Errors reported by the commands themselves.
#[derive(Debug, Error)]
pub enum CliError {
    /// The data directory has no log.
    #[error("no log found at {0}")]
    MissingLog(PathBuf),

    /// Verification found damage.
    #[error("log verification failed: {0}")]
    VerificationFailed(String),

    /// Unknown `--format` value.
    #[error("unknown output format '{0}' (expected text or json)")]
    UnknownFormat(String),
}

/// How a command prints its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human readable lines.
    Text,
    /// Pretty-printed JSON.
    Json,
}

impl OutputFormat {
    /// Parses a `--format` argument.
    pub fn parse(format: &str) -> Result<Self, CliError> {
        match format {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(CliError::UnknownFormat(other.to_string())),
        }
    }
}

/// Files of one data directory.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Wraps a data directory path.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Path of the log file.
    pub fn wal_path(&self) -> PathBuf {
        self.root.join(WAL_FILE)
    }

    /// Path of the index directory.
    pub fn index_dir(&self) -> PathBuf {
        self.root.join(INDEX_DIR)
    }

    /// Path of the recovery cursor.
    pub fn recovery_cursor_path(&self) -> PathBuf {
        self.root.join(RECOVERY_CURSOR_FILE)
    }

    /// Path of the replica state.
    pub fn replica_state_path(&self) -> PathBuf {
        self.root.join(REPLICA_STATE_FILE)
    }

    /// Opens the existing log without creating one.
    pub fn open_log(&self) -> Result<FileLog, Box<dyn std::error::Error>> {
        let path = self.wal_path();
        if !path.exists() {
            return Err(CliError::MissingLog(path).into());
        }
        Ok(FileLog::open(&path)?)
    }
}

/// Outcome of reading a log from some position to its end.
#[derive(Debug)]
pub struct LogScan {
    /// Records read.
    pub records: u64,
    /// Position just past the last good record.
    pub end: u64,
    /// Size of the log file.
    pub size: u64,
    /// Start of a torn tail, if the log ends in one.
    pub torn_tail: Option<u64>,
    /// Error that stopped the scan before the end.
    pub error: Option<CoreError>,
}

/// Reads every record from `from` to the end of `log`, handing each to
/// `visit` until it returns `false`.
///
/// Damage does not fail the scan; it ends it and is recorded in the
/// result.
pub fn scan_log(
    log: &dyn LogBackend,
    from: u64,
    mut visit: impl FnMut(&LogRecord) -> bool,
) -> Result<LogScan, StorageError> {
    let size = log.size()?;
    let mut reader = LogReader::new(log, from.min(size), size, 0);
    let mut records = 0;
    let mut error = None;
    for item in reader.by_ref() {
        match item {
            Ok(record) => {
                records += 1;
                if !visit(&record) {
                    break;
                }
            }
            Err(CoreError::TornTailRecord { .. }) => break,
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }
    Ok(LogScan {
        records,
        end: reader.position(),
        size,
        torn_tail: reader.torn_tail(),
        error,
    })
}
