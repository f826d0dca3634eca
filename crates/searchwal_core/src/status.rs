//! Index status reporting.

use crate::error::CoreResult;
use crate::rmgr::ResourceManagerTable;
use crate::types::{FileId, Lsn};
use searchwal_storage::SegmentStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

/// State of one index file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatus {
    /// File ID.
    pub file: u32,
    /// Length in bytes.
    pub len: u64,
    /// Commit position the file reflects.
    pub applied_lsn: Lsn,
}

/// State of a whole index store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStatus {
    /// Files in ID order.
    pub files: Vec<FileStatus>,
    /// Highest stamp of any file.
    pub max_applied_lsn: Lsn,
    /// Sum of file lengths.
    pub total_bytes: u64,
}

/// Reports the length and stamp of every file in `store`.
///
/// # Errors
///
/// Returns a storage error.
pub fn index_status(store: &dyn SegmentStore) -> CoreResult<IndexStatus> {
    let mut status = IndexStatus::default();
    for file in store.file_ids()? {
        let Some(len) = store.file_len(file)? else {
            continue;
        };
        let applied_lsn = Lsn::new(store.applied_lsn(file)?);
        status.max_applied_lsn = status.max_applied_lsn.max(applied_lsn);
        status.total_bytes += len;
        status.files.push(FileStatus {
            file: file.as_u32(),
            len,
            applied_lsn,
        });
    }
    Ok(status)
}

/// A file that cannot be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenFile {
    /// File ID.
    pub file: u32,
    /// What is wrong with it.
    pub reason: String,
}

/// Lists files that are stamped past `log_end` or cannot be read.
///
/// A file ahead of its log reflects changes no consumer can reproduce;
/// the index has to be rebuilt.
///
/// # Errors
///
/// Returns a storage error if the files cannot be listed.
pub fn list_broken_files(store: &dyn SegmentStore, log_end: Lsn) -> CoreResult<Vec<BrokenFile>> {
    let mut broken = Vec::new();
    for file in store.file_ids()? {
        let reason = match store.applied_lsn(file) {
            Ok(stamp) if stamp > log_end.as_u64() => {
                format!("stamped at {} past log end {log_end}", Lsn::new(stamp))
            }
            Ok(_) => match store.read_file(file) {
                Ok(_) => continue,
                Err(e) => format!("unreadable: {e}"),
            },
            Err(e) => format!("stamp unreadable: {e}"),
        };
        warn!(%file, reason = %reason, "broken index file");
        broken.push(BrokenFile {
            file: file.as_u32(),
            reason,
        });
    }
    Ok(broken)
}

/// Returns files whose contents differ between two stores.
///
/// Bytes blanked by any registered mask function are ignored. A file
/// present in only one store counts as different.
///
/// # Errors
///
/// Returns a storage error.
pub fn diverged_files(
    primary: &dyn SegmentStore,
    replica: &dyn SegmentStore,
    table: &ResourceManagerTable,
) -> CoreResult<Vec<FileId>> {
    let files: BTreeSet<FileId> = primary
        .file_ids()?
        .into_iter()
        .chain(replica.file_ids()?)
        .collect();

    let masked = |store: &dyn SegmentStore, file: FileId| -> CoreResult<Option<Vec<u8>>> {
        let mut bytes = store.read_file(file)?;
        if let Some(bytes) = bytes.as_mut() {
            for mask in table.entries().filter_map(|e| e.mask) {
                mask(file, bytes.as_mut_slice());
            }
        }
        Ok(bytes)
    };

    let mut diverged = Vec::new();
    for file in files {
        if masked(primary, file)? != masked(replica, file)? {
            diverged.push(file);
        }
    }
    Ok(diverged)
}
