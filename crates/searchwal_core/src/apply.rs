//! Physical application of records to index storage.
//!
//! The commit path on the primary and the redo engine on a consumer both
//! go through [`apply_transaction`], so the bytes they produce are the same
//! by construction.

use crate::error::CoreResult;
use crate::rmgr::{RedoEffect, ResourceManagerTable};
use crate::types::{FileId, Lsn};
use crate::wal::{LogRecord, RecordBody};
use searchwal_storage::SegmentStore;
use std::collections::BTreeSet;
use tracing::trace;

/// Applies one record body to storage.
///
/// Redo must converge even when a crash left a transaction's effects on a
/// file partially applied, so application is lenient about the current
/// state:
///
/// - a write starting past the end zero-fills the gap
/// - a truncate to a length beyond the end zero-extends the file
/// - a write or truncate on a missing file is skipped and reported as
///   [`RedoEffect::MissingTarget`]; a later record of the log removes it
///
/// # Errors
///
/// Returns storage errors.
pub fn apply_body(store: &dyn SegmentStore, body: &RecordBody) -> CoreResult<RedoEffect> {
    match body {
        RecordBody::SegmentAlloc { file, len } => store.allocate_segment(*file, *len)?,
        RecordBody::RangeWrite { file, offset, data } => {
            let Some(current) = store.file_len(*file)? else {
                return Ok(RedoEffect::MissingTarget);
            };
            if *offset > current {
                let mut padded = vec![0u8; (*offset - current) as usize];
                padded.extend_from_slice(data);
                store.write_range(*file, current, &padded)?;
            } else {
                store.write_range(*file, *offset, data)?;
            }
        }
        RecordBody::RangeTruncate { file, len } => {
            let Some(current) = store.file_len(*file)? else {
                return Ok(RedoEffect::MissingTarget);
            };
            if *len > current {
                store.write_range(*file, current, &vec![0u8; (*len - current) as usize])?;
            } else {
                store.truncate_file(*file, *len)?;
            }
        }
        RecordBody::FileRemove { file } => {
            store.remove_file(*file)?;
        }
        RecordBody::CompactionRewrite { file, data } => store.replace_file(*file, data)?,
        RecordBody::TxCommit | RecordBody::TxAbort => {}
    }
    Ok(RedoEffect::Applied)
}

/// What applying one committed transaction did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionApply {
    /// Records applied.
    pub applied: usize,
    /// Records skipped because their file already carries the commit.
    pub skipped: usize,
    /// Files whose records were applied.
    pub touched: BTreeSet<FileId>,
    /// Files a record targeted but that did not exist.
    pub missing: BTreeSet<FileId>,
    /// Files removed by the transaction.
    pub removed: BTreeSet<FileId>,
}

/// Applies the data records of a transaction that committed at `commit_lsn`.
///
/// A file whose stamp is already at or past `commit_lsn` is skipped
/// entirely. Every other touched file that still exists afterwards is
/// stamped with `commit_lsn` and synced, after all of its records are
/// applied.
///
/// # Errors
///
/// Returns [`crate::CoreError::UnknownResourceManager`] for a record of an
/// unregistered resource manager, or a storage error.
pub fn apply_transaction(
    store: &dyn SegmentStore,
    table: &ResourceManagerTable,
    commit_lsn: Lsn,
    records: &[LogRecord],
) -> CoreResult<TransactionApply> {
    let mut outcome = TransactionApply::default();
    let mut checked = BTreeSet::new();
    let mut done = BTreeSet::new();

    for record in records {
        let Some(file) = record.file() else {
            continue;
        };
        if checked.insert(file) && store.applied_lsn(file)? >= commit_lsn.as_u64() {
            done.insert(file);
        }
        if done.contains(&file) {
            trace!(%file, lsn = record.lsn.as_u64(), "file already carries commit, skipping");
            outcome.skipped += 1;
            continue;
        }

        let entry = table.get(record.rm_id)?;
        match (entry.redo)(store, record)? {
            RedoEffect::Applied => {
                outcome.applied += 1;
                outcome.missing.remove(&file);
            }
            RedoEffect::MissingTarget => {
                outcome.missing.insert(file);
            }
        }
        if matches!(record.body, RecordBody::FileRemove { .. }) {
            outcome.removed.insert(file);
            outcome.missing.remove(&file);
        } else {
            outcome.removed.remove(&file);
        }
        outcome.touched.insert(file);
    }

    for file in &outcome.touched {
        if store.file_len(*file)?.is_some() {
            store.set_applied_lsn(*file, commit_lsn.as_u64())?;
            store.sync_file(*file)?;
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rmgr::ResourceManagerTable;
    use crate::types::{ResourceManagerId, TransactionId};
    use searchwal_storage::InMemorySegmentStore;

    const F: FileId = FileId::new(1);

    fn record(lsn: u64, body: RecordBody) -> LogRecord {
        LogRecord {
            rm_id: crate::rmgr::SEARCH_RESOURCE_MANAGER_ID,
            txid: TransactionId::new(1),
            lsn: Lsn::new(lsn),
            body,
        }
    }

    fn write(offset: u64, data: &[u8]) -> RecordBody {
        RecordBody::RangeWrite {
            file: F,
            offset,
            data: data.to_vec(),
        }
    }

    #[test]
    fn lenient_write_and_truncate() {
        let store = InMemorySegmentStore::new();
        store.replace_file(F, b"ab").unwrap();

        apply_body(&store, &write(4, b"cd")).unwrap();
        assert_eq!(store.read_file(F).unwrap().unwrap(), b"ab\0\0cd");

        apply_body(&store, &RecordBody::RangeTruncate { file: F, len: 8 }).unwrap();
        assert_eq!(store.file_len(F).unwrap(), Some(8));

        apply_body(&store, &RecordBody::RangeTruncate { file: F, len: 1 }).unwrap();
        assert_eq!(store.read_file(F).unwrap().unwrap(), b"a");
    }

    #[test]
    fn missing_target_is_reported_not_created() {
        let store = InMemorySegmentStore::new();
        let effect = apply_body(&store, &write(0, b"x")).unwrap();
        assert_eq!(effect, RedoEffect::MissingTarget);
        assert_eq!(store.file_len(F).unwrap(), None);
    }

    #[test]
    fn transaction_is_stamped_with_commit_lsn() {
        let table = ResourceManagerTable::search_only();
        let store = InMemorySegmentStore::new();
        let records = vec![
            record(10, RecordBody::SegmentAlloc { file: F, len: 0 }),
            record(20, write(0, b"Groonga")),
        ];

        let outcome = apply_transaction(&store, &table, Lsn::new(30), &records).unwrap();
        assert_eq!(outcome.applied, 2);
        assert_eq!(store.applied_lsn(F).unwrap(), 30);

        let again = apply_transaction(&store, &table, Lsn::new(30), &records).unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(again.skipped, 2);
        assert_eq!(store.read_file(F).unwrap().unwrap(), b"Groonga");
    }

    #[test]
    fn partially_applied_transaction_converges() {
        let table = ResourceManagerTable::search_only();
        let records = vec![
            record(10, write(4, b"wxyz")),
            record(20, RecordBody::RangeTruncate { file: F, len: 2 }),
            record(30, write(2, b"QR")),
        ];

        let clean = InMemorySegmentStore::new();
        clean.replace_file(F, b"abcdef").unwrap();
        apply_transaction(&clean, &table, Lsn::new(40), &records).unwrap();

        let partial = InMemorySegmentStore::new();
        partial.replace_file(F, b"abcdef").unwrap();
        for r in &records[..2] {
            apply_body(&partial, &r.body).unwrap();
        }
        apply_transaction(&partial, &table, Lsn::new(40), &records).unwrap();

        assert_eq!(partial.contents(), clean.contents());
        assert_eq!(clean.read_file(F).unwrap().unwrap(), b"abQR");
    }

    #[test]
    fn unknown_resource_manager_fails() {
        let table = ResourceManagerTable::search_only();
        let store = InMemorySegmentStore::new();
        let mut r = record(10, RecordBody::SegmentAlloc { file: F, len: 0 });
        r.rm_id = ResourceManagerId::new(3);

        let err = apply_transaction(&store, &table, Lsn::new(20), &[r]).unwrap_err();
        assert!(matches!(err, crate::CoreError::UnknownResourceManager(_)));
    }

    #[test]
    fn removed_files_are_not_stamped() {
        let table = ResourceManagerTable::search_only();
        let store = InMemorySegmentStore::new();
        store.replace_file(F, b"old").unwrap();
        let records = vec![record(10, RecordBody::FileRemove { file: F })];

        let outcome = apply_transaction(&store, &table, Lsn::new(20), &records).unwrap();
        assert!(outcome.removed.contains(&F));
        assert_eq!(store.file_len(F).unwrap(), None);
        assert_eq!(store.applied_lsn(F).unwrap(), 0);
    }
}
