//! The redo engine.
//!
//! Consumes records in log order and brings index storage up to date. The
//! same engine serves crash recovery on the primary and continuous apply on
//! replicas.
//!
//! Data records are buffered per transaction. When a transaction's
//! `TxCommit` arrives its records are applied through
//! [`apply_transaction`], which stamps every file it touches with the
//! commit position. A `TxAbort` discards the buffer. Commits at or below
//! the cursor's applied position are already reflected in storage and are
//! skipped.
//!
//! Any error halts the engine: a consumer that cannot apply a record must
//! not apply anything after it.

use crate::apply::{apply_transaction, TransactionApply};
use crate::cursor::ReplayCursor;
use crate::error::{CoreError, CoreResult};
use crate::rmgr::ResourceManagerTable;
use crate::types::{FileId, Lsn, TransactionId};
use crate::wal::{LogRecord, RecordBody};
use searchwal_storage::SegmentStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// What feeding one record to the engine did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// A data record was buffered until its transaction ends.
    Buffered,
    /// A commit was applied to storage.
    Applied(TransactionApply),
    /// A commit at or below the applied position; its records were dropped.
    AlreadyApplied {
        /// Buffered records dropped.
        discarded: usize,
    },
    /// An abort; the transaction's buffered records were dropped.
    Aborted {
        /// Buffered records dropped.
        discarded: usize,
    },
}

/// Counters kept by a [`RedoEngine`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedoStats {
    /// Records consumed.
    pub records: u64,
    /// Transactions applied.
    pub committed: u64,
    /// Commits skipped as already applied.
    pub already_applied: u64,
    /// Transactions aborted.
    pub aborted: u64,
    /// Data records applied to storage.
    pub records_applied: u64,
    /// Data records skipped because their file already carried the commit.
    pub records_skipped: u64,
}

#[derive(Debug)]
struct OpenTransaction {
    first_start: u64,
    records: Vec<LogRecord>,
}

/// Applies records to index storage in log order.
pub struct RedoEngine {
    table: Arc<ResourceManagerTable>,
    cursor: ReplayCursor,
    /// End of the last record consumed.
    position: Lsn,
    open: BTreeMap<TransactionId, OpenTransaction>,
    /// Files a committed record targeted that did not exist at the time.
    missing: BTreeSet<FileId>,
    halted: Option<String>,
    stats: RedoStats,
}

impl RedoEngine {
    /// Creates an engine that resumes from `cursor`.
    ///
    /// The first record fed to it must start at `cursor.restart_lsn`.
    #[must_use]
    pub fn new(table: Arc<ResourceManagerTable>, cursor: ReplayCursor) -> Self {
        Self {
            table,
            position: cursor.restart_lsn,
            cursor,
            open: BTreeMap::new(),
            missing: BTreeSet::new(),
            halted: None,
            stats: RedoStats::default(),
        }
    }

    /// Feeds the next record of the log.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ReplayHalted`] if an earlier record failed
    /// - [`CoreError::OrderingViolation`] if the record does not start
    ///   exactly where the previous one ended
    /// - [`CoreError::UnknownResourceManager`] if no resource manager is
    ///   registered for the record
    /// - a storage error if a commit cannot be applied
    ///
    /// Every error except `ReplayHalted` halts the engine.
    pub fn apply(&mut self, store: &dyn SegmentStore, record: &LogRecord) -> CoreResult<RecordOutcome> {
        if let Some(reason) = &self.halted {
            return Err(CoreError::replay_halted(reason.clone()));
        }
        match self.apply_inner(store, record) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(lsn = %record.lsn, txid = record.txid.as_u64(), error = %e, "redo halted");
                self.halted = Some(format!("record at {} failed: {e}", record.lsn));
                Err(e)
            }
        }
    }

    fn apply_inner(&mut self, store: &dyn SegmentStore, record: &LogRecord) -> CoreResult<RecordOutcome> {
        if record.start() != self.position.as_u64() {
            return Err(CoreError::ordering_violation(format!(
                "record {} starts at {}, expected {}",
                record.lsn,
                Lsn::new(record.start()),
                self.position
            )));
        }
        self.table.get(record.rm_id)?;
        self.position = record.lsn;
        self.stats.records += 1;

        let outcome = match &record.body {
            RecordBody::TxCommit => self.commit(store, record)?,
            RecordBody::TxAbort => {
                let discarded = self.open.remove(&record.txid).map_or(0, |t| t.records.len());
                self.stats.aborted += 1;
                debug!(txid = record.txid.as_u64(), discarded, "transaction aborted");
                RecordOutcome::Aborted { discarded }
            }
            _ => {
                self.open
                    .entry(record.txid)
                    .or_insert_with(|| OpenTransaction {
                        first_start: record.start(),
                        records: Vec::new(),
                    })
                    .records
                    .push(record.clone());
                trace!(lsn = %record.lsn, txid = record.txid.as_u64(), "buffered record");
                RecordOutcome::Buffered
            }
        };

        let applied = self.cursor.applied_lsn.max(record.lsn);
        let restart = self
            .open
            .values()
            .map(|t| Lsn::new(t.first_start))
            .min()
            .unwrap_or(applied);
        self.cursor.advance_to(ReplayCursor::new(applied, restart))?;
        Ok(outcome)
    }

    fn commit(&mut self, store: &dyn SegmentStore, record: &LogRecord) -> CoreResult<RecordOutcome> {
        let records = self
            .open
            .remove(&record.txid)
            .map(|t| t.records)
            .unwrap_or_default();

        if record.lsn <= self.cursor.applied_lsn {
            self.stats.already_applied += 1;
            trace!(lsn = %record.lsn, txid = record.txid.as_u64(), "commit already applied");
            return Ok(RecordOutcome::AlreadyApplied {
                discarded: records.len(),
            });
        }

        let outcome = apply_transaction(store, &self.table, record.lsn, &records)?;
        for file in &outcome.touched {
            if outcome.missing.contains(file) {
                self.missing.insert(*file);
            } else {
                self.missing.remove(file);
            }
        }
        self.stats.committed += 1;
        self.stats.records_applied += outcome.applied as u64;
        self.stats.records_skipped += outcome.skipped as u64;
        debug!(
            lsn = %record.lsn,
            txid = record.txid.as_u64(),
            applied = outcome.applied,
            skipped = outcome.skipped,
            "transaction redone"
        );
        Ok(RecordOutcome::Applied(outcome))
    }

    /// Checks that storage is consistent with everything consumed so far.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ReplayHalted`] if the engine halted
    /// - [`CoreError::OrderingViolation`] if a file is stamped past the
    ///   applied position, or a committed record targeted a file that
    ///   never came to exist
    pub fn finish(&self, store: &dyn SegmentStore) -> CoreResult<ReplayCursor> {
        if let Some(reason) = &self.halted {
            return Err(CoreError::replay_halted(reason.clone()));
        }
        for file in store.file_ids()? {
            let stamp = store.applied_lsn(file)?;
            if stamp > self.cursor.applied_lsn.as_u64() {
                return Err(CoreError::ordering_violation(format!(
                    "{file} reflects {} but the log was applied only up to {}",
                    Lsn::new(stamp),
                    self.cursor.applied_lsn
                )));
            }
        }
        if !self.missing.is_empty() {
            let files: Vec<String> = self.missing.iter().map(ToString::to_string).collect();
            return Err(CoreError::ordering_violation(format!(
                "committed records target files that do not exist: {}",
                files.join(", ")
            )));
        }
        Ok(self.cursor)
    }

    /// Returns the cursor after the last record consumed.
    #[must_use]
    pub fn cursor(&self) -> ReplayCursor {
        self.cursor
    }

    /// Returns the position where the next record must start.
    #[must_use]
    pub fn position(&self) -> Lsn {
        self.position
    }

    /// Returns the counters.
    #[must_use]
    pub fn stats(&self) -> RedoStats {
        self.stats
    }

    /// Returns `true` if an error stopped the engine.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Returns why the engine halted.
    #[must_use]
    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Returns the transactions that logged records but have not ended.
    #[must_use]
    pub fn open_transactions(&self) -> Vec<TransactionId> {
        self.open.keys().copied().collect()
    }
}

impl std::fmt::Debug for RedoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedoEngine")
            .field("cursor", &self.cursor)
            .field("position", &self.position)
            .field("open", &self.open.len())
            .field("halted", &self.halted)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::rmgr::SEARCH_RESOURCE_MANAGER_ID;
    use crate::types::ResourceManagerId;
    use crate::wal::Wal;
    use searchwal_storage::{InMemoryLog, InMemorySegmentStore};

    const F1: FileId = FileId::new(1);
    const F2: FileId = FileId::new(2);

    /// Appends `(txid, body)` pairs to a fresh log and returns the records.
    fn log(entries: Vec<(u64, RecordBody)>) -> Vec<LogRecord> {
        let wal = Wal::open(Box::new(InMemoryLog::new()), &Config::default()).unwrap();
        entries
            .into_iter()
            .map(|(txid, body)| {
                wal.append(SEARCH_RESOURCE_MANAGER_ID, TransactionId::new(txid), body)
                    .unwrap()
            })
            .collect()
    }

    fn alloc(file: FileId) -> RecordBody {
        RecordBody::SegmentAlloc { file, len: 0 }
    }

    fn write(file: FileId, offset: u64, data: &[u8]) -> RecordBody {
        RecordBody::RangeWrite {
            file,
            offset,
            data: data.to_vec(),
        }
    }

    fn replay(
        store: &dyn SegmentStore,
        cursor: ReplayCursor,
        records: &[LogRecord],
    ) -> CoreResult<RedoEngine> {
        let mut engine = RedoEngine::new(Arc::new(ResourceManagerTable::search_only()), cursor);
        for record in records {
            engine.apply(store, record)?;
        }
        Ok(engine)
    }

    fn interleaved() -> Vec<LogRecord> {
        log(vec![
            (1, alloc(F1)),
            (2, alloc(F2)),
            (1, write(F1, 0, b"committed")),
            (2, write(F2, 0, b"aborted")),
            (3, alloc(FileId::new(3))),
            (1, RecordBody::TxCommit),
            (2, RecordBody::TxAbort),
        ])
    }

    #[test]
    fn only_committed_transactions_reach_storage() {
        let records = interleaved();
        let store = InMemorySegmentStore::new();
        let engine = replay(&store, ReplayCursor::default(), &records).unwrap();

        assert_eq!(store.read_file(F1).unwrap().unwrap(), b"committed");
        assert_eq!(store.file_len(F2).unwrap(), None);
        assert_eq!(store.applied_lsn(F1).unwrap(), records[5].lsn.as_u64());
        assert_eq!(engine.open_transactions(), vec![TransactionId::new(3)]);

        let stats = engine.stats();
        assert_eq!(stats.records, 7);
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.aborted, 1);
        assert_eq!(stats.records_applied, 2);
    }

    #[test]
    fn cursor_restarts_at_oldest_open_transaction() {
        let records = interleaved();
        let store = InMemorySegmentStore::new();
        let engine = replay(&store, ReplayCursor::default(), &records).unwrap();

        let cursor = engine.cursor();
        assert_eq!(cursor.applied_lsn, records[6].lsn);
        assert_eq!(cursor.restart_lsn, Lsn::new(records[4].start()));
        assert_eq!(engine.finish(&store).unwrap(), cursor);
    }

    #[test]
    fn resuming_from_a_cursor_skips_applied_commits() {
        let records = log(vec![
            (1, alloc(F1)),
            (2, alloc(F2)),
            (1, RecordBody::TxCommit),
            (2, write(F2, 0, b"late")),
            (2, RecordBody::TxCommit),
        ]);
        let store = InMemorySegmentStore::new();
        let first = replay(&store, ReplayCursor::default(), &records[..3]).unwrap();
        let cursor = first.cursor();
        assert_eq!(cursor.restart_lsn, Lsn::new(records[1].start()));

        let from = records
            .iter()
            .position(|r| r.start() == cursor.restart_lsn.as_u64())
            .unwrap();
        let mut engine = RedoEngine::new(Arc::new(ResourceManagerTable::search_only()), cursor);
        let outcomes: Vec<RecordOutcome> = records[from..]
            .iter()
            .map(|r| engine.apply(&store, r).unwrap())
            .collect();

        assert_eq!(outcomes[1], RecordOutcome::AlreadyApplied { discarded: 0 });
        assert!(matches!(outcomes[3], RecordOutcome::Applied(_)));
        assert_eq!(store.read_file(F2).unwrap().unwrap(), b"late");
        assert_eq!(engine.cursor(), ReplayCursor::at(records[4].lsn));
    }

    #[test]
    fn replaying_twice_changes_nothing() {
        let records = interleaved();
        let store = InMemorySegmentStore::new();
        replay(&store, ReplayCursor::default(), &records).unwrap();
        let once = store.contents();

        let engine = replay(&store, ReplayCursor::default(), &records).unwrap();
        assert_eq!(store.contents(), once);
        assert_eq!(engine.stats().records_applied, 0);
        assert_eq!(engine.stats().records_skipped, 2);
    }

    #[test]
    fn gaps_halt_the_engine() {
        let records = interleaved();
        let store = InMemorySegmentStore::new();
        let mut engine = RedoEngine::new(
            Arc::new(ResourceManagerTable::search_only()),
            ReplayCursor::default(),
        );
        engine.apply(&store, &records[0]).unwrap();

        let err = engine.apply(&store, &records[2]).unwrap_err();
        assert!(matches!(err, CoreError::OrderingViolation { .. }));
        assert!(engine.is_halted());

        let err = engine.apply(&store, &records[1]).unwrap_err();
        assert!(matches!(err, CoreError::ReplayHalted { .. }));
        assert!(matches!(engine.finish(&store), Err(CoreError::ReplayHalted { .. })));
    }

    #[test]
    fn first_record_must_start_at_restart() {
        let records = interleaved();
        let store = InMemorySegmentStore::new();
        let mut engine = RedoEngine::new(
            Arc::new(ResourceManagerTable::search_only()),
            ReplayCursor::at(records[0].lsn),
        );
        let err = engine.apply(&store, &records[2]).unwrap_err();
        assert!(matches!(err, CoreError::OrderingViolation { .. }));
    }

    #[test]
    fn unknown_resource_manager_halts() {
        let mut records = interleaved();
        records[0].rm_id = ResourceManagerId::new(17);
        let store = InMemorySegmentStore::new();
        let err = replay(&store, ReplayCursor::default(), &records).unwrap_err();
        assert!(matches!(err, CoreError::UnknownResourceManager(_)));
    }

    #[test]
    fn storage_ahead_of_log_is_detected() {
        let records = interleaved();
        let store = InMemorySegmentStore::new();
        store.replace_file(F2, b"from the future").unwrap();
        store.set_applied_lsn(F2, 1 << 40).unwrap();

        let engine = replay(&store, ReplayCursor::default(), &records).unwrap();
        let err = engine.finish(&store).unwrap_err();
        assert!(matches!(err, CoreError::OrderingViolation { .. }));
    }

    #[test]
    fn missing_targets_are_reported_until_removed() {
        let records = log(vec![
            (1, write(F1, 0, b"orphan")),
            (1, RecordBody::TxCommit),
        ]);
        let store = InMemorySegmentStore::new();
        let engine = replay(&store, ReplayCursor::default(), &records).unwrap();
        assert!(matches!(engine.finish(&store), Err(CoreError::OrderingViolation { .. })));

        let records = log(vec![
            (1, write(F1, 0, b"orphan")),
            (1, RecordBody::TxCommit),
            (2, RecordBody::FileRemove { file: F1 }),
            (2, RecordBody::TxCommit),
        ]);
        let store = InMemorySegmentStore::new();
        let engine = replay(&store, ReplayCursor::default(), &records).unwrap();
        engine.finish(&store).unwrap();
    }
}
