//! Crash recovery.

use crate::config::Config;
use crate::cursor::ReplayCursor;
use crate::error::{CoreError, CoreResult};
use crate::redo::{RedoEngine, RedoStats};
use crate::rmgr::ResourceManagerTable;
use crate::types::{Lsn, TransactionId};
use crate::wal::{RecordBody, Wal};
use searchwal_storage::SegmentStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Records read from the log per batch during recovery.
const RECOVERY_BATCH: usize = 1024;

/// What a recovery run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Cursor after recovery; persist it to bound the next run.
    pub cursor: ReplayCursor,
    /// Redo counters.
    pub stats: RedoStats,
    /// Transactions that had no outcome in the log and were aborted.
    pub aborted: Vec<TransactionId>,
    /// Start of the torn tail cut when the log was opened.
    pub truncated_tail: Option<u64>,
    /// End of the log after recovery.
    pub log_end: Lsn,
}

/// Brings `store` up to date with the log after a crash.
///
/// Replays every record from `cursor.restart_lsn` to the end of the log.
/// Transactions that logged records but neither committed nor aborted were
/// cut off by the crash; each gets a `TxAbort` appended so later consumers
/// of the log can forget them. The aborts are flushed before returning.
///
/// Must run before any transaction starts on `wal`.
///
/// # Errors
///
/// - [`CoreError::OrderingViolation`] if `cursor` is past the end of the
///   log, or storage reflects changes the log does not hold
/// - anything the redo engine reports
pub fn recover(
    wal: &Wal,
    store: &dyn SegmentStore,
    table: Arc<ResourceManagerTable>,
    cursor: ReplayCursor,
    config: &Config,
) -> CoreResult<RecoveryReport> {
    let durable = wal.durable_lsn();
    if cursor.applied_lsn > durable {
        return Err(CoreError::ordering_violation(format!(
            "cursor at {} is past the end of the log at {durable}",
            cursor.applied_lsn
        )));
    }
    info!(applied = %cursor.applied_lsn, restart = %cursor.restart_lsn, end = %durable, "starting recovery");

    let mut engine = RedoEngine::new(table, cursor);
    let mut from = cursor.restart_lsn;
    loop {
        let batch = wal.read_batch(from, cursor.applied_lsn, RECOVERY_BATCH)?;
        if batch.is_empty() {
            break;
        }
        for record in &batch.records {
            engine.apply(store, record)?;
        }
        from = batch.end;
    }

    let aborted = engine.open_transactions();
    if !aborted.is_empty() {
        for txid in &aborted {
            warn!(txid = txid.as_u64(), "transaction has no outcome, aborting");
            let record = wal.append(config.resource_manager_id, *txid, RecordBody::TxAbort)?;
            wal.flush(record.lsn)?;
            engine.apply(store, &record)?;
        }
    }

    let cursor = engine.finish(store)?;
    let report = RecoveryReport {
        cursor,
        stats: engine.stats(),
        aborted,
        truncated_tail: wal.truncated_tail(),
        log_end: wal.end_lsn(),
    };
    info!(
        applied = %report.cursor.applied_lsn,
        records = report.stats.records,
        committed = report.stats.committed,
        aborted = report.aborted.len(),
        "recovery complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ConsistencyCoordinator;
    use crate::types::FileId;
    use searchwal_storage::{InMemoryLog, InMemorySegmentStore};

    const F1: FileId = FileId::new(1);
    const F2: FileId = FileId::new(2);

    fn table() -> Arc<ResourceManagerTable> {
        Arc::new(ResourceManagerTable::search_only())
    }

    fn open_wal(log: &InMemoryLog) -> Wal {
        Wal::open(Box::new(log.clone()), &Config::default()).unwrap()
    }

    /// Runs a workload against `store`: t1 commits, t2 stays open across
    /// t3's commit, then the process dies.
    fn crashed_workload(log: &InMemoryLog, store: Arc<InMemorySegmentStore>) -> TransactionId {
        let wal = Arc::new(open_wal(log));
        let coordinator =
            ConsistencyCoordinator::new(wal, store, table(), Config::default()).unwrap();

        let mut t1 = coordinator.begin();
        t1.allocate_segment(F1, 0).unwrap();
        t1.write_range(F1, 0, b"first").unwrap();
        coordinator.commit(t1).unwrap();

        let mut t2 = coordinator.begin();
        t2.allocate_segment(F2, 0).unwrap();
        t2.write_range(F2, 0, b"never").unwrap();
        let open = t2.txid();

        let mut t3 = coordinator.begin();
        t3.write_range(F1, 5, b"+third").unwrap();
        coordinator.commit(t3).unwrap();

        std::mem::forget(t2);
        log.crash();
        open
    }

    #[test]
    fn lost_storage_is_rebuilt_from_the_log() {
        let log = InMemoryLog::new();
        let live = Arc::new(InMemorySegmentStore::new());
        let open = crashed_workload(&log, Arc::clone(&live));

        let fresh = InMemorySegmentStore::new();
        let wal = open_wal(&log);
        let report =
            recover(&wal, &fresh, table(), ReplayCursor::default(), &Config::default()).unwrap();

        assert_eq!(fresh.read_file(F1).unwrap().unwrap(), b"first+third");
        assert_eq!(fresh.file_len(F2).unwrap(), None);
        assert_eq!(fresh.contents(), live.contents());
        assert_eq!(report.aborted, vec![open]);
        assert_eq!(report.stats.committed, 2);
        assert_eq!(report.cursor, ReplayCursor::at(wal.end_lsn()));
    }

    #[test]
    fn recovery_aborts_are_durable_and_final() {
        let log = InMemoryLog::new();
        crashed_workload(&log, Arc::new(InMemorySegmentStore::new()));

        let wal = open_wal(&log);
        let store = InMemorySegmentStore::new();
        recover(&wal, &store, table(), ReplayCursor::default(), &Config::default()).unwrap();
        assert_eq!(log.durable_len(), wal.end_lsn().as_u64());
        drop(wal);

        let wal = open_wal(&log);
        let again =
            recover(&wal, &store, table(), ReplayCursor::default(), &Config::default()).unwrap();
        assert!(again.aborted.is_empty());
        assert_eq!(again.stats.records_applied, 0);
    }

    #[test]
    fn recovery_resumes_from_a_checkpoint() {
        let log = InMemoryLog::new();
        let store = Arc::new(InMemorySegmentStore::new());
        let wal = Arc::new(open_wal(&log));
        let coordinator = ConsistencyCoordinator::new(
            Arc::clone(&wal),
            Arc::clone(&store) as Arc<dyn SegmentStore>,
            table(),
            Config::default(),
        )
        .unwrap();

        let mut t1 = coordinator.begin();
        t1.allocate_segment(F1, 0).unwrap();
        coordinator.commit(t1).unwrap();
        let checkpoint = coordinator.checkpoint();
        let snapshot = store.fork();

        let mut t2 = coordinator.begin();
        t2.write_range(F1, 0, b"after").unwrap();
        coordinator.commit(t2).unwrap();
        drop(coordinator);
        drop(wal);

        let wal = open_wal(&log);
        let report = recover(&wal, &snapshot, table(), checkpoint, &Config::default()).unwrap();
        assert_eq!(report.stats.committed, 1);
        assert_eq!(snapshot.contents(), store.contents());
    }

    #[test]
    fn cursor_past_the_log_is_refused() {
        let wal = open_wal(&InMemoryLog::new());
        let err = recover(
            &wal,
            &InMemorySegmentStore::new(),
            table(),
            ReplayCursor::at(Lsn::new(4096)),
            &Config::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::OrderingViolation { .. }));
    }
}
