//! The consistency coordinator.
//!
//! Ties the log, the interceptor and index storage together on the writer:
//!
//! ```text
//!   begin ──► TransactionContext ──► interceptor ──► log (append)
//!                                         │
//!                                         └──► private overlay
//!
//!   commit ──► TxCommit ──► flush ──► apply to storage ──► visible
//! ```
//!
//! Storage is changed only after the commit record is durable, and the
//! whole transaction becomes visible at once. A transaction that aborts or
//! is dropped never touches storage at all.
//!
//! If a commit record cannot be made durable, or a durable commit cannot be
//! applied, storage and log can no longer be kept in step. The coordinator
//! then halts: the log is poisoned, every later commit is refused, and the
//! checkpoint cursor stays where it was before the failed commit so that
//! recovery replays it.

use crate::apply::apply_transaction;
use crate::config::{Config, SynchronousCommit};
use crate::cursor::ReplayCursor;
use crate::error::{CoreError, CoreResult};
use crate::interceptor::MutationInterceptor;
use crate::rmgr::ResourceManagerTable;
use crate::transaction::{TransactionContext, TransactionRegistry, TransactionState};
use crate::types::{FileId, Lsn, TransactionId};
use crate::wal::{RecordBody, Wal};
use parking_lot::{Mutex, RwLock};
use searchwal_storage::SegmentStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Observer of transaction outcomes.
pub trait TransactionListener: Send + Sync {
    /// Called after a transaction's changes became visible.
    ///
    /// `commit_lsn` is `None` for a transaction that changed nothing.
    fn on_commit(&self, txid: TransactionId, commit_lsn: Option<Lsn>, files: &[FileId]);

    /// Called after a transaction was aborted through the coordinator.
    fn on_abort(&self, txid: TransactionId);
}

/// A replica's applied position, as seen by the writer.
pub trait ReplicaWatermark: Send + Sync {
    /// Returns the position up to which the replica has applied the log.
    fn applied_lsn(&self) -> Lsn;

    /// Blocks until the replica has applied `lsn` or `timeout` passes.
    /// Returns whether it caught up.
    fn wait_for(&self, lsn: Lsn, timeout: Duration) -> bool;
}

/// Outcome of waiting for replicas after a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// Commits are acknowledged locally.
    NotRequested,
    /// Remote apply was requested but no replica is registered.
    NoReplicas,
    /// Every registered replica applied the commit.
    Applied,
    /// At least one replica did not catch up in time.
    TimedOut,
}

/// What a successful commit produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// The committed transaction.
    pub txid: TransactionId,
    /// Position of the `TxCommit` record; `None` if nothing was logged.
    pub commit_lsn: Option<Lsn>,
    /// Files the transaction changed.
    pub files: Vec<FileId>,
    /// Replica acknowledgment.
    pub remote_apply: RemoteApply,
}

/// Coordinates transactions over one log and one index store.
///
/// Build it after recovery has run against the same log and store; every
/// commit already in the log is then reflected in storage, and the
/// coordinator starts out with everything up to the log end visible.
pub struct ConsistencyCoordinator {
    wal: Arc<Wal>,
    store: Arc<dyn SegmentStore>,
    table: Arc<ResourceManagerTable>,
    config: Config,
    interceptor: MutationInterceptor,
    registry: Arc<TransactionRegistry>,
    /// Held shared by readers of storage, exclusive while a commit applies.
    gate: Arc<RwLock<()>>,
    next_txid: AtomicU64,
    /// Serializes commit record, flush and apply.
    commit_lock: Mutex<()>,
    visible: AtomicU64,
    /// Cursor frozen when a commit failed half-way.
    halted: Mutex<Option<ReplayCursor>>,
    listeners: RwLock<Vec<Arc<dyn TransactionListener>>>,
    replicas: RwLock<Vec<Arc<dyn ReplicaWatermark>>>,
}

impl ConsistencyCoordinator {
    /// Creates a coordinator.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownResourceManager`] if the configured
    /// resource manager is not in `table`.
    pub fn new(
        wal: Arc<Wal>,
        store: Arc<dyn SegmentStore>,
        table: Arc<ResourceManagerTable>,
        config: Config,
    ) -> CoreResult<Self> {
        table.get(config.resource_manager_id)?;

        let registry = Arc::new(TransactionRegistry::new());
        let gate = Arc::new(RwLock::new(()));
        let interceptor = MutationInterceptor::new(
            Arc::clone(&wal),
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&gate),
            &config,
        );
        let next_txid = wal.max_txid().next();
        let visible = wal.durable_lsn();
        info!(
            next_txid = next_txid.as_u64(),
            visible = %visible,
            rm = %config.resource_manager_id,
            "coordinator ready"
        );

        Ok(Self {
            wal,
            store,
            table,
            config,
            interceptor,
            registry,
            gate,
            next_txid: AtomicU64::new(next_txid.as_u64()),
            commit_lock: Mutex::new(()),
            visible: AtomicU64::new(visible.as_u64()),
            halted: Mutex::new(None),
            listeners: RwLock::new(Vec::new()),
            replicas: RwLock::new(Vec::new()),
        })
    }

    /// Starts a transaction.
    pub fn begin(&self) -> TransactionContext {
        let txid = TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst));
        debug!(txid = txid.as_u64(), "transaction started");
        TransactionContext::new(txid, self.interceptor.clone())
    }

    /// Commits a transaction.
    ///
    /// Appends the `TxCommit` record, makes it durable, then applies the
    /// transaction's records to storage in one step that readers cannot
    /// observe half-done. A transaction that logged nothing commits without
    /// touching the log.
    ///
    /// # Errors
    ///
    /// - [`CoreError::TransactionNotActive`] if `tx` already ended
    /// - [`CoreError::WriteOrderingFailure`] if a record of `tx` was lost,
    ///   if the commit record could not be logged or made durable, or if
    ///   the coordinator has halted
    /// - a storage error if applying failed after the commit was durable
    ///
    /// A commit that could not be made durable or applied halts the
    /// coordinator; its outcome is decided by recovery.
    pub fn commit(&self, mut tx: TransactionContext) -> CoreResult<CommitReceipt> {
        tx.ensure_active()?;
        self.ensure_running()?;
        let txid = tx.txid();
        let files: Vec<FileId> = tx.touched_files().collect();

        if tx.records().is_empty() {
            tx.mark_committed();
            debug!(txid = txid.as_u64(), "empty transaction committed");
            self.notify_commit(txid, None, &files);
            return Ok(CommitReceipt {
                txid,
                commit_lsn: None,
                files,
                remote_apply: RemoteApply::NotRequested,
            });
        }

        let commit_lsn = {
            let _commit = self.commit_lock.lock();

            let record = match self.interceptor.log_control(txid, RecordBody::TxCommit) {
                Ok(record) => record,
                Err(e) => {
                    error!(txid = txid.as_u64(), error = %e, "could not log commit");
                    tx.mark_failed();
                    return Err(CoreError::write_ordering_failure(format!(
                        "could not log commit of {txid}: {e}"
                    )));
                }
            };
            if let Err(e) = self.wal.flush(record.lsn) {
                error!(txid = txid.as_u64(), lsn = %record.lsn, error = %e, "commit record not durable");
                let message = format!("commit of {txid} at {} is not durable: {e}", record.lsn);
                self.halt(&message);
                tx.mark_in_doubt();
                return Err(CoreError::write_ordering_failure(message));
            }

            let applied = {
                let _apply = self.gate.write();
                apply_transaction(self.store.as_ref(), &self.table, record.lsn, tx.records())
            };
            match applied {
                Ok(outcome) => debug!(
                    txid = txid.as_u64(),
                    lsn = %record.lsn,
                    applied = outcome.applied,
                    files = outcome.touched.len(),
                    "transaction applied"
                ),
                Err(e) => {
                    error!(txid = txid.as_u64(), lsn = %record.lsn, error = %e, "durable commit could not be applied");
                    self.halt(&format!(
                        "commit of {txid} at {} could not be applied: {e}",
                        record.lsn
                    ));
                    tx.mark_in_doubt();
                    return Err(e);
                }
            }
            self.visible.store(record.lsn.as_u64(), Ordering::SeqCst);
            tx.mark_committed();
            record.lsn
        };

        self.notify_commit(txid, Some(commit_lsn), &files);
        let remote_apply = self.wait_for_replicas(commit_lsn);
        Ok(CommitReceipt {
            txid,
            commit_lsn: Some(commit_lsn),
            files,
            remote_apply,
        })
    }

    /// Aborts a transaction.
    ///
    /// Logs a `TxAbort` marker if the transaction logged anything. The
    /// marker is not flushed; a crash that loses it leaves the transaction
    /// without an outcome, which recovery treats as aborted.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionNotActive`] if `tx` already ended, or
    /// the error of logging the marker. The transaction is aborted either
    /// way.
    pub fn abort(&self, mut tx: TransactionContext) -> CoreResult<()> {
        let txid = tx.txid();
        let marker = tx.abort_in_place();
        if tx.state() == TransactionState::Aborted {
            for listener in self.listeners.read().iter() {
                listener.on_abort(txid);
            }
        }
        marker.map(|_| ())
    }

    /// Returns the commit position up to which changes are visible.
    #[must_use]
    pub fn visible_lsn(&self) -> Lsn {
        Lsn::new(self.visible.load(Ordering::SeqCst))
    }

    /// Returns a cursor from which a consumer of storage as it is now can
    /// continue.
    ///
    /// Persisting it after commits bounds how much log recovery must read.
    /// Once the coordinator has halted, this is the cursor from before the
    /// failed commit.
    #[must_use]
    pub fn checkpoint(&self) -> ReplayCursor {
        let _commit = self.commit_lock.lock();
        self.cursor_now()
    }

    /// Runs `f` against a stable view of storage together with the cursor
    /// that view corresponds to.
    ///
    /// No commit applies while `f` runs, so `f` can copy the store to seed a
    /// replica that then resumes from the cursor.
    pub fn base_backup<R>(&self, f: impl FnOnce(&dyn SegmentStore, ReplayCursor) -> R) -> R {
        let _commit = self.commit_lock.lock();
        let _stable = self.gate.write();
        let cursor = self.cursor_now();
        info!(applied = %cursor.applied_lsn, restart = %cursor.restart_lsn, "taking base backup");
        f(self.store.as_ref(), cursor)
    }

    /// Returns whether a failed commit has halted the coordinator.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.lock().is_some()
    }

    fn ensure_running(&self) -> CoreResult<()> {
        if let Some(cursor) = *self.halted.lock() {
            return Err(CoreError::write_ordering_failure(format!(
                "coordinator halted, recovery must resume from {}",
                cursor.restart_lsn
            )));
        }
        if self.wal.is_poisoned() {
            return Err(CoreError::write_ordering_failure(
                "log refuses writes until recovery",
            ));
        }
        Ok(())
    }

    /// Stops the writer after a commit failed half-way.
    ///
    /// Must be called with the commit lock held and before the failed
    /// transaction releases its files, so the frozen cursor still restarts
    /// at or before its first record.
    fn halt(&self, reason: &str) {
        let cursor = self.cursor_now();
        self.wal.poison(reason);
        let mut halted = self.halted.lock();
        if halted.is_none() {
            error!(
                applied = %cursor.applied_lsn,
                restart = %cursor.restart_lsn,
                reason,
                "coordinator halted, recovery must run"
            );
            *halted = Some(cursor);
        }
    }

    /// Must be called with the commit lock held.
    fn cursor_now(&self) -> ReplayCursor {
        if let Some(cursor) = *self.halted.lock() {
            return cursor;
        }
        let applied = self.visible_lsn();
        let restart = self
            .registry
            .oldest_start()
            .map_or(applied, |start| Lsn::new(start).min(applied));
        ReplayCursor::new(applied, restart)
    }

    /// Registers a transaction listener.
    pub fn register_listener(&self, listener: Arc<dyn TransactionListener>) {
        self.listeners.write().push(listener);
    }

    /// Registers a replica that [`SynchronousCommit::RemoteApply`] commits
    /// wait for.
    pub fn register_replica(&self, replica: Arc<dyn ReplicaWatermark>) {
        self.replicas.write().push(replica);
    }

    /// Returns the active transaction holding `file`, if any.
    #[must_use]
    pub fn file_owner(&self, file: FileId) -> Option<TransactionId> {
        self.registry.owner(file)
    }

    /// Returns the log.
    #[must_use]
    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    /// Returns index storage.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SegmentStore> {
        &self.store
    }

    /// Returns the resource manager table.
    #[must_use]
    pub fn table(&self) -> &Arc<ResourceManagerTable> {
        &self.table
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn notify_commit(&self, txid: TransactionId, commit_lsn: Option<Lsn>, files: &[FileId]) {
        for listener in self.listeners.read().iter() {
            listener.on_commit(txid, commit_lsn, files);
        }
    }

    fn wait_for_replicas(&self, lsn: Lsn) -> RemoteApply {
        if self.config.synchronous_commit != SynchronousCommit::RemoteApply {
            return RemoteApply::NotRequested;
        }
        let replicas = self.replicas.read().clone();
        if replicas.is_empty() {
            return RemoteApply::NoReplicas;
        }

        let deadline = Instant::now() + self.config.remote_apply_timeout;
        for replica in &replicas {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !replica.wait_for(lsn, remaining) {
                warn!(
                    lsn = %lsn,
                    replica_applied = %replica.applied_lsn(),
                    "replica did not apply commit in time"
                );
                return RemoteApply::TimedOut;
            }
        }
        RemoteApply::Applied
    }
}

impl std::fmt::Debug for ConsistencyCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyCoordinator")
            .field("visible", &self.visible_lsn())
            .field("halted", &self.is_halted())
            .field("next_txid", &self.next_txid.load(Ordering::SeqCst))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::recover;
    use crate::wal::RecordType;
    use searchwal_storage::{InMemoryLog, InMemorySegmentStore, LogBackend, StorageError, StorageResult};
    use std::sync::atomic::AtomicBool;

    const HEAP: FileId = FileId::new(1);
    const INDEX: FileId = FileId::new(2);

    /// Log backend whose appends and flushes can be made to fail.
    #[derive(Clone, Default)]
    struct FlakyLog {
        log: InMemoryLog,
        fail_append: Arc<AtomicBool>,
        fail_flush: Arc<AtomicBool>,
    }

    fn injected() -> StorageError {
        StorageError::Io(std::io::Error::other("injected failure"))
    }

    impl LogBackend for FlakyLog {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            self.log.read_at(offset, len)
        }
        fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
            if self.fail_append.load(Ordering::SeqCst) {
                return Err(injected());
            }
            self.log.append(data)
        }
        fn flush(&mut self) -> StorageResult<()> {
            if self.fail_flush.load(Ordering::SeqCst) {
                return Err(injected());
            }
            self.log.flush()
        }
        fn size(&self) -> StorageResult<u64> {
            self.log.size()
        }
        fn sync(&mut self) -> StorageResult<()> {
            self.flush()
        }
        fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
            self.log.truncate(new_size)
        }
    }

    struct Harness {
        log: FlakyLog,
        store: Arc<InMemorySegmentStore>,
        coordinator: ConsistencyCoordinator,
    }

    fn harness(config: Config) -> Harness {
        let log = FlakyLog::default();
        let wal = Arc::new(Wal::open(Box::new(log.clone()), &config).unwrap());
        let store = Arc::new(InMemorySegmentStore::new());
        let coordinator = ConsistencyCoordinator::new(
            wal,
            Arc::clone(&store) as Arc<dyn SegmentStore>,
            Arc::new(ResourceManagerTable::search_only()),
            config,
        )
        .unwrap();
        Harness {
            log,
            store,
            coordinator,
        }
    }

    fn record_types(h: &Harness) -> Vec<RecordType> {
        let wal = h.coordinator.wal();
        wal.flush(wal.end_lsn()).unwrap();
        wal.read_batch(Lsn::ZERO, Lsn::ZERO, usize::MAX)
            .unwrap()
            .records
            .iter()
            .map(|r| r.record_type())
            .collect()
    }

    /// Reads back every record the backend holds, durable or not.
    fn reopened_types(log: &FlakyLog) -> Vec<RecordType> {
        let wal = Wal::open(Box::new(log.log.clone()), &Config::default()).unwrap();
        wal.read_batch(Lsn::ZERO, Lsn::ZERO, usize::MAX)
            .unwrap()
            .records
            .iter()
            .map(|r| r.record_type())
            .collect()
    }

    #[test]
    fn storage_changes_only_at_commit() {
        let h = harness(Config::default());
        let mut tx = h.coordinator.begin();
        tx.allocate_segment(HEAP, 0).unwrap();
        tx.write_range(HEAP, 0, b"PGroonga").unwrap();
        assert_eq!(h.store.file_len(HEAP).unwrap(), None);

        let receipt = h.coordinator.commit(tx).unwrap();
        let commit_lsn = receipt.commit_lsn.unwrap();

        assert_eq!(h.store.read_file(HEAP).unwrap().unwrap(), b"PGroonga");
        assert_eq!(h.store.applied_lsn(HEAP).unwrap(), commit_lsn.as_u64());
        assert!(h.coordinator.wal().durable_lsn() >= commit_lsn);
        assert_eq!(h.coordinator.visible_lsn(), commit_lsn);
        assert_eq!(receipt.files, vec![HEAP]);
        assert_eq!(receipt.remote_apply, RemoteApply::NotRequested);
        assert_eq!(
            record_types(&h),
            vec![RecordType::SegmentAlloc, RecordType::RangeWrite, RecordType::TxCommit]
        );
    }

    #[test]
    fn transactions_read_their_own_writes() {
        let h = harness(Config::default());
        h.store.replace_file(INDEX, b"old").unwrap();

        let mut writer = h.coordinator.begin();
        writer.write_range(INDEX, 3, b"-new").unwrap();
        assert_eq!(writer.read_file(INDEX).unwrap().unwrap(), b"old-new");

        let reader = h.coordinator.begin();
        assert_eq!(reader.read_file(INDEX).unwrap().unwrap(), b"old");

        h.coordinator.commit(writer).unwrap();
        assert_eq!(reader.read_file(INDEX).unwrap().unwrap(), b"old-new");
    }

    #[test]
    fn files_belong_to_one_transaction_at_a_time() {
        let h = harness(Config::default());
        let mut t1 = h.coordinator.begin();
        let mut t2 = h.coordinator.begin();
        t1.allocate_segment(INDEX, 4).unwrap();

        let err = t2.write_range(INDEX, 0, b"x").unwrap_err();
        assert!(matches!(err, CoreError::FileLocked { owner, .. } if owner == t1.txid()));
        assert_eq!(h.coordinator.file_owner(INDEX), Some(t1.txid()));

        h.coordinator.commit(t1).unwrap();
        assert_eq!(h.coordinator.file_owner(INDEX), None);
        t2.write_range(INDEX, 0, b"x").unwrap();
    }

    #[test]
    fn large_writes_are_split() {
        let h = harness(Config::default().max_record_size(64));
        let data: Vec<u8> = (0..=255u8).collect();

        let mut tx = h.coordinator.begin();
        tx.allocate_segment(HEAP, 0).unwrap();
        tx.write_range(HEAP, 0, &data).unwrap();
        assert!(tx.records().len() > 4);
        assert!(tx.records().iter().all(|r| r.body.payload_len() <= 64));

        h.coordinator.commit(tx).unwrap();
        assert_eq!(h.store.read_file(HEAP).unwrap().unwrap(), data);
    }

    #[test]
    fn out_of_bounds_writes_are_rejected_before_logging() {
        let h = harness(Config::default());
        let mut tx = h.coordinator.begin();
        tx.allocate_segment(HEAP, 2).unwrap();

        let err = tx.write_range(HEAP, 3, b"x").unwrap_err();
        assert!(matches!(err, CoreError::Storage(StorageError::RangeOutOfBounds { .. })));
        let err = tx.truncate_file(HEAP, 5).unwrap_err();
        assert!(matches!(err, CoreError::Storage(StorageError::RangeOutOfBounds { .. })));
        let err = tx.remove_file(INDEX).unwrap_err();
        assert!(matches!(err, CoreError::Storage(StorageError::FileNotFound(_))));
        assert_eq!(tx.records().len(), 1);
        assert!(tx.is_active());
    }

    #[test]
    fn files_past_the_size_limit_are_refused() {
        let h = harness(Config::default().max_file_size(16));
        let mut tx = h.coordinator.begin();

        let err = tx.allocate_segment(HEAP, 17).unwrap_err();
        assert!(matches!(err, CoreError::FileTooLarge { size: 17, max: 16, .. }));
        tx.allocate_segment(HEAP, 16).unwrap();
        let err = tx.write_range(HEAP, 10, b"0123456789").unwrap_err();
        assert!(matches!(err, CoreError::FileTooLarge { size: 20, .. }));
        let err = tx.compaction_rewrite(INDEX, &[7u8; 17]).unwrap_err();
        assert!(matches!(err, CoreError::FileTooLarge { size: 17, .. }));

        assert!(tx.is_active());
        assert_eq!(tx.records().len(), 1);
        assert_eq!(h.coordinator.file_owner(INDEX), None);
        h.coordinator.commit(tx).unwrap();
        assert_eq!(h.store.file_len(HEAP).unwrap(), Some(16));
    }

    #[test]
    fn change_the_overlay_refuses_is_never_logged() {
        let h = harness(Config::default().max_file_size(u64::MAX));
        let mut tx = h.coordinator.begin();
        tx.allocate_segment(INDEX, 0).unwrap();
        tx.write_range(INDEX, 0, b"kept").unwrap();

        let err = tx.allocate_segment(HEAP, u64::MAX).unwrap_err();
        assert!(matches!(err, CoreError::Storage(_)));
        assert!(tx.is_active());
        assert_eq!(tx.records().len(), 2);
        let end = h.coordinator.wal().end_lsn();
        assert_eq!(tx.last_lsn(), Some(end));

        h.coordinator.commit(tx).unwrap();
        assert_eq!(
            record_types(&h),
            vec![RecordType::SegmentAlloc, RecordType::RangeWrite, RecordType::TxCommit]
        );

        // Redo of the log rebuilds exactly what the primary holds.
        let replayed = InMemorySegmentStore::new();
        recover(
            h.coordinator.wal(),
            &replayed,
            Arc::clone(h.coordinator.table()),
            ReplayCursor::default(),
            &Config::default(),
        )
        .unwrap();
        assert_eq!(replayed.contents(), h.store.contents());
        assert_eq!(h.store.file_len(HEAP).unwrap(), None);
    }

    #[test]
    fn dropped_transactions_abort() {
        let h = harness(Config::default());
        {
            let mut tx = h.coordinator.begin();
            tx.allocate_segment(HEAP, 16).unwrap();
        }
        assert_eq!(h.store.file_len(HEAP).unwrap(), None);
        assert_eq!(h.coordinator.file_owner(HEAP), None);
        assert_eq!(
            record_types(&h),
            vec![RecordType::SegmentAlloc, RecordType::TxAbort]
        );
    }

    #[test]
    fn empty_transactions_log_nothing() {
        let h = harness(Config::default());
        let receipt = h.coordinator.commit(h.coordinator.begin()).unwrap();
        assert_eq!(receipt.commit_lsn, None);
        h.coordinator.abort(h.coordinator.begin()).unwrap();
        assert_eq!(h.coordinator.wal().end_lsn(), Lsn::ZERO);
    }

    #[test]
    fn ended_transactions_reject_work() {
        let h = harness(Config::default());
        let mut tx = h.coordinator.begin();
        tx.allocate_segment(HEAP, 0).unwrap();
        tx.abort_in_place().unwrap();

        let err = tx.write_range(HEAP, 0, b"x").unwrap_err();
        assert!(matches!(err, CoreError::TransactionNotActive(_)));
        let err = h.coordinator.commit(tx).unwrap_err();
        assert!(matches!(err, CoreError::TransactionNotActive(_)));
    }

    #[test]
    fn lost_record_fails_the_transaction() {
        let h = harness(Config::default());
        let mut tx = h.coordinator.begin();
        tx.allocate_segment(HEAP, 0).unwrap();

        h.log.fail_append.store(true, Ordering::SeqCst);
        let err = tx.write_range(HEAP, 0, b"lost").unwrap_err();
        assert!(matches!(err, CoreError::WriteOrderingFailure { .. }));
        assert_eq!(tx.state(), TransactionState::Failed);

        let err = tx.write_range(HEAP, 0, b"more").unwrap_err();
        assert!(matches!(err, CoreError::WriteOrderingFailure { .. }));

        h.log.fail_append.store(false, Ordering::SeqCst);
        let err = h.coordinator.commit(tx).unwrap_err();
        assert!(matches!(err, CoreError::WriteOrderingFailure { .. }));
        assert_eq!(h.store.file_len(HEAP).unwrap(), None);
        assert_eq!(
            record_types(&h),
            vec![RecordType::SegmentAlloc, RecordType::TxAbort]
        );
    }

    #[test]
    fn commit_not_made_durable_is_left_in_doubt() {
        let h = harness(Config::default());
        let mut tx = h.coordinator.begin();
        tx.allocate_segment(HEAP, 4).unwrap();

        h.log.fail_flush.store(true, Ordering::SeqCst);
        let err = h.coordinator.commit(tx).unwrap_err();
        assert!(matches!(err, CoreError::WriteOrderingFailure { .. }));
        assert_eq!(h.store.file_len(HEAP).unwrap(), None);
        assert_eq!(h.coordinator.visible_lsn(), Lsn::ZERO);

        h.log.fail_flush.store(false, Ordering::SeqCst);
        assert_eq!(
            reopened_types(&h.log),
            vec![RecordType::SegmentAlloc, RecordType::TxCommit]
        );
    }

    #[test]
    fn failed_commit_flush_halts_until_recovery() {
        let Harness {
            log,
            store,
            coordinator,
        } = harness(Config::default());
        let mut t1 = coordinator.begin();
        t1.allocate_segment(HEAP, 0).unwrap();
        t1.write_range(HEAP, 0, b"in-doubt").unwrap();

        log.fail_flush.store(true, Ordering::SeqCst);
        let err = coordinator.commit(t1).unwrap_err();
        assert!(matches!(err, CoreError::WriteOrderingFailure { .. }));
        log.fail_flush.store(false, Ordering::SeqCst);
        assert!(coordinator.is_halted());

        // A healthy disk again must not let later work make the commit
        // durable behind storage's back.
        let mut t2 = coordinator.begin();
        let err = t2.allocate_segment(INDEX, 0).unwrap_err();
        assert!(matches!(err, CoreError::WriteOrderingFailure { .. }));
        let err = coordinator.commit(t2).unwrap_err();
        assert!(matches!(err, CoreError::WriteOrderingFailure { .. }));
        let err = coordinator.commit(coordinator.begin()).unwrap_err();
        assert!(matches!(err, CoreError::WriteOrderingFailure { .. }));
        assert_eq!(store.file_len(HEAP).unwrap(), None);

        let cursor = coordinator.checkpoint();
        assert_eq!(cursor, ReplayCursor::at(Lsn::ZERO));
        drop(coordinator);

        // Whatever reached the log decides; restart and a from-scratch
        // replay agree.
        let config = Config::default();
        let table = Arc::new(ResourceManagerTable::search_only());
        let wal = Wal::open(Box::new(log.log.clone()), &config).unwrap();
        recover(&wal, store.as_ref(), Arc::clone(&table), cursor, &config).unwrap();
        let replayed = InMemorySegmentStore::new();
        recover(&wal, &replayed, table, ReplayCursor::default(), &config).unwrap();

        assert_eq!(store.contents(), replayed.contents());
        assert_eq!(store.read_file(HEAP).unwrap().unwrap(), b"in-doubt");
        assert_eq!(store.file_len(INDEX).unwrap(), None);
    }

    /// Segment store whose next `write_range` can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemorySegmentStore,
        fail_next_write: AtomicBool,
    }

    impl SegmentStore for FlakyStore {
        fn allocate_segment(&self, file: FileId, len: u64) -> StorageResult<()> {
            self.inner.allocate_segment(file, len)
        }
        fn write_range(&self, file: FileId, offset: u64, data: &[u8]) -> StorageResult<()> {
            if self.fail_next_write.swap(false, Ordering::SeqCst) {
                return Err(injected());
            }
            self.inner.write_range(file, offset, data)
        }
        fn truncate_file(&self, file: FileId, len: u64) -> StorageResult<()> {
            self.inner.truncate_file(file, len)
        }
        fn remove_file(&self, file: FileId) -> StorageResult<bool> {
            self.inner.remove_file(file)
        }
        fn read_range(&self, file: FileId, offset: u64, len: u64) -> StorageResult<Vec<u8>> {
            self.inner.read_range(file, offset, len)
        }
        fn file_len(&self, file: FileId) -> StorageResult<Option<u64>> {
            self.inner.file_len(file)
        }
        fn file_ids(&self) -> StorageResult<Vec<FileId>> {
            self.inner.file_ids()
        }
        fn applied_lsn(&self, file: FileId) -> StorageResult<u64> {
            self.inner.applied_lsn(file)
        }
        fn set_applied_lsn(&self, file: FileId, lsn: u64) -> StorageResult<()> {
            self.inner.set_applied_lsn(file, lsn)
        }
        fn sync_file(&self, file: FileId) -> StorageResult<()> {
            self.inner.sync_file(file)
        }
    }

    #[test]
    fn unapplied_commit_stays_ahead_of_the_checkpoint() {
        let config = Config::default();
        let log = InMemoryLog::new();
        let store = Arc::new(FlakyStore::default());
        let table = Arc::new(ResourceManagerTable::search_only());
        let wal = Arc::new(Wal::open(Box::new(log.clone()), &config).unwrap());
        let coordinator = ConsistencyCoordinator::new(
            wal,
            Arc::clone(&store) as Arc<dyn SegmentStore>,
            Arc::clone(&table),
            config.clone(),
        )
        .unwrap();

        let mut t0 = coordinator.begin();
        t0.allocate_segment(INDEX, 0).unwrap();
        let before = coordinator.commit(t0).unwrap().commit_lsn.unwrap();

        let mut tx = coordinator.begin();
        tx.allocate_segment(HEAP, 0).unwrap();
        tx.write_range(HEAP, 0, b"applied late").unwrap();
        store.fail_next_write.store(true, Ordering::SeqCst);
        let err = coordinator.commit(tx).unwrap_err();
        assert!(matches!(err, CoreError::Storage(_)));

        assert!(coordinator.is_halted());
        assert_eq!(coordinator.visible_lsn(), before);
        let cursor = coordinator.checkpoint();
        assert_eq!(cursor, ReplayCursor::at(before));
        assert_eq!(coordinator.base_backup(|_, cursor| cursor), cursor);
        let mut next = coordinator.begin();
        let err = next.allocate_segment(INDEX, 4).unwrap_err();
        assert!(matches!(err, CoreError::WriteOrderingFailure { .. }));
        drop(next);
        drop(coordinator);

        let wal = Wal::open(Box::new(log), &config).unwrap();
        let report = recover(&wal, store.as_ref(), table, cursor, &config).unwrap();
        assert_eq!(report.stats.committed, 1);
        assert_eq!(store.inner.read_file(HEAP).unwrap().unwrap(), b"applied late");
        assert_eq!(store.inner.file_len(INDEX).unwrap(), Some(0));
    }

    #[derive(Default)]
    struct Recorder {
        events: parking_lot::Mutex<Vec<String>>,
    }

    impl TransactionListener for Recorder {
        fn on_commit(&self, txid: TransactionId, commit_lsn: Option<Lsn>, files: &[FileId]) {
            self.events
                .lock()
                .push(format!("commit {txid} {:?} {}", commit_lsn.is_some(), files.len()));
        }
        fn on_abort(&self, txid: TransactionId) {
            self.events.lock().push(format!("abort {txid}"));
        }
    }

    #[test]
    fn listeners_see_outcomes() {
        let h = harness(Config::default());
        let recorder = Arc::new(Recorder::default());
        h.coordinator.register_listener(recorder.clone());

        let mut t1 = h.coordinator.begin();
        t1.allocate_segment(HEAP, 0).unwrap();
        let t1_id = t1.txid();
        h.coordinator.commit(t1).unwrap();

        let t2 = h.coordinator.begin();
        let t2_id = t2.txid();
        h.coordinator.abort(t2).unwrap();

        assert_eq!(
            *recorder.events.lock(),
            vec![format!("commit {t1_id} true 1"), format!("abort {t2_id}")]
        );
    }

    struct StuckReplica;

    impl ReplicaWatermark for StuckReplica {
        fn applied_lsn(&self) -> Lsn {
            Lsn::ZERO
        }
        fn wait_for(&self, _lsn: Lsn, _timeout: Duration) -> bool {
            false
        }
    }

    struct InstantReplica;

    impl ReplicaWatermark for InstantReplica {
        fn applied_lsn(&self) -> Lsn {
            Lsn::new(u64::MAX)
        }
        fn wait_for(&self, _lsn: Lsn, _timeout: Duration) -> bool {
            true
        }
    }

    #[test]
    fn remote_apply_waits_for_replicas() {
        let config = Config::default()
            .synchronous_commit(SynchronousCommit::RemoteApply)
            .remote_apply_timeout(Duration::from_millis(20));
        let h = harness(config);

        let commit = |h: &Harness| {
            let mut tx = h.coordinator.begin();
            tx.allocate_segment(HEAP, 0).unwrap();
            h.coordinator.commit(tx).unwrap().remote_apply
        };

        assert_eq!(commit(&h), RemoteApply::NoReplicas);
        h.coordinator.register_replica(Arc::new(InstantReplica));
        assert_eq!(commit(&h), RemoteApply::Applied);
        h.coordinator.register_replica(Arc::new(StuckReplica));
        assert_eq!(commit(&h), RemoteApply::TimedOut);
    }

    #[test]
    fn checkpoint_restarts_at_oldest_open_transaction() {
        let h = harness(Config::default());
        let mut done = h.coordinator.begin();
        done.allocate_segment(HEAP, 0).unwrap();

        let mut open = h.coordinator.begin();
        let open_first = open.allocate_segment(INDEX, 0).unwrap();
        let open_start = open.records()[0].start();

        let commit_lsn = h.coordinator.commit(done).unwrap().commit_lsn.unwrap();
        assert!(open_first < commit_lsn);

        let cursor = h.coordinator.checkpoint();
        assert_eq!(cursor.applied_lsn, commit_lsn);
        assert_eq!(cursor.restart_lsn, Lsn::new(open_start));

        h.coordinator.abort(open).unwrap();
        let cursor = h.coordinator.base_backup(|store, cursor| {
            assert_eq!(store.file_len(HEAP).unwrap(), Some(0));
            cursor
        });
        assert_eq!(cursor, ReplayCursor::at(commit_lsn));
    }

    #[test]
    fn txids_continue_after_reopen() {
        let log = InMemoryLog::new();
        let store: Arc<dyn SegmentStore> = Arc::new(InMemorySegmentStore::new());
        let table = Arc::new(ResourceManagerTable::search_only());
        let open = || {
            let wal = Arc::new(Wal::open(Box::new(log.clone()), &Config::default()).unwrap());
            ConsistencyCoordinator::new(wal, Arc::clone(&store), Arc::clone(&table), Config::default())
                .unwrap()
        };

        let first = {
            let coordinator = open();
            let mut tx = coordinator.begin();
            tx.allocate_segment(HEAP, 0).unwrap();
            coordinator.commit(tx).unwrap().txid
        };
        let coordinator = open();
        assert!(coordinator.begin().txid() > first);
        assert_eq!(coordinator.visible_lsn(), coordinator.wal().end_lsn());
    }

    #[test]
    fn unregistered_resource_manager_is_refused() {
        let config = Config::default().resource_manager_id(crate::types::ResourceManagerId::new(9));
        let wal = Arc::new(Wal::open(Box::new(InMemoryLog::new()), &config).unwrap());
        let err = ConsistencyCoordinator::new(
            wal,
            Arc::new(InMemorySegmentStore::new()),
            Arc::new(ResourceManagerTable::search_only()),
            config,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::UnknownResourceManager(_)));
    }
}
