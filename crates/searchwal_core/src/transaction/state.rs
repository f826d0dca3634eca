//! Transaction context.

use crate::error::{CoreError, CoreResult};
use crate::interceptor::MutationInterceptor;
use crate::types::{FileId, Lsn, TransactionId};
use crate::wal::{LogRecord, RecordBody};
use searchwal_storage::{InMemorySegmentStore, SegmentStore};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can perform operations.
    Active,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been aborted.
    Aborted,
    /// A record could not be logged; the transaction can only abort.
    Failed,
}

/// The structural changes of one host transaction.
///
/// Every mutation is logged immediately, but shared index storage is only
/// changed when the transaction commits. Until then the transaction reads
/// its own writes from a private overlay, seeded from shared storage the
/// first time it touches a file.
///
/// Dropping an active context aborts it: a `TxAbort` marker is logged on a
/// best-effort basis and the files it claimed are released.
pub struct TransactionContext {
    txid: TransactionId,
    state: TransactionState,
    interceptor: MutationInterceptor,
    /// Set once a `TxCommit` for this transaction is in the log.
    commit_logged: bool,
    pub(crate) overlay: InMemorySegmentStore,
    pub(crate) touched: BTreeSet<FileId>,
    pub(crate) records: Vec<LogRecord>,
}

impl TransactionContext {
    pub(crate) fn new(txid: TransactionId, interceptor: MutationInterceptor) -> Self {
        Self {
            txid,
            state: TransactionState::Active,
            interceptor,
            commit_logged: false,
            overlay: InMemorySegmentStore::new(),
            touched: BTreeSet::new(),
            records: Vec::new(),
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn txid(&self) -> TransactionId {
        self.txid
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Returns the records logged so far, in log order.
    #[must_use]
    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// Returns the files this transaction has claimed.
    pub fn touched_files(&self) -> impl Iterator<Item = FileId> + '_ {
        self.touched.iter().copied()
    }

    /// Returns the LSN of the last record logged, if any.
    #[must_use]
    pub fn last_lsn(&self) -> Option<Lsn> {
        self.records.last().map(|r| r.lsn)
    }

    /// Logs and stages creation of a zero-filled file.
    ///
    /// # Errors
    ///
    /// See [`MutationInterceptor::allocate_segment`].
    pub fn allocate_segment(&mut self, file: FileId, len: u64) -> CoreResult<Lsn> {
        let interceptor = self.interceptor.clone();
        interceptor.allocate_segment(self, file, len)
    }

    /// Logs and stages a byte-range write.
    ///
    /// # Errors
    ///
    /// See [`MutationInterceptor::write_range`].
    pub fn write_range(&mut self, file: FileId, offset: u64, data: &[u8]) -> CoreResult<Lsn> {
        let interceptor = self.interceptor.clone();
        interceptor.write_range(self, file, offset, data)
    }

    /// Logs and stages a truncation.
    ///
    /// # Errors
    ///
    /// See [`MutationInterceptor::truncate_file`].
    pub fn truncate_file(&mut self, file: FileId, len: u64) -> CoreResult<Lsn> {
        let interceptor = self.interceptor.clone();
        interceptor.truncate_file(self, file, len)
    }

    /// Logs and stages removal of a file.
    ///
    /// # Errors
    ///
    /// See [`MutationInterceptor::remove_file`].
    pub fn remove_file(&mut self, file: FileId) -> CoreResult<Lsn> {
        let interceptor = self.interceptor.clone();
        interceptor.remove_file(self, file)
    }

    /// Logs and stages replacement of a file by a compacted layout.
    ///
    /// # Errors
    ///
    /// See [`MutationInterceptor::compaction_rewrite`].
    pub fn compaction_rewrite(&mut self, file: FileId, data: &[u8]) -> CoreResult<Lsn> {
        let interceptor = self.interceptor.clone();
        interceptor.compaction_rewrite(self, file, data)
    }

    /// Reads `len` bytes at `offset`, seeing this transaction's own writes.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file is missing or the range is out
    /// of bounds.
    pub fn read_range(&self, file: FileId, offset: u64, len: u64) -> CoreResult<Vec<u8>> {
        self.interceptor.read_range(self, file, offset, len)
    }

    /// Returns a file's length, seeing this transaction's own writes.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn file_len(&self, file: FileId) -> CoreResult<Option<u64>> {
        self.interceptor.file_len(self, file)
    }

    /// Reads a whole file, seeing this transaction's own writes.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn read_file(&self, file: FileId) -> CoreResult<Option<Vec<u8>>> {
        match self.file_len(file)? {
            Some(len) => self.read_range(file, 0, len).map(Some),
            None => Ok(None),
        }
    }

    pub(crate) fn ensure_active(&self) -> CoreResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Failed => Err(CoreError::write_ordering_failure(format!(
                "{} lost a log write and can only abort",
                self.txid
            ))),
            _ => Err(CoreError::TransactionNotActive(self.txid)),
        }
    }

    pub(crate) fn mark_failed(&mut self) {
        self.state = TransactionState::Failed;
    }

    /// The commit record was appended but could not be made durable.
    ///
    /// Whether the transaction committed is decided by whatever reaches the
    /// durable log, so no abort marker may follow.
    pub(crate) fn mark_in_doubt(&mut self) {
        self.commit_logged = true;
        self.state = TransactionState::Failed;
    }

    pub(crate) fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
        self.interceptor.release(self.txid, &self.touched);
    }

    /// Ends the transaction without committing.
    ///
    /// Logs a `TxAbort` marker if anything was logged, then releases the
    /// claimed files. Returns the marker's LSN.
    pub(crate) fn abort_in_place(&mut self) -> CoreResult<Option<Lsn>> {
        if matches!(
            self.state,
            TransactionState::Committed | TransactionState::Aborted
        ) {
            return Err(CoreError::TransactionNotActive(self.txid));
        }
        self.state = TransactionState::Aborted;

        let marker = if self.records.is_empty() || self.commit_logged {
            Ok(None)
        } else {
            self.interceptor
                .log_control(self.txid, RecordBody::TxAbort)
                .map(|r| Some(r.lsn))
        };
        self.interceptor.release(self.txid, &self.touched);
        self.overlay = InMemorySegmentStore::new();
        debug!(txid = self.txid.as_u64(), records = self.records.len(), "transaction aborted");
        marker
    }

    pub(crate) fn overlay(&self) -> &dyn SegmentStore {
        &self.overlay
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        if matches!(
            self.state,
            TransactionState::Active | TransactionState::Failed
        ) {
            if let Err(e) = self.abort_in_place() {
                warn!(txid = self.txid.as_u64(), error = %e, "could not log abort of dropped transaction");
            }
        }
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("txid", &self.txid)
            .field("state", &self.state)
            .field("touched", &self.touched)
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}
