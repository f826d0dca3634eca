//! The mutation interceptor.
//!
//! Every structural write a transaction makes to index storage passes
//! through here. The interceptor validates the change against what the
//! transaction currently sees, stages it in the transaction's overlay, and
//! logs a redo record for it. A change the overlay refuses is never
//! logged, and a change that could not be logged fails the transaction.
//! Shared storage is not touched until commit,
//! after the commit record is durable, so no data change can ever reach
//! storage ahead of its log record.

use crate::apply::apply_body;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::transaction::{TransactionContext, TransactionRegistry};
use crate::types::{FileId, Lsn, ResourceManagerId, TransactionId};
use crate::wal::{LogRecord, RecordBody, Wal};
use parking_lot::RwLock;
use searchwal_storage::{SegmentStore, StorageError};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, trace};

/// Payload bytes a `RangeWrite` spends on its file and offset.
const RANGE_WRITE_OVERHEAD: usize = 12;

/// Wraps the structural writes of transactions with redo logging.
///
/// Cheap to clone; all clones share one log, store and file registry.
#[derive(Clone)]
pub struct MutationInterceptor {
    wal: Arc<Wal>,
    store: Arc<dyn SegmentStore>,
    registry: Arc<TransactionRegistry>,
    gate: Arc<RwLock<()>>,
    rm_id: ResourceManagerId,
    max_record_size: usize,
    max_file_size: u64,
}

impl MutationInterceptor {
    pub(crate) fn new(
        wal: Arc<Wal>,
        store: Arc<dyn SegmentStore>,
        registry: Arc<TransactionRegistry>,
        gate: Arc<RwLock<()>>,
        config: &Config,
    ) -> Self {
        Self {
            wal,
            store,
            registry,
            gate,
            rm_id: config.resource_manager_id,
            max_record_size: config.max_record_size,
            max_file_size: config.max_file_size,
        }
    }

    fn check_size(&self, file: FileId, size: u64) -> CoreResult<()> {
        if size > self.max_file_size {
            return Err(CoreError::FileTooLarge {
                file,
                size,
                max: self.max_file_size,
            });
        }
        Ok(())
    }

    /// Largest data chunk a single record may carry.
    fn chunk_size(&self) -> usize {
        self.max_record_size.saturating_sub(RANGE_WRITE_OVERHEAD).max(1)
    }

    /// Logs creation (or reset) of `file` as `len` zero bytes.
    ///
    /// # Errors
    ///
    /// - [`CoreError::FileTooLarge`] if `len` is past the file size limit
    /// - [`CoreError::FileLocked`] if another transaction owns the file
    /// - [`CoreError::WriteOrderingFailure`] if the record cannot be logged
    pub fn allocate_segment(
        &self,
        tx: &mut TransactionContext,
        file: FileId,
        len: u64,
    ) -> CoreResult<Lsn> {
        self.check_size(file, len)?;
        self.prepare(tx, file)?;
        self.log(tx, RecordBody::SegmentAlloc { file, len })
    }

    /// Logs a write of `data` at `offset`.
    ///
    /// Writes larger than the record size limit are split into
    /// consecutive records. Returns the LSN of the last one.
    ///
    /// # Errors
    ///
    /// - [`StorageError::FileNotFound`] / [`StorageError::RangeOutOfBounds`]
    ///   if the file is missing or `offset` is past its end
    /// - [`CoreError::FileTooLarge`] if the write ends past the file size
    ///   limit
    /// - [`CoreError::FileLocked`] if another transaction owns the file
    /// - [`CoreError::WriteOrderingFailure`] if a record cannot be logged
    pub fn write_range(
        &self,
        tx: &mut TransactionContext,
        file: FileId,
        offset: u64,
        data: &[u8],
    ) -> CoreResult<Lsn> {
        self.check_size(file, offset.saturating_add(data.len() as u64))?;
        self.prepare(tx, file)?;
        let size = existing_len(tx.overlay(), file)?;
        if offset > size {
            return Err(StorageError::RangeOutOfBounds {
                file,
                offset,
                len: data.len() as u64,
                size,
            }
            .into());
        }

        if data.is_empty() {
            return self.log(
                tx,
                RecordBody::RangeWrite {
                    file,
                    offset,
                    data: Vec::new(),
                },
            );
        }

        let mut lsn = Lsn::ZERO;
        let mut at = offset;
        for chunk in data.chunks(self.chunk_size()) {
            lsn = self.log(
                tx,
                RecordBody::RangeWrite {
                    file,
                    offset: at,
                    data: chunk.to_vec(),
                },
            )?;
            at += chunk.len() as u64;
        }
        Ok(lsn)
    }

    /// Logs truncation of `file` to `len` bytes.
    ///
    /// # Errors
    ///
    /// - [`StorageError::FileNotFound`] / [`StorageError::RangeOutOfBounds`]
    ///   if the file is missing or shorter than `len`
    /// - [`CoreError::FileLocked`] if another transaction owns the file
    /// - [`CoreError::WriteOrderingFailure`] if the record cannot be logged
    pub fn truncate_file(&self, tx: &mut TransactionContext, file: FileId, len: u64) -> CoreResult<Lsn> {
        self.prepare(tx, file)?;
        let size = existing_len(tx.overlay(), file)?;
        if len > size {
            return Err(StorageError::RangeOutOfBounds {
                file,
                offset: len,
                len: 0,
                size,
            }
            .into());
        }
        self.log(tx, RecordBody::RangeTruncate { file, len })
    }

    /// Logs removal of `file`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::FileNotFound`] if the file does not exist
    /// - [`CoreError::FileLocked`] if another transaction owns the file
    /// - [`CoreError::WriteOrderingFailure`] if the record cannot be logged
    pub fn remove_file(&self, tx: &mut TransactionContext, file: FileId) -> CoreResult<Lsn> {
        self.prepare(tx, file)?;
        existing_len(tx.overlay(), file)?;
        self.log(tx, RecordBody::FileRemove { file })
    }

    /// Logs replacement of `file` by the output of compaction.
    ///
    /// The record carries the resulting layout itself, so redo reproduces
    /// the same bytes without recomputing anything. Layouts larger than the
    /// record size limit are logged as a rewrite of the first chunk
    /// followed by writes of the rest.
    ///
    /// # Errors
    ///
    /// - [`CoreError::FileTooLarge`] if the layout is past the file size
    ///   limit
    /// - [`CoreError::FileLocked`] if another transaction owns the file
    /// - [`CoreError::WriteOrderingFailure`] if a record cannot be logged
    pub fn compaction_rewrite(
        &self,
        tx: &mut TransactionContext,
        file: FileId,
        data: &[u8],
    ) -> CoreResult<Lsn> {
        self.check_size(file, data.len() as u64)?;
        self.prepare(tx, file)?;
        let mut chunks = data.chunks(self.chunk_size());
        let first = chunks.next().unwrap_or_default();
        let mut lsn = self.log(
            tx,
            RecordBody::CompactionRewrite {
                file,
                data: first.to_vec(),
            },
        )?;

        let mut at = first.len() as u64;
        for chunk in chunks {
            lsn = self.log(
                tx,
                RecordBody::RangeWrite {
                    file,
                    offset: at,
                    data: chunk.to_vec(),
                },
            )?;
            at += chunk.len() as u64;
        }
        Ok(lsn)
    }

    /// Reads `len` bytes at `offset` as `tx` sees them.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn read_range(
        &self,
        tx: &TransactionContext,
        file: FileId,
        offset: u64,
        len: u64,
    ) -> CoreResult<Vec<u8>> {
        if tx.touched.contains(&file) {
            return Ok(tx.overlay().read_range(file, offset, len)?);
        }
        let _visible = self.gate.read();
        Ok(self.store.read_range(file, offset, len)?)
    }

    /// Returns the length of `file` as `tx` sees it.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn file_len(&self, tx: &TransactionContext, file: FileId) -> CoreResult<Option<u64>> {
        if tx.touched.contains(&file) {
            return Ok(tx.overlay().file_len(file)?);
        }
        let _visible = self.gate.read();
        Ok(self.store.file_len(file)?)
    }

    /// Claims `file` for `tx` and seeds the overlay on first touch.
    fn prepare(&self, tx: &mut TransactionContext, file: FileId) -> CoreResult<()> {
        tx.ensure_active()?;
        if tx.touched.contains(&file) {
            return Ok(());
        }
        self.registry.claim(file, tx.txid())?;

        let _visible = self.gate.read();
        if let Some(bytes) = self.store.read_file(file)? {
            tx.overlay.replace_file(file, &bytes)?;
            tx.overlay
                .set_applied_lsn(file, self.store.applied_lsn(file)?)?;
        }
        tx.touched.insert(file);
        Ok(())
    }

    /// Stages `body` in the overlay of `tx`, then logs it.
    ///
    /// The overlay goes first: a change it refuses leaves the log and the
    /// transaction untouched. After a failed append the overlay holds a
    /// change the log does not, and the transaction can only abort, which
    /// discards the overlay.
    fn log(&self, tx: &mut TransactionContext, body: RecordBody) -> CoreResult<Lsn> {
        let txid = tx.txid();
        let kind = body.record_type().name();
        apply_body(&tx.overlay, &body)?;

        let appended = if tx.records.is_empty() {
            self.registry
                .log_first(txid, || self.wal.append(self.rm_id, txid, body.clone()))
        } else {
            self.wal.append(self.rm_id, txid, body.clone())
        };

        let record = match appended {
            Ok(record) => record,
            Err(e) => {
                error!(txid = txid.as_u64(), kind, error = %e, "could not log structural change");
                tx.mark_failed();
                return Err(CoreError::write_ordering_failure(format!(
                    "could not log {kind} for {txid}: {e}"
                )));
            }
        };

        trace!(txid = txid.as_u64(), lsn = record.lsn.as_u64(), kind, "staged change");
        let lsn = record.lsn;
        tx.records.push(record);
        Ok(lsn)
    }

    /// Logs a transaction-control marker.
    pub(crate) fn log_control(&self, txid: TransactionId, body: RecordBody) -> CoreResult<LogRecord> {
        self.wal.append(self.rm_id, txid, body)
    }

    pub(crate) fn release(&self, txid: TransactionId, files: &BTreeSet<FileId>) {
        self.registry.release(txid, files);
    }
}

fn existing_len(store: &dyn SegmentStore, file: FileId) -> CoreResult<u64> {
    store
        .file_len(file)?
        .ok_or_else(|| StorageError::FileNotFound(file).into())
}

impl std::fmt::Debug for MutationInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationInterceptor")
            .field("rm_id", &self.rm_id)
            .field("max_record_size", &self.max_record_size)
            .finish_non_exhaustive()
    }
}
