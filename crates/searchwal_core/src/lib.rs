//! # searchwal core
//!
//! Write-ahead logging for a search index whose storage lives outside the
//! host's page store.
//!
//! This crate provides:
//! - the record codec and the host log ([`Wal`])
//! - the mutation interceptor that logs every structural index write
//! - transaction contexts and the consistency coordinator that makes a
//!   transaction's changes visible all at once, after its commit is durable
//! - the redo engine used by crash recovery and by replicas
//! - index status and broken-file reporting
//!
//! ## Writing
//!
//! ```rust
//! use searchwal_core::{Config, ConsistencyCoordinator, FileId, ResourceManagerTable, Wal};
//! use searchwal_storage::{InMemoryLog, InMemorySegmentStore, SegmentStore};
//! use std::sync::Arc;
//!
//! let config = Config::default();
//! let wal = Arc::new(Wal::open(Box::new(InMemoryLog::new()), &config).unwrap());
//! let store: Arc<dyn SegmentStore> = Arc::new(InMemorySegmentStore::new());
//! let table = Arc::new(ResourceManagerTable::search_only());
//! let coordinator = ConsistencyCoordinator::new(wal, Arc::clone(&store), table, config).unwrap();
//!
//! let mut tx = coordinator.begin();
//! tx.allocate_segment(FileId::new(1), 0).unwrap();
//! tx.write_range(FileId::new(1), 0, b"PGroonga").unwrap();
//! assert_eq!(store.file_len(FileId::new(1)).unwrap(), None);
//!
//! coordinator.commit(tx).unwrap();
//! assert_eq!(store.read_file(FileId::new(1)).unwrap().unwrap(), b"PGroonga");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod apply;
mod config;
mod coordinator;
mod cursor;
mod error;
mod interceptor;
mod recovery;
mod redo;
mod rmgr;
mod status;
mod transaction;
mod types;
pub mod wal;

pub use apply::{apply_body, apply_transaction, TransactionApply};
pub use config::{Config, SynchronousCommit};
pub use coordinator::{
    CommitReceipt, ConsistencyCoordinator, RemoteApply, ReplicaWatermark, TransactionListener,
};
pub use cursor::ReplayCursor;
pub use error::{CoreError, CoreResult};
pub use interceptor::MutationInterceptor;
pub use recovery::{recover, RecoveryReport};
pub use redo::{RecordOutcome, RedoEngine, RedoStats};
pub use rmgr::{
    DescribeFn, MaskFn, RedoEffect, RedoFn, ResourceManagerEntry, ResourceManagerTable,
    ResourceManagerTableBuilder, SEARCH_RESOURCE_MANAGER_ID,
};
pub use status::{diverged_files, index_status, list_broken_files, BrokenFile, FileStatus, IndexStatus};
pub use transaction::{TransactionContext, TransactionState};
pub use types::{FileId, Lsn, ResourceManagerId, TransactionId};
pub use wal::{LogBatch, LogRecord, RecordBody, RecordType, Wal};
