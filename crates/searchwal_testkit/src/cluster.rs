//! A primary and its standbys in one process.
//!
//! The primary writes through a [`ConsistencyCoordinator`] onto a
//! [`CrashableLog`] and a [`CrashableStore`], so tests can cut it off at
//! any point and restart it. Standbys replay the primary's log into their
//! own stores through a [`ReplicaApplyLoop`], either on demand or on a
//! background thread.

use crate::crash::{CrashableLog, CrashableStore};
use crate::generators::Step;
use crate::table::SearchTable;
use searchwal_core::{
    diverged_files, recover, CommitReceipt, Config, ConsistencyCoordinator, CoreResult, FileId,
    RecoveryReport, RedoEngine, ReplayCursor, ResourceManagerTable, TransactionContext, Wal,
};
use searchwal_replica::{
    CatchUp, MemoryCursorStore, ReplicaApplyLoop, ReplicaConfig, ReplicaError, ReplicaResult,
    StopHandle,
};
use searchwal_storage::{InMemorySegmentStore, SegmentStore};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Records read per batch when replaying the whole log.
const REPLAY_BATCH: usize = 256;

/// A primary server.
pub struct Cluster {
    config: Config,
    table: Arc<ResourceManagerTable>,
    log: CrashableLog,
    store: CrashableStore,
    wal: Arc<Wal>,
    coordinator: Arc<ConsistencyCoordinator>,
    checkpoint: ReplayCursor,
}

impl Cluster {
    /// Starts a primary with an empty log and empty storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator rejects `config`.
    pub fn new(config: Config) -> CoreResult<Self> {
        let table = Arc::new(ResourceManagerTable::search_only());
        let log = CrashableLog::new();
        let store = CrashableStore::new();
        let wal = Arc::new(Wal::open(Box::new(log.clone()), &config)?);
        let coordinator = Arc::new(ConsistencyCoordinator::new(
            Arc::clone(&wal),
            Arc::new(store.clone()),
            Arc::clone(&table),
            config.clone(),
        )?);
        Ok(Self {
            config,
            table,
            log,
            store,
            wal,
            coordinator,
            checkpoint: ReplayCursor::default(),
        })
    }

    /// Returns the coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<ConsistencyCoordinator> {
        &self.coordinator
    }

    /// Returns the log.
    #[must_use]
    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    /// Returns the crash controls of the log.
    #[must_use]
    pub fn log(&self) -> &CrashableLog {
        &self.log
    }

    /// Returns the crash controls of the primary's storage.
    #[must_use]
    pub fn crash_store(&self) -> &CrashableStore {
        &self.store
    }

    /// Returns the primary's storage.
    #[must_use]
    pub fn store(&self) -> &InMemorySegmentStore {
        self.store.inner()
    }

    /// Returns the resource manager table.
    #[must_use]
    pub fn table(&self) -> &Arc<ResourceManagerTable> {
        &self.table
    }

    /// Runs `f` in a transaction and commits it, or aborts it if `f` fails.
    ///
    /// # Errors
    ///
    /// Returns the error of `f` or of the commit.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut TransactionContext) -> CoreResult<T>,
    ) -> CoreResult<(T, CommitReceipt)> {
        let mut tx = self.coordinator.begin();
        match f(&mut tx) {
            Ok(value) => Ok((value, self.coordinator.commit(tx)?)),
            Err(e) => {
                if let Err(abort) = self.coordinator.abort(tx) {
                    warn!(error = %abort, "abort after failed transaction body failed");
                }
                Err(e)
            }
        }
    }

    /// Creates `table` and runs a workload against it.
    ///
    /// # Errors
    ///
    /// Returns the first error of a step.
    pub fn run_workload(&self, table: &SearchTable, steps: &[Step]) -> CoreResult<()> {
        if self.store().file_len(table.heap_file())?.is_none() {
            self.transaction(|tx| table.create(tx))?;
        }
        for step in steps {
            let mut tx = self.coordinator.begin();
            for op in &step.ops {
                op.apply(table, &mut tx)?;
            }
            if step.commit {
                self.coordinator.commit(tx)?;
            } else {
                self.coordinator.abort(tx)?;
            }
        }
        Ok(())
    }

    /// Remembers where a restart may begin replaying.
    pub fn checkpoint(&mut self) -> ReplayCursor {
        self.checkpoint = self.coordinator.checkpoint();
        debug!(applied = %self.checkpoint.applied_lsn, "cluster checkpoint");
        self.checkpoint
    }

    /// Simulates power loss and a restart of the primary.
    ///
    /// Unflushed log bytes are lost, injected failures are cleared, and
    /// recovery replays the log from the last checkpoint. Open
    /// transactions and standbys of the old primary must be dropped first.
    ///
    /// # Errors
    ///
    /// Returns the error of reopening the log or of recovery.
    pub fn restart(&mut self) -> CoreResult<RecoveryReport> {
        self.log.power_loss();
        self.log.reset();
        self.store.reset();

        self.wal = Arc::new(Wal::open(Box::new(self.log.clone()), &self.config)?);
        let report = recover(
            &self.wal,
            &self.store,
            Arc::clone(&self.table),
            self.checkpoint,
            &self.config,
        )?;
        self.checkpoint = report.cursor;
        self.coordinator = Arc::new(ConsistencyCoordinator::new(
            Arc::clone(&self.wal),
            Arc::new(self.store.clone()),
            Arc::clone(&self.table),
            self.config.clone(),
        )?);
        Ok(report)
    }

    /// Replays the durable log from the beginning into a fresh store.
    ///
    /// # Errors
    ///
    /// Returns the error that halted replay.
    pub fn replay_from_scratch(&self) -> CoreResult<InMemorySegmentStore> {
        let store = InMemorySegmentStore::new();
        self.replay_into(&store, ReplayCursor::default())?;
        Ok(store)
    }

    /// Replays the durable log into `store`, starting at `cursor`.
    ///
    /// # Errors
    ///
    /// Returns the error that halted replay.
    pub fn replay_into(&self, store: &dyn SegmentStore, cursor: ReplayCursor) -> CoreResult<ReplayCursor> {
        let mut engine = RedoEngine::new(Arc::clone(&self.table), cursor);
        let end = self.wal.durable_lsn();
        let mut from = cursor.restart_lsn;
        loop {
            let batch = self.wal.read_batch(from, end, REPLAY_BATCH)?;
            if batch.is_empty() {
                break;
            }
            for record in &batch.records {
                engine.apply(store, record)?;
            }
            from = batch.end;
        }
        engine.finish(store)
    }

    /// Returns the files whose contents differ between the primary and
    /// `other`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn diverged(&self, other: &dyn SegmentStore) -> CoreResult<Vec<FileId>> {
        diverged_files(self.store(), other, &self.table)
    }

    /// Opens a standby replaying this primary's log from the beginning.
    ///
    /// # Errors
    ///
    /// Returns an error if the apply loop cannot open.
    pub fn standby(&self) -> ReplicaResult<Standby> {
        self.standby_with(ReplicaConfig::default())
    }

    /// Opens a standby with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the apply loop cannot open.
    pub fn standby_with(&self, config: ReplicaConfig) -> ReplicaResult<Standby> {
        let store = Arc::new(InMemorySegmentStore::new());
        let cursors = MemoryCursorStore::new();
        let apply = ReplicaApplyLoop::open(
            Arc::clone(&self.wal),
            cursors.clone(),
            Arc::clone(&store) as Arc<dyn SegmentStore>,
            Arc::clone(&self.table),
            config,
        )?;
        Ok(Standby {
            apply,
            store,
            cursors,
        })
    }

    /// Starts a standby on its own thread and registers it with the
    /// coordinator, so remote-apply commits wait for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the apply loop cannot open or the thread cannot
    /// be spawned.
    pub fn spawn_standby(&self) -> ReplicaResult<RunningStandby> {
        let Standby {
            mut apply, store, ..
        } = self.standby()?;
        self.coordinator.register_replica(apply.watermark());
        let stop = apply.stop_handle();
        let handle = std::thread::Builder::new()
            .name("standby-apply".into())
            .spawn(move || apply.run())?;
        Ok(RunningStandby {
            store,
            stop,
            handle: Some(handle),
        })
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("wal", &self.wal)
            .field("checkpoint", &self.checkpoint)
            .finish_non_exhaustive()
    }
}

/// A standby driven by the test.
#[derive(Debug)]
pub struct Standby {
    apply: ReplicaApplyLoop<Arc<Wal>, MemoryCursorStore>,
    store: Arc<InMemorySegmentStore>,
    cursors: MemoryCursorStore,
}

impl Standby {
    /// Applies everything the primary has made durable.
    ///
    /// # Errors
    ///
    /// Returns the error that halted the apply loop.
    pub fn catch_up(&mut self) -> ReplicaResult<CatchUp> {
        self.apply.catch_up()
    }

    /// Returns the standby's storage.
    #[must_use]
    pub fn store(&self) -> &InMemorySegmentStore {
        &self.store
    }

    /// Returns the apply loop.
    pub fn apply_loop(&mut self) -> &mut ReplicaApplyLoop<Arc<Wal>, MemoryCursorStore> {
        &mut self.apply
    }

    /// Returns the persisted replica state.
    #[must_use]
    pub fn cursors(&self) -> &MemoryCursorStore {
        &self.cursors
    }
}

/// A standby applying on a background thread.
#[derive(Debug)]
pub struct RunningStandby {
    store: Arc<InMemorySegmentStore>,
    stop: StopHandle,
    handle: Option<JoinHandle<ReplicaResult<()>>>,
}

impl RunningStandby {
    /// Returns the standby's storage.
    #[must_use]
    pub fn store(&self) -> &InMemorySegmentStore {
        &self.store
    }

    /// Stops the apply loop and waits for its thread.
    ///
    /// # Errors
    ///
    /// Returns the error that halted the loop, if any.
    pub fn shutdown(mut self) -> ReplicaResult<()> {
        self.join()
    }

    fn join(&mut self) -> ReplicaResult<()> {
        self.stop.stop();
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| ReplicaError::Halted {
                reason: "standby apply thread panicked".into(),
            })?,
            None => Ok(()),
        }
    }
}

impl Drop for RunningStandby {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            warn!(error = %e, "standby stopped with an error");
        }
    }
}
