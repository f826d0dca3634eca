//! The replica apply loop.

use crate::config::ReplicaConfig;
use crate::error::{ReplicaError, ReplicaResult};
use crate::source::LogSource;
use crate::state::{CursorStore, ReplicaState};
use parking_lot::{Condvar, Mutex};
use searchwal_core::{
    Lsn, RedoEngine, RedoStats, ReplayCursor, ReplicaWatermark, ResourceManagerTable,
};
use searchwal_storage::SegmentStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// The current state of the apply loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    /// Not applying.
    Idle,
    /// Reading and applying a batch.
    Applying,
    /// Everything available has been applied.
    CaughtUp,
    /// An error stopped the loop.
    Halted,
}

/// Statistics about the apply loop.
#[derive(Debug, Clone, Default)]
pub struct ApplyStats {
    /// Batches applied.
    pub batches: u64,
    /// Records applied.
    pub records: u64,
    /// Time the last batch was applied.
    pub last_batch_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of applying one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchResult {
    /// Records applied.
    pub records: usize,
    /// Applied-through position after the batch.
    pub applied_through: Lsn,
    /// Whether the source had nothing more to offer.
    pub caught_up: bool,
}

/// Result of a catch-up run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUp {
    /// Non-empty batches applied.
    pub batches: usize,
    /// Records applied.
    pub records: usize,
    /// Applied-through position at the end.
    pub applied_through: Lsn,
    /// Whether the run ended because everything available was applied.
    pub caught_up: bool,
}

/// The position up to which a replica has applied the log.
///
/// Shared with the writer, which waits on it for
/// [`searchwal_core::SynchronousCommit::RemoteApply`] commits.
#[derive(Debug, Default)]
pub struct AppliedWatermark {
    applied: Mutex<Lsn>,
    advanced: Condvar,
}

impl AppliedWatermark {
    /// Creates a watermark at `lsn`.
    pub fn new(lsn: Lsn) -> Self {
        Self {
            applied: Mutex::new(lsn),
            advanced: Condvar::new(),
        }
    }

    fn advance(&self, lsn: Lsn) {
        let mut applied = self.applied.lock();
        if lsn > *applied {
            *applied = lsn;
            drop(applied);
            self.advanced.notify_all();
        }
    }
}

impl ReplicaWatermark for AppliedWatermark {
    fn applied_lsn(&self) -> Lsn {
        *self.applied.lock()
    }

    fn wait_for(&self, lsn: Lsn, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut applied = self.applied.lock();
        while *applied < lsn {
            if self.advanced.wait_until(&mut applied, deadline).timed_out() {
                return *applied >= lsn;
            }
        }
        true
    }
}

/// Asks a running apply loop to stop between batches.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    /// Requests a stop.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Returns true once a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Continuously drains a log source into index storage on a standby.
///
/// The loop is the sole writer of its store. It applies records strictly
/// in log order through a [`RedoEngine`] and persists the replay cursor
/// after every batch, so a restarted loop resumes exactly where the last
/// persisted batch ended.
///
/// A fatal error (corruption, unsupported record, ordering violation) is
/// recorded in the persisted state with `needs_rebuild` set; the loop then
/// refuses to open until the index is rebuilt from a fresh base backup.
pub struct ReplicaApplyLoop<S: LogSource, C: CursorStore> {
    source: S,
    cursors: C,
    store: Arc<dyn SegmentStore>,
    config: ReplicaConfig,
    engine: RedoEngine,
    /// End of everything read successfully so far.
    valid_tail: Lsn,
    /// Set while the source ends in an incomplete frame.
    torn_tail: Option<u64>,
    saved: ReplicaState,
    state: ApplyState,
    stats: ApplyStats,
    watermark: Arc<AppliedWatermark>,
    stop: StopHandle,
}

impl<S: LogSource, C: CursorStore> ReplicaApplyLoop<S, C> {
    /// Opens the loop, resuming from the persisted cursor if there is one.
    ///
    /// # Errors
    ///
    /// - [`ReplicaError::NeedsRebuild`] if an earlier run hit a fatal error
    /// - an error if the persisted state cannot be loaded
    pub fn open(
        source: S,
        cursors: C,
        store: Arc<dyn SegmentStore>,
        table: Arc<ResourceManagerTable>,
        config: ReplicaConfig,
    ) -> ReplicaResult<Self> {
        let saved = cursors.load()?.unwrap_or_default();
        if saved.needs_rebuild {
            return Err(ReplicaError::NeedsRebuild {
                reason: saved
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "unknown error".into()),
            });
        }
        Ok(Self::with_cursor(source, cursors, store, table, config, saved))
    }

    /// Opens the loop on a store freshly restored from a base backup taken
    /// at `cursor`. Any previously persisted state is replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the new state cannot be persisted.
    pub fn from_base_backup(
        source: S,
        cursors: C,
        store: Arc<dyn SegmentStore>,
        table: Arc<ResourceManagerTable>,
        config: ReplicaConfig,
        cursor: ReplayCursor,
    ) -> ReplicaResult<Self> {
        let saved = ReplicaState {
            cursor,
            ..ReplicaState::default()
        };
        cursors.save(&saved)?;
        Ok(Self::with_cursor(source, cursors, store, table, config, saved))
    }

    fn with_cursor(
        source: S,
        cursors: C,
        store: Arc<dyn SegmentStore>,
        table: Arc<ResourceManagerTable>,
        config: ReplicaConfig,
        saved: ReplicaState,
    ) -> Self {
        let cursor = saved.cursor;
        info!(
            applied = %cursor.applied_lsn,
            restart = %cursor.restart_lsn,
            "replica apply loop opened"
        );
        Self {
            source,
            cursors,
            store,
            config,
            engine: RedoEngine::new(table, cursor),
            valid_tail: cursor.applied_lsn,
            torn_tail: None,
            saved,
            state: ApplyState::Idle,
            stats: ApplyStats::default(),
            watermark: Arc::new(AppliedWatermark::new(cursor.applied_lsn)),
            stop: StopHandle::default(),
        }
    }

    /// Reads and applies one batch, then persists the cursor.
    ///
    /// # Errors
    ///
    /// Returns the error that halted the loop. Once halted, every call
    /// returns [`ReplicaError::Halted`].
    pub fn run_once(&mut self) -> ReplicaResult<BatchResult> {
        if self.state == ApplyState::Halted {
            return Err(ReplicaError::Halted {
                reason: self
                    .stats
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "unknown error".into()),
            });
        }
        self.state = ApplyState::Applying;

        let from = self.engine.position();
        let batch = match self
            .source
            .read_batch(from, self.valid_tail, self.config.batch_size)
        {
            Ok(batch) => batch,
            Err(e) => return Err(self.fail(e.into())),
        };
        self.torn_tail = batch.torn_tail;
        if let Some(offset) = batch.torn_tail {
            debug!(offset, "source ends in an incomplete record, waiting for the rest");
        }

        if batch.is_empty() {
            self.state = ApplyState::CaughtUp;
            return Ok(BatchResult {
                records: 0,
                applied_through: self.watermark.applied_lsn(),
                caught_up: true,
            });
        }

        for record in &batch.records {
            if let Err(e) = self.engine.apply(self.store.as_ref(), record) {
                return Err(self.fail(e.into()));
            }
        }
        self.valid_tail = self.valid_tail.max(batch.end);

        let cursor = self.engine.cursor();
        let state = ReplicaState {
            cursor,
            last_error: None,
            needs_rebuild: false,
        };
        if let Err(e) = self.cursors.save(&state) {
            return Err(self.fail(e));
        }
        self.saved = state;
        self.watermark.advance(cursor.applied_lsn);

        self.stats.batches += 1;
        self.stats.records += batch.records.len() as u64;
        self.stats.last_batch_time = Some(Instant::now());

        let caught_up = batch.records.len() < self.config.batch_size || batch.torn_tail.is_some();
        self.state = if caught_up {
            ApplyState::CaughtUp
        } else {
            ApplyState::Applying
        };
        debug!(
            records = batch.records.len(),
            applied = %cursor.applied_lsn,
            restart = %cursor.restart_lsn,
            "applied batch"
        );
        Ok(BatchResult {
            records: batch.records.len(),
            applied_through: cursor.applied_lsn,
            caught_up,
        })
    }

    /// Applies batches until the source has nothing more, a stop is
    /// requested, or the configured batch limit is reached.
    ///
    /// # Errors
    ///
    /// Returns the error that halted the loop.
    pub fn catch_up(&mut self) -> ReplicaResult<CatchUp> {
        let mut result = CatchUp {
            batches: 0,
            records: 0,
            applied_through: self.watermark.applied_lsn(),
            caught_up: false,
        };
        while !self.stop.is_stopped() {
            if self
                .config
                .max_batches_per_run
                .is_some_and(|max| result.batches >= max)
            {
                break;
            }
            let batch = self.run_once()?;
            if batch.records > 0 {
                result.batches += 1;
            }
            result.records += batch.records;
            result.applied_through = batch.applied_through;
            if batch.caught_up {
                result.caught_up = true;
                break;
            }
        }
        Ok(result)
    }

    /// Applies the log until [`StopHandle::stop`] is called, blocking while
    /// no new records are available.
    ///
    /// # Errors
    ///
    /// Returns the error that halted the loop.
    pub fn run(&mut self) -> ReplicaResult<()> {
        info!("replica apply loop running");
        while !self.stop.is_stopped() {
            let caught = self.catch_up()?;
            if caught.caught_up {
                let after = match self.torn_tail {
                    Some(_) => match self.source.end_lsn() {
                        Ok(end) => end,
                        Err(e) => return Err(self.fail(e.into())),
                    },
                    None => self.engine.position(),
                };
                if let Err(e) = self.source.wait_for_records(after, self.config.poll_interval) {
                    return Err(self.fail(e.into()));
                }
            }
        }
        self.state = ApplyState::Idle;
        info!(applied = %self.watermark.applied_lsn(), "replica apply loop stopped");
        Ok(())
    }

    fn fail(&mut self, error: ReplicaError) -> ReplicaError {
        self.state = ApplyState::Halted;
        let reason = error.to_string();
        let needs_rebuild = error.is_fatal();
        error!(error = %reason, needs_rebuild, "replica apply loop halted");
        self.stats.last_error = Some(reason.clone());

        let state = ReplicaState {
            cursor: self.saved.cursor,
            last_error: Some(reason),
            needs_rebuild,
        };
        match self.cursors.save(&state) {
            Ok(()) => self.saved = state,
            Err(e) => warn!(error = %e, "could not record replica failure"),
        }
        error
    }

    /// Returns a handle that stops [`ReplicaApplyLoop::run`].
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Returns the applied-through watermark.
    pub fn watermark(&self) -> Arc<AppliedWatermark> {
        Arc::clone(&self.watermark)
    }

    /// Returns the current state.
    pub fn state(&self) -> ApplyState {
        self.state
    }

    /// Returns the loop statistics.
    pub fn stats(&self) -> ApplyStats {
        self.stats.clone()
    }

    /// Returns the redo engine counters.
    pub fn redo_stats(&self) -> RedoStats {
        self.engine.stats()
    }

    /// Returns the last persisted state.
    pub fn persisted(&self) -> &ReplicaState {
        &self.saved
    }

    /// Returns the store the loop applies to.
    pub fn store(&self) -> &Arc<dyn SegmentStore> {
        &self.store
    }
}

impl<S: LogSource, C: CursorStore> std::fmt::Debug for ReplicaApplyLoop<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaApplyLoop")
            .field("state", &self.state)
            .field("engine", &self.engine)
            .field("saved", &self.saved)
            .finish_non_exhaustive()
    }
}
