//! Configuration for the replica apply loop.

use std::time::Duration;

/// Configuration for a [`crate::ReplicaApplyLoop`].
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Maximum records read from the log per batch. The cursor is persisted
    /// after every batch.
    pub batch_size: usize,
    /// How long the loop waits for new records before checking whether it
    /// was asked to stop.
    pub poll_interval: Duration,
    /// Upper bound on batches per catch-up; `None` catches up fully.
    pub max_batches_per_run: Option<usize>,
}

impl ReplicaConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            batch_size: 256,
            poll_interval: Duration::from_millis(50),
            max_batches_per_run: None,
        }
    }

    /// Sets the batch size. Zero is raised to one.
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bounds the batches applied per catch-up.
    #[must_use]
    pub fn with_max_batches_per_run(mut self, batches: usize) -> Self {
        self.max_batches_per_run = Some(batches);
        self
    }
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self::new()
    }
}
