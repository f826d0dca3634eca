//! Writer-side configuration.

use crate::rmgr::SEARCH_RESOURCE_MANAGER_ID;
use crate::types::ResourceManagerId;
use std::time::Duration;

/// How long a commit waits before it is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SynchronousCommit {
    /// Acknowledge once the commit record is durable in the local log.
    #[default]
    Local,
    /// Additionally wait until every registered replica has applied the
    /// commit.
    RemoteApply,
}

/// Configuration for the log writer and commit path.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether a log flush also syncs file metadata (`sync_all`) instead of
    /// data only.
    pub sync_on_flush: bool,

    /// Maximum payload bytes per record. Larger writes are split.
    pub max_record_size: usize,

    /// Largest size a transaction may give an index file.
    pub max_file_size: u64,

    /// Commit acknowledgment level.
    pub synchronous_commit: SynchronousCommit,

    /// Upper bound on a [`SynchronousCommit::RemoteApply`] wait.
    pub remote_apply_timeout: Duration,

    /// Resource manager that records written by this process belong to.
    pub resource_manager_id: ResourceManagerId,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_on_flush: false,
            max_record_size: 32 * 1024, // 32 KiB
            max_file_size: 1024 * 1024 * 1024, // 1 GiB
            synchronous_commit: SynchronousCommit::Local,
            remote_apply_timeout: Duration::from_secs(10),
            resource_manager_id: SEARCH_RESOURCE_MANAGER_ID,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether flushes sync metadata.
    #[must_use]
    pub const fn sync_on_flush(mut self, value: bool) -> Self {
        self.sync_on_flush = value;
        self
    }

    /// Sets the maximum payload size of a single record.
    ///
    /// Values below 64 bytes are raised to 64 so every record type fits.
    #[must_use]
    pub const fn max_record_size(mut self, size: usize) -> Self {
        self.max_record_size = if size < MIN_RECORD_SIZE {
            MIN_RECORD_SIZE
        } else {
            size
        };
        self
    }

    /// Sets the largest size a transaction may give an index file.
    #[must_use]
    pub const fn max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    /// Sets the commit acknowledgment level.
    #[must_use]
    pub const fn synchronous_commit(mut self, level: SynchronousCommit) -> Self {
        self.synchronous_commit = level;
        self
    }

    /// Sets the remote-apply wait bound.
    #[must_use]
    pub const fn remote_apply_timeout(mut self, timeout: Duration) -> Self {
        self.remote_apply_timeout = timeout;
        self
    }

    /// Sets the resource manager ID stamped on written records.
    #[must_use]
    pub const fn resource_manager_id(mut self, id: ResourceManagerId) -> Self {
        self.resource_manager_id = id;
        self
    }
}

const MIN_RECORD_SIZE: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(!config.sync_on_flush);
        assert_eq!(config.synchronous_commit, SynchronousCommit::Local);
        assert_eq!(config.resource_manager_id, SEARCH_RESOURCE_MANAGER_ID);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .sync_on_flush(true)
            .max_record_size(1024)
            .max_file_size(4096)
            .synchronous_commit(SynchronousCommit::RemoteApply)
            .remote_apply_timeout(Duration::from_millis(50));

        assert!(config.sync_on_flush);
        assert_eq!(config.max_record_size, 1024);
        assert_eq!(config.max_file_size, 4096);
        assert_eq!(config.synchronous_commit, SynchronousCommit::RemoteApply);
        assert_eq!(config.remote_apply_timeout, Duration::from_millis(50));
    }

    #[test]
    fn tiny_record_size_is_clamped() {
        assert_eq!(Config::new().max_record_size(3).max_record_size, 64);
    }
}
