//! Persisted replica state.

use crate::error::{ReplicaError, ReplicaResult};
use parking_lot::Mutex;
use searchwal_core::ReplayCursor;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CURSOR_STATE_VERSION: u32 = 1;

/// What a replica persists between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    /// Where replay resumes.
    pub cursor: ReplayCursor,
    /// The last error that stopped the apply loop.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Set once the index can no longer be trusted.
    #[serde(default)]
    pub needs_rebuild: bool,
}

/// Durable home of a [`ReplicaState`].
pub trait CursorStore: Send + Sync {
    /// Loads the state; `None` if nothing was saved yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the state exists but cannot be read.
    fn load(&self) -> ReplicaResult<Option<ReplicaState>>;

    /// Saves the state. After this returns the state survives a crash.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    fn save(&self, state: &ReplicaState) -> ReplicaResult<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorEnvelope {
    version: u32,
    #[serde(flatten)]
    state: ReplicaState,
}

/// Keeps the state in a JSON file.
///
/// Every save writes a temporary file, syncs it and renames it over the
/// old one, so a crash leaves either the old or the new state.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    /// Creates a store for the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the state file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        match self.path.extension().and_then(|e| e.to_str()) {
            Some(extension) => self.path.with_extension(format!("{extension}.tmp")),
            None => self.path.with_extension("tmp"),
        }
    }
}

impl CursorStore for FileCursorStore {
    fn load(&self) -> ReplicaResult<Option<ReplicaState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)?;
        let envelope: CursorEnvelope = serde_json::from_slice(&bytes)
            .map_err(|e| ReplicaError::cursor_state(format!("decode {}: {e}", self.path.display())))?;
        if envelope.version != CURSOR_STATE_VERSION {
            return Err(ReplicaError::cursor_state(format!(
                "unsupported cursor state version {} (expected {CURSOR_STATE_VERSION})",
                envelope.version
            )));
        }
        Ok(Some(envelope.state))
    }

    fn save(&self, state: &ReplicaState) -> ReplicaResult<()> {
        let envelope = CursorEnvelope {
            version: CURSOR_STATE_VERSION,
            state: state.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| ReplicaError::cursor_state(format!("encode cursor state: {e}")))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = self.temp_path();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&temp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&temp, &self.path)?;
        sync_parent_dir(self.path.parent())
    }
}

#[cfg(unix)]
fn sync_parent_dir(parent: Option<&Path>) -> ReplicaResult<()> {
    if let Some(parent) = parent.filter(|p| !p.as_os_str().is_empty()) {
        fs::File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: Option<&Path>) -> ReplicaResult<()> {
    Ok(())
}

/// Keeps the state in memory. Clones share it.
#[derive(Debug, Clone, Default)]
pub struct MemoryCursorStore {
    inner: Arc<Mutex<MemoryCursorInner>>,
}

#[derive(Debug, Default)]
struct MemoryCursorInner {
    state: Option<ReplicaState>,
    saves: u64,
}

impl MemoryCursorStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the last saved state.
    pub fn state(&self) -> Option<ReplicaState> {
        self.inner.lock().state.clone()
    }

    /// Returns how many times the state was saved.
    pub fn saves(&self) -> u64 {
        self.inner.lock().saves
    }
}

impl CursorStore for MemoryCursorStore {
    fn load(&self) -> ReplicaResult<Option<ReplicaState>> {
        Ok(self.state())
    }

    fn save(&self, state: &ReplicaState) -> ReplicaResult<()> {
        let mut inner = self.inner.lock();
        inner.state = Some(state.clone());
        inner.saves += 1;
        Ok(())
    }
}
