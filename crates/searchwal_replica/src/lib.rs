//! # searchwal replica
//!
//! Keeps a standby's copy of an index up to date from the primary's log.
//!
//! This crate provides:
//! - the replica apply loop, a single consumer feeding the redo engine
//! - log sources: the host log itself, or a raw log backend such as a
//!   shipped log file
//! - replay cursor persistence (JSON file or in memory)
//! - the applied-through watermark that synchronous commits wait on
//!
//! ## Key Invariants
//!
//! - records are applied strictly in log order, one batch at a time
//! - the cursor is persisted after every applied batch
//! - a transaction's changes reach the replica's storage only with its
//!   commit record
//! - after a fatal error the replica refuses to run until rebuilt

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod apply_loop;
mod config;
mod error;
mod source;
mod state;

pub use apply_loop::{
    AppliedWatermark, ApplyState, ApplyStats, BatchResult, CatchUp, ReplicaApplyLoop, StopHandle,
};
pub use config::ReplicaConfig;
pub use error::{ReplicaError, ReplicaResult};
pub use source::{BackendSource, LogSource};
pub use state::{CursorStore, FileCursorStore, MemoryCursorStore, ReplicaState};
