//! # searchwal testkit
//!
//! Test utilities for searchwal.
//!
//! This crate provides:
//! - crash injection for the host log and for index storage
//! - a toy full-text table standing in for the external search engine
//! - a primary/standby cluster harness
//! - property-based workload generators using proptest
//!
//! End-to-end scenarios live in this crate's `tests/` directory.
//!
//! ## Usage
//!
//! ```rust
//! use searchwal_core::Config;
//! use searchwal_testkit::{Cluster, SearchTable};
//!
//! let cluster = Cluster::new(Config::default()).unwrap();
//! let table = SearchTable::default();
//! cluster.transaction(|tx| {
//!     table.create(tx)?;
//!     table.insert(tx, "PGroonga is very good!")
//! }).unwrap();
//!
//! let mut standby = cluster.standby().unwrap();
//! standby.catch_up().unwrap();
//! assert_eq!(
//!     table.seq_scan(standby.store(), "pgroonga").unwrap(),
//!     vec!["PGroonga is very good!".to_string()]
//! );
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod crash;
pub mod generators;
pub mod table;

pub use cluster::{Cluster, RunningStandby, Standby};
pub use crash::{CrashableLog, CrashableStore};
pub use generators::{Step, TableOp};
pub use table::{index_key, tokenize, Row, SearchTable, Snapshot, KEY_LEN};
