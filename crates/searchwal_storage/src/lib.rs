//! # searchwal storage
//!
//! Byte-level storage for searchwal.
//!
//! This crate provides the two lowest-level storage abstractions:
//!
//! - [`LogBackend`] - an append-only byte store holding the host log
//! - [`SegmentStore`] - random-access index files owned by the external
//!   search engine, addressed by [`FileId`]
//!
//! Both are **opaque byte stores**. They know nothing about log records,
//! transactions, postings or tokens. `searchwal_core` owns every format.
//!
//! ## Available Implementations
//!
//! - [`InMemoryLog`] / [`InMemorySegmentStore`] - tests and ephemeral use
//! - [`FileLog`] / [`DirectorySegmentStore`] - persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use searchwal_storage::{FileId, InMemorySegmentStore, SegmentStore};
//!
//! let store = InMemorySegmentStore::new();
//! let file = FileId::new(7);
//! store.allocate_segment(file, 4).unwrap();
//! store.write_range(file, 1, b"ab").unwrap();
//! assert_eq!(store.read_range(file, 0, 4).unwrap(), vec![0, b'a', b'b', 0]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod dir_store;
mod error;
mod file_log;
mod log;
mod memory_log;
mod memory_store;
mod segment;

pub use dir_store::DirectorySegmentStore;
pub use error::{StorageError, StorageResult};
pub use file_log::FileLog;
pub use log::LogBackend;
pub use memory_log::InMemoryLog;
pub use memory_store::InMemorySegmentStore;
pub use segment::{FileId, SegmentStore};
