//! Resource manager registration.
//!
//! A resource manager owns a namespace of record types and the redo logic
//! for them. The table of resource managers is built once at startup and is
//! immutable afterwards; consumers share it behind an `Arc`.

use crate::apply::apply_body;
use crate::error::{CoreError, CoreResult};
use crate::types::{FileId, ResourceManagerId};
use crate::wal::LogRecord;
use searchwal_storage::SegmentStore;
use std::collections::BTreeMap;
use std::fmt;

/// ID under which the search index resource manager is registered.
pub const SEARCH_RESOURCE_MANAGER_ID: ResourceManagerId = ResourceManagerId::new(138);

/// Result of redoing one data record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoEffect {
    /// The record's change is now reflected in storage.
    Applied,
    /// The record's target file does not exist.
    MissingTarget,
}

/// Redo entry point: applies one data record to storage.
pub type RedoFn = fn(&dyn SegmentStore, &LogRecord) -> CoreResult<RedoEffect>;

/// Renders a record for diagnostics.
pub type DescribeFn = fn(&LogRecord) -> String;

/// Blanks out bytes that may legitimately differ between a primary and a
/// replica before their files are compared.
pub type MaskFn = fn(FileId, &mut [u8]);

/// One registered resource manager.
#[derive(Clone, Copy)]
pub struct ResourceManagerEntry {
    /// Unique ID carried in every record.
    pub id: ResourceManagerId,
    /// Human-readable name.
    pub name: &'static str,
    /// Redo entry point.
    pub redo: RedoFn,
    /// Record description function.
    pub describe: DescribeFn,
    /// Optional consistency mask.
    pub mask: Option<MaskFn>,
}

impl ResourceManagerEntry {
    /// Returns the search index resource manager registered under `id`.
    #[must_use]
    pub fn search(id: ResourceManagerId) -> Self {
        Self {
            id,
            name: "search",
            redo: search_redo,
            describe: search_describe,
            mask: None,
        }
    }
}

impl fmt::Debug for ResourceManagerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceManagerEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mask", &self.mask.is_some())
            .finish_non_exhaustive()
    }
}

fn search_redo(store: &dyn SegmentStore, record: &LogRecord) -> CoreResult<RedoEffect> {
    apply_body(store, &record.body)
}

fn search_describe(record: &LogRecord) -> String {
    format!("{} {}", record.txid, record.body)
}

/// The immutable table of registered resource managers.
#[derive(Debug, Clone)]
pub struct ResourceManagerTable {
    entries: BTreeMap<ResourceManagerId, ResourceManagerEntry>,
}

impl ResourceManagerTable {
    /// Starts building a table.
    #[must_use]
    pub fn builder() -> ResourceManagerTableBuilder {
        ResourceManagerTableBuilder::default()
    }

    /// Returns a table holding only the search resource manager under its
    /// default ID.
    #[must_use]
    pub fn search_only() -> Self {
        let entry = ResourceManagerEntry::search(SEARCH_RESOURCE_MANAGER_ID);
        Self {
            entries: BTreeMap::from([(entry.id, entry)]),
        }
    }

    /// Looks up a resource manager.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownResourceManager`] if `id` is not registered.
    pub fn get(&self, id: ResourceManagerId) -> CoreResult<&ResourceManagerEntry> {
        self.entries
            .get(&id)
            .ok_or(CoreError::UnknownResourceManager(id))
    }

    /// Returns `true` if `id` is registered.
    #[must_use]
    pub fn contains(&self, id: ResourceManagerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Returns every registered entry in ID order.
    pub fn entries(&self) -> impl Iterator<Item = &ResourceManagerEntry> {
        self.entries.values()
    }

    /// Describes a record through its resource manager.
    #[must_use]
    pub fn describe(&self, record: &LogRecord) -> String {
        match self.entries.get(&record.rm_id) {
            Some(entry) => format!("{} {}: {}", record.lsn, entry.name, (entry.describe)(record)),
            None => format!("{} {} (unregistered): {}", record.lsn, record.rm_id, record.body),
        }
    }
}

/// Builder for [`ResourceManagerTable`].
#[derive(Debug, Default)]
pub struct ResourceManagerTableBuilder {
    entries: BTreeMap<ResourceManagerId, ResourceManagerEntry>,
    duplicate: Option<ResourceManagerId>,
}

impl ResourceManagerTableBuilder {
    /// Adds a resource manager.
    #[must_use]
    pub fn register(mut self, entry: ResourceManagerEntry) -> Self {
        if self.entries.insert(entry.id, entry).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(entry.id);
        }
        self
    }

    /// Finishes the table.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateResourceManager`] if an ID was
    /// registered twice.
    pub fn build(self) -> CoreResult<ResourceManagerTable> {
        if let Some(id) = self.duplicate {
            return Err(CoreError::DuplicateResourceManager(id));
        }
        Ok(ResourceManagerTable {
            entries: self.entries,
        })
    }
}
