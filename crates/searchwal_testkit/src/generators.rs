//! Property-based test generators using proptest.
//!
//! Workloads are short sequences of table operations grouped into
//! transactions, some of which abort. Words come from a small vocabulary
//! with shared eight-byte prefixes so the lossy index sees collisions.

use crate::table::SearchTable;
use proptest::prelude::*;
use searchwal_core::{CoreResult, TransactionContext};

/// Words rows are built from.
pub const VOCABULARY: &[&str] = &[
    "groonga",
    "pgroonga",
    "mroonga",
    "database",
    "databases",
    "search",
    "searching",
    "is",
    "very",
    "good",
];

/// One table operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOp {
    /// Insert a row.
    Insert(String),
    /// Delete rows containing a word.
    Delete(String),
    /// Drop dead entries.
    Vacuum,
    /// Remove every row.
    Truncate,
    /// Build the index if it is missing.
    CreateIndex,
    /// Drop the index if it exists.
    DropIndex,
}

impl TableOp {
    /// Runs the operation inside `tx`.
    ///
    /// Index operations that would fail because the index already is in
    /// the requested state do nothing.
    ///
    /// # Errors
    ///
    /// Returns any error of the underlying table operation.
    pub fn apply(&self, table: &SearchTable, tx: &mut TransactionContext) -> CoreResult<()> {
        match self {
            Self::Insert(text) => table.insert(tx, text).map(|_| ()),
            Self::Delete(word) => table.delete_matching(tx, word).map(|_| ()),
            Self::Vacuum => table.vacuum(tx),
            Self::Truncate => table.truncate(tx),
            Self::CreateIndex if !table.has_index(&*tx)? => table.create_index(tx),
            Self::DropIndex if table.has_index(&*tx)? => table.drop_index(tx),
            Self::CreateIndex | Self::DropIndex => Ok(()),
        }
    }
}

/// A transaction's worth of operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Operations in order.
    pub ops: Vec<TableOp>,
    /// Whether the transaction commits or aborts.
    pub commit: bool,
}

/// Strategy for a single vocabulary word.
pub fn word_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(VOCABULARY).prop_map(str::to_owned)
}

/// Strategy for row text: one to five words with mixed case and
/// punctuation.
pub fn sentence_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec((word_strategy(), any::<bool>()), 1..6).prop_map(|words| {
        let mut text = words
            .into_iter()
            .map(|(word, shout)| if shout { word.to_uppercase() } else { word })
            .collect::<Vec<_>>()
            .join(" ");
        text.push('!');
        text
    })
}

/// Strategy for one operation, weighted toward inserts.
pub fn op_strategy() -> impl Strategy<Value = TableOp> {
    prop_oneof![
        6 => sentence_strategy().prop_map(TableOp::Insert),
        2 => word_strategy().prop_map(TableOp::Delete),
        1 => Just(TableOp::Vacuum),
        1 => Just(TableOp::Truncate),
        2 => Just(TableOp::CreateIndex),
        1 => Just(TableOp::DropIndex),
    ]
}

/// Strategy for one transaction. Four out of five commit.
pub fn step_strategy() -> impl Strategy<Value = Step> {
    (prop::collection::vec(op_strategy(), 1..5), 0u8..5).prop_map(|(ops, roll)| Step {
        ops,
        commit: roll != 0,
    })
}

/// Strategy for a whole workload.
pub fn workload_strategy() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(step_strategy(), 1..12)
}
