//! Host transactions as seen by the index.
//!
//! A transaction's structural changes are logged as they happen but become
//! observable only as a unit:
//! - **Atomicity**: all effects after `TxCommit`, none after `TxAbort` or a crash
//! - **Read-your-writes**: a transaction reads its own staged changes
//! - **File ownership**: one active transaction per index file

mod registry;
mod state;

pub(crate) use registry::TransactionRegistry;
pub use state::{TransactionContext, TransactionState};
