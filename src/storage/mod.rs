//! Storage module for the durable frontier
//!
//! This module handles all on-disk state of a site, including:
//! - The `todo`, `working`, and `failed` task queues, one SQLite file each
//! - The per-site docid counter
//! - The gate that keeps cross-queue moves consistent

mod docid;
mod frontier;
mod gate;
mod schema;
mod sqlite;
mod traits;

pub use docid::SqliteDocidAllocator;
pub use frontier::{ClaimedTask, Frontier, FAILED, TODO, WORKING};
pub use gate::{ExclusiveSection, QueueGate, SharedSection};
pub use sqlite::{QueueIter, SqliteQueue};
pub use traits::{DocidAllocator, StorageError, StorageResult, TaskIter, TaskQueue};
