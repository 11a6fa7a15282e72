//! Storage traits and error types
//!
//! This module defines the contracts the frontier queues and the docid
//! allocator fulfil, and the errors they report.

use crate::state::UrlTask;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Queue '{0}' is closed")]
    QueueClosed(String),

    #[error("Queue '{queue}' still has {open} open iterator(s)")]
    QueueBusy { queue: String, open: usize },

    #[error("Lock poisoned: {0}")]
    Poisoned(String),

    #[error("Lease of {lease_ms}ms is out of range")]
    LeaseOutOfRange { lease_ms: i64 },

    #[error("Docid counter for site '{0}' is missing")]
    MissingCounter(String),

    #[error("Corrupt record in '{queue}': {message}")]
    Corrupt { queue: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Boxed iterator over a queue's contents
pub type TaskIter<'a> = Box<dyn Iterator<Item = StorageResult<UrlTask>> + 'a>;

/// A durable, ordered docid -> task mapping
///
/// Implementations are shared between the manager, its daemons, and external
/// workers, so every method takes `&self` and must be safe to call
/// concurrently. A `put` that has returned is visible to every iterator created
/// afterwards.
pub trait TaskQueue: Send + Sync {
    /// Name of the queue (`todo`, `working`, `failed`)
    fn name(&self) -> &str;

    /// Durably inserts or updates a task, keyed by its docid
    ///
    /// Updating an existing key keeps its position in arrival order.
    fn put(&self, task: &UrlTask) -> StorageResult<()>;

    /// Number of tasks currently stored
    fn len(&self) -> StorageResult<u64>;

    /// Returns true if the queue holds no tasks
    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Looks up a task by docid
    fn get(&self, docid: u64) -> StorageResult<Option<UrlTask>>;

    /// Removes a task by docid, returning it if it was present
    fn remove(&self, docid: u64) -> StorageResult<Option<UrlTask>>;

    /// Lazy, one-pass iteration over the tasks present when it was created
    ///
    /// The iterator is released when dropped; `close` refuses to run while any
    /// iterator is alive.
    fn iter(&self) -> StorageResult<TaskIter<'_>>;

    /// Flushes and releases the queue
    ///
    /// Returns `true` if this call closed the queue and `false` if it was
    /// already closed.
    fn close(&self) -> StorageResult<bool>;

    /// Returns true once the queue has been closed
    fn is_closed(&self) -> bool;
}

/// Source of per-site document ids
pub trait DocidAllocator: Send + Sync {
    /// Issues the next id
    ///
    /// Ids are strictly increasing and never issued twice, including across
    /// restarts. `hint` is the URL the id is for and is only logged.
    fn next(&self, hint: Option<&str>) -> StorageResult<u64>;

    /// The last id issued, 0 if none
    fn current(&self) -> StorageResult<u64>;

    /// Raises the counter so no id up to `value` is ever issued again
    fn restore_at_least(&self, value: u64) -> StorageResult<()>;
}
