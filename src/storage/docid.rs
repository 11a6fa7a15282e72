//! Durable, strictly increasing document ids
//!
//! One counter row per site in `<work_dir>/docid.sqlite`. Each `next()` is a
//! single committed `UPDATE ... RETURNING`, so an id is durable before it is
//! handed out.

use crate::storage::schema::{initialize_docid_schema, STORE_PRAGMAS};
use crate::storage::traits::{DocidAllocator, StorageError, StorageResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// SQLite-backed incrementing docid allocator
pub struct SqliteDocidAllocator {
    site_id: String,
    conn: Mutex<Option<Connection>>,
}

impl SqliteDocidAllocator {
    /// Opens the counter for `site_id` in `<dir>/docid.sqlite`, creating it at 0
    pub fn open(dir: &Path, site_id: &str) -> StorageResult<Self> {
        let conn = Connection::open(dir.join("docid.sqlite"))?;
        conn.execute_batch(STORE_PRAGMAS)?;
        Self::from_connection(conn, site_id)
    }

    /// Creates an in-memory allocator (for testing)
    #[cfg(test)]
    pub fn open_in_memory(site_id: &str) -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, site_id)
    }

    fn from_connection(conn: Connection, site_id: &str) -> StorageResult<Self> {
        initialize_docid_schema(&conn)?;
        conn.execute(
            "INSERT OR IGNORE INTO docid_counter (site_id, last_issued) VALUES (?1, 0)",
            params![site_id],
        )?;
        Ok(Self {
            site_id: site_id.to_string(),
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    /// Releases the underlying connection; returns false if already closed
    pub fn close(&self) -> StorageResult<bool> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Poisoned("docid allocator".to_string()))?;
        match guard.take() {
            Some(conn) => {
                conn.close().map_err(|(_, e)| StorageError::Sqlite(e))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StorageResult<T>) -> StorageResult<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Poisoned("docid allocator".to_string()))?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| StorageError::QueueClosed("docid".to_string()))?;
        f(conn)
    }
}

impl DocidAllocator for SqliteDocidAllocator {
    fn next(&self, hint: Option<&str>) -> StorageResult<u64> {
        let docid = self.with_conn(|conn| {
            let issued: Option<i64> = conn
                .query_row(
                    "UPDATE docid_counter SET last_issued = last_issued + 1
                     WHERE site_id = ?1 RETURNING last_issued",
                    params![self.site_id],
                    |row| row.get(0),
                )
                .optional()?;
            issued
                .map(|id| id as u64)
                .ok_or_else(|| StorageError::MissingCounter(self.site_id.clone()))
        })?;

        tracing::trace!(site = %self.site_id, docid, url = hint.unwrap_or("-"), "Issued docid");
        Ok(docid)
    }

    fn current(&self) -> StorageResult<u64> {
        self.with_conn(|conn| {
            let last: Option<i64> = conn
                .query_row(
                    "SELECT last_issued FROM docid_counter WHERE site_id = ?1",
                    params![self.site_id],
                    |row| row.get(0),
                )
                .optional()?;
            last.map(|id| id as u64)
                .ok_or_else(|| StorageError::MissingCounter(self.site_id.clone()))
        })
    }

    fn restore_at_least(&self, value: u64) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE docid_counter SET last_issued = MAX(last_issued, ?2) WHERE site_id = ?1",
                params![self.site_id, value as i64],
            )?;
            Ok(())
        })?;
        tracing::debug!(site = %self.site_id, at_least = value, "Restored docid counter");
        Ok(())
    }
}
