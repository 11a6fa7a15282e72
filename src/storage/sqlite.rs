//! SQLite queue implementation
//!
//! This module provides the SQLite-backed implementation of the TaskQueue trait.

use crate::state::UrlTask;
use crate::storage::gate::{ExclusiveSection, QueueGate};
use crate::storage::schema::{initialize_queue_schema, STORE_PRAGMAS};
use crate::storage::traits::{StorageError, StorageResult, TaskIter, TaskQueue};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Rows fetched per iterator page
const ITER_PAGE_SIZE: usize = 256;

const TASK_COLUMNS: &str =
    "seq, docid, url, depth, site_id, attempts, last_tried_at, lease_deadline, discovered_at";

/// SQLite-backed durable queue
pub struct SqliteQueue {
    name: String,
    path: Option<PathBuf>,
    conn: Mutex<Option<Connection>>,
    gate: QueueGate,
    open_iterators: AtomicUsize,
    closed: AtomicBool,
}

impl SqliteQueue {
    /// Opens (or creates) the queue `<dir>/<name>.sqlite`
    ///
    /// # Arguments
    ///
    /// * `dir` - The site work directory
    /// * `name` - Queue name, also the file stem
    /// * `gate` - The gate shared by all queues of the site
    pub fn open(dir: &Path, name: &str, gate: QueueGate) -> StorageResult<Self> {
        let path = dir.join(format!("{}.sqlite", name));
        let conn = Connection::open(&path)?;
        conn.execute_batch(STORE_PRAGMAS)?;
        initialize_queue_schema(&conn)?;

        tracing::debug!(queue = name, path = %path.display(), "Opened queue");
        Ok(Self::from_connection(name, Some(path), conn, gate))
    }

    /// Creates an in-memory queue (for testing)
    #[cfg(test)]
    pub fn open_in_memory(name: &str, gate: QueueGate) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_queue_schema(&conn)?;
        Ok(Self::from_connection(name, None, conn, gate))
    }

    fn from_connection(name: &str, path: Option<PathBuf>, conn: Connection, gate: QueueGate) -> Self {
        Self {
            name: name.to_string(),
            path,
            conn: Mutex::new(Some(conn)),
            gate,
            open_iterators: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Database file backing this queue, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The gate this queue participates in
    pub fn gate(&self) -> &QueueGate {
        &self.gate
    }

    /// Returns true if a task with this docid is present
    pub fn contains(&self, docid: u64) -> StorageResult<bool> {
        let _shared = self.gate.shared();
        self.contains_unguarded(docid)
    }

    /// Removes and returns the oldest task
    pub fn pop_front(&self) -> StorageResult<Option<UrlTask>> {
        let _shared = self.gate.shared();
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let front = select_front(&tx, &self.name)?;
            if let Some(task) = &front {
                tx.execute("DELETE FROM tasks WHERE docid = ?1", params![task.docid as i64])?;
            }
            tx.commit()?;
            Ok(front)
        })
    }

    /// All tasks in arrival order
    pub fn snapshot(&self) -> StorageResult<Vec<UrlTask>> {
        let _shared = self.gate.shared();
        self.snapshot_unguarded()
    }

    /// Lazy iteration over the tasks present right now
    ///
    /// The returned iterator borrows the queue, so it cannot outlive it, and it
    /// is released when dropped.
    pub fn iter(&self) -> StorageResult<QueueIter<'_>> {
        let _shared = self.gate.shared();
        // Register under the connection lock so `close` cannot slip in between.
        self.with_conn(|conn| {
            let high_water: i64 =
                conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM tasks", [], |row| row.get(0))?;
            self.open_iterators.fetch_add(1, Ordering::SeqCst);
            Ok(QueueIter {
                queue: self,
                high_water,
                cursor: 0,
                buffer: VecDeque::new(),
                exhausted: high_water == 0,
            })
        })
    }

    /// Number of iterators currently alive
    pub fn open_iterators(&self) -> usize {
        self.open_iterators.load(Ordering::SeqCst)
    }

    // ===== Operations inside an exclusive section =====

    pub fn put_in(&self, section: &ExclusiveSection<'_>, task: &UrlTask) -> StorageResult<()> {
        debug_assert!(section.belongs_to(&self.gate));
        self.put_unguarded(task)
    }

    pub fn get_in(&self, section: &ExclusiveSection<'_>, docid: u64) -> StorageResult<Option<UrlTask>> {
        debug_assert!(section.belongs_to(&self.gate));
        self.get_unguarded(docid)
    }

    pub fn contains_in(&self, section: &ExclusiveSection<'_>, docid: u64) -> StorageResult<bool> {
        debug_assert!(section.belongs_to(&self.gate));
        self.contains_unguarded(docid)
    }

    pub fn remove_in(&self, section: &ExclusiveSection<'_>, docid: u64) -> StorageResult<Option<UrlTask>> {
        debug_assert!(section.belongs_to(&self.gate));
        self.remove_unguarded(docid)
    }

    pub fn front_in(&self, section: &ExclusiveSection<'_>) -> StorageResult<Option<UrlTask>> {
        debug_assert!(section.belongs_to(&self.gate));
        self.with_conn(|conn| select_front(conn, &self.name))
    }

    pub fn snapshot_in(&self, section: &ExclusiveSection<'_>) -> StorageResult<Vec<UrlTask>> {
        debug_assert!(section.belongs_to(&self.gate));
        self.snapshot_unguarded()
    }

    pub fn len_in(&self, section: &ExclusiveSection<'_>) -> StorageResult<u64> {
        debug_assert!(section.belongs_to(&self.gate));
        self.len_unguarded()
    }

    // ===== Unguarded primitives =====

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StorageResult<T>) -> StorageResult<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Poisoned(format!("queue '{}'", self.name)))?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| StorageError::QueueClosed(self.name.clone()))?;
        f(conn)
    }

    fn put_unguarded(&self, task: &UrlTask) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks
                 (docid, url, depth, site_id, attempts, last_tried_at, lease_deadline, discovered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(docid) DO UPDATE SET
                    url = excluded.url,
                    depth = excluded.depth,
                    site_id = excluded.site_id,
                    attempts = excluded.attempts,
                    last_tried_at = excluded.last_tried_at,
                    lease_deadline = excluded.lease_deadline,
                    discovered_at = excluded.discovered_at",
                params![
                    task.docid as i64,
                    task.url,
                    task.depth,
                    task.site_id,
                    task.attempts,
                    task.last_tried_at.map(|t| t.to_rfc3339()),
                    task.lease_deadline.map(|t| t.to_rfc3339()),
                    task.discovered_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    fn get_unguarded(&self, docid: u64) -> StorageResult<Option<UrlTask>> {
        self.with_conn(|conn| {
            let task = conn
                .query_row(
                    &format!("SELECT {} FROM tasks WHERE docid = ?1", TASK_COLUMNS),
                    params![docid as i64],
                    row_to_task,
                )
                .optional()?;
            Ok(task.map(|(_, task)| task))
        })
    }

    fn contains_unguarded(&self, docid: u64) -> StorageResult<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT seq FROM tasks WHERE docid = ?1",
                    params![docid as i64],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    fn remove_unguarded(&self, docid: u64) -> StorageResult<Option<UrlTask>> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let task = tx
                .query_row(
                    &format!("SELECT {} FROM tasks WHERE docid = ?1", TASK_COLUMNS),
                    params![docid as i64],
                    row_to_task,
                )
                .optional()?;
            if task.is_some() {
                tx.execute("DELETE FROM tasks WHERE docid = ?1", params![docid as i64])?;
            }
            tx.commit()?;
            Ok(task.map(|(_, task)| task))
        })
    }

    fn len_unguarded(&self) -> StorageResult<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    fn snapshot_unguarded(&self) -> StorageResult<Vec<UrlTask>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {} FROM tasks ORDER BY seq ASC", TASK_COLUMNS))?;
            let tasks = stmt
                .query_map([], row_to_task)?
                .map(|row| row.map(|(_, task)| task))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    /// Fetches the next page of an iterator: rows with `cursor < seq <= high_water`
    fn fetch_page(&self, cursor: i64, high_water: i64) -> StorageResult<Vec<(i64, UrlTask)>> {
        let _shared = self.gate.shared();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM tasks WHERE seq > ?1 AND seq <= ?2 ORDER BY seq ASC LIMIT ?3",
                TASK_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![cursor, high_water, ITER_PAGE_SIZE as i64], row_to_task)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

impl TaskQueue for SqliteQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, task: &UrlTask) -> StorageResult<()> {
        let _shared = self.gate.shared();
        self.put_unguarded(task)
    }

    fn len(&self) -> StorageResult<u64> {
        let _shared = self.gate.shared();
        self.len_unguarded()
    }

    fn get(&self, docid: u64) -> StorageResult<Option<UrlTask>> {
        let _shared = self.gate.shared();
        self.get_unguarded(docid)
    }

    fn remove(&self, docid: u64) -> StorageResult<Option<UrlTask>> {
        let _shared = self.gate.shared();
        self.remove_unguarded(docid)
    }

    fn iter(&self) -> StorageResult<TaskIter<'_>> {
        Ok(Box::new(SqliteQueue::iter(self)?))
    }

    fn close(&self) -> StorageResult<bool> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Poisoned(format!("queue '{}'", self.name)))?;

        if guard.is_none() {
            return Ok(false);
        }

        let open = self.open_iterators.load(Ordering::SeqCst);
        if open > 0 {
            return Err(StorageError::QueueBusy {
                queue: self.name.clone(),
                open,
            });
        }

        // Fold the WAL back into the main file before letting go.
        if let (Some(conn), Some(_)) = (guard.as_ref(), self.path.as_ref()) {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        }
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| StorageError::Sqlite(e))?;
        }

        self.closed.store(true, Ordering::SeqCst);
        tracing::debug!(queue = %self.name, "Closed queue");
        Ok(true)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Snapshot-bounded iterator over a [`SqliteQueue`]
///
/// Pages through rows in arrival order up to the highest position that existed
/// when the iterator was created. Tasks put afterwards are not yielded, and no
/// task is yielded twice.
pub struct QueueIter<'a> {
    queue: &'a SqliteQueue,
    high_water: i64,
    cursor: i64,
    buffer: VecDeque<UrlTask>,
    exhausted: bool,
}

impl Iterator for QueueIter<'_> {
    type Item = StorageResult<UrlTask>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.queue.fetch_page(self.cursor, self.high_water) {
                Ok(rows) => {
                    if rows.len() < ITER_PAGE_SIZE {
                        self.exhausted = true;
                    }
                    if let Some((seq, _)) = rows.last() {
                        self.cursor = *seq;
                    }
                    self.buffer.extend(rows.into_iter().map(|(_, task)| task));
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }

        self.buffer.pop_front().map(Ok)
    }
}

impl Drop for QueueIter<'_> {
    fn drop(&mut self) {
        self.queue.open_iterators.fetch_sub(1, Ordering::SeqCst);
    }
}

fn select_front(conn: &Connection, queue: &str) -> StorageResult<Option<UrlTask>> {
    let front = conn
        .query_row(
            &format!("SELECT {} FROM tasks ORDER BY seq ASC LIMIT 1", TASK_COLUMNS),
            [],
            row_to_task,
        )
        .optional()
        .map_err(|e| corrupt_or_sqlite(queue, e))?;
    Ok(front.map(|(_, task)| task))
}

fn corrupt_or_sqlite(queue: &str, e: rusqlite::Error) -> StorageError {
    match e {
        rusqlite::Error::FromSqlConversionFailure(_, _, inner) => StorageError::Corrupt {
            queue: queue.to_string(),
            message: inner.to_string(),
        },
        other => StorageError::Sqlite(other),
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<(i64, UrlTask)> {
    let seq: i64 = row.get(0)?;
    let docid: i64 = row.get(1)?;
    let task = UrlTask {
        docid: docid as u64,
        url: row.get(2)?,
        depth: row.get(3)?,
        site_id: row.get(4)?,
        attempts: row.get(5)?,
        last_tried_at: parse_optional_timestamp(row, 6)?,
        lease_deadline: parse_optional_timestamp(row, 7)?,
        discovered_at: parse_timestamp(8, &row.get::<_, String>(8)?)?,
    };
    Ok((seq, task))
}

fn parse_optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| parse_timestamp(idx, &s))
        .transpose()
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;
    use std::thread;

    fn queue(name: &str) -> SqliteQueue {
        SqliteQueue::open_in_memory(name, QueueGate::new()).unwrap()
    }

    fn task(docid: u64) -> UrlTask {
        UrlTask::new(format!("https://example.com/{}", docid), 2, "example", docid)
    }

    fn docids(tasks: impl IntoIterator<Item = StorageResult<UrlTask>>) -> Vec<u64> {
        tasks.into_iter().map(|t| t.unwrap().docid).collect()
    }

    #[test]
    fn test_put_and_len() {
        let q = queue("todo");
        assert!(q.is_empty().unwrap());

        q.put(&task(1)).unwrap();
        q.put(&task(2)).unwrap();
        assert_eq!(q.len().unwrap(), 2);
    }

    #[test]
    fn test_put_same_key_updates_in_place() {
        let q = queue("todo");
        q.put(&task(1)).unwrap();
        q.put(&task(2)).unwrap();

        let mut updated = task(1);
        updated.attempts = 4;
        q.put(&updated).unwrap();

        assert_eq!(q.len().unwrap(), 2);
        let snapshot = q.snapshot().unwrap();
        assert_eq!(snapshot[0].docid, 1, "update keeps arrival position");
        assert_eq!(snapshot[0].attempts, 4);
    }

    #[test]
    fn test_roundtrip_preserves_timestamps() {
        let q = queue("working");
        let mut t = task(9);
        let now = Utc::now();
        t.mark_claimed(now, now + Duration::seconds(30));
        q.put(&t).unwrap();

        let loaded = q.get(9).unwrap().unwrap();
        assert_eq!(loaded, t);
    }

    #[test]
    fn test_remove_returns_task_once() {
        let q = queue("working");
        q.put(&task(5)).unwrap();

        assert_eq!(q.remove(5).unwrap().map(|t| t.docid), Some(5));
        assert!(q.remove(5).unwrap().is_none());
        assert!(!q.contains(5).unwrap());
    }

    #[test]
    fn test_pop_front_is_fifo() {
        let q = queue("todo");
        for id in [3, 1, 2] {
            q.put(&task(id)).unwrap();
        }

        assert_eq!(q.pop_front().unwrap().unwrap().docid, 3);
        assert_eq!(q.pop_front().unwrap().unwrap().docid, 1);
        assert_eq!(q.pop_front().unwrap().unwrap().docid, 2);
        assert!(q.pop_front().unwrap().is_none());
    }

    #[test]
    fn test_iter_spans_multiple_pages() {
        let q = queue("todo");
        let total = ITER_PAGE_SIZE as u64 * 2 + 17;
        for id in 1..=total {
            q.put(&task(id)).unwrap();
        }

        let ids = docids(q.iter().unwrap());
        assert_eq!(ids, (1..=total).collect::<Vec<_>>());
    }

    #[test]
    fn test_iter_ignores_later_puts() {
        let q = queue("todo");
        q.put(&task(1)).unwrap();
        q.put(&task(2)).unwrap();

        let mut iter = q.iter().unwrap();
        assert_eq!(iter.next().unwrap().unwrap().docid, 1);

        q.put(&task(3)).unwrap();
        // Re-putting an already yielded key must not yield it again
        q.put(&task(1)).unwrap();

        let rest: Vec<u64> = iter.map(|t| t.unwrap().docid).collect();
        assert_eq!(rest, vec![2]);
    }

    #[test]
    fn test_iter_on_empty_queue() {
        let q = queue("failed");
        assert_eq!(q.iter().unwrap().count(), 0);
    }

    #[test]
    fn test_close_refuses_with_open_iterator() {
        let q = queue("todo");
        q.put(&task(1)).unwrap();

        let iter = q.iter().unwrap();
        assert_eq!(q.open_iterators(), 1);
        assert!(matches!(q.close(), Err(StorageError::QueueBusy { open: 1, .. })));

        drop(iter);
        assert_eq!(q.open_iterators(), 0);
        assert!(q.close().unwrap());
    }

    #[test]
    fn test_close_is_idempotent() {
        let q = queue("todo");
        assert!(q.close().unwrap());
        assert!(!q.close().unwrap());
        assert!(q.is_closed());
        assert!(matches!(q.put(&task(1)), Err(StorageError::QueueClosed(_))));
    }

    #[test]
    fn test_durable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let q = SqliteQueue::open(dir.path(), "todo", QueueGate::new()).unwrap();
            q.put(&task(1)).unwrap();
            q.put(&task(2)).unwrap();
            q.close().unwrap();
        }

        let q = SqliteQueue::open(dir.path(), "todo", QueueGate::new()).unwrap();
        assert_eq!(docids(q.iter().unwrap()), vec![1, 2]);
        assert_eq!(q.path(), Some(dir.path().join("todo.sqlite").as_path()));
    }

    #[test]
    fn test_concurrent_puts() {
        let q = Arc::new(queue("todo"));
        let handles: Vec<_> = (0..4u64)
            .map(|worker| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..50u64 {
                        q.put(&task(worker * 1000 + i)).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(q.len().unwrap(), 200);
    }
}
