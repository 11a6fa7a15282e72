//! The three queues of a site and the moves between them
//!
//! Workers claim from `todo` into `working` with a lease, then either complete
//! (remove from `working`) or fail (move to `failed`). Every move writes the
//! destination before deleting the source, under the gate's exclusive side: a
//! crash in between leaves the task in two queues, never in none, and recovery
//! collapses it back into `todo`.

use crate::state::UrlTask;
use crate::storage::gate::{ExclusiveSection, QueueGate};
use crate::storage::sqlite::SqliteQueue;
use crate::storage::traits::{DocidAllocator, StorageError, StorageResult, TaskQueue};
use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use std::sync::Arc;

pub const TODO: &str = "todo";
pub const WORKING: &str = "working";
pub const FAILED: &str = "failed";

/// A task handed to a worker, valid until `lease_deadline`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    pub task: UrlTask,
    pub lease_deadline: DateTime<Utc>,
}

impl ClaimedTask {
    /// Claim token: the attempt number this claim was issued under
    pub fn attempt(&self) -> u32 {
        self.task.attempts
    }
}

/// Handle to the `todo`, `working`, and `failed` queues of one site
///
/// Cheap to clone; all clones share the same queues and gate.
#[derive(Clone)]
pub struct Frontier {
    todo: Arc<SqliteQueue>,
    working: Arc<SqliteQueue>,
    failed: Arc<SqliteQueue>,
    gate: QueueGate,
}

impl Frontier {
    /// Opens the three queues under `work_dir`, creating the directory if needed
    pub fn open(work_dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(work_dir)?;
        let gate = QueueGate::new();

        let todo = SqliteQueue::open(work_dir, TODO, gate.clone())?;
        let working = SqliteQueue::open(work_dir, WORKING, gate.clone())?;
        let failed = SqliteQueue::open(work_dir, FAILED, gate.clone())?;

        Ok(Self::from_queues(todo, working, failed, gate))
    }

    /// Creates a frontier of in-memory queues (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> StorageResult<Self> {
        let gate = QueueGate::new();
        let todo = SqliteQueue::open_in_memory(TODO, gate.clone())?;
        let working = SqliteQueue::open_in_memory(WORKING, gate.clone())?;
        let failed = SqliteQueue::open_in_memory(FAILED, gate.clone())?;
        Ok(Self::from_queues(todo, working, failed, gate))
    }

    fn from_queues(todo: SqliteQueue, working: SqliteQueue, failed: SqliteQueue, gate: QueueGate) -> Self {
        Self {
            todo: Arc::new(todo),
            working: Arc::new(working),
            failed: Arc::new(failed),
            gate,
        }
    }

    pub fn todo(&self) -> &Arc<SqliteQueue> {
        &self.todo
    }

    pub fn working(&self) -> &Arc<SqliteQueue> {
        &self.working
    }

    pub fn failed(&self) -> &Arc<SqliteQueue> {
        &self.failed
    }

    /// The three queues in `todo`, `working`, `failed` order
    pub fn queues(&self) -> [&Arc<SqliteQueue>; 3] {
        [&self.todo, &self.working, &self.failed]
    }

    /// Takes the exclusive side of the gate
    pub fn exclusive(&self) -> ExclusiveSection<'_> {
        self.gate.exclusive()
    }

    /// Queue lengths as `(todo, working, failed)`, read at a single instant
    pub fn lengths(&self) -> StorageResult<(u64, u64, u64)> {
        let section = self.exclusive();
        Ok((
            self.todo.len_in(&section)?,
            self.working.len_in(&section)?,
            self.failed.len_in(&section)?,
        ))
    }

    /// Returns true if any of the three queues holds a task
    pub fn has_tasks(&self) -> StorageResult<bool> {
        let (todo, working, failed) = self.lengths()?;
        Ok(todo + working + failed > 0)
    }

    /// Returns true if `docid` is present in any queue
    pub fn contains_in(&self, section: &ExclusiveSection<'_>, docid: u64) -> StorageResult<bool> {
        for queue in self.queues() {
            if queue.contains_in(section, docid)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Claims the oldest `todo` task for `lease`
    pub fn claim(&self, lease: Duration) -> StorageResult<Option<ClaimedTask>> {
        self.claim_at(Utc::now(), lease)
    }

    /// Claims the oldest `todo` task as of `now`
    ///
    /// Fails with `LeaseOutOfRange`, leaving the queues untouched, when
    /// `now + lease` is not a representable time.
    pub fn claim_at(&self, now: DateTime<Utc>, lease: Duration) -> StorageResult<Option<ClaimedTask>> {
        let lease_deadline = now
            .checked_add_signed(lease)
            .ok_or(StorageError::LeaseOutOfRange {
                lease_ms: lease.num_milliseconds(),
            })?;
        let section = self.exclusive();

        let Some(mut task) = self.todo.front_in(&section)? else {
            return Ok(None);
        };

        task.mark_claimed(now, lease_deadline);
        self.working.put_in(&section, &task)?;
        self.todo.remove_in(&section, task.docid)?;

        tracing::debug!(docid = task.docid, attempt = task.attempts, %lease_deadline, "Claimed task");
        Ok(Some(ClaimedTask {
            task,
            lease_deadline,
        }))
    }

    /// Completes a claimed task, removing it from `working`
    ///
    /// Returns false if the claim is no longer current: the task was reclaimed
    /// (and possibly claimed again by someone else) or already completed.
    pub fn complete(&self, docid: u64, attempt: u32) -> StorageResult<bool> {
        let section = self.exclusive();

        if !self.holds_claim(&section, docid, attempt)? {
            tracing::debug!(docid, attempt, "Completion for a stale claim ignored");
            return Ok(false);
        }

        self.working.remove_in(&section, docid)?;
        tracing::debug!(docid, "Completed task");
        Ok(true)
    }

    /// Moves a claimed task from `working` to `failed`
    ///
    /// Returns false if the claim is no longer current.
    pub fn fail(&self, docid: u64, attempt: u32) -> StorageResult<bool> {
        let section = self.exclusive();

        let Some(task) = self.working.get_in(&section, docid)? else {
            return Ok(false);
        };
        if task.attempts != attempt {
            return Ok(false);
        }

        self.failed.put_in(&section, &task)?;
        self.working.remove_in(&section, docid)?;
        tracing::info!(docid, url = %task.url, attempts = task.attempts, "Task failed permanently");
        Ok(true)
    }

    /// Appends a newly discovered URL to `todo` with a freshly allocated docid
    pub fn submit(
        &self,
        docids: &dyn DocidAllocator,
        site_id: &str,
        url: &str,
        depth: u16,
    ) -> StorageResult<UrlTask> {
        let docid = docids.next(Some(url))?;
        let task = UrlTask::new(url, depth, site_id, docid);
        self.todo.put(&task)?;
        tracing::debug!(docid, url, depth, "Submitted task");
        Ok(task)
    }

    /// Moves every task in `working` and `failed` back to `todo` with its try time reset
    ///
    /// Used by recovery at startup. Returns the number of tasks moved.
    pub fn reschedule_all(&self) -> StorageResult<usize> {
        let section = self.exclusive();
        let mut moved = 0;

        for source in [&self.working, &self.failed] {
            for task in source.snapshot_in(&section)? {
                let docid = task.docid;
                self.todo.put_in(&section, &task.reset_try_time())?;
                source.remove_in(&section, docid)?;
                moved += 1;
            }
        }

        Ok(moved)
    }

    /// Closes the three queues, returning how many this call closed
    ///
    /// Every queue is attempted even if an earlier one fails; the first error
    /// is returned.
    pub fn close(&self) -> StorageResult<usize> {
        let mut closed = 0;
        let mut first_error = None;

        for queue in self.queues() {
            match queue.close() {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(queue = queue.name(), error = %e, "Failed to close queue");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(closed),
        }
    }

    fn holds_claim(&self, section: &ExclusiveSection<'_>, docid: u64, attempt: u32) -> StorageResult<bool> {
        Ok(self
            .working
            .get_in(section, docid)?
            .is_some_and(|task| task.attempts == attempt))
    }
}
