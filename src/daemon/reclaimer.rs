//! Reclamation of abandoned work
//!
//! A fetcher that crashes or hangs never completes its claim. The reclaimer
//! finds such tasks in `working` and puts them back into `todo`.

use crate::daemon::schedule::RecurringTask;
use crate::storage::{Frontier, StorageResult};
use chrono::{DateTime, Duration, Utc};

/// Moves stale `working` tasks back to `todo`
pub struct QueueReclaimer {
    frontier: Frontier,
    timeout: Duration,
}

impl QueueReclaimer {
    /// Creates a reclaimer for `frontier`
    ///
    /// # Arguments
    ///
    /// * `frontier` - The queues to maintain
    /// * `timeout` - How long an unleased task may sit in `working`
    pub fn new(frontier: Frontier, timeout: Duration) -> Self {
        Self { frontier, timeout }
    }

    /// Scans `working` once as of `now`, returning the number of tasks reclaimed
    ///
    /// A task placed in `working` without a try time or lease is stamped with
    /// `now` and left alone; it is reclaimed once it has aged past the timeout.
    pub fn run_once(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let section = self.frontier.exclusive();
        let working = self.frontier.working();
        let todo = self.frontier.todo();

        let mut stale = Vec::new();
        for mut task in working.snapshot_in(&section)? {
            if task.is_untimed() {
                task.last_tried_at = Some(now);
                working.put_in(&section, &task)?;
                tracing::debug!(docid = task.docid, "Stamped untimed working task");
            } else if task.is_stale(now, self.timeout) {
                stale.push(task.docid);
            }
        }

        let mut reclaimed = 0;
        for docid in stale {
            // Completed since the scan: nothing to do
            let Some(task) = working.get_in(&section, docid)? else {
                continue;
            };

            todo.put_in(&section, &task.clone().reset_try_time())?;
            working.remove_in(&section, docid)?;
            reclaimed += 1;

            tracing::info!(
                docid,
                url = %task.url,
                attempts = task.attempts,
                "Reclaimed stale task"
            );
        }

        if reclaimed > 0 {
            tracing::info!(reclaimed, "Reclaimer pass finished");
        } else {
            tracing::debug!("Reclaimer pass found nothing stale");
        }
        Ok(reclaimed)
    }
}

impl RecurringTask for QueueReclaimer {
    fn name(&self) -> &'static str {
        "reclaimer"
    }

    fn run(&self) -> crate::Result<()> {
        self.run_once(Utc::now())?;
        Ok(())
    }
}
