//! Recurring background tasks
//!
//! Each daemon runs on its own tokio task with its own interval, so a slow
//! backup never holds up reclamation. Missed ticks are delayed rather than
//! bursted.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// A unit of periodic maintenance work
pub trait RecurringTask: Send + Sync + 'static {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Runs one pass; errors are logged and the schedule continues
    fn run(&self) -> crate::Result<()>;
}

/// Handle to a scheduled recurring task
pub struct DaemonHandle {
    name: &'static str,
    stop: watch::Sender<()>,
    task: JoinHandle<()>,
}

impl DaemonHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns true once the task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the schedule and waits for an in-flight run to finish
    pub async fn stop(self) {
        // Err only means the loop already exited
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            tracing::error!(daemon = self.name, error = %e, "Daemon task ended abnormally");
        }
        tracing::debug!(daemon = self.name, "Daemon stopped");
    }
}

/// Schedules `task` to run first after `initial_delay`, then every `period`
///
/// # Arguments
///
/// * `task` - The work to run on each tick
/// * `initial_delay` - Time before the first run
/// * `period` - Time between the starts of consecutive runs
///
/// # Returns
///
/// A handle that stops the schedule when asked
pub fn spawn_recurring(task: Arc<dyn RecurringTask>, initial_delay: Duration, period: Duration) -> DaemonHandle {
    let (stop, mut stopped) = watch::channel(());
    let name = task.name();

    let handle = tokio::spawn(async move {
        let mut timer = interval_at(Instant::now() + initial_delay, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = task.run() {
                        tracing::warn!(daemon = name, error = %e, "Daemon run failed");
                    }
                }
                _ = stopped.changed() => break,
            }
        }
    });

    tracing::debug!(daemon = name, ?initial_delay, ?period, "Scheduled daemon");
    DaemonHandle {
        name,
        stop,
        task: handle,
    }
}
