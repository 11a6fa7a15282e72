//! Background maintenance of the frontier
//!
//! Two recurring tasks keep a running site healthy:
//! - The reclaimer returns abandoned `working` tasks to `todo`
//! - The backuper writes periodic snapshots and restores them at startup

mod backuper;
mod reclaimer;
mod schedule;

pub use backuper::{BackupError, Backuper, FrontierSnapshot, BACKUP_FILE, SNAPSHOT_VERSION};
pub use reclaimer::QueueReclaimer;
pub use schedule::{spawn_recurring, DaemonHandle, RecurringTask};
