//! Point-in-time backups of the frontier
//!
//! A backup captures the three queues and the docid counter under the gate's
//! exclusive side, so the snapshot is consistent across queues. It is written
//! to `<work_dir>/backup.json` through a temp file and a rename, with a SHA-256
//! checksum of the snapshot payload.

use crate::daemon::schedule::RecurringTask;
use crate::state::UrlTask;
use crate::storage::{DocidAllocator, Frontier, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// File name of the backup inside the work directory
pub const BACKUP_FILE: &str = "backup.json";

/// Snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Errors raised while writing or restoring a backup
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed backup: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Backup checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Backup belongs to site '{found}', expected '{expected}'")]
    SiteMismatch { expected: String, found: String },

    #[error("Unsupported backup version {0}")]
    UnsupportedVersion(u32),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Contents of all queues and the docid counter at one instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontierSnapshot {
    pub version: u32,
    pub site_id: String,
    pub taken_at: DateTime<Utc>,
    pub last_docid: u64,
    pub todo: Vec<UrlTask>,
    pub working: Vec<UrlTask>,
    pub failed: Vec<UrlTask>,
}

impl FrontierSnapshot {
    /// Total number of tasks across the three queues
    pub fn task_count(&self) -> usize {
        self.todo.len() + self.working.len() + self.failed.len()
    }

    /// Every task with the queue it was captured from
    pub fn tasks(&self) -> impl Iterator<Item = (&'static str, &UrlTask)> {
        self.todo
            .iter()
            .map(|t| (crate::storage::TODO, t))
            .chain(self.working.iter().map(|t| (crate::storage::WORKING, t)))
            .chain(self.failed.iter().map(|t| (crate::storage::FAILED, t)))
    }

    /// Highest docid held by any task, 0 if none
    pub fn max_task_docid(&self) -> u64 {
        self.tasks().map(|(_, t)| t.docid).max().unwrap_or(0)
    }
}

/// On-disk form: the snapshot plus its checksum
#[derive(Serialize, Deserialize)]
struct BackupEnvelope {
    checksum: String,
    snapshot: FrontierSnapshot,
}

/// Writes and restores frontier backups
pub struct Backuper {
    frontier: Frontier,
    docids: Arc<dyn DocidAllocator>,
    site_id: String,
    path: PathBuf,
}

impl Backuper {
    /// Creates a backuper writing to `<work_dir>/backup.json`
    pub fn new(frontier: Frontier, docids: Arc<dyn DocidAllocator>, site_id: &str, work_dir: &Path) -> Self {
        Self {
            frontier,
            docids,
            site_id: site_id.to_string(),
            path: work_dir.join(BACKUP_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Captures a consistent snapshot of the queues and the counter
    pub fn snapshot(&self) -> Result<FrontierSnapshot, BackupError> {
        let section = self.frontier.exclusive();

        Ok(FrontierSnapshot {
            version: SNAPSHOT_VERSION,
            site_id: self.site_id.clone(),
            taken_at: Utc::now(),
            todo: self.frontier.todo().snapshot_in(&section)?,
            working: self.frontier.working().snapshot_in(&section)?,
            failed: self.frontier.failed().snapshot_in(&section)?,
            // Ids are issued before their task is put, so reading the counter
            // last still covers every captured task.
            last_docid: self.docids.current()?,
        })
    }

    /// Takes a snapshot and writes it durably, returning the number of tasks saved
    pub fn backup(&self) -> Result<usize, BackupError> {
        let snapshot = self.snapshot()?;
        let checksum = checksum(&snapshot)?;
        let bytes = serde_json::to_vec_pretty(&BackupEnvelope {
            checksum,
            snapshot: snapshot.clone(),
        })?;

        write_atomic(&self.path, &bytes)?;

        tracing::info!(
            site = %self.site_id,
            todo = snapshot.todo.len(),
            working = snapshot.working.len(),
            failed = snapshot.failed.len(),
            last_docid = snapshot.last_docid,
            "Backup written"
        );
        Ok(snapshot.task_count())
    }

    /// Reads and verifies the backup file, `None` if there is none
    pub fn load(&self) -> Result<Option<FrontierSnapshot>, BackupError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(BackupError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let envelope: BackupEnvelope = serde_json::from_slice(&bytes)?;
        let snapshot = envelope.snapshot;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(BackupError::UnsupportedVersion(snapshot.version));
        }

        let actual = checksum(&snapshot)?;
        if actual != envelope.checksum {
            return Err(BackupError::ChecksumMismatch {
                expected: envelope.checksum,
                actual,
            });
        }

        if snapshot.site_id != self.site_id {
            return Err(BackupError::SiteMismatch {
                expected: self.site_id.clone(),
                found: snapshot.site_id,
            });
        }

        Ok(Some(snapshot))
    }

    /// Restores the last backup into the live queues
    ///
    /// Returns `false` if there was no backup. Tasks whose docid already lives
    /// in some queue are left as they are; the rest are put back into the queue
    /// they were captured from. The docid counter is raised past every id in
    /// the snapshot.
    pub fn restore(&self) -> Result<bool, BackupError> {
        let Some(snapshot) = self.load()? else {
            tracing::info!(path = %self.path.display(), "No backup to restore");
            return Ok(false);
        };

        self.docids
            .restore_at_least(snapshot.last_docid.max(snapshot.max_task_docid()))?;

        let section = self.frontier.exclusive();
        let mut restored = 0;
        let mut kept_live = 0;

        for (queue, task) in snapshot.tasks() {
            if self.frontier.contains_in(&section, task.docid)? {
                kept_live += 1;
                continue;
            }

            let target = match queue {
                crate::storage::WORKING => self.frontier.working(),
                crate::storage::FAILED => self.frontier.failed(),
                _ => self.frontier.todo(),
            };
            target.put_in(&section, task)?;
            restored += 1;
        }

        tracing::info!(
            site = %self.site_id,
            taken_at = %snapshot.taken_at,
            restored,
            kept_live,
            last_docid = snapshot.last_docid,
            "Backup restored"
        );
        Ok(true)
    }
}

impl RecurringTask for Backuper {
    fn name(&self) -> &'static str {
        "backuper"
    }

    fn run(&self) -> crate::Result<()> {
        self.backup()?;
        Ok(())
    }
}

/// SHA-256 of the snapshot's JSON form, hex encoded
fn checksum(snapshot: &FrontierSnapshot) -> Result<String, BackupError> {
    let payload = serde_json::to_vec(snapshot)?;
    Ok(hex::encode(Sha256::digest(&payload)))
}

/// Writes `bytes` to `path` so that a reader sees either the old or the new file
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BackupError> {
    let io_err = |source| BackupError::Io {
        path: path.to_path_buf(),
        source,
    };

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)?;

    // Persist the rename itself where the platform allows syncing a directory
    if let Some(dir) = path.parent() {
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SqliteDocidAllocator, TaskQueue};
    use std::collections::BTreeSet;

    struct Fixture {
        dir: tempfile::TempDir,
        frontier: Frontier,
        docids: Arc<SqliteDocidAllocator>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                frontier: Frontier::open_in_memory().unwrap(),
                docids: Arc::new(SqliteDocidAllocator::open_in_memory("example").unwrap()),
            }
        }

        fn backuper(&self) -> Backuper {
            Backuper::new(self.frontier.clone(), self.docids.clone(), "example", self.dir.path())
        }

        /// Same work dir, fresh queues and counter: a restart that lost its databases
        fn restarted(&self) -> (Frontier, Arc<SqliteDocidAllocator>, Backuper) {
            let frontier = Frontier::open_in_memory().unwrap();
            let docids = Arc::new(SqliteDocidAllocator::open_in_memory("example").unwrap());
            let backuper = Backuper::new(frontier.clone(), docids.clone(), "example", self.dir.path());
            (frontier, docids, backuper)
        }
    }

    fn all_docids(frontier: &Frontier) -> Vec<u64> {
        let mut ids = Vec::new();
        for queue in frontier.queues() {
            ids.extend(queue.snapshot().unwrap().into_iter().map(|t| t.docid));
        }
        ids.sort_unstable();
        ids
    }

    fn populate(fx: &Fixture) {
        for i in 0..6 {
            fx.frontier
                .submit(fx.docids.as_ref(), "example", &format!("https://example.com/{}", i), 2)
                .unwrap();
        }
        let a = fx.frontier.claim(chrono::Duration::seconds(30)).unwrap().unwrap();
        let b = fx.frontier.claim(chrono::Duration::seconds(30)).unwrap().unwrap();
        fx.frontier.fail(b.task.docid, b.attempt()).unwrap();
        assert!(fx.frontier.working().contains(a.task.docid).unwrap());
    }

    #[test]
    fn test_restore_without_backup() {
        let fx = Fixture::new();
        assert!(!fx.backuper().restore().unwrap());
    }

    #[test]
    fn test_roundtrip_preserves_docids() {
        let fx = Fixture::new();
        populate(&fx);
        assert_eq!(fx.backuper().backup().unwrap(), 6);

        let (frontier, docids, backuper) = fx.restarted();
        assert!(backuper.restore().unwrap());

        let restored = all_docids(&frontier);
        assert_eq!(restored, all_docids(&fx.frontier));
        let unique: BTreeSet<u64> = restored.iter().copied().collect();
        assert_eq!(unique.len(), restored.len());

        assert_eq!(frontier.lengths().unwrap(), (4, 1, 1));
        assert_eq!(docids.current().unwrap(), 6);
        assert!(docids.next(None).unwrap() > 6);
    }

    #[test]
    fn test_restore_keeps_live_tasks() {
        let fx = Fixture::new();
        populate(&fx);
        fx.backuper().backup().unwrap();

        let (frontier, _docids, backuper) = fx.restarted();
        // A newer copy of docid 1 already sits in failed
        let mut live = UrlTask::new("https://example.com/0", 2, "example", 1);
        live.attempts = 7;
        frontier.failed().put(&live).unwrap();

        backuper.restore().unwrap();
        assert_eq!(frontier.failed().get(1).unwrap().unwrap().attempts, 7);
        assert!(!frontier.todo().contains(1).unwrap());
        assert!(!frontier.working().contains(1).unwrap());
        assert_eq!(all_docids(&frontier).len(), 6);
    }

    #[test]
    fn test_restore_twice_is_harmless() {
        let fx = Fixture::new();
        populate(&fx);
        fx.backuper().backup().unwrap();

        let (frontier, _docids, backuper) = fx.restarted();
        backuper.restore().unwrap();
        backuper.restore().unwrap();
        assert_eq!(all_docids(&frontier).len(), 6);
    }

    #[test]
    fn test_tampered_backup_is_rejected() {
        let fx = Fixture::new();
        populate(&fx);
        let backuper = fx.backuper();
        backuper.backup().unwrap();

        let mut doc: serde_json::Value = serde_json::from_slice(&fs::read(backuper.path()).unwrap()).unwrap();
        doc["snapshot"]["last_docid"] = serde_json::json!(1);
        fs::write(backuper.path(), serde_json::to_vec(&doc).unwrap()).unwrap();

        assert!(matches!(backuper.restore(), Err(BackupError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_foreign_site_backup_is_rejected() {
        let fx = Fixture::new();
        populate(&fx);
        fx.backuper().backup().unwrap();

        let other = Backuper::new(
            Frontier::open_in_memory().unwrap(),
            Arc::new(SqliteDocidAllocator::open_in_memory("other").unwrap()),
            "other",
            fx.dir.path(),
        );
        assert!(matches!(other.restore(), Err(BackupError::SiteMismatch { .. })));
    }

    #[test]
    fn test_backup_leaves_no_temp_file() {
        let fx = Fixture::new();
        let backuper = fx.backuper();
        backuper.backup().unwrap();
        backuper.backup().unwrap();

        assert!(backuper.path().exists());
        assert!(!backuper.path().with_extension("json.tmp").exists());
    }
}
