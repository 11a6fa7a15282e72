//! Startup recovery
//!
//! Before serving, a manager either resumes prior work or bootstraps a fresh
//! crawl. Resuming puts everything that was in flight or failed back into
//! `todo`, so every URL is processed at least once across restarts.

use crate::config::SiteSection;
use crate::daemon::{BackupError, Backuper};
use crate::manager::InitWarning;
use crate::storage::{DocidAllocator, Frontier};

/// What recovery did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Prior state found; `rescheduled` tasks moved back to `todo`
    Resumed { restored_backup: bool, rescheduled: usize },
    /// No prior state; the seed was queued under `docid`
    Seeded { docid: u64 },
}

/// Restores the backup if any, then resumes or seeds
///
/// An unreadable or foreign backup is ignored with a warning; the live queues
/// are authoritative.
pub fn recover(
    frontier: &Frontier,
    backuper: &Backuper,
    docids: &dyn DocidAllocator,
    site: &SiteSection,
    warnings: &mut Vec<InitWarning>,
) -> crate::Result<RecoveryOutcome> {
    let restored_backup = match backuper.restore() {
        Ok(restored) => restored,
        Err(e @ (BackupError::Json(_)
        | BackupError::ChecksumMismatch { .. }
        | BackupError::SiteMismatch { .. }
        | BackupError::UnsupportedVersion(_))) => {
            tracing::warn!(path = %backuper.path().display(), error = %e, "Ignoring unusable backup");
            warnings.push(InitWarning::BackupRejected {
                reason: e.to_string(),
            });
            false
        }
        Err(e) => return Err(e.into()),
    };

    if restored_backup || frontier.has_tasks()? {
        let rescheduled = frontier.reschedule_all()?;
        tracing::info!(site = %site.site_id, restored_backup, rescheduled, "Resumed prior frontier");
        return Ok(RecoveryOutcome::Resumed {
            restored_backup,
            rescheduled,
        });
    }

    let seed = frontier.submit(docids, &site.site_id, &site.seed_url, 1)?;
    tracing::info!(site = %site.site_id, docid = seed.docid, url = %seed.url, "Seeded empty frontier");
    Ok(RecoveryOutcome::Seeded { docid: seed.docid })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::UrlTask;
    use crate::storage::{SqliteDocidAllocator, TaskQueue};
    use std::sync::Arc;

    fn site() -> SiteSection {
        SiteSection {
            site_id: "example".to_string(),
            seed_url: "https://example.com/".to_string(),
            work_dir: "./unused".into(),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        frontier: Frontier,
        docids: Arc<SqliteDocidAllocator>,
        backuper: Backuper,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let frontier = Frontier::open_in_memory().unwrap();
        let docids = Arc::new(SqliteDocidAllocator::open_in_memory("example").unwrap());
        let backuper = Backuper::new(frontier.clone(), docids.clone(), "example", dir.path());
        Fixture {
            _dir: dir,
            frontier,
            docids,
            backuper,
        }
    }

    fn run(fx: &Fixture) -> (RecoveryOutcome, Vec<InitWarning>) {
        let mut warnings = Vec::new();
        let outcome = recover(&fx.frontier, &fx.backuper, fx.docids.as_ref(), &site(), &mut warnings).unwrap();
        (outcome, warnings)
    }

    #[test]
    fn test_bootstrap_seeds_once() {
        let fx = fixture();
        let (outcome, warnings) = run(&fx);

        assert!(warnings.is_empty());
        let RecoveryOutcome::Seeded { docid } = outcome else {
            panic!("expected a seed, got {:?}", outcome);
        };
        assert_eq!(fx.frontier.lengths().unwrap(), (1, 0, 0));

        let seed = fx.frontier.todo().get(docid).unwrap().unwrap();
        assert_eq!(seed.depth, 1);
        assert_eq!(seed.site_id, "example");
        assert_eq!(seed.url, "https://example.com/");
    }

    #[test]
    fn test_resume_moves_working_and_failed_back() {
        let fx = fixture();
        let mut tried = UrlTask::new("https://example.com/a", 2, "example", 10);
        let now = chrono::Utc::now();
        tried.mark_claimed(now, now + chrono::Duration::seconds(30));
        fx.frontier.working().put(&tried).unwrap();
        fx.frontier
            .failed()
            .put(&UrlTask::new("https://example.com/b", 2, "example", 11))
            .unwrap();
        fx.frontier
            .todo()
            .put(&UrlTask::new("https://example.com/c", 2, "example", 12))
            .unwrap();

        let (outcome, _) = run(&fx);
        assert_eq!(
            outcome,
            RecoveryOutcome::Resumed {
                restored_backup: false,
                rescheduled: 2
            }
        );
        assert_eq!(fx.frontier.lengths().unwrap(), (3, 0, 0));

        let back = fx.frontier.todo().get(10).unwrap().unwrap();
        assert!(back.last_tried_at.is_none());
        assert!(back.lease_deadline.is_none());
        assert_eq!(back.docid, 10);
    }

    #[test]
    fn test_resume_after_backup_without_seeding() {
        let fx = fixture();
        fx.frontier
            .submit(fx.docids.as_ref(), "example", "https://example.com/x", 3)
            .unwrap();
        fx.backuper.backup().unwrap();
        fx.frontier.todo().remove(1).unwrap();

        let (outcome, _) = run(&fx);
        assert!(matches!(outcome, RecoveryOutcome::Resumed { restored_backup: true, .. }));
        assert_eq!(fx.frontier.lengths().unwrap(), (1, 0, 0));
    }

    #[test]
    fn test_corrupt_backup_is_ignored() {
        let fx = fixture();
        std::fs::write(fx.backuper.path(), b"{ not json").unwrap();

        let (outcome, warnings) = run(&fx);
        assert!(matches!(outcome, RecoveryOutcome::Seeded { .. }));
        assert!(matches!(warnings.as_slice(), [InitWarning::BackupRejected { .. }]));
    }
}
