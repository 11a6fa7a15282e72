use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One URL queued for fetching
///
/// A task lives in exactly one of the `todo`, `working`, and `failed` queues.
/// Its `docid` is assigned once by the docid allocator and never changes; it is
/// also the key the task is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlTask {
    /// Address to fetch
    pub url: String,

    /// Crawl depth, the seed is 1
    pub depth: u16,

    /// Site that owns this task
    pub site_id: String,

    /// Document id, unique within the site
    pub docid: u64,

    /// Number of times the task has been claimed
    #[serde(default)]
    pub attempts: u32,

    /// When the task was last handed to a worker
    #[serde(default)]
    pub last_tried_at: Option<DateTime<Utc>>,

    /// Deadline of the current claim
    #[serde(default)]
    pub lease_deadline: Option<DateTime<Utc>>,

    /// When the task was first created
    pub discovered_at: DateTime<Utc>,
}

impl UrlTask {
    /// Creates a fresh, never-tried task
    pub fn new(url: impl Into<String>, depth: u16, site_id: impl Into<String>, docid: u64) -> Self {
        Self {
            url: url.into(),
            depth,
            site_id: site_id.into(),
            docid,
            attempts: 0,
            last_tried_at: None,
            lease_deadline: None,
            discovered_at: Utc::now(),
        }
    }

    /// Clears the try time and lease so the task is eligible for immediate dispatch
    ///
    /// `attempts` is kept: it counts claims over the lifetime of the task.
    pub fn reset_try_time(mut self) -> Self {
        self.last_tried_at = None;
        self.lease_deadline = None;
        self
    }

    /// Stamps the task as handed out at `now` until `deadline`
    pub fn mark_claimed(&mut self, now: DateTime<Utc>, deadline: DateTime<Utc>) {
        self.attempts += 1;
        self.last_tried_at = Some(now);
        self.lease_deadline = Some(deadline);
    }

    /// Returns true if the task carries neither a try time nor a lease
    pub fn is_untimed(&self) -> bool {
        self.last_tried_at.is_none() && self.lease_deadline.is_none()
    }

    /// Returns true if a task sitting in `working` should be reclaimed
    ///
    /// A lease deadline wins when present. Without one, the task is stale once
    /// more than `timeout` has passed since it was last tried. An untimed task
    /// is never stale; the reclaimer stamps it so that it can age.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if let Some(deadline) = self.lease_deadline {
            return now > deadline;
        }

        match self.last_tried_at {
            Some(tried) => now - tried > timeout,
            None => false,
        }
    }
}
