use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for a site manager
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub site: SiteSection,
    pub queue: QueueConfig,
    pub control: ControlConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Identity of the site this manager handles
#[derive(Debug, Clone, Deserialize)]
pub struct SiteSection {
    /// Identifier of the site, stamped on every task
    #[serde(rename = "site-id")]
    pub site_id: String,

    /// URL the crawl starts from when there is no prior state
    #[serde(rename = "seed-url")]
    pub seed_url: String,

    /// Directory holding the queue databases and the backup snapshot
    #[serde(rename = "work-dir")]
    pub work_dir: PathBuf,
}

/// Queue maintenance timings
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// How long a task may stay in `working` before it is reclaimed (milliseconds)
    #[serde(rename = "job-timeout-ms")]
    pub job_timeout_ms: u64,

    /// How often the reclaimer scans `working` (milliseconds)
    #[serde(rename = "cleaner-period-ms")]
    pub cleaner_period_ms: u64,

    /// How often a backup snapshot is written (milliseconds)
    #[serde(rename = "backup-period-ms")]
    pub backup_period_ms: u64,
}

impl QueueConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    /// The job timeout as a wall-clock span, used for leases and staleness
    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.job_timeout_ms).unwrap_or(i64::MAX))
    }

    pub fn cleaner_period(&self) -> Duration {
        Duration::from_millis(self.cleaner_period_ms)
    }

    pub fn backup_period(&self) -> Duration {
        Duration::from_millis(self.backup_period_ms)
    }
}

/// Control server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// TCP port to listen on (0 picks an ephemeral port)
    #[serde(rename = "listen-port")]
    pub listen_port: u16,

    /// Maximum number of simultaneously open connections
    #[serde(rename = "max-connections", default = "default_max_connections")]
    pub max_connections: u32,

    /// Maximum number of commands executing at once
    #[serde(rename = "worker-threads", default = "default_worker_threads")]
    pub worker_threads: u32,

    /// Deadline for a single command (milliseconds)
    #[serde(rename = "command-timeout-ms", default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Optional command descriptor file; the built-in descriptor is used otherwise
    #[serde(rename = "descriptor-path", default)]
    pub descriptor_path: Option<PathBuf>,

    /// Host name published for discovery instead of the resolved local host
    #[serde(rename = "advertise-host", default)]
    pub advertise_host: Option<String>,

    /// Treat a failed bind as fatal instead of degrading
    #[serde(default)]
    pub required: bool,
}

impl ControlConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Discovery publication configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveryConfig {
    /// Shared site descriptor the manager address is written into
    #[serde(rename = "registry-path", default)]
    pub registry_path: Option<PathBuf>,
}

fn default_max_connections() -> u32 {
    10
}

fn default_worker_threads() -> u32 {
    2
}

fn default_command_timeout_ms() -> u64 {
    5_000
}
