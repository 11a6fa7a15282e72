//! Site manager orchestration
//!
//! This module wires the frontier, the daemons, and the control server together
//! and drives them through initialization, recovery, serving, and shutdown.

mod orchestrator;
mod recovery;

pub use orchestrator::SiteManager;
pub use recovery::{recover, RecoveryOutcome};

use crate::config::{load_config, validate, SiteConfig};
use crate::control::Publication;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Step of `init()` that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    Config,
    ControlServer,
    DocidAllocator,
    Queues,
    Recovery,
    Daemons,
}

impl InitStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::ControlServer => "control-server",
            Self::DocidAllocator => "docid-allocator",
            Self::Queues => "queues",
            Self::Recovery => "recovery",
            Self::Daemons => "daemons",
        }
    }
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-fatal problems encountered during `init()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitWarning {
    /// The control server could not bind; the manager runs without it
    ControlUnavailable { reason: String },
    /// The local host name could not be resolved; a fallback address was used
    HostFallback { addr: String, reason: String },
    /// The discovery registry could not be written
    PublicationFailed { addr: String, reason: String },
    /// The backup file was unusable and was ignored
    BackupRejected { reason: String },
}

impl fmt::Display for InitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControlUnavailable { reason } => write!(f, "control server unavailable: {}", reason),
            Self::HostFallback { addr, reason } => {
                write!(f, "advertising fallback address {}: {}", addr, reason)
            }
            Self::PublicationFailed { addr, reason } => {
                write!(f, "could not publish {}: {}", addr, reason)
            }
            Self::BackupRejected { reason } => write!(f, "backup ignored: {}", reason),
        }
    }
}

/// Whether the control server is reachable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlStatus {
    /// Bound and, after `start()`, serving
    Listening {
        addr: SocketAddr,
        publication: Publication,
    },
    /// Bind failed; administration is not possible
    Unavailable { reason: String },
}

impl ControlStatus {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Listening { addr, .. } => Some(*addr),
            Self::Unavailable { .. } => None,
        }
    }
}

/// Where a manager gets its configuration from
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// A TOML file, read during `init()`
    File(PathBuf),
    /// An already built configuration, validated during `init()`
    Inline(SiteConfig),
}

impl ConfigSource {
    /// Loads and validates the configuration
    pub fn load(&self) -> crate::ConfigResult<SiteConfig> {
        match self {
            Self::File(path) => load_config(path),
            Self::Inline(config) => {
                validate(config)?;
                Ok(config.clone())
            }
        }
    }
}

impl From<SiteConfig> for ConfigSource {
    fn from(config: SiteConfig) -> Self {
        Self::Inline(config)
    }
}

impl From<PathBuf> for ConfigSource {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl From<&std::path::Path> for ConfigSource {
    fn from(path: &std::path::Path) -> Self {
        Self::File(path.to_path_buf())
    }
}
