//! Site-Frontier: the crawl frontier manager for a single site
//!
//! This crate keeps the `todo`, `working`, and `failed` URL queues of one site
//! durable across restarts, hands out document ids, reclaims abandoned work,
//! and exposes a small TCP control channel for administration.

pub mod config;
pub mod control;
pub mod daemon;
pub mod manager;
pub mod output;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for Site-Frontier operations
#[derive(Debug, Error)]
pub enum SiteError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Backup error: {0}")]
    Backup(#[from] daemon::BackupError),

    #[error("Control server error: {0}")]
    Control(#[from] control::ControlError),

    #[error("Site manager initialization failed during {stage}: {source}")]
    Init {
        stage: manager::InitStage,
        #[source]
        source: Box<SiteError>,
    },

    #[error("Invalid manager state transition: {from} -> {to}")]
    InvalidTransition {
        from: state::ManagerState,
        to: state::ManagerState,
    },

    #[error("Site manager is not initialized")]
    NotInitialized,

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SiteError {
    /// Wraps an error as an initialization failure of the given stage
    pub fn init(stage: manager::InitStage, source: impl Into<SiteError>) -> Self {
        Self::Init {
            stage,
            source: Box::new(source.into()),
        }
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Site-Frontier operations
pub type Result<T> = std::result::Result<T, SiteError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::SiteConfig;
pub use manager::SiteManager;
pub use state::{ManagerState, UrlTask};
pub use storage::{Frontier, SqliteQueue, TaskQueue};
