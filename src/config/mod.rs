//! Configuration module for Site-Frontier
//!
//! This module handles loading, parsing, and validating the TOML site configuration.
//!
//! # Example
//!
//! ```no_run
//! use site_frontier::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("site.toml")).unwrap();
//! println!("Managing site: {}", config.site.site_id);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{ControlConfig, DiscoveryConfig, QueueConfig, SiteConfig, SiteSection};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
pub use validation::{validate, MAX_PERIOD_MS};
