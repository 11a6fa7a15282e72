//! Output module for reporting frontier state
//!
//! This module handles:
//! - Loading queue and docid statistics
//! - Printing them for operators

pub mod stats;

pub use stats::{load_statistics, print_statistics, FrontierStatistics};
