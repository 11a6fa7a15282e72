//! Statistics of a site's frontier
//!
//! This module provides functionality for extracting and displaying
//! queue statistics from the storage layer.

use crate::storage::{DocidAllocator, Frontier, StorageResult};
use serde::Serialize;

/// Frontier statistics summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrontierStatistics {
    /// Tasks waiting to be claimed
    pub todo: u64,

    /// Tasks claimed and not yet completed
    pub working: u64,

    /// Tasks that failed permanently
    pub failed: u64,

    /// Last document id issued for the site
    pub last_docid: u64,
}

impl FrontierStatistics {
    /// Tasks across all three queues
    pub fn total(&self) -> u64 {
        self.todo + self.working + self.failed
    }
}

/// Loads statistics from the queues and the docid counter
///
/// # Arguments
///
/// * `frontier` - The queues to count
/// * `docids` - The site's docid allocator
///
/// # Returns
///
/// * `Ok(FrontierStatistics)` - Successfully loaded statistics
/// * `Err(StorageError)` - Failed to query a queue or the counter
pub fn load_statistics(frontier: &Frontier, docids: &dyn DocidAllocator) -> StorageResult<FrontierStatistics> {
    let (todo, working, failed) = frontier.lengths()?;
    let last_docid = docids.current()?;

    Ok(FrontierStatistics {
        todo,
        working,
        failed,
        last_docid,
    })
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `site_id` - Site the statistics belong to
/// * `stats` - The statistics to display
pub fn print_statistics(site_id: &str, stats: &FrontierStatistics) {
    println!("=== Frontier Statistics: {} ===\n", site_id);

    println!("Queues:");
    let total = stats.total();
    for (name, count) in [("todo", stats.todo), ("working", stats.working), ("failed", stats.failed)] {
        let percentage = if total > 0 {
            (count as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        println!("  {:<8} {} ({:.1}%)", name, count, percentage);
    }
    println!();

    println!("Total tasks: {}", total);
    println!("Last docid issued: {}", stats.last_docid);
}
