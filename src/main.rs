//! Site-Frontier main entry point
//!
//! This is the command-line interface for running the frontier manager of one site.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use site_frontier::config::{load_config_with_hash, SiteConfig};
use site_frontier::manager::ControlStatus;
use site_frontier::output::{load_statistics, print_statistics};
use site_frontier::storage::{Frontier, SqliteDocidAllocator};
use site_frontier::SiteManager;
use tracing_subscriber::EnvFilter;

/// Site-Frontier: the crawl frontier manager for a single site
///
/// Keeps the todo, working, and failed queues of a site durable across
/// restarts, reclaims abandoned work, and serves a TCP control channel
/// for fetch workers and operators.
#[derive(Parser, Debug)]
#[command(name = "site-frontier")]
#[command(version = "1.0.0")]
#[command(about = "Crawl frontier manager for a single site", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate the configuration and show it without starting
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show queue statistics from the work directory and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", hash);

    if cli.dry_run {
        handle_dry_run(&config);
    } else if cli.stats {
        handle_stats(&config)?;
    } else {
        handle_run(cli.config).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("site_frontier=info,warn"),
            1 => EnvFilter::new("site_frontier=debug,info"),
            2 => EnvFilter::new("site_frontier=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: shows the validated configuration
fn handle_dry_run(config: &SiteConfig) {
    println!("=== Site-Frontier Dry Run ===\n");

    println!("Site:");
    println!("  Id: {}", config.site.site_id);
    println!("  Seed URL: {}", config.site.seed_url);
    println!("  Work dir: {}", config.site.work_dir.display());

    println!("\nQueue maintenance:");
    println!("  Job timeout: {}ms", config.queue.job_timeout_ms);
    println!("  Cleaner period: {}ms", config.queue.cleaner_period_ms);
    println!("  Backup period: {}ms", config.queue.backup_period_ms);

    println!("\nControl server:");
    println!("  Port: {}", config.control.listen_port);
    println!("  Max connections: {}", config.control.max_connections);
    println!("  Worker threads: {}", config.control.worker_threads);
    println!("  Command timeout: {}ms", config.control.command_timeout_ms);
    match &config.control.descriptor_path {
        Some(path) => println!("  Descriptor: {}", path.display()),
        None => println!("  Descriptor: built-in"),
    }
    if let Some(host) = &config.control.advertise_host {
        println!("  Advertise host: {}", host);
    }
    println!("  Required: {}", config.control.required);

    if let Some(registry) = &config.discovery.registry_path {
        println!("\nDiscovery registry: {}", registry.display());
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the --stats mode: shows queue lengths and the last docid
fn handle_stats(config: &SiteConfig) -> anyhow::Result<()> {
    println!("Work dir: {}\n", config.site.work_dir.display());

    let frontier = Frontier::open(&config.site.work_dir).context("Failed to open queues")?;
    let docids = SqliteDocidAllocator::open(&config.site.work_dir, &config.site.site_id)
        .context("Failed to open docid allocator")?;

    let stats = load_statistics(&frontier, &docids)?;
    print_statistics(&config.site.site_id, &stats);

    frontier.close()?;
    docids.close()?;
    Ok(())
}

/// Runs the manager until Ctrl-C or a `shutdown` control command
async fn handle_run(config_path: PathBuf) -> anyhow::Result<()> {
    let manager = SiteManager::new(config_path);
    manager.init().await?;

    for warning in manager.warnings() {
        tracing::warn!("Init warning: {}", warning);
    }
    match manager.control_status()? {
        ControlStatus::Listening { addr, publication } => {
            tracing::info!("Control server on {} (published as {})", addr, publication.addr());
        }
        ControlStatus::Unavailable { reason } => {
            tracing::warn!("Running without control server: {}", reason);
        }
    }

    manager.start()?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received");
        }
        _ = manager.wait_stopped() => {}
    }

    manager.shutdown().await?;
    tracing::info!("Exited cleanly");
    Ok(())
}
