use crate::config::types::{ControlConfig, QueueConfig, SiteConfig, SiteSection};
use crate::ConfigError;
use url::Url;

/// Upper bound for every timing, and for a lease asked for on claim (30 days)
pub const MAX_PERIOD_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Validates the entire configuration
pub fn validate(config: &SiteConfig) -> Result<(), ConfigError> {
    validate_site(&config.site)?;
    validate_queue(&config.queue)?;
    validate_control(&config.control)?;
    Ok(())
}

/// Validates the site section
fn validate_site(site: &SiteSection) -> Result<(), ConfigError> {
    validate_site_id(&site.site_id)?;

    let seed = Url::parse(&site.seed_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid seed-url '{}': {}", site.seed_url, e)))?;

    if seed.scheme() != "http" && seed.scheme() != "https" {
        return Err(ConfigError::Validation(format!(
            "seed-url '{}' must use http or https",
            site.seed_url
        )));
    }

    if site.work_dir.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "work-dir cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Site ids name files in the registry, so keep them to a safe alphabet
fn validate_site_id(site_id: &str) -> Result<(), ConfigError> {
    if site_id.is_empty() {
        return Err(ConfigError::Validation(
            "site-id cannot be empty".to_string(),
        ));
    }

    if !site_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ConfigError::Validation(format!(
            "site-id must contain only alphanumeric characters, '-' and '_', got '{}'",
            site_id
        )));
    }

    Ok(())
}

/// Validates queue maintenance timings
fn validate_queue(queue: &QueueConfig) -> Result<(), ConfigError> {
    for (name, value) in [
        ("job-timeout-ms", queue.job_timeout_ms),
        ("cleaner-period-ms", queue.cleaner_period_ms),
        ("backup-period-ms", queue.backup_period_ms),
    ] {
        if value == 0 || value > MAX_PERIOD_MS {
            return Err(ConfigError::Validation(format!(
                "{} must be between 1ms and {}ms, got {}ms",
                name, MAX_PERIOD_MS, value
            )));
        }
    }

    Ok(())
}

/// Validates control server limits
fn validate_control(control: &ControlConfig) -> Result<(), ConfigError> {
    if control.max_connections < 1 || control.max_connections > 1024 {
        return Err(ConfigError::Validation(format!(
            "max-connections must be between 1 and 1024, got {}",
            control.max_connections
        )));
    }

    if control.worker_threads < 1 || control.worker_threads > control.max_connections {
        return Err(ConfigError::Validation(format!(
            "worker-threads must be between 1 and max-connections ({}), got {}",
            control.max_connections, control.worker_threads
        )));
    }

    if control.command_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "command-timeout-ms must be >= 1ms".to_string(),
        ));
    }

    if let Some(host) = &control.advertise_host {
        if host.trim().is_empty() {
            return Err(ConfigError::Validation(
                "advertise-host cannot be blank".to_string(),
            ));
        }
    }

    Ok(())
}
