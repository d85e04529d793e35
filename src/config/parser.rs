use std::path::Path;
use crate::errors::TemplarError;
use super::types::EngineOptions;
use tracing::warn;

pub async fn parse_config(path: &Path) -> Result<EngineOptions, TemplarError> {
    if !path.exists() {
        return Err(TemplarError::Config(format!("Config file not found: {}", path.display())));
    }

    let metadata = tokio::fs::metadata(path).await?;
    if metadata.len() > 1_048_576 {
        return Err(TemplarError::Config("Config file exceeds 1MB limit".into()));
    }

    let content = tokio::fs::read_to_string(path).await?;
    parse_config_str(&content)
}

pub fn parse_config_str(content: &str) -> Result<EngineOptions, TemplarError> {
    let options: EngineOptions = serde_yaml::from_str(content)?;
    validate_conflicts(&options)?;
    Ok(options)
}

/// Detect semantic conflicts in the parsed configuration.
fn validate_conflicts(options: &EngineOptions) -> Result<(), TemplarError> {
    if options.template_concurrency == 0 || options.host_concurrency == 0 {
        return Err(TemplarError::Config(
            "template-concurrency and host-concurrency must be at least 1".into(),
        ));
    }
    if options.rate_limit > 0 && options.rate_limit_window.is_zero() {
        return Err(TemplarError::Config(
            "rate-limit-window must be non-zero when rate-limit is set".into(),
        ));
    }
    if options.timeout.is_zero() {
        return Err(TemplarError::Config("timeout must be non-zero".into()));
    }

    let oob = &options.interactsh;
    if !oob.no_interactsh {
        if oob.cache_size == 0 {
            return Err(TemplarError::Config("interactsh cache-size must be at least 1".into()));
        }
        if oob.poll_interval.is_zero() {
            return Err(TemplarError::Config("interactsh poll-interval must be non-zero".into()));
        }
        if oob.server_url.is_empty() {
            warn!("Interactsh enabled without a server URL, OOB matchers will never fire");
        }
    }

    if options.max_host_error > 0 && options.max_host_error < 3 {
        warn!(
            max_host_error = options.max_host_error,
            "Very low max-host-error, transient failures may skip healthy hosts"
        );
    }

    Ok(())
}
