use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::filters::TemplateFilters;
use crate::interactsh::InteractshOptions;

/// Engine-wide configuration. Built once and handed to every subsystem that
/// needs it; nothing reads configuration from global state.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EngineOptions {
    /// Maximum requests issued per `rate_limit_window`. 0 disables limiting.
    pub rate_limit: u32,
    #[serde(with = "super::duration")]
    pub rate_limit_window: Duration,
    /// Templates executed in parallel.
    pub template_concurrency: usize,
    /// Targets executed in parallel for one template.
    pub host_concurrency: usize,
    /// Per-request timeout enforced by every backend.
    #[serde(with = "super::duration")]
    pub timeout: Duration,
    /// Errors tolerated per host before further requests are skipped. 0 disables.
    pub max_host_error: u32,
    /// Extra error substrings that count toward the host error threshold.
    pub track_errors: Vec<String>,
    pub stop_at_first_match: bool,
    pub allow_local_file_access: bool,
    pub templates_directory: PathBuf,
    pub follow_redirects: bool,
    /// Upper bound on bytes read from a raw network response.
    pub max_read_size: usize,
    pub interactsh: InteractshOptions,
    /// Which loaded templates are kept for execution.
    pub filters: TemplateFilters,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            rate_limit: 150,
            rate_limit_window: Duration::from_secs(1),
            template_concurrency: 25,
            host_concurrency: 25,
            timeout: Duration::from_secs(10),
            max_host_error: 30,
            track_errors: Vec::new(),
            stop_at_first_match: false,
            allow_local_file_access: false,
            templates_directory: PathBuf::from("templates"),
            follow_redirects: false,
            max_read_size: 4096,
            interactsh: InteractshOptions::default(),
            filters: TemplateFilters::default(),
        }
    }
}

impl EngineOptions {
    /// Options suited to unit and integration tests: no rate limit, short
    /// timeouts, OOB disabled.
    pub fn for_tests() -> Self {
        Self {
            rate_limit: 0,
            timeout: Duration::from_secs(5),
            interactsh: InteractshOptions {
                no_interactsh: true,
                ..InteractshOptions::default()
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_options_defaults() {
        let options = EngineOptions::default();
        assert_eq!(options.max_host_error, 30);
        assert_eq!(options.rate_limit, 150);
        assert_eq!(options.interactsh.cache_size, 5000);
        assert_eq!(options.interactsh.eviction, Duration::from_secs(60));
        assert!(!options.allow_local_file_access);
    }

    #[test]
    fn test_engine_options_partial_yaml() {
        let yaml = "rate-limit: 10\ntimeout: 2.5\ninteractsh:\n  no-interactsh: true\n";
        let options: EngineOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(options.rate_limit, 10);
        assert_eq!(options.timeout, Duration::from_millis(2500));
        assert!(options.interactsh.no_interactsh);
        assert_eq!(options.host_concurrency, 25);
        assert!(options.filters.is_empty());
    }

    #[test]
    fn test_filters_section() {
        let options: EngineOptions = serde_yaml::from_str("filters:
  tags: [cve]
  exclude-ids: [noisy]
").unwrap();
        assert_eq!(options.filters.tags, vec!["cve"]);
        assert_eq!(options.filters.exclude_ids, vec!["noisy"]);
    }

    #[test]
    fn test_for_tests_disables_oob() {
        let options = EngineOptions::for_tests();
        assert!(options.interactsh.no_interactsh);
        assert_eq!(options.rate_limit, 0);
    }
}
