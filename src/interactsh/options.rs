use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Out-of-band interaction settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct InteractshOptions {
    /// Correlation server base URL, e.g. `https://oast.example`.
    pub server_url: String,
    /// Token sent as the `Authorization` header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
    /// Maximum pending correlation entries.
    pub cache_size: usize,
    /// Lifetime of a pending correlation entry.
    #[serde(with = "crate::config::duration")]
    pub eviction: Duration,
    /// Extra time spent polling after the scan finished.
    #[serde(with = "crate::config::duration")]
    pub cooldown: Duration,
    #[serde(with = "crate::config::duration")]
    pub poll_interval: Duration,
    /// Disable interaction correlation; interaction matchers never match.
    pub no_interactsh: bool,
}

impl Default for InteractshOptions {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            authorization: None,
            cache_size: 5000,
            eviction: Duration::from_secs(60),
            cooldown: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
            no_interactsh: false,
        }
    }
}
