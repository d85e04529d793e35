use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::TemplarError;

/// Protocol of a request block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    Dns,
    Http,
    Network,
}

impl ProtocolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::Dns => "dns",
            ProtocolType::Http => "http",
            ProtocolType::Network => "network",
        }
    }

    /// Template keys that declare blocks of this protocol.
    pub fn template_keys(&self) -> &'static [&'static str] {
        match self {
            ProtocolType::Dns => &["dns"],
            ProtocolType::Http => &["http", "requests"],
            ProtocolType::Network => &["network", "tcp"],
        }
    }

    pub fn from_template_key(key: &str) -> Option<Self> {
        [ProtocolType::Dns, ProtocolType::Http, ProtocolType::Network]
            .into_iter()
            .find(|p| p.template_keys().contains(&key))
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolType {
    type Err = TemplarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_template_key(&s.to_ascii_lowercase())
            .ok_or_else(|| TemplarError::Template(format!("unknown protocol '{}'", s)))
    }
}
