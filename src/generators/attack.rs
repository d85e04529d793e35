use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::errors::TemplarError;

/// Strategy used to combine payload value lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackType {
    /// Same index applied to every variable; `max(len)` combinations.
    Batteringram,
    /// Variables paired by index; `min(len)` combinations.
    Pitchfork,
    /// Full cartesian product, right-most variable advancing fastest.
    Clusterbomb,
}

impl AttackType {
    /// Attack used when a request does not name one.
    pub fn default_for(payload_count: usize) -> Self {
        if payload_count > 1 {
            Self::Clusterbomb
        } else {
            Self::Batteringram
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Batteringram => "batteringram",
            Self::Pitchfork => "pitchfork",
            Self::Clusterbomb => "clusterbomb",
        }
    }
}

impl std::fmt::Display for AttackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttackType {
    type Err = TemplarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "batteringram" | "battering-ram" => Ok(Self::Batteringram),
            "pitchfork" => Ok(Self::Pitchfork),
            "clusterbomb" | "cluster-bomb" => Ok(Self::Clusterbomb),
            other => Err(TemplarError::Compile(format!("unknown attack type '{}'", other))),
        }
    }
}
