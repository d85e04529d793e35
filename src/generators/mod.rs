//! Payload generators.
//!
//! A generator holds ordered payload value lists keyed by variable name and
//! an [`AttackType`] deciding how they combine. Lists come inline from the
//! template or from wordlist files opened through the [`Catalog`].

mod attack;
mod iterator;

pub use attack::AttackType;
pub use iterator::PayloadIterator;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::Path;
use tracing::debug;

use crate::catalog::{read_lines, Catalog};
use crate::errors::TemplarError;

/// Payload values as declared in a template: an inline list, a wordlist
/// path, or a multi-line string with one value per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadSource {
    Values(Vec<serde_yaml::Value>),
    File(String),
}

fn scalar_to_string(value: &serde_yaml::Value) -> Result<String, TemplarError> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Null => Ok(String::new()),
        other => Err(TemplarError::Compile(format!("payload values must be scalars, got {:?}", other))),
    }
}

#[derive(Debug, Clone)]
pub struct PayloadGenerator {
    payloads: Vec<(String, Vec<String>)>,
    attack: AttackType,
    total: usize,
}

impl PayloadGenerator {
    /// Build a generator, loading wordlists through the catalog.
    ///
    /// Fails with a compile error when a wordlist cannot be resolved inside
    /// the sandbox or is unreadable, or when the number of combinations does
    /// not fit in a `usize`.
    pub fn new(
        payloads: &[(String, PayloadSource)],
        attack: AttackType,
        template_path: Option<&Path>,
        catalog: &dyn Catalog,
    ) -> Result<Self, TemplarError> {
        let mut resolved = Vec::with_capacity(payloads.len());
        for (name, source) in payloads {
            let values = match source {
                PayloadSource::Values(items) => {
                    items.iter().map(scalar_to_string).collect::<Result<Vec<_>, _>>()?
                }
                PayloadSource::File(text) if text.contains('\n') => {
                    text.lines().filter(|l| !l.is_empty()).map(str::to_string).collect()
                }
                PayloadSource::File(path) => {
                    let file = catalog.resolve_path(path, template_path).map_err(|e| {
                        TemplarError::Compile(format!("could not load payload '{}': {}", name, e))
                    })?;
                    read_lines(catalog, &file).map_err(|e| {
                        TemplarError::Compile(format!("could not read payload file {}: {}", file.display(), e))
                    })?
                }
            };
            debug!(payload = %name, values = values.len(), "Loaded payload values");
            resolved.push((name.clone(), values));
        }
        Self::from_values(resolved, attack)
    }

    /// Build a generator from already-resolved value lists.
    pub fn from_values(payloads: Vec<(String, Vec<String>)>, attack: AttackType) -> Result<Self, TemplarError> {
        let total = combinations(&payloads, attack).ok_or_else(|| {
            let sizes: Vec<_> = payloads.iter().map(|(name, values)| format!("{}={}", name, values.len())).collect();
            TemplarError::Compile(format!("{} payload combinations overflow ({})", attack, sizes.join(", ")))
        })?;
        Ok(Self { payloads, attack, total })
    }

    pub fn attack(&self) -> AttackType {
        self.attack
    }

    pub fn payloads(&self) -> &[(String, Vec<String>)] {
        &self.payloads
    }

    /// Number of combinations a fresh iterator yields.
    pub fn total(&self) -> usize {
        self.total
    }

    /// A fresh, independent cursor starting at the first combination.
    pub fn iterator(&self) -> PayloadIterator<'_> {
        PayloadIterator::new(self)
    }
}

/// Combinations yielded for `payloads` under `attack`, or `None` on overflow.
fn combinations(payloads: &[(String, Vec<String>)], attack: AttackType) -> Option<usize> {
    if payloads.is_empty() {
        return Some(0);
    }
    let mut lengths = payloads.iter().map(|(_, values)| values.len());
    match attack {
        AttackType::Batteringram => lengths.max(),
        AttackType::Pitchfork => lengths.min(),
        AttackType::Clusterbomb => lengths.try_fold(1usize, usize::checked_mul),
    }
}

/// Deserialize a `payloads:` mapping keeping declaration order, which
/// decides iteration order.
pub fn deserialize_payloads<'de, D>(deserializer: D) -> Result<Vec<(String, PayloadSource)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OrderedPayloads;

    impl<'de> Visitor<'de> for OrderedPayloads {
        type Value = Vec<(String, PayloadSource)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a mapping of payload names to values or wordlist paths")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut out = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((name, source)) = map.next_entry::<String, PayloadSource>()? {
                out.push((name, source));
            }
            Ok(out)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }
    }

    deserializer.deserialize_any(OrderedPayloads)
}
