//! Matchers and extractors evaluated against flattened response data.

pub mod extractors;
pub mod jsonquery;
pub mod matchers;
pub mod xpath;

pub use extractors::{Extractor, ExtractorKind};
pub use matchers::{Condition, Matcher, MatcherKind};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::dsl;
use crate::errors::TemplarError;
use crate::output::InternalEvent;

/// Matchers and extractors attached to one protocol block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Operators {
    pub matchers: Vec<Matcher>,
    pub extractors: Vec<Extractor>,
    /// How the matchers of this block combine.
    pub matchers_condition: Condition,
}

/// Outcome of running operators against one response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorsResult {
    pub matched: bool,
    pub extracted: bool,
    /// Snippets keyed by the name of each named, non-internal matcher that matched.
    pub matches: BTreeMap<String, Vec<String>>,
    /// Values keyed by the name of each named, non-internal extractor.
    pub extracts: BTreeMap<String, Vec<String>>,
    /// Every non-internal extracted value, in extraction order.
    pub output_extracts: Vec<String>,
    /// Values from internal extractors, for reuse by later requests.
    pub dynamic_values: BTreeMap<String, Vec<String>>,
    /// Payload combination used for the request that produced this result.
    pub payload_values: Map<String, Value>,
}

impl OperatorsResult {
    /// Fold another result into this one, as done when several generated
    /// requests of a block contribute to a single event.
    pub fn merge(&mut self, other: &OperatorsResult) {
        self.matched |= other.matched;
        self.extracted |= other.extracted;
        for (name, values) in &other.matches {
            self.matches.entry(name.clone()).or_default().extend(values.iter().cloned());
        }
        for (name, values) in &other.extracts {
            self.extracts.entry(name.clone()).or_default().extend(values.iter().cloned());
        }
        self.output_extracts.extend(other.output_extracts.iter().cloned());
        for (name, values) in &other.dynamic_values {
            self.dynamic_values.entry(name.clone()).or_default().extend(values.iter().cloned());
        }
        for (key, value) in &other.payload_values {
            self.payload_values.insert(key.clone(), value.clone());
        }
    }

    /// Dynamic values flattened for variable maps: single values as strings,
    /// several as arrays.
    pub fn dynamic_map(&self) -> Map<String, Value> {
        self.dynamic_values
            .iter()
            .map(|(name, values)| (name.clone(), extracted_value(values)))
            .collect()
    }
}

fn extracted_value(values: &[String]) -> Value {
    match values {
        [single] => Value::String(single.clone()),
        many => Value::Array(many.iter().cloned().map(Value::String).collect()),
    }
}

impl Operators {
    pub fn compile(&mut self) -> Result<(), TemplarError> {
        for matcher in &mut self.matchers {
            matcher.compile()?;
        }
        for extractor in &mut self.extractors {
            extractor.compile()?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty() && self.extractors.is_empty()
    }

    pub fn has_matchers(&self) -> bool {
        !self.matchers.is_empty()
    }

    /// Run extractors then matchers against `data`.
    ///
    /// Extracted values are written back into `data` under the extractor name
    /// so matchers can reference them. Returns `None` when nothing is worth
    /// reporting; a result carrying dynamic values is always returned, even
    /// unmatched, so callers can chain them.
    pub fn execute<M, E>(&self, data: &mut InternalEvent, match_fn: M, extract_fn: E) -> Option<OperatorsResult>
    where
        M: Fn(&InternalEvent, &Matcher) -> (bool, Vec<String>),
        E: Fn(&InternalEvent, &Extractor) -> Vec<String>,
    {
        let mut result = OperatorsResult::default();

        for extractor in &self.extractors {
            let values = extract_fn(data, extractor);
            if values.is_empty() {
                continue;
            }
            if extractor.internal {
                if let Some(name) = &extractor.name {
                    result.dynamic_values.entry(name.clone()).or_default().extend(values.iter().cloned());
                }
            } else {
                result.output_extracts.extend(values.iter().cloned());
                if let Some(name) = &extractor.name {
                    result.extracts.entry(name.clone()).or_default().extend(values.iter().cloned());
                }
            }
            if let Some(name) = &extractor.name {
                data.insert(name.clone(), extracted_value(&values));
            }
        }

        let mut all_matched = true;
        let mut any_matched = false;
        for matcher in &self.matchers {
            let (matched, snippets) = match_fn(data, matcher);
            if matched {
                any_matched = true;
                if let (Some(name), false) = (&matcher.name, matcher.internal) {
                    result.matches.insert(name.clone(), snippets);
                }
            } else {
                all_matched = false;
                if self.matchers_condition == Condition::And {
                    break;
                }
            }
        }

        result.matched = match self.matchers_condition {
            Condition::And => self.has_matchers() && all_matched,
            Condition::Or => any_matched,
        };
        if !result.matched {
            result.matches.clear();
        }
        result.extracted = !result.output_extracts.is_empty();

        if !result.dynamic_values.is_empty() {
            return Some(result);
        }
        if self.has_matchers() && !result.matched {
            return None;
        }
        if result.matched || result.extracted {
            return Some(result);
        }
        None
    }
}

/// Select the text of a response part. An empty part means `default_part`;
/// `all`, `raw` and `response` are aliases for the full raw response.
/// List values are joined one per line.
pub fn part_text(data: &InternalEvent, part: &str, default_part: &str) -> Option<String> {
    let part = if part.is_empty() { default_part } else { part };
    let key = part.replace('-', "_");
    let value = data.get(&key).or_else(|| match part {
        "all" | "raw" | "response" => data.get("response").or_else(|| data.get("raw")),
        _ => None,
    })?;
    Some(match value {
        Value::Array(items) => items.iter().map(dsl::to_text).collect::<Vec<_>>().join("\n"),
        other => dsl::to_text(other),
    })
}

/// Shared matcher dispatch used by every protocol backend.
pub fn default_match(data: &InternalEvent, matcher: &Matcher, default_part: &str) -> (bool, Vec<String>) {
    match matcher.kind {
        MatcherKind::Status => {
            let matched = matchers::numeric_field(data, "status_code")
                .map(|status| matcher.match_status(status as u16))
                .unwrap_or(false);
            (matcher.result(matched), Vec::new())
        }
        MatcherKind::Dsl => (matcher.result(matcher.match_dsl(data)), Vec::new()),
        kind => {
            // A missing part never matches, even for negative matchers.
            let Some(corpus) = part_text(data, &matcher.part, default_part) else {
                return (false, Vec::new());
            };
            match kind {
                MatcherKind::Word => {
                    let (matched, snippets) = matcher.match_words(&corpus, data);
                    matcher.result_with_snippets(matched, snippets)
                }
                MatcherKind::Regex => {
                    let (matched, snippets) = matcher.match_regex(&corpus);
                    matcher.result_with_snippets(matched, snippets)
                }
                MatcherKind::Binary => {
                    let (matched, snippets) = matcher.match_binary(corpus.as_bytes());
                    matcher.result_with_snippets(matched, snippets)
                }
                MatcherKind::Size => (matcher.result(matcher.match_size(corpus.len())), Vec::new()),
                MatcherKind::Xpath => (matcher.result(matcher.match_xpath(&corpus)), Vec::new()),
                MatcherKind::Status | MatcherKind::Dsl => (false, Vec::new()),
            }
        }
    }
}

/// Shared extractor dispatch used by every protocol backend.
pub fn default_extract(data: &InternalEvent, extractor: &Extractor, default_part: &str) -> Vec<String> {
    match extractor.kind {
        ExtractorKind::Kval => extractor.extract_kval(data),
        ExtractorKind::Dsl => extractor.extract_dsl(data),
        kind => {
            let Some(corpus) = part_text(data, &extractor.part, default_part) else {
                return Vec::new();
            };
            match kind {
                ExtractorKind::Regex => extractor.extract_regex(&corpus),
                ExtractorKind::Json => extractor.extract_json(&corpus),
                ExtractorKind::Xpath => extractor.extract_xpath(&corpus),
                ExtractorKind::Kval | ExtractorKind::Dsl => Vec::new(),
            }
        }
    }
}
