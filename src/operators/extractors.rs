use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::jsonquery::{self, JsonQuery};
use super::xpath::{parse_document, Selected, XPath};
use crate::dsl::{self, Expression};
use crate::errors::TemplarError;
use crate::output::InternalEvent;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    #[default]
    Regex,
    Kval,
    Json,
    Xpath,
    Dsl,
}

impl ExtractorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractorKind::Regex => "regex",
            ExtractorKind::Kval => "kval",
            ExtractorKind::Json => "json",
            ExtractorKind::Xpath => "xpath",
            ExtractorKind::Dsl => "dsl",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Extractor {
    #[serde(rename = "type")]
    pub kind: ExtractorKind,
    pub name: Option<String>,
    /// Response part to extract from. Empty means the backend default.
    pub part: String,
    /// Internal extractors feed dynamic values to later requests instead of
    /// being reported.
    pub internal: bool,
    pub case_insensitive: bool,
    pub regex: Vec<String>,
    /// Capture group reported by regex extractors.
    pub group: usize,
    pub kval: Vec<String>,
    pub json: Vec<String>,
    pub xpath: Vec<String>,
    /// Attribute reported for each element selected by an xpath extractor.
    pub attribute: Option<String>,
    pub dsl: Vec<String>,

    #[serde(skip)]
    compiled_regex: Vec<Regex>,
    #[serde(skip)]
    compiled_json: Vec<JsonQuery>,
    #[serde(skip)]
    compiled_xpath: Vec<XPath>,
    #[serde(skip)]
    compiled_dsl: Vec<Expression>,
}

/// Insert preserving first-seen order, skipping duplicates and empties.
fn push_unique(out: &mut Vec<String>, value: String) {
    if !value.is_empty() && !out.contains(&value) {
        out.push(value);
    }
}

impl Extractor {
    pub fn compile(&mut self) -> Result<(), TemplarError> {
        let label = self.name.clone().unwrap_or_else(|| self.kind.as_str().to_string());
        if self.internal && self.name.is_none() {
            return Err(TemplarError::Compile(format!("internal {} extractor needs a name", self.kind.as_str())));
        }
        let empty = match self.kind {
            ExtractorKind::Regex => self.regex.is_empty(),
            ExtractorKind::Kval => self.kval.is_empty(),
            ExtractorKind::Json => self.json.is_empty(),
            ExtractorKind::Xpath => self.xpath.is_empty(),
            ExtractorKind::Dsl => self.dsl.is_empty(),
        };
        if empty {
            return Err(TemplarError::Compile(format!("extractor '{}' has no {} values", label, self.kind.as_str())));
        }

        self.compiled_regex = self
            .regex
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(self.case_insensitive)
                    .build()
                    .map_err(|e| TemplarError::Compile(format!("extractor '{}': invalid regex '{}': {}", label, pattern, e)))
            })
            .collect::<Result<_, _>>()?;
        if let Some(re) = self.compiled_regex.iter().find(|re| re.captures_len() <= self.group) {
            return Err(TemplarError::Compile(format!(
                "extractor '{}': regex '{}' has no group {}",
                label,
                re.as_str(),
                self.group
            )));
        }
        self.compiled_json = self.json.iter().map(|q| JsonQuery::compile(q)).collect::<Result<_, _>>()?;
        self.compiled_xpath = self.xpath.iter().map(|e| XPath::compile(e)).collect::<Result<_, _>>()?;
        self.compiled_dsl = self
            .dsl
            .iter()
            .map(|source| {
                Expression::compile(source)
                    .map_err(|e| TemplarError::Compile(format!("extractor '{}': invalid dsl '{}': {}", label, source, e)))
            })
            .collect::<Result<_, _>>()?;
        if self.case_insensitive {
            self.kval = self.kval.iter().map(|k| k.to_lowercase()).collect();
        }
        Ok(())
    }

    pub fn extract_regex(&self, corpus: &str) -> Vec<String> {
        let mut out = Vec::new();
        for re in &self.compiled_regex {
            for captures in re.captures_iter(corpus) {
                if let Some(group) = captures.get(self.group) {
                    push_unique(&mut out, group.as_str().to_string());
                }
            }
        }
        out
    }

    /// Look up response fields by key. Dashes and underscores are
    /// interchangeable so `content-type` finds the `content_type` header field.
    pub fn extract_kval(&self, data: &InternalEvent) -> Vec<String> {
        let mut out = Vec::new();
        for key in &self.kval {
            let normalized = key.replace('-', "_");
            let value = data.get(&normalized).or_else(|| data.get(key)).or_else(|| {
                self.case_insensitive
                    .then(|| data.iter().find(|(k, _)| k.to_lowercase().replace('-', "_") == normalized))
                    .flatten()
                    .map(|(_, v)| v)
            });
            if let Some(value) = value {
                push_unique(&mut out, dsl::to_text(value));
            }
        }
        out
    }

    /// A body that is not valid JSON extracts nothing.
    pub fn extract_json(&self, corpus: &str) -> Vec<String> {
        let Ok(document) = serde_json::from_str::<serde_json::Value>(corpus) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for query in &self.compiled_json {
            for value in query.evaluate(&document) {
                push_unique(&mut out, jsonquery::render(value));
            }
        }
        out
    }

    pub fn extract_xpath(&self, corpus: &str) -> Vec<String> {
        let document = parse_document(corpus);
        let mut out = Vec::new();
        for xpath in &self.compiled_xpath {
            for selected in xpath.select(&document) {
                let value = match (&self.attribute, &selected) {
                    (Some(attribute), Selected::Element(element)) => element.attribute(attribute).map(str::to_string),
                    _ => Some(selected.text()),
                };
                if let Some(value) = value {
                    push_unique(&mut out, value);
                }
            }
        }
        out
    }

    pub fn extract_dsl(&self, data: &InternalEvent) -> Vec<String> {
        let mut env = data.clone();
        let mut out = Vec::new();
        for expression in &self.compiled_dsl {
            match expression.evaluate(&mut env) {
                Ok(value) => push_unique(&mut out, dsl::to_text(&value)),
                Err(e) => warn!(expression = %expression.source(), error = %e, "DSL extractor evaluation failed"),
            }
        }
        out
    }
}
