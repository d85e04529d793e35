use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::xpath::{parse_document, XPath};
use crate::dsl::{self, Expression};
use crate::errors::TemplarError;
use crate::output::InternalEvent;
use crate::protocols::replacer;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    And,
    #[default]
    Or,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatcherKind {
    #[default]
    #[serde(alias = "words")]
    Word,
    Regex,
    Binary,
    Status,
    Size,
    Dsl,
    Xpath,
}

impl MatcherKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatcherKind::Word => "word",
            MatcherKind::Regex => "regex",
            MatcherKind::Binary => "binary",
            MatcherKind::Status => "status",
            MatcherKind::Size => "size",
            MatcherKind::Dsl => "dsl",
            MatcherKind::Xpath => "xpath",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Matcher {
    #[serde(rename = "type")]
    pub kind: MatcherKind,
    /// How multiple values of this matcher combine.
    pub condition: Condition,
    /// Response part to match against. Empty means the backend default.
    pub part: String,
    pub name: Option<String>,
    pub negative: bool,
    pub case_insensitive: bool,
    /// Collect every matching snippet instead of stopping at the first.
    pub match_all: bool,
    /// Participates in matching but is never reported.
    pub internal: bool,
    pub words: Vec<String>,
    pub regex: Vec<String>,
    pub binary: Vec<String>,
    pub status: Vec<u16>,
    pub size: Vec<usize>,
    pub dsl: Vec<String>,
    pub xpath: Vec<String>,

    #[serde(skip)]
    compiled_regex: Vec<Regex>,
    #[serde(skip)]
    compiled_binary: Vec<Vec<u8>>,
    #[serde(skip)]
    compiled_dsl: Vec<Expression>,
    #[serde(skip)]
    compiled_xpath: Vec<XPath>,
}

impl Matcher {
    pub fn compile(&mut self) -> Result<(), TemplarError> {
        let label = self.name.clone().unwrap_or_else(|| self.kind.as_str().to_string());
        let empty = match self.kind {
            MatcherKind::Word => self.words.is_empty(),
            MatcherKind::Regex => self.regex.is_empty(),
            MatcherKind::Binary => self.binary.is_empty(),
            MatcherKind::Status => self.status.is_empty(),
            MatcherKind::Size => self.size.is_empty(),
            MatcherKind::Dsl => self.dsl.is_empty(),
            MatcherKind::Xpath => self.xpath.is_empty(),
        };
        if empty {
            return Err(TemplarError::Compile(format!("matcher '{}' has no {} values", label, self.kind.as_str())));
        }

        self.compiled_regex = self
            .regex
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(self.case_insensitive)
                    .build()
                    .map_err(|e| TemplarError::Compile(format!("matcher '{}': invalid regex '{}': {}", label, pattern, e)))
            })
            .collect::<Result<_, _>>()?;
        self.compiled_binary = self
            .binary
            .iter()
            .map(|pattern| {
                hex::decode(pattern.trim())
                    .map_err(|e| TemplarError::Compile(format!("matcher '{}': invalid hex '{}': {}", label, pattern, e)))
            })
            .collect::<Result<_, _>>()?;
        self.compiled_dsl = self
            .dsl
            .iter()
            .map(|source| {
                Expression::compile(source)
                    .map_err(|e| TemplarError::Compile(format!("matcher '{}': invalid dsl '{}': {}", label, source, e)))
            })
            .collect::<Result<_, _>>()?;
        self.compiled_xpath = self.xpath.iter().map(|e| XPath::compile(e)).collect::<Result<_, _>>()?;
        if self.case_insensitive {
            self.words = self.words.iter().map(|w| w.to_lowercase()).collect();
        }
        Ok(())
    }

    /// Flip the result for negative matchers. Snippets are meaningless once
    /// negated and are dropped.
    pub fn result(&self, matched: bool) -> bool {
        if self.negative {
            !matched
        } else {
            matched
        }
    }

    pub fn result_with_snippets(&self, matched: bool, snippets: Vec<String>) -> (bool, Vec<String>) {
        if self.negative {
            (!matched, Vec::new())
        } else {
            (matched, snippets)
        }
    }

    /// Combine per-value outcomes according to the condition. Returns early
    /// once the outcome is settled, unless `match-all` asks for every snippet.
    fn combine<I>(&self, outcomes: I) -> (bool, Vec<String>)
    where
        I: IntoIterator<Item = Option<Vec<String>>>,
    {
        let mut snippets = Vec::new();
        let mut any = false;
        for outcome in outcomes {
            match outcome {
                None if self.condition == Condition::And => return (false, Vec::new()),
                None => continue,
                Some(found) => {
                    any = true;
                    snippets.extend(found);
                    if self.condition == Condition::Or && !self.match_all {
                        break;
                    }
                }
            }
        }
        (any, snippets)
    }

    /// Words may carry `{{var}}` markers resolved from the response data.
    pub fn match_words(&self, corpus: &str, data: &InternalEvent) -> (bool, Vec<String>) {
        let corpus = if self.case_insensitive { corpus.to_lowercase() } else { corpus.to_string() };
        self.combine(self.words.iter().map(|word| {
            let word = if word.contains("{{") { replacer::replace(word, data) } else { word.clone() };
            corpus.contains(&word).then(|| vec![word])
        }))
    }

    pub fn match_regex(&self, corpus: &str) -> (bool, Vec<String>) {
        self.combine(self.compiled_regex.iter().map(|re| {
            let found: Vec<String> = if self.match_all {
                re.find_iter(corpus).map(|m| m.as_str().to_string()).collect()
            } else {
                re.find(corpus).map(|m| vec![m.as_str().to_string()]).unwrap_or_default()
            };
            (!found.is_empty()).then_some(found)
        }))
    }

    pub fn match_binary(&self, corpus: &[u8]) -> (bool, Vec<String>) {
        self.combine(self.compiled_binary.iter().zip(&self.binary).map(|(needle, raw)| {
            let found = !needle.is_empty() && corpus.windows(needle.len()).any(|window| window == needle.as_slice());
            found.then(|| vec![raw.clone()])
        }))
    }

    pub fn match_status(&self, status: u16) -> bool {
        self.status.contains(&status)
    }

    /// Exact match on byte length.
    pub fn match_size(&self, length: usize) -> bool {
        self.size.contains(&length)
    }

    /// Evaluation errors count as "no match" and are logged.
    pub fn match_dsl(&self, data: &InternalEvent) -> bool {
        let mut env = data.clone();
        let mut outcomes = Vec::with_capacity(self.compiled_dsl.len());
        for expression in &self.compiled_dsl {
            let matched = match expression.evaluate(&mut env) {
                Ok(value) => dsl::truthy(&value),
                Err(e) => {
                    warn!(expression = %expression.source(), error = %e, "DSL matcher evaluation failed");
                    false
                }
            };
            if !matched && self.condition == Condition::And {
                return false;
            }
            if matched && self.condition == Condition::Or {
                return true;
            }
            outcomes.push(matched);
        }
        outcomes.iter().any(|m| *m)
    }

    pub fn match_xpath(&self, corpus: &str) -> bool {
        let document = parse_document(corpus);
        let outcomes = self.compiled_xpath.iter().map(|xpath| (!xpath.select(&document).is_empty()).then(Vec::new));
        self.combine(outcomes).0
    }
}

/// Read a numeric response field such as `status_code`.
pub fn numeric_field(data: &InternalEvent, key: &str) -> Option<u64> {
    match data.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matcher(yaml: &str) -> Matcher {
        let mut m: Matcher = serde_yaml::from_str(yaml).unwrap();
        m.compile().unwrap();
        m
    }

    fn data() -> InternalEvent {
        json!({"body": "Hello Admin Panel", "status_code": 200, "host": "example.com"})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_words_or_and() {
        let or = matcher("type: word\nwords: [missing, Admin]\n");
        assert!(or.match_words("Hello Admin", &data()).0);
        let and = matcher("type: words\ncondition: and\nwords: [missing, Admin]\n");
        assert!(!and.match_words("Hello Admin", &data()).0);
    }

    #[test]
    fn test_words_case_insensitive_and_templated() {
        let m = matcher("type: word\ncase-insensitive: true\nwords: [ADMIN]\n");
        assert_eq!(m.match_words("hello admin", &data()), (true, vec!["admin".to_string()]));
        let templated = matcher("type: word\nwords: ['{{host}}']\n");
        assert!(templated.match_words("redirect to example.com", &data()).0);
    }

    #[test]
    fn test_regex_match_all() {
        let m = matcher("type: regex\nmatch-all: true\nregex: ['\\d+']\n");
        assert_eq!(m.match_regex("a1 b22 c333").1, vec!["1", "22", "333"]);
        let first = matcher("type: regex\nregex: ['\\d+']\n");
        assert_eq!(first.match_regex("a1 b22").1, vec!["1"]);
    }

    #[test]
    fn test_binary_and_size() {
        let m = matcher("type: binary\nbinary: ['504b0304']\n");
        assert!(m.match_binary(b"xxPK\x03\x04yy").0);
        let size = matcher("type: size\nsize: [5]\n");
        assert!(size.match_size("hello".len()));
        assert!(!size.match_size("hello!".len()));
    }

    #[test]
    fn test_dsl_errors_are_no_match() {
        let ok = matcher("type: dsl\ndsl: ['status_code == 200 && contains(body, \"Admin\")']\n");
        assert!(ok.match_dsl(&data()));
        let broken = matcher("type: dsl\ndsl: ['undefined_var == 1']\n");
        assert!(!broken.match_dsl(&data()));
    }

    #[test]
    fn test_negative() {
        let m = matcher("type: word\nnegative: true\nwords: [Admin]\n");
        let (matched, snippets) = m.match_words("Hello Admin", &data());
        assert_eq!(m.result_with_snippets(matched, snippets), (false, Vec::new()));
    }

    #[test]
    fn test_compile_errors() {
        let mut empty: Matcher = serde_yaml::from_str("type: regex\n").unwrap();
        assert!(empty.compile().is_err());
        let mut bad: Matcher = serde_yaml::from_str("type: binary\nbinary: ['zz']\n").unwrap();
        assert!(bad.compile().is_err());
    }

    #[test]
    fn test_xpath_matcher() {
        let m = matcher("type: xpath\nxpath: ['//title']\n");
        assert!(m.match_xpath("<html><title>x</title></html>"));
        assert!(!m.match_xpath("<html></html>"));
    }

    #[test]
    fn test_numeric_field() {
        assert_eq!(numeric_field(&data(), "status_code"), Some(200));
        assert_eq!(numeric_field(&data(), "missing"), None);
    }
}
