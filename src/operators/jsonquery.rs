//! Path queries over JSON documents for `json` extractors.
//!
//! Supported forms: `.` (identity), `.key`, `.["key"]`, `.[0]`, `.[-1]`,
//! `.[]` (iterate), chained (`.data.items[].name`) and piped
//! (`.data.items[] | .name`). A leading `$` is accepted as an alias for `.`.

use serde_json::Value;

use crate::errors::TemplarError;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(i64),
    Iterate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonQuery {
    source: String,
    segments: Vec<Segment>,
}

impl JsonQuery {
    pub fn compile(source: &str) -> Result<Self, TemplarError> {
        let mut segments = Vec::new();
        for stage in source.split('|') {
            segments.extend(parse_stage(stage.trim(), source)?);
        }
        Ok(Self { source: source.to_string(), segments })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `document`. Missing keys and out-of-range indexes
    /// produce no output rather than `null`.
    pub fn evaluate<'a>(&self, document: &'a Value) -> Vec<&'a Value> {
        let mut current = vec![document];
        for segment in &self.segments {
            let mut next = Vec::new();
            for value in current {
                match (segment, value) {
                    (Segment::Key(key), Value::Object(map)) => next.extend(map.get(key)),
                    (Segment::Index(index), Value::Array(items)) => {
                        let resolved = if *index < 0 { items.len() as i64 + index } else { *index };
                        if resolved >= 0 {
                            next.extend(items.get(resolved as usize));
                        }
                    }
                    (Segment::Iterate, Value::Array(items)) => next.extend(items.iter()),
                    (Segment::Iterate, Value::Object(map)) => next.extend(map.values()),
                    _ => {}
                }
            }
            current = next;
            if current.is_empty() {
                break;
            }
        }
        current.into_iter().filter(|v| !v.is_null()).collect()
    }
}

fn invalid(query: &str, message: &str) -> TemplarError {
    TemplarError::Compile(format!("invalid json query '{}': {}", query, message))
}

fn parse_stage(stage: &str, query: &str) -> Result<Vec<Segment>, TemplarError> {
    let stage = stage.strip_prefix('$').map(|rest| if rest.is_empty() { "." } else { rest }).unwrap_or(stage);
    if !stage.starts_with('.') && !stage.starts_with('[') {
        return Err(invalid(query, "each stage must start with '.'"));
    }

    let bytes = stage.as_bytes();
    let mut segments = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                i += 1;
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || matches!(bytes[i], b'_' | b'-' | b'$')) {
                    i += 1;
                }
                if i > start {
                    segments.push(Segment::Key(stage[start..i].to_string()));
                }
            }
            b'[' => {
                let close = stage[i..].find(']').map(|offset| i + offset).ok_or_else(|| invalid(query, "unclosed '['"))?;
                let inner = stage[i + 1..close].trim();
                if inner.is_empty() {
                    segments.push(Segment::Iterate);
                } else if let Some(key) = inner
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .or_else(|| inner.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
                {
                    segments.push(Segment::Key(key.to_string()));
                } else {
                    let index = inner.parse::<i64>().map_err(|_| invalid(query, "index must be an integer"))?;
                    segments.push(Segment::Index(index));
                }
                i = close + 1;
            }
            b' ' => i += 1,
            other => return Err(invalid(query, &format!("unexpected '{}'", other as char))),
        }
    }
    Ok(segments)
}

/// Render a selected JSON value as extractor output.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
