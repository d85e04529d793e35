//! `{{marker}}` substitution in request templates.
//!
//! A marker naming a known variable is replaced by its value. Any other
//! marker is evaluated as an expression against the variables; if that
//! fails it is left in place and reported by [`unresolved`].

use serde_json::{Map, Value};

use crate::dsl::{self, Expression};
use crate::errors::TemplarError;

/// Byte ranges `(start, end)` of each `{{...}}` marker, `end` exclusive.
fn marker_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut offset = 0;
    while let Some(open) = text[offset..].find("{{") {
        let start = offset + open;
        let Some(close) = text[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + close + 2;
        spans.push((start, end));
        offset = end;
    }
    spans
}

fn resolve(inner: &str, values: &Map<String, Value>) -> Option<String> {
    let name = inner.trim();
    if let Some(value) = values.get(name) {
        return Some(dsl::to_text(value));
    }
    let expression = Expression::compile(name).ok()?;
    let mut env = values.clone();
    expression.evaluate(&mut env).ok().map(|value| dsl::to_text(&value))
}

/// Substitute every resolvable marker.
pub fn replace(template: &str, values: &Map<String, Value>) -> String {
    let spans = marker_spans(template);
    if spans.is_empty() {
        return template.to_string();
    }
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for (start, end) in spans {
        out.push_str(&template[last..start]);
        match resolve(&template[start + 2..end - 2], values) {
            Some(value) => out.push_str(&value),
            None => out.push_str(&template[start..end]),
        }
        last = end;
    }
    out.push_str(&template[last..]);
    out
}

/// Names of markers still present in `text`.
pub fn unresolved(text: &str) -> Vec<String> {
    marker_spans(text)
        .into_iter()
        .map(|(start, end)| text[start + 2..end - 2].trim().to_string())
        .collect()
}

/// Substitute markers and fail if any remain.
pub fn replace_strict(template: &str, values: &Map<String, Value>) -> Result<String, TemplarError> {
    let out = replace(template, values);
    let missing = unresolved(&out);
    if missing.is_empty() {
        Ok(out)
    } else {
        Err(TemplarError::UnresolvedVariables(missing.join(", ")))
    }
}

/// Evaluate template-level variables in declaration order. Each variable
/// may reference the values and the variables declared before it.
pub fn evaluate_variables(variables: &[(String, String)], values: &Map<String, Value>) -> Map<String, Value> {
    let mut scope = values.clone();
    let mut out = Map::new();
    for (name, raw) in variables {
        let value = Value::String(replace(raw, &scope));
        scope.insert(name.clone(), value.clone());
        out.insert(name.clone(), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values() -> Map<String, Value> {
        json!({"BaseURL": "http://a.com", "token": "abc", "ports": ["80", "443"], "n": 2})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_plain_variables() {
        assert_eq!(replace("{{BaseURL}}/login?t={{ token }}", &values()), "http://a.com/login?t=abc");
        assert_eq!(replace("{{ports}}", &values()), "80");
    }

    #[test]
    fn test_expression_markers() {
        assert_eq!(replace("{{to_upper(token)}}-{{n + 1}}", &values()), "ABC-3");
    }

    #[test]
    fn test_unresolved_left_in_place() {
        let out = replace("{{BaseURL}}/{{interactsh-url}}", &values());
        assert_eq!(out, "http://a.com/{{interactsh-url}}");
        assert_eq!(unresolved(&out), vec!["interactsh-url"]);
        assert!(matches!(replace_strict(&out, &values()), Err(TemplarError::UnresolvedVariables(v)) if v == "interactsh-url"));
    }

    #[test]
    fn test_unbalanced_braces_untouched() {
        assert_eq!(replace("{{token", &values()), "{{token");
        assert!(unresolved("{ {x} }").is_empty());
    }

    #[test]
    fn test_variables_see_earlier_variables() {
        let vars = vec![("a".to_string(), "{{token}}1".to_string()), ("b".to_string(), "{{a}}2".to_string())];
        let out = evaluate_variables(&vars, &values());
        assert_eq!(out["b"], json!("abc12"));
    }
}
