//! Helper functions available to every expression.

use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use super::{as_number, number, to_text, DslError};

/// Patterns compiled by `regex()`, shared by every expression.
static REGEX_CACHE: LazyLock<DashMap<String, Regex>> = LazyLock::new(DashMap::new);

/// Entries kept before the cache is reset.
const REGEX_CACHE_LIMIT: usize = 4096;

fn cached_regex(pattern: &str) -> Result<Regex, DslError> {
    if let Some(re) = REGEX_CACHE.get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(pattern).map_err(|e| DslError::Type(format!("invalid regex '{}': {}", pattern, e)))?;
    if REGEX_CACHE.len() >= REGEX_CACHE_LIMIT {
        REGEX_CACHE.clear();
    }
    REGEX_CACHE.insert(pattern.to_string(), re.clone());
    Ok(re)
}

fn arity(name: &str, args: &[Value], min: usize) -> Result<(), DslError> {
    if args.len() < min {
        return Err(DslError::Arity { name: name.to_string(), expected: min, got: args.len() });
    }
    Ok(())
}

fn contains_one(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| super::eval::loose_eq(item, needle)),
        Value::Object(map) => map.contains_key(&to_text(needle)),
        other => to_text(other).contains(&to_text(needle)),
    }
}

/// Flatten arguments so that array arguments contribute their elements.
fn flatten(args: &[Value]) -> Vec<Value> {
    args.iter()
        .flat_map(|arg| match arg {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        })
        .collect()
}

pub fn call(name: &str, args: &[Value]) -> Result<Value, DslError> {
    match name {
        "contains" => {
            arity(name, args, 2)?;
            Ok(Value::Bool(contains_one(&args[0], &args[1])))
        }
        "contains_all" => {
            arity(name, args, 2)?;
            Ok(Value::Bool(args[1..].iter().all(|n| contains_one(&args[0], n))))
        }
        "contains_any" => {
            arity(name, args, 2)?;
            Ok(Value::Bool(args[1..].iter().any(|n| contains_one(&args[0], n))))
        }
        "starts_with" => {
            arity(name, args, 2)?;
            let text = to_text(&args[0]);
            Ok(Value::Bool(args[1..].iter().any(|p| text.starts_with(&to_text(p)))))
        }
        "ends_with" => {
            arity(name, args, 2)?;
            let text = to_text(&args[0]);
            Ok(Value::Bool(args[1..].iter().any(|p| text.ends_with(&to_text(p)))))
        }
        "len" => {
            arity(name, args, 1)?;
            let len = match &args[0] {
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => to_text(other).chars().count(),
            };
            Ok(Value::from(len))
        }
        "to_lower" => {
            arity(name, args, 1)?;
            Ok(Value::String(to_text(&args[0]).to_lowercase()))
        }
        "to_upper" => {
            arity(name, args, 1)?;
            Ok(Value::String(to_text(&args[0]).to_uppercase()))
        }
        "trim" => {
            arity(name, args, 1)?;
            Ok(Value::String(to_text(&args[0]).trim().to_string()))
        }
        "replace" => {
            arity(name, args, 3)?;
            Ok(Value::String(to_text(&args[0]).replace(&to_text(&args[1]), &to_text(&args[2]))))
        }
        "regex" => {
            arity(name, args, 2)?;
            let re = cached_regex(&to_text(&args[0]))?;
            Ok(Value::Bool(re.is_match(&to_text(&args[1]))))
        }
        "to_number" => {
            arity(name, args, 1)?;
            as_number(&args[0])
                .map(number)
                .ok_or_else(|| DslError::Type(format!("'{}' is not a number", to_text(&args[0]))))
        }
        "to_string" => {
            arity(name, args, 1)?;
            Ok(Value::String(to_text(&args[0])))
        }
        "concat" => Ok(Value::String(flatten(args).iter().map(to_text).collect())),
        "join" => {
            arity(name, args, 1)?;
            let separator = to_text(&args[0]);
            let parts: Vec<String> = flatten(&args[1..]).iter().map(to_text).collect();
            Ok(Value::String(parts.join(&separator)))
        }
        "split" => {
            arity(name, args, 2)?;
            let separator = to_text(&args[1]);
            Ok(Value::Array(
                to_text(&args[0])
                    .split(separator.as_str())
                    .map(|s| Value::String(s.to_string()))
                    .collect(),
            ))
        }
        "iterate" => Ok(Value::Array(flatten(args))),
        _ => Err(DslError::UnknownFunction(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_contains_variants() {
        assert_eq!(call("contains", &[json!("hello world"), json!("world")]).unwrap(), json!(true));
        assert_eq!(call("contains", &[json!(["a", "b"]), json!("b")]).unwrap(), json!(true));
        assert_eq!(
            call("contains_all", &[json!("abc"), json!("a"), json!("z")]).unwrap(),
            json!(false)
        );
        assert_eq!(
            call("contains_any", &[json!("abc"), json!("z"), json!("c")]).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_string_helpers() {
        assert_eq!(call("to_lower", &[json!("AbC")]).unwrap(), json!("abc"));
        assert_eq!(call("len", &[json!("héllo")]).unwrap(), json!(5));
        assert_eq!(call("replace", &[json!("a-b"), json!("-"), json!("+")]).unwrap(), json!("a+b"));
        assert_eq!(call("join", &[json!(","), json!(["a", "b"]), json!("c")]).unwrap(), json!("a,b,c"));
        assert_eq!(call("split", &[json!("a,b"), json!(",")]).unwrap(), json!(["a", "b"]));
    }

    #[test]
    fn test_regex_and_numbers() {
        assert_eq!(call("regex", &[json!("^v[0-9]+$"), json!("v12")]).unwrap(), json!(true));
        assert!(call("regex", &[json!("("), json!("x")]).is_err());
        assert_eq!(call("to_number", &[json!("42")]).unwrap(), json!(42));
    }

    #[test]
    fn test_regex_compiled_once_per_pattern() {
        let pattern = "^cache-[a-z]+$";
        assert_eq!(call("regex", &[json!(pattern), json!("cache-hit")]).unwrap(), json!(true));
        let first = REGEX_CACHE.get(pattern).map(|re| re.as_str().to_string());
        assert_eq!(first.as_deref(), Some(pattern));
        assert_eq!(call("regex", &[json!(pattern), json!("cache-1")]).unwrap(), json!(false));
        assert!(REGEX_CACHE.contains_key(pattern));
        assert!(!REGEX_CACHE.contains_key("("));
    }

    #[test]
    fn test_iterate_flattens() {
        assert_eq!(call("iterate", &[json!(["1.1.1.1", "8.8.8.8"]), json!(null)]).unwrap(), json!(["1.1.1.1", "8.8.8.8"]));
    }

    #[test]
    fn test_arity_and_unknown() {
        assert!(matches!(call("contains", &[json!("x")]), Err(DslError::Arity { .. })));
        assert!(matches!(call("nope", &[]), Err(DslError::UnknownFunction(_))));
    }
}
