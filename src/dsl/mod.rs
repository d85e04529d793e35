//! Small expression language.
//!
//! Expressions drive DSL matchers and extractors and `{{...}}` markers that are
//! not plain variables. Values are `serde_json::Value`s so response maps can be
//! used directly as variable environments.

mod eval;
pub mod functions;
mod lexer;
mod parser;

pub use eval::{loose_eq, Environment, Evaluator};
pub use parser::Expr;

use parser::Parser;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DslError {
    #[error("syntax error at offset {pos}: {message}")]
    Syntax { pos: usize, message: String },

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{name}() expects at least {expected} arguments, got {got}")]
    Arity { name: String, expected: usize, got: usize },

    #[error("type error: {0}")]
    Type(String),
}

/// A compiled single expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    expr: Expr,
}

impl Expression {
    pub fn compile(source: &str) -> Result<Self, DslError> {
        let expr = Parser::new(source)?.parse_expression()?;
        Ok(Self { source: source.to_string(), expr })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, env: &mut dyn Environment) -> Result<Value, DslError> {
        Evaluator::new(env).eval(&self.expr)
    }

    pub fn evaluate_bool(&self, env: &mut dyn Environment) -> Result<bool, DslError> {
        self.evaluate(env).map(|v| truthy(&v))
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Integral results stay integers so that `200 + 0` renders as `200`.
pub fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

/// Render a value the way it is substituted into requests.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items.first().map(to_text).unwrap_or_default(),
        Value::Object(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!([1])));
    }

    #[test]
    fn test_to_text_renders_first_array_item() {
        assert_eq!(to_text(&json!(["10.0.0.1", "10.0.0.2"])), "10.0.0.1");
        assert_eq!(to_text(&json!(200)), "200");
        assert_eq!(to_text(&number(3.0)), "3");
    }

    #[test]
    fn test_evaluate_bool() {
        let mut env = json!({"status_code": 404}).as_object().cloned().unwrap();
        let expr = Expression::compile("status_code != 200").unwrap();
        assert!(expr.evaluate_bool(&mut env).unwrap());
    }
}
