use serde_json::Value;

use super::functions;
use super::parser::{BinaryOp, Expr, UnaryOp};
use super::{as_number, number, to_text, truthy, DslError};

/// Resolves names the evaluator does not know about itself.
///
/// Matchers resolve variables against the flattened response map.
pub trait Environment {
    fn variable(&mut self, name: &str) -> Option<Value>;

    /// Return `None` to fall back to the built-in helper functions.
    fn call(&mut self, _name: &str, _args: &[Value]) -> Option<Result<Value, DslError>> {
        None
    }
}

impl Environment for serde_json::Map<String, Value> {
    fn variable(&mut self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

pub struct Evaluator<'e> {
    env: &'e mut dyn Environment,
}

impl<'e> Evaluator<'e> {
    pub fn new(env: &'e mut dyn Environment) -> Self {
        Self { env }
    }

    fn lookup(&mut self, name: &str) -> Result<Value, DslError> {
        self.env
            .variable(name)
            .ok_or_else(|| DslError::UnknownVariable(name.to_string()))
    }

    pub fn eval(&mut self, expr: &Expr) -> Result<Value, DslError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => self.lookup(name),
            Expr::Array(items) => {
                let values = items.iter().map(|e| self.eval(e)).collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(values))
            }
            Expr::Unary(op, inner) => {
                let value = self.eval(inner)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                    UnaryOp::Neg => as_number(&value)
                        .map(|n| number(-n))
                        .ok_or_else(|| DslError::Type(format!("cannot negate {}", value))),
                }
            }
            Expr::And(left, right) => {
                if !truthy(&self.eval(left)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&self.eval(right)?)))
            }
            Expr::Or(left, right) => {
                if truthy(&self.eval(left)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&self.eval(right)?)))
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(*op, &left, &right)
            }
            Expr::Call(name, args) => {
                let values = args.iter().map(|e| self.eval(e)).collect::<Result<Vec<_>, _>>()?;
                if let Some(result) = self.env.call(name, &values) {
                    return result;
                }
                functions::call(name, &values)
            }
            Expr::Member(target, name) => {
                let target = self.eval(target)?;
                Ok(member(&target, name))
            }
            Expr::Index(target, index) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                Ok(match (&target, &index) {
                    (Value::Array(items), idx) => as_number(idx)
                        .and_then(|n| items.get(n as usize).cloned())
                        .unwrap_or(Value::Null),
                    (Value::String(s), idx) => as_number(idx)
                        .and_then(|n| s.chars().nth(n as usize))
                        .map(|c| Value::String(c.to_string()))
                        .unwrap_or(Value::Null),
                    (_, key) => member(&target, &to_text(key)),
                })
            }
        }
    }
}

fn member(target: &Value, name: &str) -> Value {
    match (target, name) {
        (Value::Object(map), _) => map.get(name).cloned().unwrap_or(Value::Null),
        (Value::Array(items), "length") => Value::from(items.len()),
        (Value::String(s), "length") => Value::from(s.chars().count()),
        _ => Value::Null,
    }
}

pub fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        _ => to_text(left) == to_text(right),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, DslError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(left, right))),
        BinaryOp::NotEq => Ok(Value::Bool(!loose_eq(left, right))),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let ordering = match (as_number(left), as_number(right)) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => Some(to_text(left).cmp(&to_text(right))),
            };
            let Some(ordering) = ordering else {
                return Ok(Value::Bool(false));
            };
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::LtEq => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::Add => match (left, right) {
            (Value::Number(_), Value::Number(_)) => arithmetic(op, left, right),
            (Value::String(_), _) | (_, Value::String(_)) => {
                Ok(Value::String(format!("{}{}", to_text(left), to_text(right))))
            }
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
            }
            _ => arithmetic(op, left, right),
        },
        _ => arithmetic(op, left, right),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, DslError> {
    let (Some(a), Some(b)) = (as_number(left), as_number(right)) else {
        return Err(DslError::Type(format!("cannot apply {:?} to {} and {}", op, left, right)));
    };
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => {
            return Err(DslError::Type("division by zero".into()));
        }
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        _ => return Err(DslError::Type(format!("{:?} is not arithmetic", op))),
    };
    Ok(number(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::Expression;
    use serde_json::json;

    fn data() -> serde_json::Map<String, Value> {
        json!({
            "status_code": 200,
            "body": "Welcome admin",
            "content_length": "13",
            "tags": ["a", "b"],
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn eval(source: &str) -> Value {
        Expression::compile(source).unwrap().evaluate(&mut data()).unwrap()
    }

    #[test]
    fn test_comparisons_are_numeric_when_possible() {
        assert_eq!(eval("status_code == 200"), json!(true));
        assert_eq!(eval("content_length > 9"), json!(true));
        assert_eq!(eval("status_code == '200'"), json!(true));
        assert_eq!(eval("'abc' < 'abd'"), json!(true));
    }

    #[test]
    fn test_arithmetic_and_concat() {
        assert_eq!(eval("1 + 2 * 3"), json!(7));
        assert_eq!(eval("7 / 2"), json!(3.5));
        assert_eq!(eval("'v' + 1"), json!("v1"));
        assert!(Expression::compile("1 / 0").unwrap().evaluate(&mut data()).is_err());
    }

    #[test]
    fn test_member_and_index() {
        assert_eq!(eval("tags[1]"), json!("b"));
        assert_eq!(eval("tags.length"), json!(2));
        assert_eq!(eval("body[0]"), json!("W"));
    }

    #[test]
    fn test_unknown_variable_is_error() {
        let result = Expression::compile("missing == 1").unwrap().evaluate(&mut data());
        assert!(matches!(result, Err(DslError::UnknownVariable(name)) if name == "missing"));
    }

    struct Counting {
        calls: Vec<String>,
    }

    impl Environment for Counting {
        fn variable(&mut self, _name: &str) -> Option<Value> {
            None
        }

        fn call(&mut self, name: &str, _args: &[Value]) -> Option<Result<Value, DslError>> {
            match name {
                "yes" | "no" => {
                    self.calls.push(name.to_string());
                    Some(Ok(Value::Bool(name == "yes")))
                }
                _ => None,
            }
        }
    }

    #[test]
    fn test_logical_operators_short_circuit() {
        let mut env = Counting { calls: Vec::new() };
        let value = Expression::compile("no() && yes()").unwrap().evaluate(&mut env).unwrap();
        assert_eq!(value, json!(false));
        assert_eq!(env.calls, vec!["no"]);

        let mut env = Counting { calls: Vec::new() };
        Expression::compile("yes() || no()").unwrap().evaluate(&mut env).unwrap();
        assert_eq!(env.calls, vec!["yes"]);
    }
}
