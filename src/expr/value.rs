//! Tagged value variant for expression evaluation
//!
//! Every value flowing through the evaluator is one of these variants.
//! Operators are implemented as explicit matches over the variant; ill-typed
//! combinations produce a typed evaluation error rather than a silent
//! coercion.

use std::collections::BTreeMap;
use std::fmt;

use super::error::ExprError;

/// A dynamically typed value produced by expression evaluation
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Absent or explicitly null
    Null,
    /// Boolean
    Bool(bool),
    /// Integer number
    Int(i64),
    /// Floating point number
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Ordered list
    List(Vec<Value>),
    /// String-keyed object
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Name of this value's type, used in error messages and type checks
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) | Value::Float(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// True if this value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Interpret this value as a boolean condition
    ///
    /// Only booleans and null participate; everything else is a type error.
    /// Null is falsy so that optional-chain results compose with predicates.
    pub fn as_condition(&self) -> Result<bool, ExprError> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Null => Ok(false),
            other => Err(ExprError::type_mismatch(format!(
                "expected boolean condition, got {}",
                other.type_name()
            ))),
        }
    }

    /// Numeric view of this value, promoting int to float
    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Equality across variants
    ///
    /// Int and float compare numerically; null equals only null; values of
    /// different non-numeric types are unequal (not an error, matching the
    /// comparison semantics of the readiness predicates).
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                self.as_f64() == other.as_f64()
            }
            (a, b) => a == b,
        }
    }

    /// Ordering comparison; only numbers and strings are ordered
    pub fn compare(&self, other: &Value) -> Result<std::cmp::Ordering, ExprError> {
        match (self, other) {
            (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).ok_or_else(|| {
                    ExprError::type_mismatch("NaN is not comparable".to_string())
                }),
                _ => Err(ExprError::type_mismatch(format!(
                    "cannot compare {} with {}",
                    a.type_name(),
                    b.type_name()
                ))),
            },
        }
    }

    /// Arithmetic addition: numbers add, strings concatenate, lists append
    pub fn add(&self, other: &Value) -> Result<Value, ExprError> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => checked(a.checked_add(*b), a, "+", b),
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            (Value::List(a), Value::List(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                Ok(Value::List(out))
            }
            _ => self.numeric_op(other, "+", |a, b| a + b),
        }
    }

    /// Arithmetic subtraction
    pub fn sub(&self, other: &Value) -> Result<Value, ExprError> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => checked(a.checked_sub(*b), a, "-", b),
            _ => self.numeric_op(other, "-", |a, b| a - b),
        }
    }

    /// Arithmetic multiplication
    pub fn mul(&self, other: &Value) -> Result<Value, ExprError> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => checked(a.checked_mul(*b), a, "*", b),
            _ => self.numeric_op(other, "*", |a, b| a * b),
        }
    }

    /// Arithmetic division; division by zero and overflow are typed
    /// evaluation errors
    pub fn div(&self, other: &Value) -> Result<Value, ExprError> {
        match (self, other) {
            (_, Value::Int(0)) => Err(ExprError::eval("division by zero")),
            (Value::Int(a), Value::Int(b)) => checked(a.checked_div(*b), a, "/", b),
            (_, Value::Float(f)) if *f == 0.0 => Err(ExprError::eval("division by zero")),
            _ => self.numeric_op(other, "/", |a, b| a / b),
        }
    }

    /// Arithmetic remainder; integers only
    pub fn rem(&self, other: &Value) -> Result<Value, ExprError> {
        match (self, other) {
            (_, Value::Int(0)) => Err(ExprError::eval("division by zero")),
            (Value::Int(a), Value::Int(b)) => checked(a.checked_rem(*b), a, "%", b),
            (a, b) => Err(ExprError::type_mismatch(format!(
                "operator '%' requires integers, got {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    fn numeric_op(
        &self,
        other: &Value,
        op: &str,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<Value, ExprError> {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Float(f(a, b))),
            _ => Err(ExprError::type_mismatch(format!(
                "operator '{}' requires numbers, got {} and {}",
                op,
                self.type_name(),
                other.type_name()
            ))),
        }
    }

    /// Number of elements in a list, object, or string (`size` built-in)
    pub fn size(&self) -> Result<Value, ExprError> {
        match self {
            Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
            Value::List(l) => Ok(Value::Int(l.len() as i64)),
            Value::Object(m) => Ok(Value::Int(m.len() as i64)),
            other => Err(ExprError::type_mismatch(format!(
                "size() requires string, array, or object, got {}",
                other.type_name()
            ))),
        }
    }
}

fn checked(result: Option<i64>, a: &i64, op: &str, b: &i64) -> Result<Value, ExprError> {
    result
        .map(Value::Int)
        .ok_or_else(|| ExprError::eval(format!("integer overflow in {} {} {}", a, op, b)))
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(a) => Value::List(a.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(m) => {
                Value::Object(m.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::Number(i.into()),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::List(l) => {
                serde_json::Value::Array(l.into_iter().map(serde_json::Value::from).collect())
            }
            Value::Object(m) => serde_json::Value::Object(
                m.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
            // Lists and objects render as JSON when spliced into a string
            other => {
                let json: serde_json::Value = other.clone().into();
                write!(f, "{}", json)
            }
        }
    }
}
