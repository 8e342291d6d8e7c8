use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Leaf value carried by a triple.
///
/// `Null` doubles as the retraction marker: a `_collection` leaf whose winning
/// value is `Null` tombstones the whole entity.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, PartialOrd)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Null,
    Bool,
    I64,
    F64,
    String,
}

impl ValueType {
    pub fn of(v: &Value) -> Self {
        match v {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::I64(_) => ValueType::I64,
            Value::F64(_) => ValueType::F64,
            Value::String(_) => ValueType::String,
        }
    }
}

impl Value {
    pub fn is_null(&self) -> bool { matches!(self, Value::Null) }

    /// Canonical rendering used when a set member value becomes an attribute
    /// path segment.
    pub fn as_path_segment(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::I64(i) => i.to_string(),
            Value::F64(f) => f.to_string(),
            Value::String(s) => s.clone(),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{:?}", b),
            Value::I64(i) => write!(f, "{:?}", i),
            Value::F64(float) => write!(f, "{:?}", float),
            Value::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::String(s.to_string()) }
}
impl From<String> for Value {
    fn from(s: String) -> Self { Value::String(s) }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self { Value::I64(i) }
}
impl From<i32> for Value {
    fn from(i: i32) -> Self { Value::I64(i as i64) }
}
impl From<f64> for Value {
    fn from(f: f64) -> Self { Value::F64(f) }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self { Value::Bool(b) }
}

impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::I64(i) => serde_json::Value::from(*i),
            Value::F64(f) => serde_json::Number::from_f64(*f).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}
