//! Scalar values exchanged between entities, the tracker and storage.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// The semantic type of a mapped field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Integer,
    Real,
    Text,
    Boolean,
}

impl FieldType {
    /// Column type used in generated DDL.
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Integer => "INTEGER",
            FieldType::Real => "REAL",
            FieldType::Text => "TEXT",
            FieldType::Boolean => "BOOLEAN",
        }
    }

    /// Parse a declared column type as reported by introspection.
    pub fn from_sql_type(declared: &str) -> Option<FieldType> {
        match declared.trim().to_ascii_uppercase().as_str() {
            "INTEGER" | "INT" | "BIGINT" => Some(FieldType::Integer),
            "REAL" | "DOUBLE" | "FLOAT" => Some(FieldType::Real),
            "TEXT" | "VARCHAR" | "STRING" => Some(FieldType::Text),
            "BOOLEAN" | "BOOL" => Some(FieldType::Boolean),
            _ => None,
        }
    }

    /// Whether values of this type have a meaningful ordering for `<`/`>`.
    pub fn is_ordered(&self) -> bool {
        !matches!(self, FieldType::Boolean)
    }
}

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The field type this value belongs to, `None` for `Null`.
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Value::Null => None,
            Value::Integer(_) => Some(FieldType::Integer),
            Value::Real(_) => Some(FieldType::Real),
            Value::Text(_) => Some(FieldType::Text),
            Value::Boolean(_) => Some(FieldType::Boolean),
        }
    }

    /// Whether this value may be stored in a field of type `ty`.
    /// Integers are accepted for real fields.
    pub fn fits(&self, ty: FieldType) -> bool {
        match (self, ty) {
            (Value::Null, _) => true,
            (Value::Integer(_), FieldType::Real) => true,
            (v, ty) => v.field_type() == Some(ty),
        }
    }

    /// The hashable key form of this value, if it can be a primary key.
    pub fn as_key(&self) -> Option<KeyValue> {
        match self {
            Value::Integer(i) => Some(KeyValue::Integer(*i)),
            Value::Text(s) => Some(KeyValue::Text(s.clone())),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Total order used for sorting rows: `Null` sorts first, like sqlite.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            _ => self.partial_cmp_non_null(other).unwrap_or(Ordering::Equal),
        }
    }

    /// Comparison between two non-null values of compatible types.
    pub fn partial_cmp_non_null(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Real(a), Value::Real(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Real(b)) => (*a as f64).partial_cmp(b),
            (Value::Real(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Convert a JSON scalar produced by serde into a value of type `ty`.
    pub(crate) fn from_json(json: &serde_json::Value, ty: FieldType) -> Option<Value> {
        match (json, ty) {
            (serde_json::Value::Null, _) => Some(Value::Null),
            (serde_json::Value::Number(n), FieldType::Integer) => n.as_i64().map(Value::Integer),
            (serde_json::Value::Number(n), FieldType::Real) => n.as_f64().map(Value::Real),
            (serde_json::Value::String(s), FieldType::Text) => Some(Value::Text(s.clone())),
            (serde_json::Value::Bool(b), FieldType::Boolean) => Some(Value::Boolean(*b)),
            _ => None,
        }
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Real(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Boolean(b) => write!(f, "{}", b),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Hashable primary-key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    Integer(i64),
    Text(String),
}

impl KeyValue {
    pub fn to_value(&self) -> Value {
        match self {
            KeyValue::Integer(i) => Value::Integer(*i),
            KeyValue::Text(s) => Value::Text(s.clone()),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Integer(i) => write!(f, "{}", i),
            KeyValue::Text(s) => write!(f, "'{}'", s),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Integer(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Text(v.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::Text(v)
    }
}

/// One row of field values in descriptor field order.
pub type Row = Vec<Value>;
