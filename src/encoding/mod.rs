//! Typed column values exchanged with the persistence layer, and their
//! conversions.
//!
//! `text` converts values to and from the textual form used by text-oriented
//! backends and dumps, `bincode` serializes journal entries, and `format`
//! renders rows for humans.

pub mod bincode;
pub mod format;
pub mod text;

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Column type of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Int,
    BigInt,
    Double,
    String,
    Blob,
    DateTime,
    Bitmap,
}

/// A single nullable column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i32),
    BigInt(i64),
    Double(f64),
    String(String),
    Blob(Vec<u8>),
    /// Seconds since the unix epoch, UTC.
    DateTime(i64),
    Bitmap(u32),
}

impl Value {
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => None,
            Value::Int(_) => Some(ValueType::Int),
            Value::BigInt(_) => Some(ValueType::BigInt),
            Value::Double(_) => Some(ValueType::Double),
            Value::String(_) => Some(ValueType::String),
            Value::Blob(_) => Some(ValueType::Blob),
            Value::DateTime(_) => Some(ValueType::DateTime),
            Value::Bitmap(_) => Some(ValueType::Bitmap),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view of any integral value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v as i64),
            Value::BigInt(v) | Value::DateTime(v) => Some(*v),
            Value::Bitmap(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Orders two values of compatible types. NULL is only comparable to NULL.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Blob(a), Value::Blob(b)) => Some(a.cmp(b)),
            (Value::Double(_), _) | (_, Value::Double(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            }
            _ => Some(self.as_i64()?.cmp(&other.as_i64()?)),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Error type for encoding operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodingError {
    #[error("Invalid encoding format: {0}")]
    InvalidFormat(String),
    #[error("Truncated data")]
    TruncatedData,
    #[error("Invalid UTF-8 sequence")]
    InvalidUtf8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_mixed_integral_types() {
        assert_eq!(Value::Int(5).compare(&Value::BigInt(7)), Some(Ordering::Less));
        assert_eq!(
            Value::DateTime(100).compare(&Value::BigInt(100)),
            Some(Ordering::Equal)
        );
        assert_eq!(Value::Double(0.5).compare(&Value::Int(1)), Some(Ordering::Less));
    }

    #[test]
    fn test_null_only_compares_with_null() {
        assert_eq!(Value::Null.compare(&Value::Null), Some(Ordering::Equal));
        assert_eq!(Value::Null.compare(&Value::Int(0)), None);
        assert_eq!(Value::from("a").compare(&Value::Int(1)), None);
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(Value::from(None::<String>), Value::Null);
        assert_eq!(Value::from(Some("path")), Value::String("path".into()));
        assert_eq!(Value::from(Some("x")).value_type(), Some(ValueType::String));
    }
}
