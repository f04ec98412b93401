//! Scalar values carried through streams and the parameter table

use analyst_rdbc::Value;
use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EngineError, Result};

/// Timestamp rendering used for text output
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One value in a row
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Scalar {
    /// Absent value
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// Any integer, widened to 64 bits
    Int(i64),
    /// Any float, widened to 64 bits
    Float(f64),
    /// Text
    Text(String),
    /// Date and time without zone
    Timestamp(NaiveDateTime),
}

/// A row: values position-aligned with the stream columns
pub type Row = Vec<Scalar>;

impl Scalar {
    /// Check if value is NULL
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Normalize a driver value
    ///
    /// Byte buffers must hold UTF-8 text; anything else is a decode error.
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Int8(n) => Self::Int(i64::from(n)),
            Value::Int16(n) => Self::Int(i64::from(n)),
            Value::Int32(n) => Self::Int(i64::from(n)),
            Value::Int64(n) => Self::Int(n),
            Value::Float32(n) => Self::Float(f64::from(n)),
            Value::Float64(n) => Self::Float(n),
            Value::String(s) => Self::Text(s),
            Value::Bytes(b) => Self::Text(String::from_utf8(b).map_err(|e| {
                EngineError::Decode(format!("byte column is not valid UTF-8: {}", e))
            })?),
            Value::Date(d) => Self::Timestamp(d.and_time(NaiveTime::MIN)),
            Value::DateTime(dt) => Self::Timestamp(dt),
            Value::DateTimeTz(dt) => Self::Timestamp(dt.naive_utc()),
            Value::Json(j) => Self::Text(j.to_string()),
        })
    }

    /// Convert to a driver value for binding
    pub fn to_value(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(n) => Value::Int64(*n),
            Self::Float(n) => Value::Float64(*n),
            Self::Text(s) => Value::String(s.clone()),
            Self::Timestamp(ts) => Value::DateTime(*ts),
        }
    }

    /// Render as a JSON value
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(n) => serde_json::Value::from(*n),
            Self::Float(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Timestamp(ts) => {
                serde_json::Value::String(ts.format(TIMESTAMP_FORMAT).to_string())
            }
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(n) => write!(f, "{}", n),
            Self::Float(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{}", s),
            Self::Timestamp(ts) => write!(f, "{}", ts.format(TIMESTAMP_FORMAT)),
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<NaiveDateTime> for Scalar {
    fn from(v: NaiveDateTime) -> Self {
        Self::Timestamp(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_integers_and_floats_widen() {
        assert_eq!(Scalar::from_value(Value::Int8(-4)).unwrap(), Scalar::Int(-4));
        assert_eq!(Scalar::from_value(Value::Int32(7)).unwrap(), Scalar::Int(7));
        assert_eq!(
            Scalar::from_value(Value::Float32(0.5)).unwrap(),
            Scalar::Float(0.5)
        );
    }

    #[test]
    fn test_bytes_decode_to_text() {
        assert_eq!(
            Scalar::from_value(Value::Bytes(b"abc".to_vec())).unwrap(),
            Scalar::Text("abc".into())
        );
        let err = Scalar::from_value(Value::Bytes(vec![0xc3, 0x28])).unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }

    #[test]
    fn test_date_becomes_midnight() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let scalar = Scalar::from_value(Value::Date(date)).unwrap();
        assert_eq!(scalar.to_string(), "2024-02-29 00:00:00");
    }

    #[test]
    fn test_json_renders_to_text() {
        let scalar = Scalar::from_value(Value::Json(serde_json::json!({"a": 1}))).unwrap();
        assert_eq!(scalar, Scalar::Text(r#"{"a":1}"#.into()));
    }

    #[test]
    fn test_to_json() {
        assert_eq!(Scalar::Int(3).to_json(), serde_json::json!(3));
        assert_eq!(Scalar::Float(f64::NAN).to_json(), serde_json::Value::Null);
        assert_eq!(Scalar::Null.to_json(), serde_json::Value::Null);
    }
}
