//! Dynamically typed records as they move through the pipeline.
//!
//! Source documents are heterogeneous: the same field may hold a string in
//! one document and a nested map in the next. [`Value`] keeps that shape
//! explicit, including the timestamp representations document stores hand
//! back and the not-a-number floats that stand in for missing numbers.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::normalize::format_rfc3339;

/// One source document: an ordered mapping from field name to value.
pub type Record = IndexMap<String, Value>;

/// Native timestamp representations found in source documents.
#[derive(Debug, Clone, PartialEq)]
pub enum Timestamp {
    /// Nanosecond-precision UTC datetime, as decoded from typed document APIs.
    Precise(DateTime<Utc>),
    /// Protobuf-style `seconds` / `nanos` pair.
    Proto {
        /// Seconds since the Unix epoch.
        seconds: i64,
        /// Sub-second nanoseconds.
        nanos: i32,
    },
    /// Zone-less native timestamp, interpreted as UTC.
    Naive(NaiveDateTime),
}

impl Timestamp {
    /// Converts the timestamp to a UTC datetime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Type`] if a protobuf pair is out of range.
    pub fn to_utc(&self) -> Result<DateTime<Utc>> {
        match self {
            Self::Precise(dt) => Ok(*dt),
            Self::Proto { seconds, nanos } => u32::try_from(*nanos)
                .ok()
                .and_then(|n| DateTime::from_timestamp(*seconds, n))
                .ok_or_else(|| {
                    Error::Type(format!(
                        "timestamp out of range: seconds={seconds}, nanos={nanos}"
                    ))
                }),
            Self::Naive(ndt) => Ok(ndt.and_utc()),
        }
    }
}

/// A loosely typed field value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Missing or explicit null.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating point; `NaN` marks a missing number.
    Float(f64),
    /// String.
    String(String),
    /// Native timestamp.
    Timestamp(Timestamp),
    /// Sequence of values.
    Array(Vec<Value>),
    /// Nested mapping.
    Map(Record),
}

impl Value {
    /// Short name of the value's shape, for error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Timestamp(_) => "timestamp",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
        }
    }

    /// Returns the string slice if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the nested mapping if this is a map.
    #[must_use]
    pub fn as_map(&self) -> Option<&Record> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the elements if this is a sequence.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Returns true for truthy flags: `true`, non-zero numbers, non-empty strings.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0 && !f.is_nan(),
            Self::String(s) => !s.is_empty(),
            Self::Timestamp(_) => true,
            Self::Array(a) => !a.is_empty(),
            Self::Map(m) => !m.is_empty(),
        }
    }

    /// Converts to a JSON value, rendering timestamps in canonical RFC 3339
    /// form and `NaN` as `null`.
    ///
    /// # Errors
    ///
    /// Returns an error if a nested timestamp is out of range.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Timestamp(ts) => serde_json::Value::String(format_rfc3339(&ts.to_utc()?)),
            Self::Array(items) => serde_json::Value::Array(
                items.iter().map(Value::to_json).collect::<Result<_>>()?,
            ),
            Self::Map(map) => serde_json::Value::Object(record_to_json(map)?),
        })
    }
}

/// Converts a record to a JSON object, keeping field order.
///
/// # Errors
///
/// Returns an error if a nested timestamp is out of range.
pub fn record_to_json(record: &Record) -> Result<serde_json::Map<String, serde_json::Value>> {
    record
        .iter()
        .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
        .collect()
}

/// Builds a record from a JSON object.
///
/// # Errors
///
/// Returns [`Error::Extraction`] if the value is not an object.
pub fn record_from_json(value: serde_json::Value) -> Result<Record> {
    match Value::from(value) {
        Value::Map(map) => Ok(map),
        other => Err(Error::Extraction(format!(
            "expected a document object, got {}",
            other.type_name()
        ))),
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .unwrap_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN))),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Timestamp> for Value {
    fn from(value: Timestamp) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Record> for Value {
    fn from(value: Record) -> Self {
        Self::Map(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Self::Array(value.into_iter().map(Into::into).collect())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            other => match other.to_json() {
                Ok(json) => write!(f, "{json}"),
                Err(_) => write!(f, "{other:?}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_from_json_numbers() {
        assert_eq!(Value::from(serde_json::json!(42)), Value::Int(42));
        assert_eq!(Value::from(serde_json::json!(1.5)), Value::Float(1.5));
    }

    #[test]
    fn test_from_json_keeps_field_order() {
        let json = serde_json::json!({"zeta": 1, "alpha": 2, "mid": 3});
        let record = record_from_json(json).unwrap();
        let keys: Vec<&str> = record.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_record_from_json_rejects_scalar() {
        assert!(matches!(
            record_from_json(serde_json::json!("nope")),
            Err(Error::Extraction(_))
        ));
    }

    #[test]
    fn test_to_json_nan_becomes_null() {
        assert_eq!(Value::Float(f64::NAN).to_json().unwrap(), serde_json::Value::Null);
    }

    #[test]
    fn test_to_json_renders_nested_timestamp() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut record = Record::new();
        record.insert("at".into(), Value::Timestamp(Timestamp::Precise(ts)));
        let json = Value::Array(vec![Value::Map(record)]).to_json().unwrap();
        assert_eq!(json[0]["at"], "2024-03-01T12:00:00.000000+00:00");
    }

    #[test]
    fn test_proto_timestamp_out_of_range() {
        let ts = Timestamp::Proto {
            seconds: 0,
            nanos: -1,
        };
        assert!(matches!(ts.to_utc(), Err(Error::Type(_))));
    }

    #[test]
    fn test_display_strings_unquoted() {
        assert_eq!(Value::from("abc").to_string(), "abc");
        assert_eq!(Value::from(vec!["a", "b"]).to_string(), r#"["a","b"]"#);
    }

    #[test]
    fn test_truthiness() {
        assert!(Value::Bool(true).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Float(f64::NAN).is_truthy());
        assert!(!Value::Null.is_truthy());
    }
}
