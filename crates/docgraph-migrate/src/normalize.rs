//! Value normalization.
//!
//! Pure helpers for null detection, phone number and timestamp
//! canonicalization, and numeric coercion. A value that cannot be made
//! canonical is an error for the whole run, never a skipped row.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use tracing::warn;

use crate::error::{Error, Result};
use crate::record::Value;

fn phone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+\d+$").expect("static regex"))
}

fn phone_noncompliant_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^+\d]").expect("static regex"))
}

fn whitespace_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Returns true if the value counts as empty.
///
/// Sequences are never null, even when empty. Everything else is null when
/// missing, `NaN`, or the empty string.
#[must_use]
pub fn is_null(value: &Value) -> bool {
    match value {
        Value::Array(_) => false,
        Value::Null => true,
        Value::Float(f) => f.is_nan(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Same as [`is_null`] for a possibly missing field.
#[must_use]
pub fn is_null_opt(value: Option<&Value>) -> bool {
    value.map_or(true, is_null)
}

fn is_phone_number(value: &str) -> bool {
    phone_regex().is_match(value)
}

/// Canonicalizes a phone number to `+` followed by digits.
///
/// Null values pass through unchanged.
///
/// # Errors
///
/// Returns [`Error::Format`] if the value is still not a phone number after
/// cleanup, or [`Error::Type`] for non-string, non-integer input.
pub fn normalize_phone(value: &Value) -> Result<Value> {
    if is_null(value) {
        return Ok(value.clone());
    }
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        other => {
            return Err(Error::Type(format!(
                "phone number must be a string, got {}",
                other.type_name()
            )))
        }
    };
    if is_phone_number(&raw) {
        return Ok(Value::String(raw));
    }

    warn!("normalize_phone: will attempt to fix \"{}\"", raw);
    let trimmed = raw.trim();
    let prefixed = if trimmed.starts_with('+') {
        trimmed.to_string()
    } else {
        format!("+{trimmed}")
    };
    let cleaned = phone_noncompliant_chars()
        .replace_all(&prefixed, "")
        .into_owned();

    if is_phone_number(&cleaned) {
        Ok(Value::String(cleaned))
    } else {
        Err(Error::Format(format!(
            "\"{raw}\" is not a valid phone number (cleaned to \"{cleaned}\")"
        )))
    }
}

/// Formats a UTC datetime as RFC 3339 with microseconds and a `+00:00` offset.
#[must_use]
pub fn format_rfc3339(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Canonicalizes any supported timestamp shape to RFC 3339.
///
/// Accepted shapes: native [`Timestamp`](crate::record::Timestamp) values
/// (precise, protobuf pair, naive), a `{seconds, nanoseconds}` map (or the
/// `_seconds` / `_nanoseconds` variant), and ISO-like strings. Null input
/// yields `Ok(None)`.
///
/// # Errors
///
/// Returns [`Error::Format`] for unparseable strings and [`Error::Type`]
/// for any other shape.
pub fn normalize_timestamp(value: &Value) -> Result<Option<String>> {
    if is_null(value) {
        return Ok(None);
    }
    let utc = match value {
        Value::Timestamp(ts) => ts.to_utc()?,
        Value::String(s) => parse_timestamp_str(s)?,
        Value::Map(map) => {
            let seconds = map.get("seconds").or_else(|| map.get("_seconds"));
            let nanos = map.get("nanoseconds").or_else(|| map.get("_nanoseconds"));
            if is_null_opt(seconds) && is_null_opt(nanos) {
                return Ok(None);
            }
            let seconds = seconds.map_or(Ok(0), |v| integral(v, "seconds"))?;
            let nanos = nanos.map_or(Ok(0), |v| integral(v, "nanoseconds"))?;
            u32::try_from(nanos)
                .ok()
                .and_then(|n| DateTime::from_timestamp(seconds, n))
                .ok_or_else(|| {
                    Error::Type(format!(
                        "timestamp out of range: seconds={seconds}, nanoseconds={nanos}"
                    ))
                })?
        }
        other => {
            return Err(Error::Type(format!(
                "value \"{other}\" is not a supported timestamp ({})",
                other.type_name()
            )))
        }
    };
    Ok(Some(format_rfc3339(&utc)))
}

fn integral(value: &Value, name: &str) -> Result<i64> {
    match value {
        Value::Null => Ok(0),
        Value::Int(i) => Ok(*i),
        Value::Float(f) if f.is_nan() => Ok(0),
        Value::Float(f) => Ok(f.trunc() as i64),
        other => Err(Error::Type(format!(
            "timestamp {name} must be numeric, got {}",
            other.type_name()
        ))),
    }
}

fn parse_timestamp_str(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(ndt.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(ndt) = date.and_hms_opt(0, 0, 0) {
            return Ok(ndt.and_utc());
        }
    }
    Err(Error::Format(format!("\"{s}\" is not a recognizable timestamp")))
}

/// Coerces a numeric value to an integer, treating `NaN` and null as zero.
///
/// # Errors
///
/// Returns [`Error::Type`] for values that are not numeric.
pub fn coerce_int(value: &Value) -> Result<Value> {
    let n = match value {
        Value::Null => 0,
        Value::Bool(b) => i64::from(*b),
        Value::Int(i) => *i,
        Value::Float(f) if f.is_nan() => 0,
        Value::Float(f) => f.trunc() as i64,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(|f| if f.is_nan() { 0 } else { f.trunc() as i64 })
            .map_err(|_| Error::Type(format!("\"{s}\" is not numeric")))?,
        other => {
            return Err(Error::Type(format!(
                "cannot coerce {} to integer",
                other.type_name()
            )))
        }
    };
    Ok(Value::Int(n))
}

/// Escapes backslashes and double quotes for a double-quoted literal.
#[must_use]
pub fn str_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Collapses every run of whitespace into a single space.
#[must_use]
pub fn trim_whitespace(value: &str) -> String {
    whitespace_runs().replace_all(value, " ").into_owned()
}

/// Returns the first capture group of `regex` in a string value.
///
/// Non-strings yield null. When nothing matches, the input is returned
/// unchanged unless `default_null` is set.
#[must_use]
pub fn regex_match(regex: &Regex, value: &Value, default_null: bool) -> Value {
    let Value::String(haystack) = value else {
        return Value::Null;
    };
    match regex.captures(haystack).and_then(|c| c.get(1)) {
        Some(m) => Value::String(m.as_str().to_string()),
        None if default_null => Value::Null,
        None => value.clone(),
    }
}

#[cfg(test)]
#[path = "normalize_tests.rs"]
mod tests;
