//! Insert statement synthesis.
//!
//! One mapped record becomes one parameterized `insert` statement, or an
//! [`InvalidRow`] when the record must not be written. Fields are emitted
//! in mapping order:
//!
//! - resolved fields contribute their sub-expression and variables
//! - nulls are omitted, or invalidate the record if listed in `skip_if_empty`
//! - strings and timestamps become escaped, double-quoted literals
//! - maps and sequences become `<json>` literals
//! - numbers and booleans are emitted as-is; infinite floats are a type error
//!
//! A declared type cast prefixes the literal, e.g. `<uuid>"..."`.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::CollectionRules;
use crate::error::{Error, Result};
use crate::mapping::{Cell, MappedRecord, METADATA_FIELD};
use crate::normalize::{is_null, normalize_timestamp, str_escape};
use crate::record::Value;
use crate::target::Vars;

/// A statement ready for execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    /// Statement text.
    pub query: String,
    /// Bound variables.
    pub vars: Vars,
}

/// A record that will not be written.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidRow {
    /// `firebase_uid` or `firebase_id` of the record, when mapped.
    pub id: Option<String>,
    /// Why the record was rejected.
    pub reason: String,
    /// The mapped record as it was.
    pub raw: MappedRecord,
}

/// Synthesis output for one record.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryFragment {
    /// A statement to execute.
    Valid(Statement),
    /// A rejected record.
    Invalid(InvalidRow),
}

/// Builds insert statements for one target entity.
#[derive(Debug, Clone)]
pub struct QueryBuilder<'a> {
    entity: &'a str,
    type_casts: &'a HashMap<String, String>,
    suffix: &'a str,
    skip_if_empty: &'a [String],
}

impl<'a> QueryBuilder<'a> {
    /// Creates a builder.
    #[must_use]
    pub fn new(
        entity: &'a str,
        type_casts: &'a HashMap<String, String>,
        suffix: &'a str,
        skip_if_empty: &'a [String],
    ) -> Self {
        Self {
            entity,
            type_casts,
            suffix,
            skip_if_empty,
        }
    }

    /// Creates a builder from a collection's rules.
    #[must_use]
    pub fn for_collection(entity: &'a str, rules: &'a CollectionRules) -> Self {
        Self::new(
            entity,
            &rules.type_casts,
            &rules.query_suffix,
            &rules.skip_if_empty,
        )
    }

    /// Synthesizes the statement for one record.
    ///
    /// # Errors
    ///
    /// Returns an error if a timestamp cannot be normalized or a value
    /// cannot be serialized.
    pub fn build(&self, record: &MappedRecord) -> Result<QueryFragment> {
        let invalid = |reason: String| {
            Ok(QueryFragment::Invalid(InvalidRow {
                id: record.row_id(),
                reason,
                raw: record.clone(),
            }))
        };

        let mut query = format!("insert {} {{", self.entity);
        let mut vars = Vars::new();

        for (field, cell) in record.iter() {
            if field == METADATA_FIELD {
                if let Some(reason) = record.skip_reason() {
                    warn!(
                        "query: Skipping row {} due to {}",
                        record.row_id().unwrap_or_default(),
                        reason
                    );
                    return invalid(reason);
                }
                continue;
            }

            let value = match cell {
                Cell::Resolved(resolution) => {
                    if resolution.vars_all_null() {
                        continue;
                    }
                    vars.extend(resolution.vars.clone());
                    query.push_str(&format!(" {field} {},", resolution.query));
                    continue;
                }
                Cell::Value(value) => value,
            };

            if is_null(value) {
                if self.skip_if_empty.iter().any(|f| f == field) {
                    warn!(
                        "query: Skipping row {} due to empty field {}",
                        record.row_id().unwrap_or_default(),
                        field
                    );
                    return invalid(format!("empty field `{field}`"));
                }
                continue;
            }

            let cast = self.type_casts.get(field).map(String::as_str);
            let Some(expr) = literal(value, cast)? else {
                continue;
            };
            query.push_str(&format!(" {field} := {expr},"));
        }

        query.push_str("} ");
        query.push_str(self.suffix);
        Ok(QueryFragment::Valid(Statement {
            query: query.trim_end().to_string(),
            vars,
        }))
    }

    /// Synthesizes every record and partitions the results.
    ///
    /// # Errors
    ///
    /// Propagates the first synthesis error.
    pub fn build_all(&self, records: &[MappedRecord]) -> Result<BuiltQueries> {
        let mut built = BuiltQueries::default();
        for record in records {
            match self.build(record)? {
                QueryFragment::Valid(statement) => built.valid.push(statement),
                QueryFragment::Invalid(row) => built.invalid.push(row),
            }
        }
        info!("Processed {} rows.", records.len());
        info!(
            "Skipped {} rows which did not pass validation checks.",
            built.invalid.len()
        );
        info!("Built {} valid queries.", built.valid.len());
        Ok(built)
    }
}

/// Partitioned synthesis output.
#[derive(Debug, Clone, Default)]
pub struct BuiltQueries {
    /// Statements to execute, in record order.
    pub valid: Vec<Statement>,
    /// Rejected records, in record order.
    pub invalid: Vec<InvalidRow>,
}

fn wrap(expr: String, cast: Option<&str>) -> String {
    match cast {
        Some(cast) => format!("<{cast}>{expr}"),
        None => expr,
    }
}

fn quoted(s: &str) -> String {
    format!("\"{}\"", str_escape(s))
}

/// Renders a non-null value as a literal expression. `None` means the
/// value contributes nothing (an empty map).
fn literal(value: &Value, cast: Option<&str>) -> Result<Option<String>> {
    let expr = match value {
        Value::Null => return Ok(None),
        Value::Bool(b) => wrap(b.to_string(), cast),
        Value::Int(i) => wrap(i.to_string(), cast),
        Value::Float(f) if !f.is_finite() => {
            return Err(Error::Type(format!("{f} has no EdgeQL literal")))
        }
        Value::Float(f) => wrap(f.to_string(), cast),
        Value::String(s) => wrap(quoted(s), cast),
        Value::Timestamp(_) => match normalize_timestamp(value)? {
            Some(ts) => wrap(quoted(&ts), cast),
            None => return Ok(None),
        },
        Value::Map(map) if map.is_empty() => return Ok(None),
        Value::Map(_) | Value::Array(_) => {
            let json = serde_json::to_string(&value.to_json()?)?;
            wrap(quoted(&json), Some("json"))
        }
    };
    Ok(Some(expr))
}

#[cfg(test)]
#[path = "query_tests.rs"]
mod tests;
