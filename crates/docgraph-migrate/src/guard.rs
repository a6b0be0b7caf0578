//! Prerequisite guards.
//!
//! A guard is a read-only query run against the target store for each
//! record before anything is written. Guards are AND-ed: once one fails
//! for a record, later guards are not run for it. Any error while
//! running a guard counts as a failure.

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::mapping::{Cell, MappedRecord, PREREQ_VALID_KEY};
use crate::record::Value;
use crate::target::{TargetStore, Vars};

/// A guard declaration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GuardSpec {
    /// Query returning a count or boolean as its first row.
    pub query: String,
    /// Query variable name to mapped field name.
    #[serde(default)]
    pub vars: IndexMap<String, String>,
}

/// Outcome counts of a guard pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardReport {
    /// Guard queries executed.
    pub executed: usize,
    /// Guard queries that failed or errored.
    pub failed: usize,
    /// Guard evaluations skipped because an earlier guard failed.
    pub short_circuited: usize,
}

/// Runs every guard against every record and stores the outcome under
/// the `__prereq_valid` metadata key.
pub async fn validate(
    records: &mut [MappedRecord],
    guards: &[GuardSpec],
    store: &dyn TargetStore,
) -> GuardReport {
    let mut report = GuardReport::default();
    for guard in guards {
        info!("Running prerequisite query: {}", guard.query);
        for record in records.iter_mut() {
            if prerequisite_failed(record) {
                report.short_circuited += 1;
                continue;
            }
            report.executed += 1;
            let valid = run_guard(guard, record, store).await;
            if !valid {
                report.failed += 1;
            }
            record.set_metadata(PREREQ_VALID_KEY, Value::Bool(valid));
        }
    }
    report
}

fn prerequisite_failed(record: &MappedRecord) -> bool {
    record
        .metadata()
        .and_then(|m| m.get(PREREQ_VALID_KEY))
        .is_some_and(|v| *v == Value::Bool(false))
}

async fn run_guard(guard: &GuardSpec, record: &MappedRecord, store: &dyn TargetStore) -> bool {
    let vars = match remap_vars(&guard.vars, record) {
        Ok(vars) => vars,
        Err(e) => {
            error!("Cannot bind prerequisite variables: {}", e);
            return false;
        }
    };
    match store.query(&guard.query, &vars).await {
        Ok(rows) => {
            let valid = rows.first().is_some_and(is_positive);
            if !valid {
                warn!(
                    "Prerequisite failed for {}, vars: {}",
                    record.row_id().unwrap_or_default(),
                    serde_json::Value::Object(vars.into_iter().collect())
                );
            }
            valid
        }
        Err(e) => {
            error!(
                "Error executing prerequisite '{}' with variables {}: {}",
                guard.query,
                serde_json::Value::Object(vars.into_iter().collect()),
                e
            );
            false
        }
    }
}

/// Binds guard variables from a record. Resolved fields bind their source
/// value; missing fields bind null.
///
/// # Errors
///
/// Returns an error if a value cannot be converted to JSON.
pub fn remap_vars(
    mapping: &IndexMap<String, String>,
    record: &MappedRecord,
) -> crate::error::Result<Vars> {
    mapping
        .iter()
        .map(|(var, field)| {
            let value = record
                .get(field)
                .map_or(Ok(serde_json::Value::Null), Cell::to_json)?;
            Ok((var.clone(), value))
        })
        .collect()
}

fn is_positive(row: &serde_json::Value) -> bool {
    match row {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f > 0.0),
        _ => false,
    }
}

#[cfg(test)]
#[path = "guard_tests.rs"]
mod tests;
