//! Batch execution strategies.
//!
//! - row-wise: one synthesized insert per record, inside a single
//!   transaction or best-effort
//! - grouped bulk: one statement per group, the group bound as `$data`
//! - resolution-keyed bulk: one statement per record, chosen by key
//!
//! Only the transactional row-wise strategy fails the run on a statement
//! error. Every other strategy logs the failure and moves on.

use indexmap::IndexMap;
use indicatif::ProgressBar;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::mapping::{MappedBatch, MappedRecord};
use crate::query::{InvalidRow, Statement};
use crate::record::Value;
use crate::target::{TargetStore, Vars};
use crate::transforms::{KeyFunction, KeySpec};

/// Variable name bulk statements receive their JSON payload under.
pub const DATA_VAR: &str = "data";

/// How a collection's records are written.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ExecutionPlan {
    /// One synthesized insert per record.
    RowTransactional {
        /// Target entity inserted into.
        entity: String,
    },
    /// One statement per `group_by` group.
    GroupedBulk {
        /// Statement unpacking `<json>$data` server-side.
        query: String,
    },
    /// One statement per record, selected by a key function.
    ResolutionKeyedBulk {
        /// Key function applied to the whole mapped record.
        key: KeySpec,
        /// Statement per key, each reading `<json>$data`.
        statements: IndexMap<String, String>,
    },
}

impl ExecutionPlan {
    /// Strategy name, for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RowTransactional { .. } => "row_transactional",
            Self::GroupedBulk { .. } => "grouped_bulk",
            Self::ResolutionKeyedBulk { .. } => "resolution_keyed_bulk",
        }
    }

    pub(crate) fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Self::RowTransactional { entity } if entity.trim().is_empty() => {
                Err("row_transactional needs an entity".to_string())
            }
            Self::GroupedBulk { query } if query.trim().is_empty() => {
                Err("grouped_bulk needs a query".to_string())
            }
            Self::ResolutionKeyedBulk { statements, .. } if statements.is_empty() => {
                Err("resolution_keyed_bulk needs at least one statement".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Whether row-wise statements share one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// All statements commit together or not at all.
    Transactional,
    /// Each statement stands alone; failures are logged.
    BestEffort,
}

/// Counts from one execution pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Statements sent.
    pub attempted: usize,
    /// Statements that succeeded.
    pub succeeded: usize,
    /// Statements that failed.
    pub failed: usize,
    /// Records not sent (null group key or unknown resolution key).
    pub skipped: usize,
}

fn vars_json(vars: &Vars) -> serde_json::Value {
    serde_json::Value::Object(vars.clone().into_iter().collect())
}

/// Executes synthesized statements in order.
///
/// # Errors
///
/// In [`TxMode::Transactional`], returns [`Error::Transaction`] after
/// rolling back when any statement fails, and propagates a failure to open
/// the transaction. [`TxMode::BestEffort`] never fails.
pub async fn run_statements(
    statements: &[Statement],
    store: &dyn TargetStore,
    mode: TxMode,
    progress: &ProgressBar,
) -> Result<ExecutionReport> {
    let mut report = ExecutionReport::default();
    match mode {
        TxMode::BestEffort => {
            info!("--no-transaction: running queries without transactional guarantees");
            for statement in statements {
                report.attempted += 1;
                match store.execute(&statement.query, &statement.vars).await {
                    Ok(_) => report.succeeded += 1,
                    Err(e) => {
                        error!(
                            "Error executing query '{}' with variables {}: {}",
                            statement.query,
                            vars_json(&statement.vars),
                            e
                        );
                        report.failed += 1;
                    }
                }
                progress.inc(1);
            }
        }
        TxMode::Transactional => {
            let mut tx = store.begin_transaction().await?;
            for (i, statement) in statements.iter().enumerate() {
                report.attempted += 1;
                if let Err(e) = tx.execute(&statement.query, &statement.vars).await {
                    error!(
                        "Error executing query '{}' with variables {}: {}",
                        statement.query,
                        vars_json(&statement.vars),
                        e
                    );
                    if let Err(rollback) = tx.rollback().await {
                        error!("Rollback failed: {}", rollback);
                    }
                    return Err(Error::Transaction(format!(
                        "statement {} of {} failed: {}",
                        i + 1,
                        statements.len(),
                        e
                    )));
                }
                progress.inc(1);
            }
            tx.commit().await?;
            report.succeeded = report.attempted;
        }
    }
    Ok(report)
}

/// Splits off records whose metadata forbids writing them.
#[must_use]
pub fn split_skipped(batch: MappedBatch) -> (MappedBatch, Vec<InvalidRow>) {
    let MappedBatch {
        records,
        group_by,
        partial,
    } = batch;
    let mut kept = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();
    for record in records {
        match record.skip_reason() {
            Some(reason) => {
                warn!(
                    "Skipping row {} due to {}",
                    record.row_id().unwrap_or_default(),
                    reason
                );
                rejected.push(InvalidRow {
                    id: record.row_id(),
                    reason,
                    raw: record,
                });
            }
            None => kept.push(record),
        }
    }
    (
        MappedBatch {
            records: kept,
            group_by,
            partial,
        },
        rejected,
    )
}

fn ensure_complete(batch: &MappedBatch) -> Result<()> {
    if batch.partial {
        return Err(Error::Config(
            "a single-field batch cannot be written".to_string(),
        ));
    }
    Ok(())
}

fn payload(records: &[&MappedRecord]) -> Result<Vars> {
    let rows = records
        .iter()
        .map(|r| r.to_json().map(serde_json::Value::Object))
        .collect::<Result<Vec<_>>>()?;
    let mut vars = Vars::new();
    vars.insert(
        DATA_VAR.to_string(),
        serde_json::Value::String(serde_json::to_string(&rows)?),
    );
    Ok(vars)
}

/// Executes `query` once per group, binding the group as a JSON array.
/// A failing group is logged and does not stop later groups.
///
/// # Errors
///
/// Returns [`Error::Config`] for a single-field batch, or an error if a
/// payload cannot be serialized.
pub async fn run_grouped(
    batch: &MappedBatch,
    query: &str,
    store: &dyn TargetStore,
    progress: &ProgressBar,
) -> Result<ExecutionReport> {
    ensure_complete(batch)?;
    let (groups, ungrouped) = batch.groups()?;
    let mut report = ExecutionReport {
        skipped: ungrouped,
        ..ExecutionReport::default()
    };
    info!("Running bulk inserts for {} groups", groups.len());
    for group in &groups {
        info!(
            "Running bulk inserts for group {} ({} rows)",
            serde_json::Value::Array(group.key.clone()),
            group.records.len()
        );
        let vars = payload(&group.records)?;
        report.attempted += 1;
        match store.execute(query, &vars).await {
            Ok(_) => report.succeeded += 1,
            Err(e) => {
                error!(
                    "Error executing bulk query for group {}: {}",
                    serde_json::Value::Array(group.key.clone()),
                    e
                );
                report.failed += 1;
            }
        }
        progress.inc(group.records.len() as u64);
    }
    Ok(report)
}

/// Executes one statement per record, chosen by the record's resolution
/// key. Unknown keys and failing statements are logged and skipped.
///
/// # Errors
///
/// Returns [`Error::Config`] for a single-field batch, or an error if a
/// record cannot be serialized.
pub async fn run_keyed(
    batch: &MappedBatch,
    key_fn: &KeyFunction,
    statements: &IndexMap<String, String>,
    store: &dyn TargetStore,
    progress: &ProgressBar,
) -> Result<ExecutionReport> {
    ensure_complete(batch)?;
    let mut report = ExecutionReport::default();
    for (i, record) in batch.records.iter().enumerate() {
        progress.inc(1);
        let vars = payload(&[record])?;
        let row = Value::Map(
            record
                .iter()
                .map(|(k, c)| (k.to_string(), c.source().clone()))
                .collect(),
        );
        let key = match key_fn.key(&row) {
            Ok(key) => key,
            Err(e) => {
                error!("Cannot compute resolution for row {}: {}", i, e);
                report.skipped += 1;
                continue;
            }
        };
        let Some(statement) = key.as_deref().and_then(|k| statements.get(k)) else {
            error!(
                "Invalid resolution {} for row {}",
                key.as_deref().unwrap_or("null"),
                vars[DATA_VAR]
            );
            report.skipped += 1;
            continue;
        };
        report.attempted += 1;
        match store.execute(statement, &vars).await {
            Ok(rows) => {
                report.succeeded += 1;
                info!(
                    "Row {} resolved to {} with result {}",
                    record.row_id().unwrap_or_else(|| i.to_string()),
                    key.as_deref().unwrap_or_default(),
                    serde_json::Value::Array(rows)
                );
            }
            Err(e) => {
                error!(
                    "Error executing query '{}' with {}: {}",
                    statement, vars[DATA_VAR], e
                );
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
