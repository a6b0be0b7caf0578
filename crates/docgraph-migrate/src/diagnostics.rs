//! Run diagnostics: invalid-row dumps and statement previews.

use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::error::Result;
use crate::normalize::trim_whitespace;
use crate::query::{InvalidRow, Statement};
use crate::record::Value;

/// Statements shown at each end of a preview.
pub const PREVIEW_LEN: usize = 5;

/// Progress bar for a run phase; a spinner when the total is unknown.
pub(crate) fn create_progress_bar(total: u64, phase: &str) -> ProgressBar {
    let pb = if total > 0 {
        ProgressBar::new(total)
    } else {
        ProgressBar::new_spinner()
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} [{{elapsed_precise}}] {phase} [{{bar:40.cyan/blue}}] {{pos}}/{{len}} ({{eta}})"
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

/// Path of the invalid-row dump for a collection.
#[must_use]
pub fn dump_path(dir: &Path, collection: &str) -> PathBuf {
    dir.join(format!("{collection}_invalid.csv"))
}

fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Float(f) if f.is_nan() => String::new(),
        other => other.to_string(),
    }
}

/// Writes invalid rows to `<dir>/<collection>_invalid.csv`. The header is
/// the union of the rows' field names in first-seen order; fields a row
/// lacks are left empty. Nothing is written for an empty slice.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn dump_invalid(rows: &[InvalidRow], dir: &Path, collection: &str) -> Result<Option<PathBuf>> {
    if rows.is_empty() {
        return Ok(None);
    }
    let header: IndexSet<&str> = rows.iter().flat_map(|r| r.raw.field_names()).collect();

    std::fs::create_dir_all(dir)?;
    let path = dump_path(dir, collection);
    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(&header)?;
    for row in rows {
        let cells = header.iter().map(|field| {
            row.raw
                .get(field)
                .map(|cell| csv_cell(cell.source()))
                .unwrap_or_default()
        });
        writer.write_record(cells)?;
    }
    writer.flush()?;
    info!(
        "--dump-invalid: {} rows dumped to {}",
        rows.len(),
        path.display()
    );
    Ok(Some(path))
}

/// The first and last [`PREVIEW_LEN`] statements as single-line JSON.
///
/// # Errors
///
/// Returns an error if a statement cannot be serialized.
pub fn preview(statements: &[Statement]) -> Result<(String, String)> {
    let head = &statements[..statements.len().min(PREVIEW_LEN)];
    let tail = &statements[statements.len().saturating_sub(PREVIEW_LEN)..];
    Ok((
        trim_whitespace(&serde_json::to_string(head)?),
        trim_whitespace(&serde_json::to_string(tail)?),
    ))
}

/// Logs the statement preview.
///
/// # Errors
///
/// Returns an error if a statement cannot be serialized.
pub fn log_preview(statements: &[Statement]) -> Result<()> {
    let (head, tail) = preview(statements)?;
    info!("Queries (head): {}", head);
    info!("Queries (tail): {}", tail);
    Ok(())
}
