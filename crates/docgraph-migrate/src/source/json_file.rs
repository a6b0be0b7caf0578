//! Directory of JSON collection exports.
//!
//! Each `<collection>.json` file holds an array of document objects. A
//! document needs an `id`; `_path`, `create_time` and `update_time` are
//! optional. Documents of sub-collections carry their full `_path` so a
//! collection-group fetch can find them in any file. Exported
//! `{_seconds, _nanoseconds}` maps are read back as timestamps.

use std::cmp::Ordering;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{debug, info};

use super::{
    enrich, Cursor, FetchPage, FetchRequest, RecordSource, CREATE_TIME_FIELD, ID_FIELD,
    PATH_FIELD, UPDATE_TIME_FIELD,
};
use crate::config::Direction;
use crate::error::{Error, Result};
use crate::record::{record_from_json, Record, Timestamp, Value};

/// Configuration for the JSON export source.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonFileConfig {
    /// Directory holding one `<collection>.json` file per collection.
    pub dir: PathBuf,
}

/// JSON export source.
pub struct JsonFileSource {
    config: JsonFileConfig,
    files: Option<IndexMap<String, Vec<Record>>>,
}

impl JsonFileSource {
    /// Creates a new JSON export source.
    #[must_use]
    pub fn new(config: JsonFileConfig) -> Self {
        Self {
            config,
            files: None,
        }
    }

    fn files(&self) -> Result<&IndexMap<String, Vec<Record>>> {
        self.files
            .as_ref()
            .ok_or_else(|| Error::SourceConnection("json_file source is not connected".to_string()))
    }

    fn load_file(&self, collection: &str, path: &std::path::Path) -> Result<Vec<Record>> {
        let file = File::open(path).map_err(|e| {
            Error::SourceConnection(format!(
                "Failed to open JSON file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let root: serde_json::Value = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::Extraction(format!("Failed to parse '{}': {}", path.display(), e)))?;
        let serde_json::Value::Array(docs) = root else {
            return Err(Error::Extraction(format!(
                "'{}' is not an array of documents",
                path.display()
            )));
        };
        docs.into_iter()
            .enumerate()
            .map(|(i, doc)| load_document(collection, i, doc))
            .collect()
    }

    /// Documents in scope for a request, before ordering.
    fn scope(&self, request: &FetchRequest) -> Result<Vec<&Record>> {
        let files = self.files()?;
        if request.collection_group {
            return Ok(files
                .values()
                .flatten()
                .filter(|r| parent_collection(r) == Some(request.collection.as_str()))
                .collect());
        }
        files
            .get(&request.collection)
            .map(|docs| docs.iter().collect())
            .ok_or_else(|| {
                Error::Extraction(format!(
                    "collection `{}` not found in {}",
                    request.collection,
                    self.config.dir.display()
                ))
            })
    }

    /// Documents matching a request in fetch order, ignoring its limit.
    fn select(&self, request: &FetchRequest) -> Result<Vec<&Record>> {
        request.check()?;
        let mut docs = self.scope(request)?;
        let Some(order) = &request.order else {
            docs.sort_by(|a, b| path_of(a).cmp(&path_of(b)));
            if let Some(cursor) = &request.start_after {
                docs.retain(|r| path_of(r) > cursor.path);
            }
            return Ok(docs);
        };

        docs.retain(|r| r.contains_key(&order.field));
        let key = |r: &Record| (r.get(&order.field).cloned().unwrap_or_default(), path_of(r));
        let directed = |ord: Ordering| match order.direction {
            Direction::Ascending => ord,
            Direction::Descending => ord.reverse(),
        };
        docs.sort_by(|a, b| directed(compare_keys(&key(*a), &key(*b))));
        if let Some(cursor) = &request.start_after {
            let after = (
                cursor.order_value.clone().unwrap_or_default(),
                cursor.path.clone(),
            );
            docs.retain(|r| directed(compare_keys(&key(*r), &after)) == Ordering::Greater);
        }
        Ok(docs)
    }
}

#[async_trait]
impl RecordSource for JsonFileSource {
    fn source_type(&self) -> &'static str {
        "json_file"
    }

    async fn connect(&mut self) -> Result<()> {
        let entries = std::fs::read_dir(&self.config.dir).map_err(|e| {
            Error::SourceConnection(format!(
                "Failed to read directory '{}': {}",
                self.config.dir.display(),
                e
            ))
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut files = IndexMap::new();
        for path in paths {
            let Some(collection) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let docs = self.load_file(collection, &path)?;
            debug!("Loaded {} documents from {}", docs.len(), path.display());
            files.insert(collection.to_string(), docs);
        }
        info!(
            "Loaded {} collection files from {}",
            files.len(),
            self.config.dir.display()
        );
        self.files = Some(files);
        Ok(())
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchPage> {
        let docs = self.select(request)?;
        let limit = request.limit.unwrap_or(usize::MAX);
        let records = docs.into_iter().take(limit).cloned().collect();
        Ok(FetchPage::new(records, request.order.as_ref()))
    }

    async fn count(&self, request: &FetchRequest) -> Result<usize> {
        Ok(self.select(request)?.len())
    }

    async fn resolve_start_after(&self, request: &FetchRequest, key: &str) -> Result<Cursor> {
        info!(
            "start_after: interpreting \"{}\" as document key and retrieving it from {}...",
            key, request.collection
        );
        let found = self.scope(request)?.into_iter().find(|r| {
            if request.collection_group {
                path_of(r).join("/") == key
            } else {
                r.get(ID_FIELD).and_then(Value::as_str) == Some(key)
            }
        });
        found
            .and_then(|r| Cursor::after(r, request.order.as_ref()))
            .ok_or_else(|| {
                Error::Extraction(format!(
                    "start_after document `{key}` not found in {}",
                    request.collection
                ))
            })
    }

    async fn close(&mut self) -> Result<()> {
        self.files = None;
        Ok(())
    }
}

fn load_document(collection: &str, index: usize, doc: serde_json::Value) -> Result<Record> {
    let mut fields = record_from_json(doc)?;
    let id = match fields.shift_remove(ID_FIELD) {
        Some(Value::String(s)) => s,
        Some(Value::Int(i)) => i.to_string(),
        _ => {
            return Err(Error::Extraction(format!(
                "document {index} of `{collection}` has no id"
            )))
        }
    };
    let path = match fields.shift_remove(PATH_FIELD) {
        Some(Value::Array(segments)) => segments.iter().map(ToString::to_string).collect(),
        _ => vec![collection.to_string(), id.clone()],
    };
    let create_time = fields
        .shift_remove(CREATE_TIME_FIELD)
        .map(native_timestamp)
        .unwrap_or_default();
    let update_time = fields
        .shift_remove(UPDATE_TIME_FIELD)
        .map(native_timestamp)
        .unwrap_or_default();
    let fields = fields
        .into_iter()
        .map(|(k, v)| (k, nested(v)))
        .collect();
    Ok(enrich(fields, &id, create_time, update_time, &path))
}

/// Turns exported timestamp shapes into native timestamps: RFC 3339
/// strings for the metadata fields, and `{_seconds, _nanoseconds}` maps
/// anywhere.
fn native_timestamp(value: Value) -> Value {
    match value {
        Value::String(s) => match DateTime::parse_from_rfc3339(&s) {
            Ok(dt) => Value::Timestamp(Timestamp::Precise(dt.with_timezone(&Utc))),
            Err(_) => Value::String(s),
        },
        other => nested(other),
    }
}

/// Converts timestamp maps at any depth. Strings are left alone.
fn nested(value: Value) -> Value {
    match value {
        Value::Map(map) => {
            let proto = match (map.get("_seconds"), map.get("_nanoseconds"), map.len()) {
                (Some(Value::Int(seconds)), Some(Value::Int(nanos)), 2) => {
                    i32::try_from(*nanos).ok().map(|nanos| (*seconds, nanos))
                }
                _ => None,
            };
            match proto {
                Some((seconds, nanos)) => Value::Timestamp(Timestamp::Proto { seconds, nanos }),
                None => Value::Map(map.into_iter().map(|(k, v)| (k, nested(v))).collect()),
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(nested).collect()),
        other => other,
    }
}

fn path_of(record: &Record) -> Vec<String> {
    record
        .get(PATH_FIELD)
        .and_then(Value::as_array)
        .map(|segments| segments.iter().map(ToString::to_string).collect())
        .unwrap_or_default()
}

fn parent_collection(record: &Record) -> Option<&str> {
    let segments = record.get(PATH_FIELD)?.as_array()?;
    segments.len().checked_sub(2).and_then(|i| segments[i].as_str())
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) => 2,
        Value::Timestamp(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Map(_) => 6,
    }
}

/// Orders values the way the document store does: by type first, then by
/// value within a type.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            as_f64(a).total_cmp(&as_f64(b))
        }
        (Value::Timestamp(x), Value::Timestamp(y)) => match (x.to_utc(), y.to_utc()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => Ordering::Equal,
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(a, b)| compare_values(a, b))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        _ => f64::NAN,
    }
}

fn compare_keys(a: &(Value, Vec<String>), b: &(Value, Vec<String>)) -> Ordering {
    compare_values(&a.0, &b.0).then_with(|| a.1.cmp(&b.1))
}

#[cfg(test)]
#[path = "json_file_tests.rs"]
mod tests;
