//! Mapping engine.
//!
//! Turns source records into target-shaped [`MappedRecord`]s by evaluating
//! one [`MappingRule`] per declared target field, in declaration order.

use std::fmt;

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::record::{Record, Value};
use crate::resolver::{Resolution, Resolver, ResolverSpec};
use crate::transforms::{
    RowTransform, RowTransformSpec, TransformRegistry, TransformSpec, ValueTransform,
};

/// Reserved field carrying skip flags and guard outcomes.
pub const METADATA_FIELD: &str = "metadata";

/// Metadata key holding the prerequisite guard outcome.
pub const PREREQ_VALID_KEY: &str = "__prereq_valid";

/// Location of a value in a source record, at most one level deep.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "PathRepr")]
pub enum SourcePath {
    /// Top-level field.
    Field(String),
    /// Field of a nested map.
    Nested {
        /// Top-level map field.
        parent: String,
        /// Key inside the map.
        child: String,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PathRepr {
    Field(String),
    Nested(Vec<String>),
}

impl TryFrom<PathRepr> for SourcePath {
    type Error = String;

    fn try_from(repr: PathRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            PathRepr::Field(f) => Ok(Self::Field(f)),
            PathRepr::Nested(mut parts) if parts.len() == 2 => {
                let child = parts.pop().unwrap_or_default();
                let parent = parts.pop().unwrap_or_default();
                Ok(Self::Nested { parent, child })
            }
            PathRepr::Nested(parts) if parts.len() == 1 => {
                Ok(Self::Field(parts.into_iter().next().unwrap_or_default()))
            }
            PathRepr::Nested(parts) => Err(format!(
                "source path must have one or two segments, got {}",
                parts.len()
            )),
        }
    }
}

impl SourcePath {
    /// Reads the value at this path. Missing fields and non-map parents
    /// read as null.
    #[must_use]
    pub fn get(&self, record: &Record) -> Value {
        match self {
            Self::Field(f) => record.get(f).cloned().unwrap_or_default(),
            Self::Nested { parent, child } => record
                .get(parent)
                .and_then(Value::as_map)
                .and_then(|m| m.get(child))
                .cloned()
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for SourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => f.write_str(name),
            Self::Nested { parent, child } => write!(f, "{parent}.{child}"),
        }
    }
}

/// How one target field is produced.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawRule")]
pub enum MappingRule {
    /// The same constant for every record.
    Literal(Value),
    /// A value read from the source record.
    ColumnRef {
        /// Where to read.
        path: SourcePath,
        /// Transform applied to the value read.
        transform: Option<TransformSpec>,
        /// Link each element of a sequence instead of the whole value.
        array: bool,
        /// Resolver replacing the value with a linking sub-query.
        resolve: Option<ResolverSpec>,
    },
    /// A value computed from the whole source record.
    RowDerived {
        /// Row transform.
        transform: RowTransformSpec,
        /// Resolver replacing the value with a linking sub-query.
        resolve: Option<ResolverSpec>,
    },
}

impl MappingRule {
    /// Shorthand for a plain column copy.
    pub fn column(field: impl Into<String>) -> Self {
        Self::ColumnRef {
            path: SourcePath::Field(field.into()),
            transform: None,
            array: false,
            resolve: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRule {
    Shorthand(String),
    Full(RawRuleBody),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRuleBody {
    #[serde(default)]
    literal: Option<Value>,
    #[serde(default)]
    col: Option<SourcePath>,
    #[serde(default)]
    row: Option<RowTransformSpec>,
    #[serde(default)]
    transform: Option<TransformSpec>,
    #[serde(default)]
    array: bool,
    #[serde(default)]
    resolve: Option<ResolverSpec>,
}

impl TryFrom<RawRule> for MappingRule {
    type Error = String;

    fn try_from(raw: RawRule) -> std::result::Result<Self, Self::Error> {
        let body = match raw {
            RawRule::Shorthand(field) => return Ok(Self::column(field)),
            RawRule::Full(body) => body,
        };
        let sources = [
            body.literal.is_some(),
            body.col.is_some(),
            body.row.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count();
        if sources != 1 {
            return Err(format!(
                "mapping rule must declare exactly one of `literal`, `col`, `row` (found {sources})"
            ));
        }

        if let Some(value) = body.literal {
            if body.transform.is_some() || body.resolve.is_some() || body.array {
                return Err("a `literal` rule takes no other keys".into());
            }
            return Ok(Self::Literal(value));
        }
        if let Some(transform) = body.row {
            if body.transform.is_some() {
                return Err("a `row` rule names its transform in `row`".into());
            }
            if body.array {
                return Err("the array flag applies to `col` rules only".into());
            }
            return Ok(Self::RowDerived {
                transform,
                resolve: body.resolve,
            });
        }
        if body.array && body.resolve.is_none() {
            return Err("the array flag requires a resolver".into());
        }
        let path = body
            .col
            .ok_or_else(|| "mapping rule has no source".to_string())?;
        Ok(Self::ColumnRef {
            path,
            transform: body.transform,
            array: body.array,
            resolve: body.resolve,
        })
    }
}

/// A mapped field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    /// A plain value.
    Value(Value),
    /// A value replaced by a linking sub-query.
    Resolved(Box<Resolution>),
}

impl Cell {
    /// The underlying value, ignoring any resolution.
    #[must_use]
    pub fn source(&self) -> &Value {
        match self {
            Self::Value(v) => v,
            Self::Resolved(r) => &r.source,
        }
    }

    /// Converts to JSON, resolved cells as their source value.
    ///
    /// # Errors
    ///
    /// Returns an error if a timestamp is out of range.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        self.source().to_json()
    }
}

/// A record in target shape, fields in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedRecord {
    fields: IndexMap<String, Cell>,
}

impl MappedRecord {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field.
    pub fn insert(&mut self, field: impl Into<String>, cell: Cell) {
        self.fields.insert(field.into(), cell);
    }

    /// Looks up a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Cell> {
        self.fields.get(field)
    }

    /// Iterates fields in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Cell)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Field names in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the record has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The reserved metadata map, if present and a map.
    #[must_use]
    pub fn metadata(&self) -> Option<&Record> {
        self.fields.get(METADATA_FIELD).and_then(|c| c.source().as_map())
    }

    /// Sets one metadata key, keeping the other keys.
    pub fn set_metadata(&mut self, key: &str, value: Value) {
        let mut metadata = self.metadata().cloned().unwrap_or_default();
        metadata.insert(key.to_string(), value);
        self.fields
            .insert(METADATA_FIELD.to_string(), Cell::Value(Value::Map(metadata)));
    }

    /// Identifier used in logs and diagnostics.
    #[must_use]
    pub fn row_id(&self) -> Option<String> {
        ["firebase_uid", "firebase_id"]
            .into_iter()
            .find_map(|f| self.fields.get(f))
            .map(|c| c.source().to_string())
    }

    /// The reason the record must not be written, if its metadata says so.
    #[must_use]
    pub fn skip_reason(&self) -> Option<String> {
        let metadata = self.metadata()?;
        if metadata.get(PREREQ_VALID_KEY) == Some(&Value::Bool(false)) {
            return Some("failed prerequisite".to_string());
        }
        ["isDeleted", "testingAccount"]
            .into_iter()
            .find(|flag| metadata.get(*flag).is_some_and(Value::is_truthy))
            .map(|flag| format!("metadata flag `{flag}`"))
    }

    /// Converts to a JSON object, resolved cells as their source value.
    ///
    /// # Errors
    ///
    /// Returns an error if a timestamp is out of range.
    pub fn to_json(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        self.fields
            .iter()
            .map(|(k, c)| Ok((k.clone(), c.to_json()?)))
            .collect()
    }
}

/// Options for one transformation pass.
#[derive(Debug, Clone, Default)]
pub struct TransformOptions {
    /// Skip transforms flagged as calling outside services.
    pub no_external: bool,
    /// Restrict mapping to one declared field.
    pub single_field: Option<String>,
}

/// A batch of mapped records.
#[derive(Debug, Clone, Default)]
pub struct MappedBatch {
    /// Records in source order.
    pub records: Vec<MappedRecord>,
    /// Fields whose values partition the batch for grouped writes.
    pub group_by: Vec<String>,
    /// True when only a single field was mapped. Such batches are never written.
    pub partial: bool,
}

/// Records sharing a group key.
#[derive(Debug)]
pub struct RecordGroup<'a> {
    /// Values of the `group_by` fields.
    pub key: Vec<serde_json::Value>,
    /// Members in source order.
    pub records: Vec<&'a MappedRecord>,
}

impl MappedBatch {
    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Partitions the batch by the `group_by` fields.
    ///
    /// Groups appear in order of first occurrence and keep source order.
    /// Records whose key contains a null are left out of every group and
    /// counted in the second element. Without `group_by` the whole batch
    /// is a single group.
    ///
    /// # Errors
    ///
    /// Returns an error if a key value cannot be converted to JSON.
    pub fn groups(&self) -> Result<(Vec<RecordGroup<'_>>, usize)> {
        if self.group_by.is_empty() {
            let all = RecordGroup {
                key: Vec::new(),
                records: self.records.iter().collect(),
            };
            return Ok((vec![all], 0));
        }

        let mut groups: IndexMap<String, RecordGroup<'_>> = IndexMap::new();
        let mut ungrouped = 0;
        for record in &self.records {
            let key = self
                .group_by
                .iter()
                .map(|f| record.get(f).map_or(Ok(serde_json::Value::Null), Cell::to_json))
                .collect::<Result<Vec<_>>>()?;
            if key.iter().any(serde_json::Value::is_null) {
                ungrouped += 1;
                continue;
            }
            let id = serde_json::to_string(&key)?;
            groups
                .entry(id)
                .or_insert_with(|| RecordGroup {
                    key,
                    records: Vec::new(),
                })
                .records
                .push(record);
        }
        if ungrouped > 0 {
            warn!(
                "{} records have a null value in group_by fields {:?} and were not grouped",
                ungrouped, self.group_by
            );
        }
        Ok((groups.into_values().collect(), ungrouped))
    }
}

enum CompiledRule {
    Literal(Value),
    Column {
        path: SourcePath,
        transform: Option<ValueTransform>,
        resolver: Option<Resolver>,
    },
    Row {
        transform: RowTransform,
        resolver: Option<Resolver>,
    },
}

/// Compiled mapping rules for one collection.
pub struct Mapper {
    rules: Vec<(String, CompiledRule)>,
}

impl fmt::Debug for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapper")
            .field("fields", &self.rules.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish()
    }
}

impl Mapper {
    /// Compiles mapping rules against a registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a rule names an unknown function or
    /// declares an invalid resolver.
    pub fn new(
        mapping: &IndexMap<String, MappingRule>,
        registry: &TransformRegistry,
    ) -> Result<Self> {
        let mut rules = Vec::with_capacity(mapping.len());
        for (field, rule) in mapping {
            let compiled = match rule {
                MappingRule::Literal(value) => CompiledRule::Literal(value.clone()),
                MappingRule::ColumnRef {
                    path,
                    transform,
                    array,
                    resolve,
                } => CompiledRule::Column {
                    path: path.clone(),
                    transform: transform
                        .as_ref()
                        .map(|t| registry.value_transform(t))
                        .transpose()
                        .map_err(|e| in_field(field, e))?,
                    resolver: resolve
                        .as_ref()
                        .map(|r| Resolver::from_spec(field, r, *array, registry))
                        .transpose()
                        .map_err(|e| in_field(field, e))?,
                },
                MappingRule::RowDerived { transform, resolve } => CompiledRule::Row {
                    transform: registry
                        .row_transform(transform)
                        .map_err(|e| in_field(field, e))?,
                    resolver: resolve
                        .as_ref()
                        .map(|r| Resolver::from_spec(field, r, false, registry))
                        .transpose()
                        .map_err(|e| in_field(field, e))?,
                },
            };
            rules.push((field.clone(), compiled));
        }
        Ok(Self { rules })
    }

    /// Declared target fields, in order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|(f, _)| f.as_str())
    }

    /// Maps a batch of source records.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an undeclared `single_field`, and
    /// propagates any transform or resolver failure, which aborts the run.
    pub fn transform(
        &self,
        records: &[Record],
        group_by: &[String],
        options: &TransformOptions,
    ) -> Result<MappedBatch> {
        if let Some(single) = &options.single_field {
            if !self.rules.iter().any(|(f, _)| f == single) {
                return Err(Error::Config(format!(
                    "field `{single}` is not declared in the mapping"
                )));
            }
        }

        let mapped = records
            .iter()
            .map(|r| self.map_record(r, options))
            .collect::<Result<Vec<_>>>()?;
        debug!("mapped {} records", mapped.len());

        Ok(MappedBatch {
            records: mapped,
            group_by: if options.single_field.is_some() {
                Vec::new()
            } else {
                group_by.to_vec()
            },
            partial: options.single_field.is_some(),
        })
    }

    fn map_record(&self, record: &Record, options: &TransformOptions) -> Result<MappedRecord> {
        let mut out = MappedRecord::new();
        for (field, rule) in &self.rules {
            if options
                .single_field
                .as_deref()
                .is_some_and(|single| single != field)
            {
                continue;
            }
            let (value, resolver) = match rule {
                CompiledRule::Literal(value) => (value.clone(), None),
                CompiledRule::Column {
                    path,
                    transform,
                    resolver,
                } => {
                    let raw = path.get(record);
                    let value = match transform {
                        Some(t) if t.is_external() && options.no_external => raw,
                        Some(t) => t.apply(&raw)?,
                        None => raw,
                    };
                    (value, resolver.as_ref())
                }
                CompiledRule::Row {
                    transform,
                    resolver,
                } => {
                    if transform.is_external() && options.no_external {
                        info!(
                            "--no-external: `{}` omitted ({} calls an external service)",
                            field,
                            transform.name()
                        );
                        continue;
                    }
                    (transform.apply(record)?, resolver.as_ref())
                }
            };

            let cell = match resolver {
                Some(resolver) => match resolver.resolve(&value)? {
                    Some(resolution) => Cell::Resolved(Box::new(resolution)),
                    None => Cell::Value(Value::Null),
                },
                None => Cell::Value(value),
            };
            out.insert(field.clone(), cell);
        }
        Ok(out)
    }
}

fn in_field(field: &str, err: Error) -> Error {
    match err {
        Error::Config(msg) => Error::Config(format!("field `{field}`: {msg}")),
        other => other,
    }
}

#[cfg(test)]
#[path = "mapping_tests.rs"]
mod tests;
