//! Configuration types for docgraph-migrate.

use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::executor::ExecutionPlan;
use crate::guard::GuardSpec;
use crate::mapping::{MappingRule, METADATA_FIELD};

/// Main migration configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// Document store to read from.
    pub source: SourceConfig,
    /// Graph-relational store to write to.
    pub target: TargetConfig,
    /// Run options shared by every collection.
    #[serde(default)]
    pub options: MigrationOptions,
    /// Rules per source collection, in declaration order.
    pub collections: IndexMap<String, CollectionRules>,
}

/// Source store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum SourceConfig {
    /// Directory of JSON collection exports.
    #[serde(rename = "json_file")]
    JsonFile(crate::source::json_file::JsonFileConfig),
    /// Firestore over its REST API.
    #[serde(rename = "firestore")]
    Firestore(crate::source::firestore::FirestoreConfig),
}

/// Target store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum TargetConfig {
    /// EdgeDB over its EdgeQL HTTP endpoint.
    #[serde(rename = "edgedb_http")]
    EdgeHttp(crate::target::http::EdgeHttpConfig),
    /// In-process store that records statements without writing anywhere.
    #[serde(rename = "memory")]
    Memory,
}

/// Options that apply to every collection.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationOptions {
    /// Documents per page when fetching a whole collection.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Directory receiving `--dump-invalid` CSV files.
    #[serde(default = "default_dump_dir")]
    pub dump_dir: PathBuf,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            dump_dir: default_dump_dir(),
        }
    }
}

fn default_page_size() -> usize {
    100
}

fn default_dump_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Sort direction for paged fetches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Smallest first.
    #[default]
    #[serde(alias = "ASCENDING")]
    Ascending,
    /// Largest first.
    #[serde(alias = "DESCENDING")]
    Descending,
}

/// Field and direction documents are fetched in.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FetchOrder {
    /// Field to sort by. Documents lacking it are not returned by the store.
    pub field: String,
    /// Sort direction.
    #[serde(default)]
    pub direction: Direction,
}

/// Migration rules for one source collection.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionRules {
    /// Fetch ordering.
    pub fetch_order: FetchOrder,
    /// Fetch every sub-collection with this id instead of a top-level collection.
    #[serde(default)]
    pub collection_group: bool,
    /// Target field rules, in output order.
    pub mapping: IndexMap<String, MappingRule>,
    /// Fields partitioning records for grouped bulk writes.
    #[serde(default)]
    pub group_by: Vec<String>,
    /// How synthesized work is executed.
    pub execution: ExecutionPlan,
    /// Cast annotation per target field, e.g. `uuid` or `datetime`.
    #[serde(default)]
    pub type_casts: HashMap<String, String>,
    /// Text appended after each insert statement.
    #[serde(default)]
    pub query_suffix: String,
    /// Fields whose null value marks the whole record invalid.
    #[serde(default)]
    pub skip_if_empty: Vec<String>,
    /// Guard queries run before writing.
    #[serde(default)]
    pub prerequisites: Vec<GuardSpec>,
}

impl MigrationConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Rules for a collection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the collection is not declared.
    pub fn collection(&self, name: &str) -> Result<&CollectionRules> {
        self.collections
            .get(name)
            .ok_or_else(|| Error::Config(format!("no rules for collection `{name}`")))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.options.page_size == 0 {
            return Err(Error::Config("page_size must be greater than 0".to_string()));
        }
        if self.collections.is_empty() {
            return Err(Error::Config("no collections declared".to_string()));
        }
        for (name, rules) in &self.collections {
            rules
                .validate()
                .map_err(|e| Error::Config(format!("collection `{name}`: {e}")))?;
        }
        Ok(())
    }
}

impl CollectionRules {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.fetch_order.field.is_empty() {
            return Err("fetch_order.field cannot be empty".to_string());
        }
        if self.mapping.is_empty() {
            return Err("mapping cannot be empty".to_string());
        }
        let undeclared = |field: &String| !self.mapping.contains_key(field);

        if let Some(f) = self.group_by.iter().find(|f| undeclared(f)) {
            return Err(format!("group_by field `{f}` is not mapped"));
        }
        if let Some(f) = self.skip_if_empty.iter().find(|f| undeclared(f)) {
            return Err(format!("skip_if_empty field `{f}` is not mapped"));
        }
        if let Some(f) = self.type_casts.keys().find(|f| undeclared(f)) {
            return Err(format!("type_casts field `{f}` is not mapped"));
        }
        if self.type_casts.contains_key(METADATA_FIELD) {
            return Err(format!("`{METADATA_FIELD}` is reserved and cannot be cast"));
        }
        for guard in &self.prerequisites {
            if guard.query.trim().is_empty() {
                return Err("prerequisite query cannot be empty".to_string());
            }
            if let Some(f) = guard.vars.values().find(|f| undeclared(f)) {
                return Err(format!("prerequisite variable refers to unmapped field `{f}`"));
            }
        }
        if !self.group_by.is_empty() && !matches!(self.execution, ExecutionPlan::GroupedBulk { .. })
        {
            return Err("group_by is only used by the grouped_bulk strategy".to_string());
        }
        self.execution.validate()
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
