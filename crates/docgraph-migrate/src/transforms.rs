//! Named transform and resolution-key functions.
//!
//! Mapping rules refer to functions by name (or by a small declarative
//! form such as `{segment: 1}`). The [`TransformRegistry`] binds those
//! references to Rust closures once, when a collection's rules are
//! compiled. Applications register their own closures next to the
//! built-ins; closures that call an outside service are flagged
//! `external` so `--no-external` runs can skip them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::normalize::{coerce_int, is_null, normalize_phone, normalize_timestamp, regex_match};
use crate::record::{Record, Value};

type ValueFn = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;
type RowFn = Arc<dyn Fn(&Record) -> Result<Value> + Send + Sync>;
type KeyFn = Arc<dyn Fn(&Value) -> Result<Option<String>> + Send + Sync>;

/// Reference to a value transform in a mapping rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransformSpec {
    /// A registered transform, e.g. `normalize_phone`.
    Named(String),
    /// The n-th element of a sequence (null when out of bounds).
    Segment {
        /// Zero-based position.
        segment: usize,
    },
    /// The first capture group of a regular expression.
    Regex {
        /// Pattern with at least one capture group.
        regex: String,
        /// Yield null instead of the input when nothing matches.
        #[serde(default)]
        default_null: bool,
    },
}

/// Reference to a whole-record transform in a mapping rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowTransformSpec {
    /// A registered row transform, e.g. `attach_metadata`.
    Named(String),
    /// First non-null field among `coalesce`, optionally passed through `then`.
    Coalesce {
        /// Candidate source fields, in priority order.
        coalesce: Vec<String>,
        /// Value transform applied to the chosen value.
        #[serde(default)]
        then: Option<TransformSpec>,
    },
}

/// Reference to a resolution-key function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySpec {
    /// A registered key function, e.g. `identity`.
    Named(String),
    /// Always the same key.
    Constant {
        /// The key.
        constant: String,
    },
    /// The string form of a field of a map value.
    Field {
        /// Field name inside the value.
        field: String,
    },
    /// The key of the first arm whose field is present in a map value.
    Switch {
        /// Arms, tried in order.
        switch: Vec<SwitchArm>,
        /// Key used when no arm matches; null when absent.
        #[serde(default)]
        default: Option<String>,
    },
}

/// One arm of a [`KeySpec::Switch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchArm {
    /// Field that must be non-null for the arm to match.
    pub when: String,
    /// Resolution key produced by the arm.
    pub key: String,
}

/// A compiled value transform.
#[derive(Clone)]
pub struct ValueTransform {
    name: String,
    external: bool,
    func: ValueFn,
}

impl ValueTransform {
    /// Transform name, for logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the transform calls an outside service.
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.external
    }

    /// Applies the transform.
    ///
    /// # Errors
    ///
    /// Propagates the transform's error.
    pub fn apply(&self, value: &Value) -> Result<Value> {
        (self.func)(value)
    }
}

impl fmt::Debug for ValueTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueTransform")
            .field("name", &self.name)
            .field("external", &self.external)
            .finish_non_exhaustive()
    }
}

/// A compiled whole-record transform.
#[derive(Clone)]
pub struct RowTransform {
    name: String,
    external: bool,
    func: RowFn,
}

impl RowTransform {
    /// Transform name, for logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the transform calls an outside service.
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.external
    }

    /// Applies the transform to a source record.
    ///
    /// # Errors
    ///
    /// Propagates the transform's error.
    pub fn apply(&self, record: &Record) -> Result<Value> {
        (self.func)(record)
    }
}

impl fmt::Debug for RowTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowTransform")
            .field("name", &self.name)
            .field("external", &self.external)
            .finish_non_exhaustive()
    }
}

/// A compiled resolution-key function.
#[derive(Clone)]
pub struct KeyFunction {
    name: String,
    func: KeyFn,
}

impl KeyFunction {
    /// Builds a key function from a closure.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Value) -> Result<Option<String>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Function name, for logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Computes the resolution key for a value. `None` means no key.
    ///
    /// # Errors
    ///
    /// Propagates the function's error.
    pub fn key(&self, value: &Value) -> Result<Option<String>> {
        (self.func)(value)
    }
}

impl fmt::Debug for KeyFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Registry of named transforms and key functions.
#[derive(Default, Clone)]
pub struct TransformRegistry {
    values: HashMap<String, ValueTransform>,
    rows: HashMap<String, RowTransform>,
    keys: HashMap<String, KeyFunction>,
}

impl TransformRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in functions.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register_value("normalize_phone", false, normalize_phone)
            .register_value("normalize_timestamp", false, |v| {
                Ok(normalize_timestamp(v)?.map_or(Value::Null, Value::String))
            })
            .register_value("coerce_int", false, coerce_int)
            .register_value("null_if_empty", false, |v| {
                Ok(if is_null(v) { Value::Null } else { v.clone() })
            })
            .register_value("empty_if_null", false, |v| {
                Ok(if is_null(v) {
                    Value::String(String::new())
                } else {
                    v.clone()
                })
            })
            .register_value("keys", false, |v| {
                Ok(Value::Array(match v {
                    Value::Map(m) => m.keys().map(|k| Value::String(k.clone())).collect(),
                    _ => Vec::new(),
                }))
            })
            .register_value("list_or_empty", false, |v| {
                Ok(match v {
                    Value::Array(_) => v.clone(),
                    _ => Value::Array(Vec::new()),
                })
            })
            .register_value("trim", false, |v| {
                Ok(match v {
                    Value::String(s) => Value::String(s.trim().to_string()),
                    other => other.clone(),
                })
            })
            .register_row("attach_metadata", false, attach_metadata)
            .register_key("identity", |v| {
                Ok(match v {
                    v if is_null(v) => None,
                    Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                })
            });
        registry
    }

    /// Registers a value transform.
    pub fn register_value<F>(&mut self, name: &str, external: bool, func: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.values.insert(
            name.to_string(),
            ValueTransform {
                name: name.to_string(),
                external,
                func: Arc::new(func),
            },
        );
        self
    }

    /// Registers a whole-record transform.
    pub fn register_row<F>(&mut self, name: &str, external: bool, func: F) -> &mut Self
    where
        F: Fn(&Record) -> Result<Value> + Send + Sync + 'static,
    {
        self.rows.insert(
            name.to_string(),
            RowTransform {
                name: name.to_string(),
                external,
                func: Arc::new(func),
            },
        );
        self
    }

    /// Registers a resolution-key function.
    pub fn register_key<F>(&mut self, name: &str, func: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Option<String>> + Send + Sync + 'static,
    {
        self.keys
            .insert(name.to_string(), KeyFunction::new(name, func));
        self
    }

    /// Binds a value transform reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unknown names or invalid patterns.
    pub fn value_transform(&self, spec: &TransformSpec) -> Result<ValueTransform> {
        match spec {
            TransformSpec::Named(name) => self
                .values
                .get(name)
                .cloned()
                .ok_or_else(|| Error::Config(format!("unknown transform `{name}`"))),
            TransformSpec::Segment { segment } => {
                let n = *segment;
                Ok(ValueTransform {
                    name: format!("segment({n})"),
                    external: false,
                    func: Arc::new(move |v| {
                        Ok(v.as_array()
                            .and_then(|items| items.get(n))
                            .cloned()
                            .unwrap_or(Value::Null))
                    }),
                })
            }
            TransformSpec::Regex {
                regex,
                default_null,
            } => {
                if regex.is_empty() {
                    return Err(Error::Config(
                        "regex transform requires a non-empty pattern".to_string(),
                    ));
                }
                let compiled = Regex::new(regex)
                    .map_err(|e| Error::Config(format!("invalid regex `{regex}`: {e}")))?;
                if compiled.captures_len() < 2 {
                    return Err(Error::Config(format!(
                        "regex `{regex}` needs a capture group"
                    )));
                }
                let default_null = *default_null;
                Ok(ValueTransform {
                    name: format!("regex({regex})"),
                    external: false,
                    func: Arc::new(move |v| Ok(regex_match(&compiled, v, default_null))),
                })
            }
        }
    }

    /// Binds a row transform reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unknown names.
    pub fn row_transform(&self, spec: &RowTransformSpec) -> Result<RowTransform> {
        match spec {
            RowTransformSpec::Named(name) => self
                .rows
                .get(name)
                .cloned()
                .ok_or_else(|| Error::Config(format!("unknown row transform `{name}`"))),
            RowTransformSpec::Coalesce { coalesce, then } => {
                if coalesce.is_empty() {
                    return Err(Error::Config(
                        "coalesce needs at least one field".to_string(),
                    ));
                }
                let fields = coalesce.clone();
                let then = then
                    .as_ref()
                    .map(|t| self.value_transform(t))
                    .transpose()?;
                let external = then.as_ref().is_some_and(ValueTransform::is_external);
                Ok(RowTransform {
                    name: format!("coalesce({})", fields.join(",")),
                    external,
                    func: Arc::new(move |record| {
                        let chosen = fields
                            .iter()
                            .filter_map(|f| record.get(f))
                            .find(|v| !is_null(v))
                            .cloned()
                            .unwrap_or(Value::Null);
                        match &then {
                            Some(t) => t.apply(&chosen),
                            None => Ok(chosen),
                        }
                    }),
                })
            }
        }
    }

    /// Binds a resolution-key function reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unknown names or empty switches.
    pub fn key_fn(&self, spec: &KeySpec) -> Result<KeyFunction> {
        match spec {
            KeySpec::Named(name) => self
                .keys
                .get(name)
                .cloned()
                .ok_or_else(|| Error::Config(format!("unknown resolve function `{name}`"))),
            KeySpec::Constant { constant } => {
                let key = constant.clone();
                Ok(KeyFunction::new(format!("constant({key})"), move |_| {
                    Ok(Some(key.clone()))
                }))
            }
            KeySpec::Field { field } => {
                let field = field.clone();
                Ok(KeyFunction::new(format!("field({field})"), move |v| {
                    Ok(v.as_map()
                        .and_then(|m| m.get(&field))
                        .filter(|inner| !is_null(inner))
                        .map(ToString::to_string))
                }))
            }
            KeySpec::Switch { switch, default } => {
                if switch.is_empty() && default.is_none() {
                    return Err(Error::Config(
                        "switch resolver needs at least one arm or a default".to_string(),
                    ));
                }
                let arms = switch.clone();
                let default = default.clone();
                Ok(KeyFunction::new("switch", move |v| {
                    let matched = v.as_map().and_then(|m| {
                        arms.iter()
                            .find(|arm| m.get(&arm.when).is_some_and(|x| !is_null(x)))
                    });
                    Ok(matched.map(|arm| arm.key.clone()).or_else(|| default.clone()))
                }))
            }
        }
    }
}

/// Builds the `metadata` map consumed by the query synthesizer's skip
/// logic from a user document's soft-delete and test-account flags.
///
/// # Errors
///
/// Never fails; the signature matches registered row transforms.
pub fn attach_metadata(record: &Record) -> Result<Value> {
    let mut metadata = Record::new();
    for flag in ["isDeleted", "testingAccount"] {
        if let Some(value) = record.get(flag) {
            if !is_null(value) {
                metadata.insert(flag.to_string(), Value::Bool(value.is_truthy()));
            }
        }
    }
    Ok(Value::Map(metadata))
}

#[cfg(test)]
#[path = "transforms_tests.rs"]
mod tests;
