//! Reference resolution.
//!
//! A resolver turns a value that must be linked to an existing target
//! object into a [`Resolution`]: a sub-query chosen by resolution key plus
//! the variables it binds. Scalar resolvers produce one sub-query per
//! value; array resolvers produce one per element and fold them into a
//! single `assert_distinct` set expression.
//!
//! Query templates are opaque text. The only substitution performed is
//! [`INDEX_PLACEHOLDER`], replaced by an element's position so the
//! sub-query can address it inside the bound JSON array.

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::normalize::is_null;
use crate::record::Value;
use crate::transforms::{KeyFunction, KeySpec, TransformRegistry};

/// Placeholder replaced by the element position in array templates.
pub const INDEX_PLACEHOLDER: &str = "%%n%%";

/// Largest sequence an array resolver will link.
pub const MAX_ARRAY_LEN: usize = 1024;

/// Resolver declaration in a mapping rule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResolverSpec {
    /// Function computing the resolution key from a value.
    pub key: KeySpec,
    /// Query template per resolution key.
    pub resolutions: IndexMap<String, String>,
}

/// A value replaced by a linking sub-expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Value the resolution was computed from. For arrays, the element
    /// sequence with `Null` at positions that produced no key.
    pub source: Value,
    /// Sub-expression emitted in place of a literal.
    pub query: String,
    /// Variables the sub-expression refers to.
    pub vars: IndexMap<String, serde_json::Value>,
}

impl Resolution {
    /// Returns true if every bound variable is null.
    #[must_use]
    pub fn vars_all_null(&self) -> bool {
        self.vars.values().all(serde_json::Value::is_null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Scalar,
    Array,
}

/// A compiled resolver bound to one target field.
#[derive(Debug, Clone)]
pub struct Resolver {
    field: String,
    key_fn: KeyFunction,
    resolutions: IndexMap<String, String>,
    shape: Shape,
}

impl Resolver {
    /// Builds a resolver producing one sub-query per value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no resolutions are declared.
    pub fn scalar(
        field: impl Into<String>,
        key_fn: KeyFunction,
        resolutions: IndexMap<String, String>,
    ) -> Result<Self> {
        Self::build(field.into(), key_fn, resolutions, Shape::Scalar)
    }

    /// Builds a resolver producing one sub-query per sequence element.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no resolutions are declared.
    pub fn array(
        field: impl Into<String>,
        key_fn: KeyFunction,
        resolutions: IndexMap<String, String>,
    ) -> Result<Self> {
        Self::build(field.into(), key_fn, resolutions, Shape::Array)
    }

    /// Compiles a resolver declaration against a registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unknown key functions or empty
    /// resolution sets.
    pub fn from_spec(
        field: &str,
        spec: &ResolverSpec,
        array: bool,
        registry: &TransformRegistry,
    ) -> Result<Self> {
        let key_fn = registry.key_fn(&spec.key)?;
        let shape = if array { Shape::Array } else { Shape::Scalar };
        Self::build(field.to_string(), key_fn, spec.resolutions.clone(), shape)
    }

    fn build(
        field: String,
        key_fn: KeyFunction,
        resolutions: IndexMap<String, String>,
        shape: Shape,
    ) -> Result<Self> {
        if resolutions.is_empty() {
            return Err(Error::Config(format!(
                "resolver for `{field}` declares no resolutions"
            )));
        }
        Ok(Self {
            field,
            key_fn,
            resolutions,
            shape,
        })
    }

    /// Target field this resolver writes.
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Whether this resolver links sequence elements.
    #[must_use]
    pub fn is_array(&self) -> bool {
        self.shape == Shape::Array
    }

    /// Resolves a value.
    ///
    /// `Ok(None)` means the field is omitted from the record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnresolvedKey`] when a computed key has no declared
    /// resolution.
    pub fn resolve(&self, value: &Value) -> Result<Option<Resolution>> {
        match self.shape {
            Shape::Scalar => self.resolve_scalar(value),
            Shape::Array => self.resolve_array(value),
        }
    }

    fn template(&self, key: Option<&str>, value: &Value) -> Result<&str> {
        key.and_then(|k| self.resolutions.get(k))
            .map(String::as_str)
            .ok_or_else(|| Error::unresolved_key(&self.field, key, value))
    }

    fn resolve_scalar(&self, value: &Value) -> Result<Option<Resolution>> {
        if is_null(value) {
            return Ok(None);
        }
        let key = self.key_fn.key(value)?;
        let query = self.template(key.as_deref(), value)?.to_string();
        let mut vars = IndexMap::new();
        vars.insert(self.field.clone(), value.to_json()?);
        Ok(Some(Resolution {
            source: value.clone(),
            query,
            vars,
        }))
    }

    fn resolve_array(&self, value: &Value) -> Result<Option<Resolution>> {
        let Some(entries) = value.as_array() else {
            debug!(field = %self.field, "not a sequence ({}), field omitted", value.type_name());
            return Ok(None);
        };
        if entries.is_empty() {
            return Ok(None);
        }
        if entries.len() > MAX_ARRAY_LEN {
            warn!(
                "{}: {} elements exceeds the limit of {}, field omitted",
                self.field,
                entries.len(),
                MAX_ARRAY_LEN
            );
            return Ok(None);
        }

        let mut sources = Vec::with_capacity(entries.len());
        let mut parts = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            let Some(map) = entry.as_map() else {
                error!(
                    "{}: element {} is a {}, only maps can be linked; field omitted",
                    self.field,
                    i,
                    entry.type_name()
                );
                return Ok(None);
            };
            let Some(key) = self.key_fn.key(entry)?.filter(|k| !k.is_empty()) else {
                let id = map.get("id").map_or_else(|| "<missing id>".to_string(), ToString::to_string);
                warn!("{}: null resolution key for element {} ({})", self.field, i, id);
                sources.push(Value::Null);
                continue;
            };
            let template = self.template(Some(&key), entry)?;
            parts.push(format!("({}),", substitute_index(template, i)));
            sources.push(entry.clone());
        }

        if sources.iter().all(is_null) {
            info!("{}: every element is null, field omitted", self.field);
            return Ok(None);
        }

        let encoded = serde_json::to_string(&Value::Array(sources.clone()).to_json()?)?;
        let mut vars = IndexMap::new();
        vars.insert(self.field.clone(), serde_json::Value::String(encoded));
        Ok(Some(Resolution {
            source: Value::Array(sources),
            query: format!(":= assert_distinct({{{}}})", parts.concat()),
            vars,
        }))
    }
}

/// Replaces every [`INDEX_PLACEHOLDER`] in `template` with `index`.
#[must_use]
pub fn substitute_index(template: &str, index: usize) -> String {
    template.replace(INDEX_PLACEHOLDER, &index.to_string())
}

#[cfg(test)]
#[path = "resolver_tests.rs"]
mod tests;
