//! Error types for docgraph-migrate.
//!
//! Errors fall into four classes: configuration and format errors abort a
//! run, row-level validity failures never surface as errors at all (they
//! become invalid query fragments), and execution errors are fatal or
//! logged depending on the execution strategy.

use thiserror::Error;

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while migrating a collection.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or incomplete mapping configuration (MIG-001).
    #[error("[MIG-001] Configuration error: {0}")]
    Config(String),

    /// A resolver produced a key outside its declared resolution set (MIG-002).
    ///
    /// The mapping rules do not cover a category of value seen in the data.
    #[error("[MIG-002] Resolution key `{key}` not declared for field `{field}` (value: {value})")]
    UnresolvedKey {
        /// Target field being resolved.
        field: String,
        /// Key returned by the resolve function (`null` when absent).
        key: String,
        /// Source value that produced the key.
        value: String,
    },

    /// A value could not be corrected into its canonical form (MIG-003).
    #[error("[MIG-003] Format error: {0}")]
    Format(String),

    /// A value had a shape a transform does not support (MIG-004).
    #[error("[MIG-004] Type error: {0}")]
    Type(String),

    /// Source store connection error (MIG-005).
    #[error("[MIG-005] Source connection error: {0}")]
    SourceConnection(String),

    /// Failed to decode records returned by the source (MIG-006).
    #[error("[MIG-006] Extraction error: {0}")]
    Extraction(String),

    /// Authentication against a remote store failed (MIG-007).
    #[error("[MIG-007] Authentication failed: {0}")]
    Authentication(String),

    /// Remote store asked us to slow down (MIG-008).
    #[error("[MIG-008] Rate limited, retry after {0}s")]
    RateLimit(u64),

    /// Target store connection error (MIG-009).
    #[error("[MIG-009] Target connection error: {0}")]
    TargetConnection(String),

    /// A statement failed against the target store (MIG-010).
    #[error("[MIG-010] Query execution failed: {0}")]
    Execution(String),

    /// A transactional batch was rolled back (MIG-011).
    #[error("[MIG-011] Transaction aborted: {0}")]
    Transaction(String),

    /// The target store cannot perform the requested operation (MIG-012).
    #[error("[MIG-012] Unsupported operation: {0}")]
    Unsupported(String),

    /// HTTP transport error (MIG-013).
    #[error("[MIG-013] HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error (MIG-014).
    #[error("[MIG-014] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error (MIG-015).
    #[error("[MIG-015] YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error (MIG-016).
    #[error("[MIG-016] JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV writer error (MIG-017).
    #[error("[MIG-017] CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    /// Returns the error code (e.g., "MIG-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "MIG-001",
            Self::UnresolvedKey { .. } => "MIG-002",
            Self::Format(_) => "MIG-003",
            Self::Type(_) => "MIG-004",
            Self::SourceConnection(_) => "MIG-005",
            Self::Extraction(_) => "MIG-006",
            Self::Authentication(_) => "MIG-007",
            Self::RateLimit(_) => "MIG-008",
            Self::TargetConnection(_) => "MIG-009",
            Self::Execution(_) => "MIG-010",
            Self::Transaction(_) => "MIG-011",
            Self::Unsupported(_) => "MIG-012",
            Self::Http(_) => "MIG-013",
            Self::Io(_) => "MIG-014",
            Self::Yaml(_) => "MIG-015",
            Self::Json(_) => "MIG-016",
            Self::Csv(_) => "MIG-017",
        }
    }

    /// Returns true if this error belongs to a class that aborts the run
    /// rather than being logged against a single statement.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Execution(_))
    }

    /// Builds an [`Error::UnresolvedKey`].
    pub fn unresolved_key(
        field: impl Into<String>,
        key: Option<&str>,
        value: impl std::fmt::Display,
    ) -> Self {
        Self::UnresolvedKey {
            field: field.into(),
            key: key.unwrap_or("null").to_string(),
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
