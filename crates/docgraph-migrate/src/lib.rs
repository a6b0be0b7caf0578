// Migration tool - pedantic lints relaxed for CLI ergonomics
#![allow(clippy::pedantic)]

//! # docgraph-migrate
//!
//! `docgraph-migrate` is a CLI tool and library for migrating document-store
//! collections (Firestore) into a graph-relational database (EdgeDB).
//!
//! Each collection is migrated by a declarative rule set: field mappings
//! with transforms, reference resolution into linking sub-queries,
//! prerequisite guards, and one of three execution strategies.
//!
//! | Strategy | Writes | Failure handling |
//! |----------|--------|------------------|
//! | `row_transactional` | one insert per record | all-or-nothing, or best-effort with `--no-transaction` |
//! | `grouped_bulk` | one statement per `group_by` group | failed groups are logged |
//! | `resolution_keyed_bulk` | one keyed statement per record | failed records are logged |
//!
//! ## Quick Start
//!
//! ```bash
//! # Preview what would be written
//! docgraph-migrate run --config rules.yaml users --dry-run --limit 20
//!
//! # Inspect one mapped field
//! docgraph-migrate run --config rules.yaml users --dry-run --field phone_number
//! ```
//!
//! ## Configuration Example
//!
//! ```yaml
//! source:
//!   type: firestore
//!   project_id: my-project
//!
//! target:
//!   type: edgedb_http
//!   url: http://localhost:10701
//!
//! collections:
//!   users:
//!     fetch_order: { field: createdAt, direction: ascending }
//!     mapping:
//!       firebase_uid: id
//!       phone_number: { col: phoneNumber, transform: normalize_phone }
//!       metadata: { row: attach_metadata }
//!     skip_if_empty: [phone_number]
//!     query_suffix: unless conflict on .firebase_uid
//!     execution: { strategy: row_transactional, entity: User }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod guard;
pub mod mapping;
pub mod normalize;
pub mod pipeline;
pub mod query;
pub mod record;
pub mod resolver;
pub mod retry;
pub mod source;
pub mod target;
pub mod transforms;
pub mod transport;

pub use config::{CollectionRules, MigrationConfig, MigrationOptions, SourceConfig, TargetConfig};
pub use error::{Error, Result};
pub use executor::{ExecutionPlan, ExecutionReport};
pub use mapping::{Cell, MappedBatch, MappedRecord, Mapper, MappingRule};
pub use pipeline::{Pipeline, RunOptions, RunStats};
pub use query::{QueryBuilder, Statement};
pub use record::{Record, Timestamp, Value};
pub use source::{RecordSource, FetchRequest, FetchPage};
pub use target::{TargetStore, Transaction};
pub use transforms::TransformRegistry;
