//! Migration pipeline orchestration.
//!
//! One run migrates one collection: fetch, transform, guard validation,
//! statement synthesis or bulk payload construction, then execution. The
//! phases are strictly sequential over one in-memory batch.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::{CollectionRules, MigrationConfig};
use crate::diagnostics::{create_progress_bar, dump_invalid, log_preview};
use crate::error::{Error, Result};
use crate::executor::{
    run_grouped, run_keyed, run_statements, split_skipped, ExecutionPlan, ExecutionReport, TxMode,
};
use crate::guard;
use crate::mapping::{MappedBatch, Mapper, TransformOptions};
use crate::query::{InvalidRow, QueryBuilder};
use crate::record::Record;
use crate::source::{create_source, fetch_all, FetchRequest, RecordSource};
use crate::target::{create_store, TargetStore};
use crate::transforms::TransformRegistry;

/// Options for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Build everything but execute nothing.
    pub dry_run: bool,
    /// Write invalid rows to a CSV file.
    pub dump_invalid: bool,
    /// Skip transforms that call outside services.
    pub no_external: bool,
    /// Execute row-wise statements one by one instead of in one transaction.
    pub no_transaction: bool,
    /// Map only this field. Requires `dry_run`.
    pub field: Option<String>,
    /// Fetch a single page of at most this many documents.
    pub limit: Option<usize>,
    /// Document key to start after.
    pub start_after: Option<String>,
}

/// Wall-clock time spent per phase.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PhaseTimings {
    /// Fetching documents.
    pub fetch: Duration,
    /// Mapping and guard validation.
    pub transform: Duration,
    /// Statement synthesis and execution.
    pub query: Duration,
    /// The whole run.
    pub total: Duration,
}

/// Run statistics.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunStats {
    /// Documents fetched.
    pub fetched: usize,
    /// Records mapped.
    pub transformed: usize,
    /// Records that passed validation.
    pub valid: usize,
    /// Records rejected before execution.
    pub invalid: usize,
    /// Statements that succeeded.
    pub executed: usize,
    /// Statements that failed without aborting the run.
    pub failed: usize,
    /// Records never sent (null group key or unknown resolution key).
    pub skipped: usize,
    /// Per-phase timings.
    pub timings: PhaseTimings,
}

impl RunStats {
    fn absorb(&mut self, report: ExecutionReport) {
        self.executed = report.succeeded;
        self.failed = report.failed;
        self.skipped = report.skipped;
    }
}

/// Migration pipeline.
pub struct Pipeline {
    config: MigrationConfig,
    registry: TransformRegistry,
    source: Box<dyn RecordSource>,
    store: Box<dyn TargetStore>,
}

impl Pipeline {
    /// Create a pipeline over explicit source and target stores.
    #[must_use]
    pub fn new(
        config: MigrationConfig,
        registry: TransformRegistry,
        source: Box<dyn RecordSource>,
        store: Box<dyn TargetStore>,
    ) -> Self {
        Self {
            config,
            registry,
            source,
            store,
        }
    }

    /// Create a pipeline with the stores named in the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if either store configuration is invalid.
    pub fn from_config(config: MigrationConfig, registry: TransformRegistry) -> Result<Self> {
        let source = create_source(&config.source)?;
        let store = create_store(&config.target)?;
        Ok(Self::new(config, registry, source, store))
    }

    /// The loaded configuration.
    #[must_use]
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// The target store.
    #[must_use]
    pub fn store(&self) -> &dyn TargetStore {
        self.store.as_ref()
    }

    /// Migrate one collection. The source and target stores are closed
    /// when the run ends, whether it succeeded or not.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unknown collection, an undeclared
    /// `field`, or `field` without `dry_run`. Propagates fatal source,
    /// transform and transaction errors, then errors from closing.
    pub async fn run(&mut self, collection: &str, options: &RunOptions) -> Result<RunStats> {
        let result = self.migrate(collection, options).await;
        let closed = self.close().await;
        match (result, closed) {
            (Ok(stats), closed) => closed.map(|()| stats),
            (Err(e), Err(close_error)) => {
                warn!("Closing stores after a failed run: {}", close_error);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    async fn close(&mut self) -> Result<()> {
        let source = self.source.close().await;
        let store = self.store.close().await;
        source.and(store)
    }

    async fn migrate(&mut self, collection: &str, options: &RunOptions) -> Result<RunStats> {
        let start = Instant::now();
        let rules = self.config.collection(collection)?.clone();
        check_options(&rules, options)?;
        let mapper = Mapper::new(&rules.mapping, &self.registry)?;
        let mut stats = RunStats::default();

        info!(
            "Migrating {} ({} strategy) from {} to {}",
            collection,
            rules.execution.name(),
            self.source.source_type(),
            self.store.store_type()
        );

        let phase = Instant::now();
        let records = self.fetch(collection, &rules, options).await?;
        stats.fetched = records.len();
        stats.timings.fetch = phase.elapsed();
        info!(
            "Fetched {} documents in {:.2}s",
            stats.fetched,
            stats.timings.fetch.as_secs_f64()
        );

        let phase = Instant::now();
        let transform_options = TransformOptions {
            no_external: options.no_external,
            single_field: options.field.clone(),
        };
        let mut batch = mapper.transform(&records, &rules.group_by, &transform_options)?;
        stats.transformed = batch.len();
        if batch.partial {
            info!("--field: guards skipped when mapping a single field");
        } else if !rules.prerequisites.is_empty() {
            let report =
                guard::validate(&mut batch.records, &rules.prerequisites, self.store.as_ref())
                    .await;
            info!(
                "Prerequisites: {} queries, {} failed, {} short-circuited",
                report.executed, report.failed, report.short_circuited
            );
        }
        stats.timings.transform = phase.elapsed();
        info!(
            "Transform time: {:.2}s",
            stats.timings.transform.as_secs_f64()
        );

        let phase = Instant::now();
        self.execute(collection, &rules, batch, options, &mut stats)
            .await?;
        stats.timings.query = phase.elapsed();
        info!("Query time: {:.2}s", stats.timings.query.as_secs_f64());

        stats.timings.total = start.elapsed();
        info!(
            "{}: {} fetched, {} transformed, {} valid, {} invalid, {} executed, {} failed, {} skipped in {:.2}s",
            collection,
            stats.fetched,
            stats.transformed,
            stats.valid,
            stats.invalid,
            stats.executed,
            stats.failed,
            stats.skipped,
            stats.timings.total.as_secs_f64()
        );
        Ok(stats)
    }

    async fn fetch(
        &mut self,
        collection: &str,
        rules: &CollectionRules,
        options: &RunOptions,
    ) -> Result<Vec<Record>> {
        self.source.connect().await?;
        let mut request = FetchRequest::for_collection(collection, rules);
        if rules.collection_group {
            info!("Fetching {} as a collection group...", collection);
        }
        if let Some(key) = &options.start_after {
            let cursor = self.source.resolve_start_after(&request, key).await?;
            request = request.with_start_after(Some(cursor));
        }

        let records = match options.limit {
            Some(limit) => {
                self.source
                    .fetch(&request.with_limit(Some(limit)))
                    .await?
                    .records
            }
            None => {
                fetch_all(
                    self.source.as_ref(),
                    &request,
                    self.config.options.page_size,
                )
                .await?
            }
        };

        let fields: BTreeSet<&str> = records
            .iter()
            .flat_map(|r| r.keys().map(String::as_str))
            .collect();
        info!("Loaded fields: {:?}", fields);
        Ok(records)
    }

    async fn execute(
        &self,
        collection: &str,
        rules: &CollectionRules,
        batch: MappedBatch,
        options: &RunOptions,
        stats: &mut RunStats,
    ) -> Result<()> {
        let store = self.store.as_ref();
        match &rules.execution {
            ExecutionPlan::RowTransactional { entity } => {
                let built = QueryBuilder::for_collection(entity, rules).build_all(&batch.records)?;
                stats.valid = built.valid.len();
                stats.invalid = built.invalid.len();
                self.dump(&built.invalid, collection, options)?;
                log_preview(&built.valid)?;
                if skip_execution(built.valid.len(), options) {
                    return Ok(());
                }
                let mode = if options.no_transaction {
                    TxMode::BestEffort
                } else {
                    TxMode::Transactional
                };
                let progress = create_progress_bar(built.valid.len() as u64, "insert");
                let report = run_statements(&built.valid, store, mode, &progress).await;
                progress.finish_and_clear();
                stats.absorb(report?);
            }
            ExecutionPlan::GroupedBulk { query } => {
                let (batch, rejected) = split_skipped(batch);
                stats.valid = batch.len();
                stats.invalid = rejected.len();
                self.dump(&rejected, collection, options)?;
                info!("Query: {} (with bulk insert)", query);
                if skip_execution(batch.len(), options) {
                    return Ok(());
                }
                info!("Will run on {} rows", batch.len());
                let progress = create_progress_bar(batch.len() as u64, "bulk");
                let report = run_grouped(&batch, query, store, &progress).await;
                progress.finish_and_clear();
                stats.absorb(report?);
            }
            ExecutionPlan::ResolutionKeyedBulk { key, statements } => {
                let key_fn = self.registry.key_fn(key)?;
                let (batch, rejected) = split_skipped(batch);
                stats.valid = batch.len();
                stats.invalid = rejected.len();
                self.dump(&rejected, collection, options)?;
                info!("Query: {} (with row resolvers)", key_fn.name());
                if skip_execution(batch.len(), options) {
                    return Ok(());
                }
                info!("Will run on {} rows", batch.len());
                let progress = create_progress_bar(batch.len() as u64, "resolve");
                let report = run_keyed(&batch, &key_fn, statements, store, &progress).await;
                progress.finish_and_clear();
                stats.absorb(report?);
            }
        }
        Ok(())
    }

    fn dump(&self, rows: &[InvalidRow], collection: &str, options: &RunOptions) -> Result<()> {
        if options.dump_invalid {
            dump_invalid(rows, &self.config.options.dump_dir, collection)?;
        }
        Ok(())
    }
}

fn check_options(rules: &CollectionRules, options: &RunOptions) -> Result<()> {
    let Some(field) = &options.field else {
        return Ok(());
    };
    if !rules.mapping.contains_key(field) {
        return Err(Error::Config(format!(
            "field `{field}` is not declared in the mapping"
        )));
    }
    if !options.dry_run {
        return Err(Error::Config(
            "--field requires --dry-run: statements built from one field would insert partial data"
                .to_string(),
        ));
    }
    Ok(())
}

fn skip_execution(pending: usize, options: &RunOptions) -> bool {
    if options.dry_run {
        info!("--dry-run: nothing executed");
        return true;
    }
    if pending == 0 {
        warn!("Nothing to execute");
        return true;
    }
    false
}
