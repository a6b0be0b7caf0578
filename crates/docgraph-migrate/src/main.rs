//! docgraph-migrate CLI
//!
//! Migrates one document-store collection at a time into a
//! graph-relational database, following a YAML rules file.

// CLI tool - relax pedantic lints for ergonomics
#![allow(clippy::pedantic)]

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

use docgraph_migrate::config::{SourceConfig, TargetConfig};
use docgraph_migrate::{
    Error, ExecutionPlan, MigrationConfig, Pipeline, RunOptions, TransformRegistry,
};

#[derive(Parser)]
#[command(name = "docgraph-migrate")]
#[command(version)]
#[command(about = "Migrate Firestore collections into EdgeDB", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Args)]
struct Secrets {
    /// Firestore OAuth2 bearer token (overrides the rules file)
    #[arg(long, env = "FIRESTORE_TOKEN", hide_env_values = true)]
    firestore_token: Option<String>,

    /// EdgeDB password (overrides the rules file)
    #[arg(long, env = "EDGEDB_PASSWORD", hide_env_values = true)]
    edgedb_password: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate one collection
    Run {
        /// Rules file path
        #[arg(short, long, value_name = "FILE", env = "DOCGRAPH_RULES")]
        config: PathBuf,

        /// Source collection to migrate
        collection: String,

        /// Build statements but do not execute them
        #[arg(long)]
        dry_run: bool,

        /// Write invalid rows to <dump_dir>/<collection>_invalid.csv
        #[arg(long)]
        dump_invalid: bool,

        /// Skip transforms that call external services
        #[arg(long)]
        no_external: bool,

        /// Execute statements one by one instead of in one transaction
        #[arg(long)]
        no_transaction: bool,

        /// Map only this target field (requires --dry-run)
        #[arg(long, value_name = "FIELD")]
        field: Option<String>,

        /// Fetch a single page of at most N documents
        #[arg(long, value_name = "N")]
        limit: Option<usize>,

        /// Document key to start after
        #[arg(long, value_name = "KEY")]
        start_after: Option<String>,

        #[command(flatten)]
        secrets: Secrets,
    },

    /// Validate a rules file
    Validate {
        /// Rules file path
        #[arg(short, long, value_name = "FILE", env = "DOCGRAPH_RULES")]
        config: PathBuf,
    },

    /// List the collections a rules file declares
    List {
        /// Rules file path
        #[arg(short, long, value_name = "FILE", env = "DOCGRAPH_RULES")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            config,
            collection,
            dry_run,
            dump_invalid,
            no_external,
            no_transaction,
            field,
            limit,
            start_after,
            secrets,
        } => {
            let options = RunOptions {
                dry_run,
                dump_invalid,
                no_external,
                no_transaction,
                field,
                limit,
                start_after,
            };
            run_migration(&config, &collection, &options, secrets).await?;
        }
        Commands::Validate { config } => {
            validate_config(&config)?;
        }
        Commands::List { config } => {
            list_collections(&config)?;
        }
    }

    Ok(())
}

fn load(config_path: &Path) -> anyhow::Result<MigrationConfig> {
    info!("Loading configuration from {:?}", config_path);
    let config = MigrationConfig::from_file(config_path)?;
    config.validate()?;
    Ok(config)
}

fn apply_secrets(config: &mut MigrationConfig, secrets: Secrets) {
    if let (SourceConfig::Firestore(cfg), Some(token)) =
        (&mut config.source, secrets.firestore_token)
    {
        cfg.token = Some(token);
    }
    if let (TargetConfig::EdgeHttp(cfg), Some(password)) =
        (&mut config.target, secrets.edgedb_password)
    {
        cfg.password = Some(password);
    }
}

async fn run_migration(
    config_path: &Path,
    collection: &str,
    options: &RunOptions,
    secrets: Secrets,
) -> anyhow::Result<()> {
    let mut config = load(config_path)?;
    apply_secrets(&mut config, secrets);

    let mut pipeline = Pipeline::from_config(config, TransformRegistry::with_builtins())?;
    let stats = match pipeline.run(collection, options).await {
        Ok(stats) => stats,
        Err(e @ Error::Transaction(_)) => {
            error!("{}", e);
            eprintln!("Nothing was written. Rerun with --no-transaction to keep the valid rows.");
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    println!("\nMigration of {collection} complete");
    println!("   Fetched:     {}", stats.fetched);
    println!("   Transformed: {}", stats.transformed);
    println!("   Valid:       {}", stats.valid);
    println!("   Invalid:     {}", stats.invalid);
    println!("   Executed:    {}", stats.executed);
    println!("   Failed:      {}", stats.failed);
    println!("   Skipped:     {}", stats.skipped);
    println!(
        "   Duration:    {:.2}s (fetch {:.2}s, transform {:.2}s, query {:.2}s)",
        stats.timings.total.as_secs_f64(),
        stats.timings.fetch.as_secs_f64(),
        stats.timings.transform.as_secs_f64(),
        stats.timings.query.as_secs_f64()
    );
    if options.dry_run {
        println!("   (dry run: nothing was written)");
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> anyhow::Result<()> {
    let config = load(config_path)?;
    let registry = TransformRegistry::with_builtins();
    for (name, rules) in &config.collections {
        let mapper = docgraph_migrate::Mapper::new(&rules.mapping, &registry)
            .map_err(|e| anyhow::anyhow!("collection `{name}`: {e}"))?;
        debug!("{}: {:?}", name, mapper.fields().collect::<Vec<_>>());
        if let ExecutionPlan::ResolutionKeyedBulk { key, .. } = &rules.execution {
            registry
                .key_fn(key)
                .map_err(|e| anyhow::anyhow!("collection `{name}`: {e}"))?;
        }
    }

    println!("Configuration is valid");
    println!("   Collections: {}", config.collections.len());
    Ok(())
}

fn list_collections(config_path: &Path) -> anyhow::Result<()> {
    let config = load(config_path)?;
    for (name, rules) in &config.collections {
        println!(
            "{name}: {} fields, {} strategy, ordered by {} ({:?}){}",
            rules.mapping.len(),
            rules.execution.name(),
            rules.fetch_order.field,
            rules.fetch_order.direction,
            if rules.collection_group {
                ", collection group"
            } else {
                ""
            }
        );
    }
    Ok(())
}
