//! # folio CLI entry point
//!
//! Operator commands for the periodic maintenance sweeps. Intended to be run
//! from a scheduler; every command exits non-zero on failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use folio_core::content::OrphanCollector;
use folio_core::maintenance::{sweep_idempotency_records, sweep_orphaned_content};
use folio_core::{ContentStoreConfig, FsContentStore, IdempotencyCoordinator};
use folio_postgres::{PgAdvisoryLock, PgIdempotencyStore, PgReferenceSource, DEFAULT_TABLE};
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

/// Folio maintenance tool.
#[derive(Parser, Debug)]
#[command(name = "folio", version, about, long_about = None)]
struct Cli {
    /// Enable verbose output. Repeat for more verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// PostgreSQL connection string.
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Idempotency table name.
    #[arg(long, default_value = DEFAULT_TABLE, global = true)]
    table: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the idempotency table if it does not exist.
    InitSchema,

    /// Delete idempotency records older than the given age.
    SweepIdempotency(SweepIdempotencyArgs),

    /// Delete stored content that no catalog row references.
    SweepContent(SweepContentArgs),
}

#[derive(Args, Debug)]
struct SweepIdempotencyArgs {
    /// Records created more than this many hours ago are deleted.
    #[arg(long, default_value_t = 24)]
    max_age_hours: u64,
}

#[derive(Args, Debug)]
struct SweepContentArgs {
    /// Unreferenced content younger than this is kept.
    #[arg(long, default_value_t = 24)]
    ttl_hours: u64,

    /// Root directory of the content store.
    #[arg(long, env = "FOLIO_CONTENT_ROOT")]
    content_root: PathBuf,

    /// Public URL prefix of the content store.
    #[arg(long, env = "FOLIO_CONTENT_BASE_URL", default_value = "")]
    base_url: String,

    /// Query returning one text column of referenced content URLs.
    #[arg(long)]
    reference_query: String,

    /// Report what would be deleted without deleting it.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let url = cli
        .database_url
        .context("--database-url or DATABASE_URL is required")?;
    let pool = PgPool::connect(&url)
        .await
        .context("failed to connect to PostgreSQL")?;

    match cli.command {
        Commands::InitSchema => {
            let store = PgIdempotencyStore::with_table(pool, cli.table)?;
            store.create_table().await?;
            println!("created table {}", store.table());
        }
        Commands::SweepIdempotency(args) => {
            let store = PgIdempotencyStore::with_table(pool.clone(), cli.table)?;
            let coordinator =
                IdempotencyCoordinator::new(Arc::new(store), Arc::new(PgAdvisoryLock::new(pool)));
            let deleted = sweep_idempotency_records(&coordinator, args.max_age_hours).await?;
            println!("deleted {deleted} idempotency record(s)");
        }
        Commands::SweepContent(args) => {
            let store = FsContentStore::from_config(&ContentStoreConfig {
                root: args.content_root,
                base_url: args.base_url,
            });
            let collector = OrphanCollector::new(Arc::new(store));
            let references = PgReferenceSource::new(pool, args.reference_query);
            let report =
                sweep_orphaned_content(&collector, &references, args.ttl_hours, args.dry_run)
                    .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.has_errors() {
                anyhow::bail!("{} file(s) could not be removed", report.errors.len());
            }
        }
    }
    Ok(())
}
