//! # SpaceSync CLI (`ssync`)
//!
//! Thin command-line wrapper around the sync engine. All commands accept a
//! `--config` flag pointing to a TOML configuration file.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ssync verify` | Check source credentials |
//! | `ssync sync <space>` | Run one reconciliation pass for a space |
//! | `ssync retrieve <space> "<query>"` | Query the destination index |
//! | `ssync status <space>` | Show cached sync state for a space |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use spacesync::config::{load_config, Config};
use spacesync::extract::VisionDescriber;
use spacesync::gateway::{DestinationGateway, KnowledgeBaseClient};
use spacesync::models::SyncReport;
use spacesync::reconcile::{Reconciler, SyncOptions};
use spacesync::source::{SourceClient, WikiClient};
use spacesync::state::JsonStateStore;

/// SpaceSync CLI — mirror wiki spaces into a knowledge-base index.
#[derive(Parser)]
#[command(
    name = "ssync",
    about = "SpaceSync — incremental wiki-space to knowledge-base sync",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/spacesync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the configured source credentials are accepted.
    Verify,

    /// Run one sync pass for a space.
    Sync {
        /// Space key to reconcile (e.g. `ENG`).
        space: String,

        /// Ignore cached state — re-upload everything currently in the
        /// source.
        #[arg(long)]
        full: bool,

        /// Show the pending diff without applying anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Query the destination index for relevant chunks.
    Retrieve {
        /// Space key whose collection to query.
        space: String,

        /// Query text.
        query: String,

        /// Maximum number of chunks to return.
        #[arg(long, default_value_t = 7)]
        top_k: usize,
    },

    /// Show cached sync state for a space.
    Status {
        /// Space key to inspect.
        space: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Verify => verify(&config).await,
        Commands::Sync {
            space,
            full,
            dry_run,
        } => sync(&config, &space, full, dry_run).await,
        Commands::Retrieve {
            space,
            query,
            top_k,
        } => retrieve(&config, &space, &query, top_k).await,
        Commands::Status { space } => status(&config, &space),
    }
}

fn build_source(config: &Config) -> Result<Arc<dyn SourceClient>> {
    let token = config.source.resolved_api_token()?;
    Ok(Arc::new(WikiClient::new(
        &config.source,
        &config.sync,
        token,
    )?))
}

fn build_gateway(config: &Config) -> Result<Arc<dyn DestinationGateway>> {
    let key = config.destination.resolved_api_key()?;
    Ok(Arc::new(KnowledgeBaseClient::new(
        &config.destination,
        &config.sync,
        key,
    )?))
}

fn build_reconciler(config: &Config) -> Result<Reconciler> {
    let source = build_source(config)?;
    let gateway = build_gateway(config)?;
    let state = JsonStateStore::new(&config.sync.state_dir);

    let mut reconciler = Reconciler::new(source, gateway, state, config.sync.max_concurrency);
    if let Some(image) = &config.extractors.image {
        reconciler = reconciler.with_image_describer(Arc::new(VisionDescriber::new(image)?));
    }
    Ok(reconciler)
}

fn collection_name(config: &Config, space: &str) -> String {
    format!("{}_{}", config.source.host_prefix(), space)
}

async fn verify(config: &Config) -> Result<()> {
    let source = build_source(config)?;
    match source.verify_credentials().await {
        Ok(()) => {
            println!("credentials ok");
            Ok(())
        }
        Err(err) => {
            println!("credentials rejected");
            Err(err.into())
        }
    }
}

async fn sync(config: &Config, space: &str, full: bool, dry_run: bool) -> Result<()> {
    let reconciler = build_reconciler(config)?;
    let collection = collection_name(config, space);
    let options = SyncOptions { full };

    if dry_run {
        let (pages, attachments) = reconciler.preview(space, &collection, &options).await?;
        println!("sync {space} (dry-run)");
        println!(
            "  pages: {} to upsert, {} to delete",
            pages.upsert_count(),
            pages.removed.len()
        );
        println!(
            "  attachments: {} to upsert, {} to delete",
            attachments.upsert_count(),
            attachments.removed.len()
        );
        return Ok(());
    }

    // first interrupt stops dispatching and persists completed work
    let cancel = reconciler.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, finishing in-flight work");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    let report = reconciler.sync_space(space, &collection, &options).await?;
    print_report(space, &report);
    Ok(())
}

fn print_report(space: &str, report: &SyncReport) {
    println!("sync {space}");
    println!("  collection: {}", report.collection);
    println!(
        "  pages: {} upserted, {} deleted",
        report.pages_upserted, report.pages_deleted
    );
    println!(
        "  attachments: {} upserted, {} deleted, {} skipped",
        report.attachments_upserted, report.attachments_deleted, report.skipped
    );
    if !report.failed.is_empty() {
        println!("  failed: {}", report.failed.len());
        for failure in &report.failed {
            println!("    {} {} — {}", failure.kind, failure.name, failure.error);
        }
    }
    if report.cancelled {
        println!("  cancelled before completion; completed work persisted");
    }
    println!("ok");
}

async fn retrieve(config: &Config, space: &str, query: &str, top_k: usize) -> Result<()> {
    let gateway = build_gateway(config)?;
    let collection = collection_name(config, space);

    let handle = gateway.get_or_create_collection(&collection).await?;
    if handle.created {
        // a brand-new collection invalidates any cached sync state
        JsonStateStore::new(&config.sync.state_dir).reset(&collection)?;
        println!("collection {collection} was empty — run `ssync sync {space}` first");
        return Ok(());
    }
    let chunks = gateway.retrieve(&handle.id, query, top_k).await?;

    if chunks.is_empty() {
        println!("no results");
        return Ok(());
    }
    for chunk in &chunks {
        println!("[{:.3}] {}", chunk.score, chunk.document_name);
        println!("{}", chunk.content);
        println!();
    }
    Ok(())
}

fn status(config: &Config, space: &str) -> Result<()> {
    let collection = collection_name(config, space);
    let store = JsonStateStore::new(&config.sync.state_dir);
    let state = store.load(&collection)?;

    println!("status {space}");
    println!("  collection: {collection}");
    println!("  state file: {}", store.path_for(&collection).display());
    match state.saved_at {
        Some(at) => println!("  last synced: {}", at.to_rfc3339()),
        None => println!("  last synced: never"),
    }
    println!("  cached pages: {}", state.pages.len());
    println!("  cached attachments: {}", state.attachments.len());
    Ok(())
}
