//! # corpus-sync CLI (`corpus`)
//!
//! The `corpus` binary drives the sync engine and serves the retrieval
//! API. All commands accept a `--config` flag pointing to a TOML
//! configuration file.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `corpus init` | Build the index from the object store (or validate an existing one) |
//! | `corpus sync` | Run one reconciliation pass against the object store |
//! | `corpus upload <path>` | Write a local file to the object store and upsert the index |
//! | `corpus objects` | List the objects currently in the store |
//! | `corpus search "<query>"` | Similarity search over indexed chunks |
//! | `corpus serve` | Bootstrap, sync, and start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! corpus init --config ./config/corpus.toml
//! corpus sync --config ./config/corpus.toml
//! corpus upload ./whitepaper.pdf --config ./config/corpus.toml
//! corpus search "key rotation policy" --limit 5
//! corpus serve --config ./config/corpus.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use corpus_sync::bootstrap::bootstrap_or_load;
use corpus_sync::config::{load_config, Config};
use corpus_sync::index::sqlite::SqliteIndex;
use corpus_sync::index::ChunkIndex;
use corpus_sync::models::SyncReport;
use corpus_sync::object_store::s3::S3Store;
use corpus_sync::object_store::ObjectStore;
use corpus_sync::reconcile::{reconcile, upsert_object};
use corpus_sync::search::retrieve;
use corpus_sync::server::run_server;

/// corpus-sync — keeps a searchable chunk index synchronized with a
/// versioned S3 document collection.
#[derive(Parser)]
#[command(
    name = "corpus",
    about = "Keeps a searchable chunk index synchronized with a versioned S3 document collection",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/corpus.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the index from the object store, or validate an existing one.
    ///
    /// With no index at the configured path, enumerates the full catalog
    /// and builds the index in one batch (an empty store yields an empty
    /// index). With an existing index, opens and validates it.
    Init {
        /// Delete any existing index and rebuild from scratch.
        #[arg(long)]
        force_rebuild: bool,
    },

    /// Run one reconciliation pass.
    ///
    /// Diffs the store's current versions against the index and applies
    /// the minimal set of add/replace/remove operations. Running it again
    /// with no remote change is a no-op.
    Sync,

    /// Upload a local file to the object store and upsert its chunks.
    Upload {
        /// File to upload. The object key is the filename under the
        /// configured prefix.
        path: PathBuf,
    },

    /// List the objects currently in the store.
    Objects,

    /// Similarity search over indexed chunks.
    Search {
        query: String,

        /// Maximum number of results.
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Bootstrap the index, reconcile, and start the HTTP server.
    Serve,
}

fn print_report(report: &SyncReport) {
    println!("sync report");
    println!("  added:   {} objects", report.added);
    println!("  updated: {} objects", report.updated);
    println!("  deleted: {} objects", report.deleted);
    println!("  chunks:  +{} / -{}", report.chunks_added, report.chunks_deleted);
    if !report.issues.is_empty() {
        println!("  issues:  {}", report.issues.len());
        for issue in &report.issues {
            println!("    [{:?}] {}: {}", issue.stage, issue.key, issue.detail);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config: Config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init { force_rebuild } => {
            let store = S3Store::new(config.store.clone())?;
            let (index, needs_sync) = bootstrap_or_load(&config, &store, force_rebuild).await?;
            let count = index.count().await?;
            println!("Index ready at {} ({} chunks)", config.index.path.display(), count);
            if needs_sync {
                println!("Run `corpus sync` before serving queries.");
            }
            index.close().await;
        }

        Commands::Sync => {
            let store = S3Store::new(config.store.clone())?;
            let (index, _) = bootstrap_or_load(&config, &store, false).await?;
            let report = reconcile(&store, &index, config.chunking.clone()).await?;
            print_report(&report);
            index.close().await;
        }

        Commands::Upload { path } => {
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .context("upload path has no filename")?
                .to_string();
            let bytes = std::fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;

            let store = S3Store::new(config.store.clone())?;
            let (index, _) = bootstrap_or_load(&config, &store, false).await?;

            let prefix = config.store.prefix.trim_end_matches('/');
            let key = if prefix.is_empty() {
                filename
            } else {
                format!("{}/{}", prefix, filename)
            };

            let remote = store.put(&key, bytes).await?;
            println!("Uploaded {} (version {})", key, remote.version_id);

            let chunks_added = upsert_object(
                &store,
                &index,
                config.chunking.clone(),
                &key,
                &remote.version_id,
                remote.last_modified,
            )
            .await?;
            println!("Indexed {} chunks for {}", chunks_added, key);
            index.close().await;
        }

        Commands::Objects => {
            let store = S3Store::new(config.store.clone())?;
            let listing = store.list_for_display().await?;
            println!("{:<40} {:>10}  {:<25} KEY", "FILENAME", "SIZE", "LAST MODIFIED");
            for obj in &listing {
                println!(
                    "{:<40} {:>10}  {:<25} {}",
                    obj.filename,
                    obj.size,
                    obj.last_modified.as_deref().unwrap_or("-"),
                    obj.key
                );
            }
            println!("{} objects", listing.len());
        }

        Commands::Search { query, limit } => {
            if !SqliteIndex::exists(&config.index.path) {
                bail!(
                    "no index at {}; run `corpus init` first",
                    config.index.path.display()
                );
            }
            let index = SqliteIndex::open(&config.index.path, config.embedding.clone()).await?;
            let results = retrieve(&index, &query, limit).await?;
            if results.is_empty() {
                println!("no results");
            }
            for (i, result) in results.iter().enumerate() {
                let snippet: String = result.text.chars().take(240).collect();
                println!("{}. [{:.3}] {}", i + 1, result.score, result.source_key);
                println!("   {}", result.public_url);
                println!("   {}", snippet.replace('\n', " "));
            }
            index.close().await;
        }

        Commands::Serve => {
            let store = S3Store::new(config.store.clone())?;
            let (index, needs_sync) = bootstrap_or_load(&config, &store, false).await?;
            if needs_sync {
                let report = reconcile(&store, &index, config.chunking.clone()).await?;
                print_report(&report);
            }
            let store: Arc<dyn ObjectStore> = Arc::new(store);
            let index: Arc<dyn ChunkIndex> = Arc::new(index);
            run_server(config, store, index).await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
