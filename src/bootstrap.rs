//! Index bootstrap: build from scratch or open and validate.
//!
//! Exactly one place constructs the index handle; every other operation
//! receives it as a value. When an existing index is opened, the caller is
//! told a reconciliation pass is required before serving queries.

use anyhow::{Context, Result};

use crate::config::Config;
use crate::index::sqlite::SqliteIndex;
use crate::index::ChunkIndex;
use crate::loader::DocumentLoader;
use crate::models::ChunkRecord;
use crate::object_store::ObjectStore;

/// Build the index from the full catalog when none exists at the configured
/// path, or open and validate the existing one.
///
/// Returns the handle plus `needs_sync`: `true` when an existing index was
/// opened and a reconciliation pass must run before queries are served.
/// An empty catalog produces an empty, persisted index — not an error.
/// `force_rebuild` deletes an existing index first.
///
/// Failures here are fatal to startup: an unreachable catalog during a
/// fresh build, or an existing index that cannot be opened.
pub async fn bootstrap_or_load(
    config: &Config,
    store: &dyn ObjectStore,
    force_rebuild: bool,
) -> Result<(SqliteIndex, bool)> {
    let path = &config.index.path;

    if force_rebuild && SqliteIndex::exists(path) {
        println!("Rebuild requested: deleting existing index at {}", path.display());
        remove_index_files(path)?;
    }

    if !SqliteIndex::exists(path) {
        println!("No index at {}; building from the object store", path.display());
        let catalog = store.list_current().await?;
        let index = SqliteIndex::create(path, config.embedding.clone()).await?;

        if catalog.is_empty() {
            println!("Object store is empty; created an empty index");
            index.persist().await?;
            return Ok((index, false));
        }

        let loader = DocumentLoader::new(store, config.chunking.clone());
        let mut all_chunks: Vec<ChunkRecord> = Vec::new();
        let mut loaded = 0usize;
        for (key, remote) in &catalog {
            println!("  processing {} (version {})", key, remote.version_id);
            match loader.load(key, &remote.version_id, remote.last_modified).await {
                Ok(chunks) => {
                    all_chunks.extend(chunks);
                    loaded += 1;
                }
                Err(e) => {
                    eprintln!("Warning: excluding '{}' from the initial build: {}", key, e);
                }
            }
        }

        let chunk_count = index.add_chunks(&all_chunks).await?;
        index.persist().await?;
        println!(
            "Built index with {} chunks from {} of {} objects",
            chunk_count,
            loaded,
            catalog.len()
        );
        return Ok((index, false));
    }

    let index = SqliteIndex::open(path, config.embedding.clone())
        .await
        .context("existing index failed validation")?;
    let count = index.count().await?;
    println!(
        "Opened existing index at {} ({} chunks); sync required",
        path.display(),
        count
    );
    Ok((index, true))
}

/// Remove the index database and its WAL sidecar files.
fn remove_index_files(path: &std::path::Path) -> Result<()> {
    std::fs::remove_file(path)
        .with_context(|| format!("failed to delete index file {}", path.display()))?;
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let sidecar = std::path::PathBuf::from(sidecar);
        if sidecar.exists() {
            std::fs::remove_file(&sidecar)
                .with_context(|| format!("failed to delete {}", sidecar.display()))?;
        }
    }
    Ok(())
}
