//! Reconciliation engine.
//!
//! Computes the three-way difference between the remote catalog's current
//! state and the index's last-indexed state, then applies it with a strict
//! order inside one pass: replacement chunks are materialized first, all
//! stale chunks are removed in one filtered batch delete, new chunks are
//! inserted in one batch add, and the index is persisted only when a
//! mutation actually happened. Delete-before-add bounds the window in which
//! a concurrent reader could observe two live versions of one key.
//!
//! Failure containment:
//! - catalog listing failure aborts the pass (never treated as "everything
//!   was deleted");
//! - a key that fails to fetch or parse is skipped this pass — for an
//!   *updated* key this also demotes the key out of the delete set, keeping
//!   the stale chunks retrievable instead of deleting without replacement;
//! - batch delete/add failures are recorded per key and the pass continues;
//!   the next pass re-discovers the same version mismatch and retries.
//!
//! Passes must not overlap on one index; the caller serializes them.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::config::ChunkingConfig;
use crate::error::SyncError;
use crate::index::{ChunkIndex, MetadataFilter};
use crate::loader::DocumentLoader;
use crate::models::{Catalog, ChunkRecord, ReconcilePlan, SyncIssue, SyncReport, SyncStage};
use crate::object_store::ObjectStore;
use crate::state::indexed_versions;

/// Classify every key as new, updated, or deleted.
///
/// A key in both maps with matching versions needs no action and appears in
/// none of the sets. Output follows the catalog's (sorted) iteration order;
/// deleted keys are sorted for determinism.
pub fn plan(catalog: &Catalog, indexed: &HashMap<String, String>) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();

    for (key, remote) in catalog {
        match indexed.get(key) {
            None => plan.to_add.push(key.clone()),
            Some(version) if *version != remote.version_id => plan.to_update.push(key.clone()),
            Some(_) => {}
        }
    }

    for key in indexed.keys() {
        if !catalog.contains_key(key) {
            plan.to_delete.push(key.clone());
        }
    }
    plan.to_delete.sort();

    plan
}

/// Run one full reconciliation pass: diff the catalog against the index
/// and apply the difference. Re-running with no remote change is a no-op.
pub async fn reconcile(
    store: &dyn ObjectStore,
    index: &dyn ChunkIndex,
    chunking: ChunkingConfig,
) -> Result<SyncReport, SyncError> {
    let catalog = store.list_current().await?;
    let indexed = indexed_versions(index)
        .await
        .map_err(|e| SyncError::IndexMutationFailed(format!("metadata scan failed: {}", e)))?;

    let plan = plan(&catalog, &indexed);
    if plan.is_empty() {
        println!("sync: index already matches the object store");
        return Ok(SyncReport::default());
    }

    let loader = DocumentLoader::new(store, chunking);
    let mut report = SyncReport::default();
    let mut chunks_to_add: Vec<ChunkRecord> = Vec::new();
    // Keys whose existing chunks must go: removed keys, plus updated keys
    // whose replacement loaded successfully.
    let mut keys_to_remove: HashSet<String> = plan.to_delete.iter().cloned().collect();

    for key in &plan.to_add {
        let remote = &catalog[key];
        println!("  + new object: {}", key);
        match loader.load(key, &remote.version_id, remote.last_modified).await {
            Ok(chunks) => {
                chunks_to_add.extend(chunks);
                report.added += 1;
            }
            Err(e) => {
                eprintln!("Warning: skipping new object '{}': {}", key, e);
                report.issues.push(issue_for_load_error(key, &e));
            }
        }
    }

    for key in &plan.to_update {
        let remote = &catalog[key];
        println!(
            "  * updated object: {} ({} -> {})",
            key,
            indexed.get(key).map(String::as_str).unwrap_or("?"),
            remote.version_id
        );
        match loader.load(key, &remote.version_id, remote.last_modified).await {
            Ok(chunks) => {
                chunks_to_add.extend(chunks);
                keys_to_remove.insert(key.clone());
                report.updated += 1;
            }
            Err(e) => {
                // The stale chunks stay in place: retrievability over
                // freshness when the replacement cannot be built.
                eprintln!(
                    "Warning: failed to reprocess '{}', keeping previous version: {}",
                    key, e
                );
                report.issues.push(issue_for_load_error(key, &e));
            }
        }
    }

    for key in &plan.to_delete {
        println!("  - removed object: {}", key);
    }
    report.deleted = plan.to_delete.len();

    // Deletions first, one filtered batch.
    if !keys_to_remove.is_empty() {
        match delete_chunks_for_keys(index, &keys_to_remove).await {
            Ok(removed) => report.chunks_deleted = removed,
            Err(e) => {
                eprintln!("Warning: batch delete failed, stale chunks may remain: {}", e);
                let mut failed: Vec<&String> = keys_to_remove.iter().collect();
                failed.sort();
                for key in failed {
                    report.issues.push(SyncIssue {
                        key: key.clone(),
                        stage: SyncStage::IndexDelete,
                        detail: e.to_string(),
                    });
                }
            }
        }
    }

    // Then additions.
    if !chunks_to_add.is_empty() {
        match index.add_chunks(&chunks_to_add).await {
            Ok(added) => report.chunks_added = added,
            Err(e) => {
                eprintln!("Warning: batch add failed, chunks deferred to next pass: {}", e);
                let mut failed_keys: Vec<String> = chunks_to_add
                    .iter()
                    .map(|c| c.source_key.clone())
                    .collect();
                failed_keys.sort();
                failed_keys.dedup();
                for key in failed_keys {
                    report.issues.push(SyncIssue {
                        key,
                        stage: SyncStage::IndexAdd,
                        detail: e.to_string(),
                    });
                }
            }
        }
    }

    if !report.is_noop() {
        if let Err(e) = index.persist().await {
            eprintln!("Warning: failed to persist index changes: {}", e);
            report.issues.push(SyncIssue {
                key: String::new(),
                stage: SyncStage::Persist,
                detail: e.to_string(),
            });
        }
    }

    println!(
        "sync: {} added, {} updated, {} deleted ({} chunks in, {} chunks out, {} issues)",
        report.added,
        report.updated,
        report.deleted,
        report.chunks_added,
        report.chunks_deleted,
        report.issues.len()
    );

    Ok(report)
}

/// Insert-or-replace the index's chunks for a single object, used after a
/// direct write to the store outside a full pass.
///
/// Unlike the full pass, deletion here is unconditional: by the time the
/// old chunks are removed, the replacement has already been loaded. Zero
/// chunks from the loader surfaces [`SyncError::ProcessingFailed`] to the
/// caller — the object now exists in storage, but the upload is still
/// reported as failed so the index never silently diverges.
pub async fn upsert_object(
    store: &dyn ObjectStore,
    index: &dyn ChunkIndex,
    chunking: ChunkingConfig,
    key: &str,
    version_id: &str,
    last_modified: DateTime<Utc>,
) -> Result<usize, SyncError> {
    let loader = DocumentLoader::new(store, chunking);
    let chunks = loader.load(key, version_id, last_modified).await?;

    let mut keys = HashSet::new();
    keys.insert(key.to_string());
    match delete_chunks_for_keys(index, &keys).await {
        Ok(0) => {}
        Ok(removed) => println!("  replaced {} existing chunks for '{}'", removed, key),
        Err(e) => {
            // Proceed with the add; the next full pass re-deletes leftovers.
            eprintln!("Warning: failed to delete existing chunks for '{}': {}", key, e);
        }
    }

    let added = index
        .add_chunks(&chunks)
        .await
        .map_err(|e| SyncError::IndexMutationFailed(e.to_string()))?;

    if let Err(e) = index.persist().await {
        eprintln!("Warning: failed to persist index after upsert of '{}': {}", key, e);
    }

    Ok(added)
}

/// One filtered batch delete: collect the ids of every chunk whose source
/// key is in `keys`, then remove them. Zero matches is not an error.
async fn delete_chunks_for_keys(
    index: &dyn ChunkIndex,
    keys: &HashSet<String>,
) -> anyhow::Result<usize> {
    let entries = index
        .metadata(&MetadataFilter::KeyIn(keys.clone()))
        .await?;
    if entries.is_empty() {
        return Ok(0);
    }
    let ids: Vec<String> = entries.into_iter().map(|(id, _)| id).collect();
    index.delete_by_ids(&ids).await
}

fn issue_for_load_error(key: &str, err: &SyncError) -> SyncIssue {
    let stage = match err {
        SyncError::FetchFailed { .. } => SyncStage::Fetch,
        _ => SyncStage::Extract,
    };
    SyncIssue {
        key: key.to_string(),
        stage,
        detail: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RemoteObject;
    use chrono::Utc;

    fn catalog_of(entries: &[(&str, &str)]) -> Catalog {
        entries
            .iter()
            .map(|(key, version)| {
                (
                    key.to_string(),
                    RemoteObject {
                        version_id: version.to_string(),
                        last_modified: Utc::now(),
                    },
                )
            })
            .collect()
    }

    fn indexed_of(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn plan_classifies_disjoint_sets() {
        let catalog = catalog_of(&[("a", "v1"), ("b", "v2"), ("c", "v1")]);
        let indexed = indexed_of(&[("b", "v1"), ("c", "v1"), ("d", "v9")]);

        let plan = plan(&catalog, &indexed);
        assert_eq!(plan.to_add, vec!["a"]);
        assert_eq!(plan.to_update, vec!["b"]);
        assert_eq!(plan.to_delete, vec!["d"]);
    }

    #[test]
    fn plan_is_empty_when_states_match() {
        let catalog = catalog_of(&[("a", "v1"), ("b", "v2")]);
        let indexed = indexed_of(&[("a", "v1"), ("b", "v2")]);
        assert!(plan(&catalog, &indexed).is_empty());
    }

    #[test]
    fn plan_of_empty_index_adds_everything() {
        let catalog = catalog_of(&[("a", "v1"), ("b", "v1")]);
        let plan = plan(&catalog, &HashMap::new());
        assert_eq!(plan.to_add, vec!["a", "b"]);
        assert!(plan.to_update.is_empty());
        assert!(plan.to_delete.is_empty());
    }

    #[test]
    fn plan_of_empty_catalog_deletes_everything() {
        let indexed = indexed_of(&[("a", "v1"), ("b", "v1")]);
        let plan = plan(&Catalog::new(), &indexed);
        assert!(plan.to_add.is_empty());
        assert_eq!(plan.to_delete, vec!["a", "b"]);
    }
}
