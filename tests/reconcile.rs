//! Engine-level tests for the reconciliation pass and single-object
//! upsert, run against the in-memory object store and index.
//!
//! Covered properties: convergence from an empty index, idempotence of a
//! second pass, update-replaces-never-duplicates, deletion of removed
//! keys, preservation of stale chunks when reprocessing fails, windowing
//! through the full pipeline, and end-to-end upsert version replacement.

use std::collections::HashSet;

use corpus_sync::config::ChunkingConfig;
use corpus_sync::error::SyncError;
use corpus_sync::index::memory::MemoryIndex;
use corpus_sync::index::ChunkIndex;
use corpus_sync::models::SyncStage;
use corpus_sync::object_store::MemoryStore;
use corpus_sync::reconcile::{reconcile, upsert_object};
use corpus_sync::state::indexed_versions;

fn chunking() -> ChunkingConfig {
    ChunkingConfig {
        chunk_size: 1000,
        chunk_overlap: 200,
    }
}

fn doc(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

#[tokio::test]
async fn converges_from_an_empty_index() {
    let store = MemoryStore::new();
    store.put_sync("a.txt", doc("alpha document body"));
    store.put_sync("b.txt", doc("beta document body"));
    let index = MemoryIndex::new();

    let report = reconcile(&store, &index, chunking()).await.unwrap();
    assert_eq!(report.added, 2);
    assert_eq!(report.updated, 0);
    assert_eq!(report.deleted, 0);
    assert!(report.issues.is_empty());

    let versions = indexed_versions(&index).await.unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions["a.txt"], "v1");
    assert_eq!(versions["b.txt"], "v1");
}

#[tokio::test]
async fn second_pass_with_no_change_is_a_noop() {
    let store = MemoryStore::new();
    store.put_sync("a.txt", doc("alpha document body"));
    let index = MemoryIndex::new();

    reconcile(&store, &index, chunking()).await.unwrap();
    let persists_after_first = index.persists();

    let report = reconcile(&store, &index, chunking()).await.unwrap();
    assert_eq!(report.added, 0);
    assert_eq!(report.updated, 0);
    assert_eq!(report.deleted, 0);
    assert_eq!(report.chunks_added, 0);
    assert_eq!(report.chunks_deleted, 0);
    assert_eq!(index.persists(), persists_after_first);
}

#[tokio::test]
async fn update_replaces_and_never_duplicates() {
    let store = MemoryStore::new();
    store.put_sync("a.txt", doc("first version of alpha"));
    let index = MemoryIndex::new();
    reconcile(&store, &index, chunking()).await.unwrap();

    store.put_sync("a.txt", doc("second version of alpha"));
    let report = reconcile(&store, &index, chunking()).await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.added, 0);

    let versions: HashSet<String> = index
        .records()
        .iter()
        .filter(|c| c.source_key == "a.txt")
        .map(|c| c.source_version_id.clone())
        .collect();
    assert_eq!(versions, HashSet::from(["v2".to_string()]));
}

#[tokio::test]
async fn removed_keys_lose_all_their_chunks() {
    let store = MemoryStore::new();
    store.put_sync("a.txt", doc("alpha body"));
    store.put_sync("b.txt", doc("beta body"));
    let index = MemoryIndex::new();
    reconcile(&store, &index, chunking()).await.unwrap();

    store.delete("b.txt");
    let report = reconcile(&store, &index, chunking()).await.unwrap();
    assert_eq!(report.deleted, 1);

    assert!(index.records().iter().all(|c| c.source_key != "b.txt"));
    assert!(index.records().iter().any(|c| c.source_key == "a.txt"));
}

#[tokio::test]
async fn failed_reprocessing_keeps_the_stale_chunks() {
    let store = MemoryStore::new();
    store.put_sync("a.txt", doc("original alpha body"));
    let index = MemoryIndex::new();
    reconcile(&store, &index, chunking()).await.unwrap();

    // Version changes, but the new bytes cannot be fetched.
    store.put_sync("a.txt", doc("newer alpha body"));
    store.fail_fetch("a.txt");

    let report = reconcile(&store, &index, chunking()).await.unwrap();
    assert_eq!(report.updated, 0);
    assert_eq!(report.chunks_deleted, 0);
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].key, "a.txt");
    assert_eq!(report.issues[0].stage, SyncStage::Fetch);

    // Retrievability over freshness: the v1 chunks are still there.
    let stale: Vec<_> = index
        .records()
        .into_iter()
        .filter(|c| c.source_key == "a.txt")
        .collect();
    assert!(!stale.is_empty());
    assert!(stale.iter().all(|c| c.source_version_id == "v1"));
}

#[tokio::test]
async fn unparseable_new_object_is_skipped_with_issue() {
    let store = MemoryStore::new();
    store.put_sync("good.txt", doc("readable body"));
    store.put_sync("junk.bin", vec![0u8, 1, 0, 2, 0, 3]);
    let index = MemoryIndex::new();

    let report = reconcile(&store, &index, chunking()).await.unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].key, "junk.bin");
    assert_eq!(report.issues[0].stage, SyncStage::Extract);

    let versions = indexed_versions(&index).await.unwrap();
    assert!(versions.contains_key("good.txt"));
    assert!(!versions.contains_key("junk.bin"));
}

#[tokio::test]
async fn catalog_failure_aborts_the_pass_untouched() {
    let store = MemoryStore::new();
    store.put_sync("a.txt", doc("alpha body"));
    let index = MemoryIndex::new();
    reconcile(&store, &index, chunking()).await.unwrap();
    let before = index.records().len();

    store.fail_listing(true);
    let result = reconcile(&store, &index, chunking()).await;
    assert!(matches!(result, Err(SyncError::CatalogUnavailable(_))));
    // The index is not treated as if everything were deleted.
    assert_eq!(index.records().len(), before);

    store.fail_listing(false);
    let report = reconcile(&store, &index, chunking()).await.unwrap();
    assert!(report.is_noop());
}

#[tokio::test]
async fn failed_batch_add_retries_on_the_next_pass() {
    let store = MemoryStore::new();
    store.put_sync("a.txt", doc("alpha body"));
    let index = MemoryIndex::new();

    index.fail_next_add();
    let report = reconcile(&store, &index, chunking()).await.unwrap();
    assert_eq!(report.chunks_added, 0);
    assert!(report
        .issues
        .iter()
        .any(|i| i.key == "a.txt" && i.stage == SyncStage::IndexAdd));
    assert!(indexed_versions(&index).await.unwrap().is_empty());

    // The next pass re-discovers the same mismatch and succeeds.
    let report = reconcile(&store, &index, chunking()).await.unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(indexed_versions(&index).await.unwrap()["a.txt"], "v1");
}

#[tokio::test]
async fn failed_batch_delete_is_contained_and_reported() {
    let store = MemoryStore::new();
    store.put_sync("a.txt", doc("alpha body"));
    let index = MemoryIndex::new();
    reconcile(&store, &index, chunking()).await.unwrap();

    store.delete("a.txt");
    index.fail_next_delete();
    let report = reconcile(&store, &index, chunking()).await.unwrap();
    assert_eq!(report.chunks_deleted, 0);
    assert!(report
        .issues
        .iter()
        .any(|i| i.key == "a.txt" && i.stage == SyncStage::IndexDelete));

    // Idempotent re-deletion on the next pass.
    let report = reconcile(&store, &index, chunking()).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert!(index.records().is_empty());
}

#[tokio::test]
async fn long_documents_window_through_the_full_pipeline() {
    let store = MemoryStore::new();
    store.put_sync("long.txt", doc(&"x".repeat(2400)));
    let index = MemoryIndex::new();

    let report = reconcile(&store, &index, chunking()).await.unwrap();
    assert_eq!(report.chunks_added, 3);

    let mut offsets: Vec<usize> = index.records().iter().map(|c| c.start_offset).collect();
    offsets.sort();
    assert_eq!(offsets, vec![0, 800, 1600]);
}

#[tokio::test]
async fn upsert_end_to_end_reports_the_written_version() {
    let store = MemoryStore::new();
    let index = MemoryIndex::new();

    let remote = store.put_sync("c.txt", doc("uploaded body"));
    let added = upsert_object(
        &store,
        &index,
        chunking(),
        "c.txt",
        &remote.version_id,
        remote.last_modified,
    )
    .await
    .unwrap();
    assert!(added > 0);
    assert_eq!(indexed_versions(&index).await.unwrap()["c.txt"], "v1");

    let remote = store.put_sync("c.txt", doc("uploaded body, revised"));
    upsert_object(
        &store,
        &index,
        chunking(),
        "c.txt",
        &remote.version_id,
        remote.last_modified,
    )
    .await
    .unwrap();

    let versions: HashSet<String> = index
        .records()
        .iter()
        .filter(|c| c.source_key == "c.txt")
        .map(|c| c.source_version_id.clone())
        .collect();
    assert_eq!(versions, HashSet::from(["v2".to_string()]));
    assert_eq!(indexed_versions(&index).await.unwrap()["c.txt"], "v2");
}

#[tokio::test]
async fn upsert_of_unprocessable_object_surfaces_the_failure() {
    let store = MemoryStore::new();
    let index = MemoryIndex::new();

    let remote = store.put_sync("junk.bin", vec![0u8, 1, 0, 2]);
    let result = upsert_object(
        &store,
        &index,
        chunking(),
        "junk.bin",
        &remote.version_id,
        remote.last_modified,
    )
    .await;

    assert!(matches!(result, Err(SyncError::ProcessingFailed { .. })));
    assert_eq!(index.count().await.unwrap(), 0);
}

#[tokio::test]
async fn mixed_pass_applies_all_three_classes_at_once() {
    let store = MemoryStore::new();
    store.put_sync("keep.txt", doc("unchanged body"));
    store.put_sync("change.txt", doc("old body"));
    store.put_sync("drop.txt", doc("doomed body"));
    let index = MemoryIndex::new();
    reconcile(&store, &index, chunking()).await.unwrap();

    store.put_sync("change.txt", doc("new body"));
    store.delete("drop.txt");
    store.put_sync("fresh.txt", doc("brand new body"));

    let report = reconcile(&store, &index, chunking()).await.unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.updated, 1);
    assert_eq!(report.deleted, 1);

    let versions = indexed_versions(&index).await.unwrap();
    assert_eq!(versions.len(), 3);
    assert_eq!(versions["keep.txt"], "v1");
    assert_eq!(versions["change.txt"], "v2");
    assert_eq!(versions["fresh.txt"], "v1");
}
