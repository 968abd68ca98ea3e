//! Document loader and chunker.
//!
//! Turns one remote object reference into the chunk records that replace
//! the key's slice of the index: fetch bytes, extract text through the
//! parser chain, split into overlapping windows, and stamp every window
//! with the provenance metadata contract.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::chunk::split_text;
use crate::config::ChunkingConfig;
use crate::error::SyncError;
use crate::extract::{extract_text, parser_name};
use crate::models::{format_last_modified, ChunkRecord};
use crate::object_store::ObjectStore;

pub struct DocumentLoader<'a> {
    store: &'a dyn ObjectStore,
    chunking: ChunkingConfig,
}

impl<'a> DocumentLoader<'a> {
    pub fn new(store: &'a dyn ObjectStore, chunking: ChunkingConfig) -> Self {
        Self { store, chunking }
    }

    /// Load one object and produce its pre-embedding chunk records.
    ///
    /// Errors are per-key: [`SyncError::FetchFailed`] when the bytes cannot
    /// be retrieved, [`SyncError::ProcessingFailed`] when extraction raises
    /// or yields no text. Neither aborts the caller's pass.
    pub async fn load(
        &self,
        key: &str,
        version_id: &str,
        last_modified: DateTime<Utc>,
    ) -> Result<Vec<ChunkRecord>, SyncError> {
        let bytes = self.store.fetch(key).await?;

        let text = extract_text(key, &bytes).map_err(|e| SyncError::ProcessingFailed {
            key: key.to_string(),
            detail: e.to_string(),
        })?;

        if text.is_empty() {
            eprintln!(
                "Warning: no extractable text in '{}' ({} parser)",
                key,
                parser_name(key)
            );
            return Err(SyncError::ProcessingFailed {
                key: key.to_string(),
                detail: format!("{} parser yielded no text", parser_name(key)),
            });
        }

        let public_url = self.store.public_url(key);
        let last_modified = format_last_modified(last_modified);

        let chunks = split_text(&text, self.chunking.chunk_size, self.chunking.chunk_overlap)
            .into_iter()
            .map(|(start_offset, window)| ChunkRecord {
                id: Uuid::new_v4().to_string(),
                text: window,
                source_key: key.to_string(),
                source_version_id: version_id.to_string(),
                public_url: public_url.clone(),
                last_modified: last_modified.clone(),
                start_offset,
            })
            .collect();

        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::MemoryStore;

    fn chunking() -> ChunkingConfig {
        ChunkingConfig {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }

    #[tokio::test]
    async fn chunks_carry_provenance_metadata() {
        let store = MemoryStore::new();
        let remote = store.put_sync("docs/a.txt", "hello world".as_bytes().to_vec());

        let loader = DocumentLoader::new(&store, chunking());
        let chunks = loader
            .load("docs/a.txt", &remote.version_id, remote.last_modified)
            .await
            .unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].source_key, "docs/a.txt");
        assert_eq!(chunks[0].source_version_id, "v1");
        assert_eq!(chunks[0].public_url, "https://objects.test/docs/a.txt");
        assert_eq!(chunks[0].start_offset, 0);
    }

    #[tokio::test]
    async fn long_text_splits_into_overlapping_windows() {
        let store = MemoryStore::new();
        let body = "z".repeat(2400);
        let remote = store.put_sync("docs/long.txt", body.into_bytes());

        let loader = DocumentLoader::new(&store, chunking());
        let chunks = loader
            .load("docs/long.txt", &remote.version_id, remote.last_modified)
            .await
            .unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].start_offset, 800);
        assert_eq!(chunks[2].start_offset, 1600);
    }

    #[tokio::test]
    async fn fetch_failure_propagates_as_fetch_failed() {
        let store = MemoryStore::new();
        let remote = store.put_sync("docs/a.txt", b"body".to_vec());
        store.fail_fetch("docs/a.txt");

        let loader = DocumentLoader::new(&store, chunking());
        let result = loader
            .load("docs/a.txt", &remote.version_id, remote.last_modified)
            .await;
        assert!(matches!(result, Err(SyncError::FetchFailed { .. })));
    }

    #[tokio::test]
    async fn unparseable_source_is_processing_failed() {
        let store = MemoryStore::new();
        let remote = store.put_sync("docs/blob.bin", vec![0u8, 1, 2, 0, 3]);

        let loader = DocumentLoader::new(&store, chunking());
        let result = loader
            .load("docs/blob.bin", &remote.version_id, remote.last_modified)
            .await;
        assert!(matches!(result, Err(SyncError::ProcessingFailed { .. })));
    }
}
