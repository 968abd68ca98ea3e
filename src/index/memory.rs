//! In-memory [`ChunkIndex`] for engine tests.
//!
//! Stores chunk records without embeddings; `similar` scores by naive term
//! overlap so retrieval paths can be exercised without a network. Failure
//! injection flags let tests drive the engine's partial-failure containment,
//! and a persist counter makes "no persist on a no-op pass" assertable.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::{ChunkMeta, ChunkRecord, ScoredChunk};

use super::{ChunkIndex, MetadataFilter};

#[derive(Default)]
pub struct MemoryIndex {
    chunks: RwLock<Vec<ChunkRecord>>,
    persist_count: AtomicUsize,
    fail_next_delete: AtomicBool,
    fail_next_add: AtomicBool,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `persist` calls so far.
    pub fn persists(&self) -> usize {
        self.persist_count.load(Ordering::SeqCst)
    }

    /// Make the next `delete_by_ids` call fail.
    pub fn fail_next_delete(&self) {
        self.fail_next_delete.store(true, Ordering::SeqCst);
    }

    /// Make the next `add_chunks` call fail.
    pub fn fail_next_add(&self) {
        self.fail_next_add.store(true, Ordering::SeqCst);
    }

    /// All stored records (test assertions).
    pub fn records(&self) -> Vec<ChunkRecord> {
        self.chunks.read().unwrap().clone()
    }
}

#[async_trait]
impl ChunkIndex for MemoryIndex {
    async fn metadata(&self, filter: &MetadataFilter) -> Result<Vec<(String, ChunkMeta)>> {
        let chunks = self.chunks.read().unwrap();
        Ok(chunks
            .iter()
            .filter(|c| filter.matches(Some(c.source_key.as_str())))
            .map(|c| {
                (
                    c.id.clone(),
                    ChunkMeta {
                        source_key: Some(c.source_key.clone()),
                        source_version_id: Some(c.source_version_id.clone()),
                        public_url: Some(c.public_url.clone()),
                        last_modified: Some(c.last_modified.clone()),
                    },
                )
            })
            .collect())
    }

    async fn add_chunks(&self, chunks: &[ChunkRecord]) -> Result<usize> {
        if self.fail_next_add.swap(false, Ordering::SeqCst) {
            bail!("injected add failure");
        }
        let mut stored = self.chunks.write().unwrap();
        stored.extend(chunks.iter().cloned());
        Ok(chunks.len())
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<usize> {
        if self.fail_next_delete.swap(false, Ordering::SeqCst) {
            bail!("injected delete failure");
        }
        let mut stored = self.chunks.write().unwrap();
        let before = stored.len();
        stored.retain(|c| !ids.contains(&c.id));
        Ok(before - stored.len())
    }

    async fn similar(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        let chunks = self.chunks.read().unwrap();
        let mut scored: Vec<ScoredChunk> = chunks
            .iter()
            .filter_map(|c| {
                let text_lower = c.text.to_lowercase();
                let matches = terms.iter().filter(|t| text_lower.contains(*t)).count();
                if matches > 0 {
                    Some(ScoredChunk {
                        text: c.text.clone(),
                        source_key: c.source_key.clone(),
                        public_url: c.public_url.clone(),
                        score: matches as f64,
                    })
                } else {
                    None
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn persist(&self) -> Result<()> {
        self.persist_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.chunks.read().unwrap().len() as u64)
    }
}
