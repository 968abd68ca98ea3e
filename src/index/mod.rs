//! Vector index abstraction.
//!
//! The [`ChunkIndex`] trait is the engine's only view of the chunk store:
//! metadata queries by filter, batch add, batch delete by id, similarity
//! search, and persist. The production backend is SQLite
//! ([`sqlite::SqliteIndex`]); [`memory::MemoryIndex`] backs the engine
//! tests.
//!
//! Mutation (delete batch, add batch) requires exclusive access for the
//! duration of one reconciliation pass; callers serialize passes. Reads may
//! proceed concurrently with whatever consistency the backend provides.

pub mod memory;
pub mod sqlite;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ChunkMeta, ChunkRecord, ScoredChunk};

/// Predicate over a chunk's source key, used for metadata queries and for
/// collecting the ids of a batch delete.
#[derive(Debug, Clone)]
pub enum MetadataFilter {
    /// Every chunk in the index.
    All,
    /// Chunks whose source key equals the given key.
    KeyEquals(String),
    /// Chunks whose source key is in the given set.
    KeyIn(HashSet<String>),
}

impl MetadataFilter {
    /// Whether a chunk with the given (possibly missing) source key matches.
    pub fn matches(&self, source_key: Option<&str>) -> bool {
        match self {
            MetadataFilter::All => true,
            MetadataFilter::KeyEquals(key) => source_key == Some(key.as_str()),
            MetadataFilter::KeyIn(keys) => source_key.is_some_and(|k| keys.contains(k)),
        }
    }
}

/// Abstract chunk index backend.
#[async_trait]
pub trait ChunkIndex: Send + Sync {
    /// Ids and provenance metadata of every chunk matching `filter`.
    /// No chunk content is returned.
    async fn metadata(&self, filter: &MetadataFilter) -> Result<Vec<(String, ChunkMeta)>>;

    /// Insert a batch of chunks (embedding them if configured). Returns the
    /// number inserted.
    async fn add_chunks(&self, chunks: &[ChunkRecord]) -> Result<usize>;

    /// Delete chunks by id, tolerating ids that are already gone. Returns
    /// the number removed.
    async fn delete_by_ids(&self, ids: &[String]) -> Result<usize>;

    /// Top-`k` chunks most similar to `query`.
    async fn similar(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>>;

    /// Flush index state to durable storage.
    async fn persist(&self) -> Result<()>;

    /// Number of chunks currently stored.
    async fn count(&self) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_all_matches_missing_keys() {
        assert!(MetadataFilter::All.matches(None));
        assert!(MetadataFilter::All.matches(Some("k")));
    }

    #[test]
    fn filter_equals_and_in() {
        let eq = MetadataFilter::KeyEquals("a".to_string());
        assert!(eq.matches(Some("a")));
        assert!(!eq.matches(Some("b")));
        assert!(!eq.matches(None));

        let set: HashSet<String> = ["a".to_string(), "b".to_string()].into();
        let within = MetadataFilter::KeyIn(set);
        assert!(within.matches(Some("b")));
        assert!(!within.matches(Some("c")));
        assert!(!within.matches(None));
    }
}
