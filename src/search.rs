//! Similarity search over the chunk index.

use anyhow::Result;

use crate::index::ChunkIndex;
use crate::models::ScoredChunk;

/// Retrieve the `k` chunks most similar to `query`.
pub async fn retrieve(index: &dyn ChunkIndex, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
    if query.trim().is_empty() {
        anyhow::bail!("query must not be empty");
    }
    index.similar(query, k).await
}

/// Unique public URLs of the given chunks, in first-seen order. Used for
/// citation display alongside an answer.
pub fn unique_sources(chunks: &[ScoredChunk]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    chunks
        .iter()
        .filter(|c| !c.public_url.is_empty())
        .filter(|c| seen.insert(c.public_url.clone()))
        .map(|c| c.public_url.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(url: &str) -> ScoredChunk {
        ScoredChunk {
            text: "body".to_string(),
            source_key: "k".to_string(),
            public_url: url.to_string(),
            score: 1.0,
        }
    }

    #[test]
    fn sources_deduplicated_in_order() {
        let chunks = vec![chunk("https://a"), chunk("https://b"), chunk("https://a")];
        assert_eq!(unique_sources(&chunks), vec!["https://a", "https://b"]);
    }

    #[test]
    fn empty_urls_are_dropped() {
        let chunks = vec![chunk(""), chunk("https://a")];
        assert_eq!(unique_sources(&chunks), vec!["https://a"]);
    }
}
