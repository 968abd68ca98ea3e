//! SQLite-backed [`ChunkIndex`].
//!
//! One `chunks` table holds text, provenance metadata, and the embedding as
//! a little-endian f32 BLOB. Similarity search is brute-force cosine over
//! all stored vectors, computed in process. The WAL journal is checkpointed
//! on [`persist`](ChunkIndex::persist) so the main database file is the
//! durable artifact.

use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::config::EmbeddingConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, embed_query, embed_texts, vec_to_blob};
use crate::error::SyncError;
use crate::models::{ChunkMeta, ChunkRecord, ScoredChunk};

use super::{ChunkIndex, MetadataFilter};

/// Ids per DELETE statement, below SQLite's bind parameter ceiling.
const DELETE_BATCH: usize = 500;

pub struct SqliteIndex {
    pool: SqlitePool,
    embedding: EmbeddingConfig,
}

impl SqliteIndex {
    /// Whether an index already exists at `path`.
    pub fn exists(path: &Path) -> bool {
        path.is_file()
    }

    /// Create a fresh index at `path` (parent directories included).
    pub async fn create(path: &Path, embedding: EmbeddingConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to create index at {}", path.display()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                source_key TEXT,
                source_version_id TEXT,
                public_url TEXT,
                last_modified TEXT,
                start_offset INTEGER NOT NULL DEFAULT 0,
                embedding BLOB
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source_key ON chunks(source_key)")
            .execute(&pool)
            .await?;

        Ok(Self { pool, embedding })
    }

    /// Open an existing index and validate it is queryable.
    ///
    /// Any failure here is [`SyncError::IndexCorrupt`]: the caller is
    /// expected to halt startup rather than serve against a broken index.
    pub async fn open(path: &Path, embedding: EmbeddingConfig) -> Result<Self, SyncError> {
        if !Self::exists(path) {
            return Err(SyncError::IndexCorrupt(format!(
                "no index at {}",
                path.display()
            )));
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| SyncError::IndexCorrupt(e.to_string()))?
            .create_if_missing(false)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| SyncError::IndexCorrupt(e.to_string()))?;

        let index = Self { pool, embedding };
        index
            .count()
            .await
            .map_err(|e| SyncError::IndexCorrupt(e.to_string()))?;
        Ok(index)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn meta_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<(String, ChunkMeta)> {
    let id: String = row.try_get("id")?;
    let meta = ChunkMeta {
        source_key: row.try_get("source_key")?,
        source_version_id: row.try_get("source_version_id")?,
        public_url: row.try_get("public_url")?,
        last_modified: row.try_get("last_modified")?,
    };
    Ok((id, meta))
}

#[async_trait]
impl ChunkIndex for SqliteIndex {
    async fn metadata(&self, filter: &MetadataFilter) -> Result<Vec<(String, ChunkMeta)>> {
        let base = "SELECT id, source_key, source_version_id, public_url, last_modified FROM chunks";
        let rows = match filter {
            MetadataFilter::All => sqlx::query(base).fetch_all(&self.pool).await?,
            MetadataFilter::KeyEquals(key) => {
                let sql = format!("{} WHERE source_key = ?", base);
                sqlx::query(&sql).bind(key).fetch_all(&self.pool).await?
            }
            MetadataFilter::KeyIn(keys) => {
                if keys.is_empty() {
                    return Ok(Vec::new());
                }
                let placeholders = vec!["?"; keys.len()].join(", ");
                let sql = format!("{} WHERE source_key IN ({})", base, placeholders);
                let mut query = sqlx::query(&sql);
                for key in keys {
                    query = query.bind(key);
                }
                query.fetch_all(&self.pool).await?
            }
        };

        rows.iter().map(meta_from_row).collect()
    }

    async fn add_chunks(&self, chunks: &[ChunkRecord]) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let vectors: Option<Vec<Vec<f32>>> = if self.embedding.is_enabled() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            Some(embed_texts(&self.embedding, &texts).await?)
        } else {
            None
        };

        let mut tx = self.pool.begin().await?;
        for (i, chunk) in chunks.iter().enumerate() {
            let blob = vectors.as_ref().map(|v| vec_to_blob(&v[i]));
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO chunks
                    (id, text, source_key, source_version_id, public_url, last_modified, start_offset, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.text)
            .bind(&chunk.source_key)
            .bind(&chunk.source_version_id)
            .bind(&chunk.public_url)
            .bind(&chunk.last_modified)
            .bind(chunk.start_offset as i64)
            .bind(blob)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(chunks.len())
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut removed = 0usize;
        for batch in ids.chunks(DELETE_BATCH) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!("DELETE FROM chunks WHERE id IN ({})", placeholders);
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            removed += query.execute(&self.pool).await?.rows_affected() as usize;
        }
        Ok(removed)
    }

    async fn similar(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        if !self.embedding.is_enabled() {
            bail!("Similarity search requires an embedding provider");
        }
        let query_vec = embed_query(&self.embedding, query).await?;

        let rows = sqlx::query(
            "SELECT text, source_key, public_url, embedding FROM chunks WHERE embedding IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<ScoredChunk> = rows
            .iter()
            .map(|row| -> Result<ScoredChunk> {
                let blob: Vec<u8> = row.try_get("embedding")?;
                let score = cosine_similarity(&query_vec, &blob_to_vec(&blob));
                Ok(ScoredChunk {
                    text: row.try_get("text")?,
                    source_key: row
                        .try_get::<Option<String>, _>("source_key")?
                        .unwrap_or_default(),
                    public_url: row
                        .try_get::<Option<String>, _>("public_url")?
                        .unwrap_or_default(),
                    score,
                })
            })
            .collect::<Result<_>>()?;

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn persist(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkRecord;

    fn record(id: &str, key: &str, version: &str) -> ChunkRecord {
        ChunkRecord {
            id: id.to_string(),
            text: format!("text of {}", id),
            source_key: key.to_string(),
            source_version_id: version.to_string(),
            public_url: format!("https://objects.test/{}", key),
            last_modified: "2024-06-01T10:00:00+00:00".to_string(),
            start_offset: 0,
        }
    }

    async fn fresh_index() -> (tempfile::TempDir, SqliteIndex) {
        let dir = tempfile::tempdir().unwrap();
        let index = SqliteIndex::create(&dir.path().join("index.sqlite"), EmbeddingConfig::default())
            .await
            .unwrap();
        (dir, index)
    }

    #[tokio::test]
    async fn add_query_delete_round_trip() {
        let (_dir, index) = fresh_index().await;
        index
            .add_chunks(&[record("c1", "a.txt", "v1"), record("c2", "b.txt", "v1")])
            .await
            .unwrap();
        assert_eq!(index.count().await.unwrap(), 2);

        let metas = index
            .metadata(&MetadataFilter::KeyEquals("a.txt".to_string()))
            .await
            .unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].0, "c1");
        assert_eq!(metas[0].1.source_version_id.as_deref(), Some("v1"));

        let removed = index.delete_by_ids(&["c1".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_tolerates_missing_ids() {
        let (_dir, index) = fresh_index().await;
        let removed = index
            .delete_by_ids(&["ghost-1".to_string(), "ghost-2".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn open_missing_index_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let result =
            SqliteIndex::open(&dir.path().join("absent.sqlite"), EmbeddingConfig::default()).await;
        assert!(matches!(result, Err(SyncError::IndexCorrupt(_))));
    }

    #[tokio::test]
    async fn open_existing_index_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.sqlite");
        {
            let index = SqliteIndex::create(&path, EmbeddingConfig::default())
                .await
                .unwrap();
            index.add_chunks(&[record("c1", "a.txt", "v1")]).await.unwrap();
            index.persist().await.unwrap();
            index.close().await;
        }
        let reopened = SqliteIndex::open(&path, EmbeddingConfig::default())
            .await
            .unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
    }
}
