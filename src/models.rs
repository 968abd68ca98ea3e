//! Core data models used throughout corpus-sync.
//!
//! These types represent the remote catalog entries, index chunks, and
//! reconciliation results that flow through the sync engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// The current version of one object in the remote store, as reported by
/// the catalog listing (delete markers already collapsed away).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Opaque version token; changes on every overwrite.
    pub version_id: String,
    pub last_modified: DateTime<Utc>,
}

/// The catalog's view of the remote store: key → current version.
pub type Catalog = BTreeMap<String, RemoteObject>;

/// A unit of indexed text with its provenance, produced by the loader
/// before embedding. Embedding happens when the chunk is inserted into
/// the index.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub text: String,
    pub source_key: String,
    pub source_version_id: String,
    pub public_url: String,
    /// Last-modified timestamp of the source object, RFC 3339.
    pub last_modified: String,
    /// Character offset of this window within the extracted source text.
    pub start_offset: usize,
}

/// Provenance metadata read back from the index for one stored chunk.
///
/// Fields are optional because the reader must tolerate chunks written
/// with missing metadata rather than fail the scan.
#[derive(Debug, Clone, Default)]
pub struct ChunkMeta {
    pub source_key: Option<String>,
    pub source_version_id: Option<String>,
    pub public_url: Option<String>,
    pub last_modified: Option<String>,
}

/// A chunk returned from similarity search, with its score and provenance.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub text: String,
    pub source_key: String,
    pub public_url: String,
    pub score: f64,
}

/// One entry of the display-oriented object listing (`GET /files`,
/// `corpus objects`).
#[derive(Debug, Clone, Serialize)]
pub struct ObjectListing {
    pub key: String,
    pub filename: String,
    pub size: i64,
    pub last_modified: Option<String>,
    pub public_url: String,
}

/// The three disjoint key sets computed by one reconciliation pass.
/// Ephemeral: consumed immediately, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Keys present in the catalog but not in the index.
    pub to_add: Vec<String>,
    /// Keys present in both, with differing version ids.
    pub to_update: Vec<String>,
    /// Keys present in the index but gone from the catalog.
    pub to_delete: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

/// Where in the pipeline a per-key failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncStage {
    Fetch,
    Extract,
    IndexDelete,
    IndexAdd,
    Persist,
}

/// A per-key failure recorded during a pass, so that callers can assert on
/// outcomes instead of scraping log output.
#[derive(Debug, Clone, Serialize)]
pub struct SyncIssue {
    pub key: String,
    pub stage: SyncStage,
    pub detail: String,
}

/// Counters and issues from one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Objects newly added to the index.
    pub added: usize,
    /// Objects whose chunks were replaced with a newer version.
    pub updated: usize,
    /// Objects whose chunks were removed because the key left the catalog.
    pub deleted: usize,
    pub chunks_added: usize,
    pub chunks_deleted: usize,
    pub issues: Vec<SyncIssue>,
}

impl SyncReport {
    /// True when the pass made no index mutation at all.
    pub fn is_noop(&self) -> bool {
        self.chunks_added == 0 && self.chunks_deleted == 0
    }
}

/// Format a timestamp the way chunk metadata stores it.
pub fn format_last_modified(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}
