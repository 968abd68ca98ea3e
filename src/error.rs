//! Error taxonomy for the synchronization engine.
//!
//! Per-key failures ([`SyncError::FetchFailed`], [`SyncError::ProcessingFailed`])
//! never abort a reconciliation pass; pass-level and startup-level failures
//! ([`SyncError::CatalogUnavailable`], [`SyncError::IndexCorrupt`]) do.

/// Engine error. Variants map one-to-one onto the failure containment rules
/// of the reconciliation pass.
#[derive(Debug)]
pub enum SyncError {
    /// The object store listing could not be completed. Fatal to the current
    /// pass: an unreachable catalog must never be treated as an empty one.
    CatalogUnavailable(String),
    /// A single object's bytes could not be fetched. The key is skipped this
    /// pass and retried on the next one.
    FetchFailed { key: String, detail: String },
    /// Parsing/splitting yielded no text for a key. The key is skipped; for
    /// a single-document upsert this is surfaced to the caller.
    ProcessingFailed { key: String, detail: String },
    /// A batch delete or add against the index failed. Logged, pass continues.
    IndexMutationFailed(String),
    /// An existing index could not be opened or validated. Fatal to startup.
    IndexCorrupt(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::CatalogUnavailable(detail) => {
                write!(f, "object store listing unavailable: {}", detail)
            }
            SyncError::FetchFailed { key, detail } => {
                write!(f, "failed to fetch object '{}': {}", key, detail)
            }
            SyncError::ProcessingFailed { key, detail } => {
                write!(f, "no extractable text for object '{}': {}", key, detail)
            }
            SyncError::IndexMutationFailed(detail) => {
                write!(f, "index mutation failed: {}", detail)
            }
            SyncError::IndexCorrupt(detail) => {
                write!(f, "index cannot be opened: {}", detail)
            }
        }
    }
}

impl std::error::Error for SyncError {}
