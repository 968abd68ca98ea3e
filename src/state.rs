//! Index state reader.
//!
//! Reconstructs, from chunk metadata alone, which source version each key
//! was last indexed at. Chunks missing either provenance field are skipped
//! rather than failing the scan. When a key's chunks disagree on the
//! version (possible only after a prior partial failure), the version on
//! the last-scanned chunk wins; the next reconciliation pass converges it.

use std::collections::HashMap;

use anyhow::Result;

use crate::index::{ChunkIndex, MetadataFilter};

/// Map every indexed source key to its last-indexed version id.
///
/// An empty index yields an empty map, not an error.
pub async fn indexed_versions(index: &dyn ChunkIndex) -> Result<HashMap<String, String>> {
    let entries = index.metadata(&MetadataFilter::All).await?;

    let mut versions = HashMap::new();
    for (_, meta) in entries {
        if let (Some(key), Some(version)) = (meta.source_key, meta.source_version_id) {
            versions.insert(key, version);
        }
    }
    Ok(versions)
}
