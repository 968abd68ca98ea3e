//! Object storage abstraction.
//!
//! The [`ObjectStore`] trait is the engine's only view of the remote
//! document collection: list the current versions, fetch bytes, write an
//! object, and derive its public URL. The production backend is S3
//! ([`s3::S3Store`]); [`MemoryStore`] backs the engine tests.

pub mod s3;

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SyncError;
use crate::models::{Catalog, ObjectListing, RemoteObject};

/// A remote key/value blob store with per-object version identifiers.
///
/// Implementations collapse multi-version history to the single current
/// state per key: [`list_current`](ObjectStore::list_current) never reports
/// a key whose latest event is a delete marker, and never reports more than
/// one version per key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// The current key set and versions under the configured prefix.
    ///
    /// Failure is [`SyncError::CatalogUnavailable`] and aborts the caller's
    /// pass; an unreachable store is never reported as an empty one.
    async fn list_current(&self) -> Result<Catalog, SyncError>;

    /// Display-oriented listing (size, filename, public URL), sorted by
    /// filename.
    async fn list_for_display(&self) -> Result<Vec<ObjectListing>, SyncError>;

    /// Fetch one object's bytes.
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, SyncError>;

    /// Write an object and return the version the store assigned to it.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<RemoteObject>;

    /// Public HTTP URL for a key. Pure and deterministic.
    fn public_url(&self, key: &str) -> String;
}

/// Filename portion of a key (final path segment).
pub(crate) fn key_filename(key: &str) -> String {
    match key.rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => key.to_string(),
    }
}

struct StoredObject {
    bytes: Vec<u8>,
    version_id: String,
    last_modified: DateTime<Utc>,
}

/// In-memory [`ObjectStore`] for tests and local development.
///
/// Versions are `v1`, `v2`, ... per key in write order. Keys registered via
/// [`fail_fetch`](MemoryStore::fail_fetch) error on fetch to exercise the
/// engine's skip paths.
pub struct MemoryStore {
    objects: RwLock<HashMap<String, StoredObject>>,
    unfetchable: RwLock<HashSet<String>>,
    listing_down: std::sync::atomic::AtomicBool,
    base_url: String,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            unfetchable: RwLock::new(HashSet::new()),
            listing_down: std::sync::atomic::AtomicBool::new(false),
            base_url: "https://objects.test".to_string(),
        }
    }

    /// Make future `fetch` calls for `key` fail.
    pub fn fail_fetch(&self, key: &str) {
        self.unfetchable.write().unwrap().insert(key.to_string());
    }

    /// Make catalog listings fail, as if the store were unreachable.
    pub fn fail_listing(&self, down: bool) {
        self.listing_down
            .store(down, std::sync::atomic::Ordering::SeqCst);
    }

    /// Remove an object, as if the latest event were a delete marker.
    pub fn delete(&self, key: &str) {
        self.objects.write().unwrap().remove(key);
    }

    /// Synchronous `put` for test setup.
    pub fn put_sync(&self, key: &str, bytes: Vec<u8>) -> RemoteObject {
        let mut objects = self.objects.write().unwrap();
        let next = objects
            .get(key)
            .and_then(|o| o.version_id.strip_prefix('v'))
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        let obj = StoredObject {
            bytes,
            version_id: format!("v{}", next),
            last_modified: Utc::now(),
        };
        let remote = RemoteObject {
            version_id: obj.version_id.clone(),
            last_modified: obj.last_modified,
        };
        objects.insert(key.to_string(), obj);
        remote
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_current(&self) -> Result<Catalog, SyncError> {
        if self.listing_down.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SyncError::CatalogUnavailable(
                "injected listing failure".to_string(),
            ));
        }
        let objects = self.objects.read().unwrap();
        Ok(objects
            .iter()
            .map(|(key, obj)| {
                (
                    key.clone(),
                    RemoteObject {
                        version_id: obj.version_id.clone(),
                        last_modified: obj.last_modified,
                    },
                )
            })
            .collect())
    }

    async fn list_for_display(&self) -> Result<Vec<ObjectListing>, SyncError> {
        let objects = self.objects.read().unwrap();
        let mut listing: Vec<ObjectListing> = objects
            .iter()
            .map(|(key, obj)| ObjectListing {
                key: key.clone(),
                filename: key_filename(key),
                size: obj.bytes.len() as i64,
                last_modified: Some(obj.last_modified.to_rfc3339()),
                public_url: self.public_url(key),
            })
            .collect();
        listing.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(listing)
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>, SyncError> {
        if self.unfetchable.read().unwrap().contains(key) {
            return Err(SyncError::FetchFailed {
                key: key.to_string(),
                detail: "injected fetch failure".to_string(),
            });
        }
        let objects = self.objects.read().unwrap();
        objects
            .get(key)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| SyncError::FetchFailed {
                key: key.to_string(),
                detail: "no such object".to_string(),
            })
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<RemoteObject> {
        Ok(self.put_sync(key, bytes))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn versions_advance_on_overwrite() {
        let store = MemoryStore::new();
        let first = store.put_sync("a.txt", b"one".to_vec());
        let second = store.put_sync("a.txt", b"two".to_vec());
        assert_eq!(first.version_id, "v1");
        assert_eq!(second.version_id, "v2");

        let catalog = store.list_current().await.unwrap();
        assert_eq!(catalog["a.txt"].version_id, "v2");
        assert_eq!(store.fetch("a.txt").await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn deleted_keys_leave_the_catalog() {
        let store = MemoryStore::new();
        store.put_sync("a.txt", b"one".to_vec());
        store.delete("a.txt");
        assert!(store.list_current().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn display_listing_sorted_by_filename() {
        let store = MemoryStore::new();
        store.put_sync("docs/zeta.txt", b"z".to_vec());
        store.put_sync("docs/alpha.txt", b"a".to_vec());
        let listing = store.list_for_display().await.unwrap();
        assert_eq!(listing[0].filename, "alpha.txt");
        assert_eq!(listing[1].filename, "zeta.txt");
    }
}
