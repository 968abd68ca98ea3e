//! # corpus-sync
//!
//! Keeps a searchable chunk index synchronized with a mutable, versioned
//! document collection in an S3-compatible object store, so retrieval
//! always answers against the current version of each document — never a
//! stale or duplicated one.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌──────────────┐
//! │ Object store │──▶│  Reconcile    │──▶│ Chunk index  │
//! │ (S3, versioned) │ diff + apply  │   │ SQLite + vec │
//! └──────────────┘   └───────────────┘   └──────┬───────┘
//!                                               │
//!                           ┌───────────────────┤
//!                           ▼                   ▼
//!                      ┌──────────┐       ┌──────────┐
//!                      │   CLI    │       │   HTTP   │
//!                      │ (corpus) │       │ SSE chat │
//!                      └──────────┘       └──────────┘
//! ```
//!
//! One reconciliation pass lists the store's current versions, diffs them
//! against the versions recorded in chunk metadata, and applies the
//! difference with deletes strictly before adds. Re-running a pass with no
//! remote change is a no-op; re-running after a partial failure converges.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and the chunk metadata contract |
//! | [`object_store`] | Versioned object store trait + S3 backend |
//! | [`extract`] | Parser chain (PDF, OOXML, plain text) |
//! | [`chunk`] | Overlapping-window text splitter |
//! | [`loader`] | Fetch → extract → split → stamp provenance |
//! | [`index`] | Chunk index trait + SQLite backend |
//! | [`state`] | Index state reader (key → last-indexed version) |
//! | [`reconcile`] | The diff-and-apply engine and single-object upsert |
//! | [`bootstrap`] | Build-from-scratch or open-and-validate |
//! | [`embedding`] | Embedding provider dispatch |
//! | [`search`] | Similarity retrieval |
//! | [`chat`] | Retrieval-augmented chat pipeline |
//! | [`server`] | HTTP server (files, upload, SSE chat) |

pub mod bootstrap;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod loader;
pub mod models;
pub mod object_store;
pub mod reconcile;
pub mod search;
pub mod server;
pub mod state;
