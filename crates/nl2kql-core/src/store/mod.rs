//! Storage abstraction for the context index.
//!
//! The [`Store`] trait defines the operations the retrieval pipeline needs
//! over the four knowledge collections, enabling pluggable backends (SQLite
//! in the app crate, [`memory::InMemoryStore`] for tests and embedding).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::models::{CollectionKind, ContextItem, RetrievalResult};

/// Per-collection counters reported by [`Store::stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionStats {
    pub kind: CollectionKind,
    pub count: usize,
    /// Time of the last rebuild or upsert, `None` if never written.
    pub last_refreshed: Option<DateTime<Utc>>,
}

/// Abstract storage backend for context items and their vectors.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](Store::upsert) | Insert or replace one item by identifier |
/// | [`query`](Store::query) | Cosine top-k over one collection |
/// | [`rebuild`](Store::rebuild) | Atomically replace one collection |
/// | [`items`](Store::items) | All items of one collection, in insertion order |
/// | [`get`](Store::get) | One item by identifier |
/// | [`stats`](Store::stats) | Counts and refresh times for all collections |
///
/// Results of [`query`](Store::query) are ordered by descending similarity,
/// ties broken by insertion position. Concurrent readers of a collection
/// being rebuilt observe either the old or the new contents, never a mix.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace an item. A replaced item keeps its original
    /// insertion position.
    async fn upsert(&self, kind: CollectionKind, item: &ContextItem, vector: &[f32])
        -> Result<()>;

    async fn query(
        &self,
        kind: CollectionKind,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>>;

    /// Replace the full contents of one collection. On failure the
    /// collection keeps its previous contents.
    async fn rebuild(&self, kind: CollectionKind, entries: Vec<(ContextItem, Vec<f32>)>)
        -> Result<()>;

    async fn items(&self, kind: CollectionKind) -> Result<Vec<ContextItem>>;

    async fn get(&self, kind: CollectionKind, id: &str) -> Result<Option<ContextItem>>;

    async fn stats(&self) -> Result<Vec<CollectionStats>>;
}

/// Sort scored candidates by similarity desc, then position asc, and keep
/// the first `top_k`.
pub fn rank_candidates(mut results: Vec<RetrievalResult>, top_k: usize) -> Vec<RetrievalResult> {
    results.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.position.cmp(&b.position))
    });
    results.truncate(top_k);
    results
}

/// Reject items whose metadata does not belong to `kind`.
pub fn check_kind(kind: CollectionKind, item: &ContextItem) -> Result<()> {
    if item.kind() != kind {
        return Err(crate::CoreError::Storage(format!(
            "item '{}' is a {} item, not {}",
            item.id,
            item.kind(),
            kind
        )));
    }
    Ok(())
}
