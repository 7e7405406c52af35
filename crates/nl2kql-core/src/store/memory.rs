//! In-memory [`Store`] implementation.
//!
//! Each collection is an immutable [`CollectionSnapshot`] behind an
//! `Arc`. Readers clone the `Arc` under a momentary read lock and score
//! without holding any lock. Writers serialize on a store-wide mutex, build
//! a new snapshot, and swap it in, so a reader sees either the old or the
//! new collection and never a partial mix.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::embedding::cosine_similarity;
use crate::error::{CoreError, Result};
use crate::models::{CollectionKind, ContextItem, RetrievalResult};

use super::{check_kind, rank_candidates, CollectionStats, Store};

#[derive(Debug, Clone)]
struct Entry {
    item: ContextItem,
    vector: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
struct CollectionSnapshot {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
    refreshed: Option<DateTime<Utc>>,
}

impl CollectionSnapshot {
    fn from_entries(entries: Vec<Entry>) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.item.id.clone(), i))
            .collect();
        Self {
            entries,
            index,
            refreshed: Some(Utc::now()),
        }
    }
}

/// In-memory store for tests and single-process embedding.
pub struct InMemoryStore {
    collections: HashMap<CollectionKind, RwLock<Arc<CollectionSnapshot>>>,
    /// Vector dimension, fixed by the first vector written.
    dims: RwLock<Option<usize>>,
    write_lock: Mutex<()>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            collections: CollectionKind::ALL
                .into_iter()
                .map(|k| (k, RwLock::new(Arc::new(CollectionSnapshot::default()))))
                .collect(),
            dims: RwLock::new(None),
            write_lock: Mutex::new(()),
        }
    }

    fn slot(&self, kind: CollectionKind) -> &RwLock<Arc<CollectionSnapshot>> {
        // Every kind is inserted in `new`.
        &self.collections[&kind]
    }

    fn snapshot(&self, kind: CollectionKind) -> Arc<CollectionSnapshot> {
        Arc::clone(&self.slot(kind).read())
    }

    fn check_vector(&self, vector: &[f32]) -> Result<()> {
        match *self.dims.read() {
            Some(expected) if expected != vector.len() => Err(CoreError::DimensionMismatch {
                expected,
                got: vector.len(),
            }),
            _ => Ok(()),
        }
    }

    fn fix_dims(&self, dims: usize) {
        let mut guard = self.dims.write();
        if guard.is_none() {
            *guard = Some(dims);
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert(
        &self,
        kind: CollectionKind,
        item: &ContextItem,
        vector: &[f32],
    ) -> Result<()> {
        check_kind(kind, item)?;
        let _w = self.write_lock.lock();
        self.check_vector(vector)?;

        let current = self.snapshot(kind);
        let mut next = (*current).clone();
        let entry = Entry {
            item: item.clone(),
            vector: vector.to_vec(),
        };
        match next.index.get(&item.id) {
            Some(&pos) => next.entries[pos] = entry,
            None => {
                next.index.insert(item.id.clone(), next.entries.len());
                next.entries.push(entry);
            }
        }
        next.refreshed = Some(Utc::now());
        *self.slot(kind).write() = Arc::new(next);
        self.fix_dims(vector.len());
        Ok(())
    }

    async fn query(
        &self,
        kind: CollectionKind,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>> {
        self.check_vector(vector)?;
        let snapshot = self.snapshot(kind);
        let scored = snapshot
            .entries
            .iter()
            .enumerate()
            .map(|(position, e)| RetrievalResult {
                item: e.item.clone(),
                similarity: cosine_similarity(vector, &e.vector),
                position,
            })
            .collect();
        Ok(rank_candidates(scored, top_k))
    }

    async fn rebuild(
        &self,
        kind: CollectionKind,
        entries: Vec<(ContextItem, Vec<f32>)>,
    ) -> Result<()> {
        let _w = self.write_lock.lock();
        let fail = |reason: String| CoreError::StoreRebuildFailure {
            collection: kind,
            reason,
        };

        let expected = (*self.dims.read()).or_else(|| entries.first().map(|(_, v)| v.len()));
        let mut built: Vec<Entry> = Vec::with_capacity(entries.len());
        let mut seen: HashMap<String, usize> = HashMap::new();
        for (item, vector) in entries {
            check_kind(kind, &item).map_err(|e| fail(e.to_string()))?;
            if let Some(dims) = expected {
                if vector.len() != dims {
                    return Err(fail(format!(
                        "item '{}' has dimension {}, expected {}",
                        item.id,
                        vector.len(),
                        dims
                    )));
                }
            }
            let entry = Entry { item, vector };
            // Later duplicates replace earlier ones in place.
            match seen.get(&entry.item.id) {
                Some(&pos) => built[pos] = entry,
                None => {
                    seen.insert(entry.item.id.clone(), built.len());
                    built.push(entry);
                }
            }
        }

        *self.slot(kind).write() = Arc::new(CollectionSnapshot::from_entries(built));
        if let Some(dims) = expected {
            self.fix_dims(dims);
        }
        Ok(())
    }

    async fn items(&self, kind: CollectionKind) -> Result<Vec<ContextItem>> {
        Ok(self
            .snapshot(kind)
            .entries
            .iter()
            .map(|e| e.item.clone())
            .collect())
    }

    async fn get(&self, kind: CollectionKind, id: &str) -> Result<Option<ContextItem>> {
        let snapshot = self.snapshot(kind);
        Ok(snapshot
            .index
            .get(id)
            .map(|&pos| snapshot.entries[pos].item.clone()))
    }

    async fn stats(&self) -> Result<Vec<CollectionStats>> {
        Ok(CollectionKind::ALL
            .into_iter()
            .map(|kind| {
                let snapshot = self.snapshot(kind);
                CollectionStats {
                    kind,
                    count: snapshot.entries.len(),
                    last_refreshed: snapshot.refreshed,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;

    fn field(table: &str, name: &str) -> ContextItem {
        ContextItem::field_description(table, name, "string", "")
    }

    #[tokio::test]
    async fn test_single_item_roundtrip_rank_one() {
        let store = InMemoryStore::new();
        let e = HashEmbedder::new(32);
        let item = field("SecurityEvent", "EventID");
        let v = e.embed_one(&item.text);
        store
            .upsert(CollectionKind::FieldDescriptions, &item, &v)
            .await
            .unwrap();

        let results = store
            .query(CollectionKind::FieldDescriptions, &v, 5)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].item.id, item.id);
        assert!((results[0].similarity - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_ties_keep_insertion_order() {
        let store = InMemoryStore::new();
        let v = vec![1.0, 0.0];
        for name in ["b", "a", "c"] {
            store
                .upsert(CollectionKind::FieldDescriptions, &field("T", name), &v)
                .await
                .unwrap();
        }
        let ids: Vec<String> = store
            .query(CollectionKind::FieldDescriptions, &v, 3)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.item.id)
            .collect();
        assert_eq!(ids, vec!["field::T::b", "field::T::a", "field::T::c"]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_in_place() {
        let store = InMemoryStore::new();
        let kind = CollectionKind::FieldDescriptions;
        store.upsert(kind, &field("T", "a"), &[1.0, 0.0]).await.unwrap();
        store.upsert(kind, &field("T", "b"), &[1.0, 0.0]).await.unwrap();
        let replaced = ContextItem::field_description("T", "a", "int", "changed");
        store.upsert(kind, &replaced, &[1.0, 0.0]).await.unwrap();

        let items = store.items(kind).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], replaced);
    }

    #[tokio::test]
    async fn test_collections_are_independent() {
        let store = InMemoryStore::new();
        store
            .upsert(CollectionKind::FieldDescriptions, &field("T", "a"), &[1.0])
            .await
            .unwrap();
        let results = store
            .query(CollectionKind::Schemas, &[1.0], 10)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_replaces_collection() {
        let store = InMemoryStore::new();
        let kind = CollectionKind::FieldDescriptions;
        store.upsert(kind, &field("Old", "x"), &[1.0, 0.0]).await.unwrap();
        store
            .rebuild(
                kind,
                vec![
                    (field("New", "a"), vec![0.0, 1.0]),
                    (field("New", "b"), vec![1.0, 0.0]),
                ],
            )
            .await
            .unwrap();
        assert!(store.get(kind, "field::Old::x").await.unwrap().is_none());
        assert_eq!(store.items(kind).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_previous_contents() {
        let store = InMemoryStore::new();
        let kind = CollectionKind::FieldDescriptions;
        store.upsert(kind, &field("Old", "x"), &[1.0, 0.0]).await.unwrap();
        let err = store
            .rebuild(kind, vec![(field("New", "a"), vec![1.0, 0.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::StoreRebuildFailure { .. }));
        assert!(store.get(kind, "field::Old::x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wrong_kind_rejected() {
        let store = InMemoryStore::new();
        let example = ContextItem::example_pair("q", "T | take 1", "");
        assert!(store
            .upsert(CollectionKind::Schemas, &example, &[1.0])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_query_dimension_mismatch() {
        let store = InMemoryStore::new();
        store
            .upsert(CollectionKind::Schemas, &ContextItem::table_schema("T", "", vec![]), &[1.0, 0.0])
            .await
            .unwrap();
        let err = store
            .query(CollectionKind::Schemas, &[1.0], 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DimensionMismatch { expected: 2, got: 1 }));
    }

    #[tokio::test]
    async fn test_stats_counts_and_timestamps() {
        let store = InMemoryStore::new();
        store
            .upsert(CollectionKind::FieldValues, &ContextItem::field_values("T", "f", &[]), &[1.0])
            .await
            .unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.len(), 4);
        let values = stats
            .iter()
            .find(|s| s.kind == CollectionKind::FieldValues)
            .unwrap();
        assert_eq!(values.count, 1);
        assert!(values.last_refreshed.is_some());
        let schemas = stats
            .iter()
            .find(|s| s.kind == CollectionKind::Schemas)
            .unwrap();
        assert_eq!(schemas.count, 0);
        assert!(schemas.last_refreshed.is_none());
    }

    #[tokio::test]
    async fn test_readers_see_old_or_new_during_rebuild() {
        let store = Arc::new(InMemoryStore::new());
        let kind = CollectionKind::FieldDescriptions;
        let old: Vec<_> = (0..50)
            .map(|i| (field("Old", &format!("f{i}")), vec![1.0, 0.0]))
            .collect();
        store.rebuild(kind, old).await.unwrap();

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for round in 0..20 {
                    let table = if round % 2 == 0 { "New" } else { "Old" };
                    let entries: Vec<_> = (0..50)
                        .map(|i| (field(table, &format!("f{i}")), vec![1.0, 0.0]))
                        .collect();
                    store.rebuild(kind, entries).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        for _ in 0..200 {
            let results = store.query(kind, &[1.0, 0.0], 100).await.unwrap();
            assert_eq!(results.len(), 50);
            let first = results[0].item.table().unwrap().to_string();
            assert!(results.iter().all(|r| r.item.table() == Some(first.as_str())));
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
    }
}
