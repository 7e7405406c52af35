//! SQLite-backed [`Store`] implementation.
//!
//! Every collection lives in the `context_items` table keyed by
//! `(collection, id)`. Vectors are stored as little-endian `f32` BLOBs and
//! scored in process with cosine similarity. Rebuilds run inside a single
//! transaction, so a concurrent reader (one `SELECT` under WAL) observes the
//! complete old or the complete new collection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use nl2kql_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use nl2kql_core::models::{CollectionKind, ContextItem, FeedbackRecord, ItemMetadata, RetrievalResult};
use nl2kql_core::store::{check_kind, rank_candidates, CollectionStats, Store};
use nl2kql_core::{CoreError, Result};

/// SQLite implementation of the [`Store`] trait, plus the append-only
/// feedback log.
pub struct SqliteStore {
    pool: SqlitePool,
    /// Serializes collection mutations relative to each other.
    write_lock: Mutex<()>,
}

fn storage(e: impl std::fmt::Display) -> CoreError {
    CoreError::Storage(e.to_string())
}

fn from_ts(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|t| DateTime::from_timestamp(t, 0))
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Dimension of any stored vector outside `exclude`, if there is one.
    async fn stored_dims(&self, exclude: Option<CollectionKind>) -> Result<Option<usize>> {
        let dims: Option<i64> = match exclude {
            Some(kind) => {
                sqlx::query_scalar("SELECT dims FROM context_items WHERE collection != ? LIMIT 1")
                    .bind(kind.as_str())
                    .fetch_optional(&self.pool)
                    .await
            }
            None => {
                sqlx::query_scalar("SELECT dims FROM context_items LIMIT 1")
                    .fetch_optional(&self.pool)
                    .await
            }
        }
        .map_err(storage)?;
        Ok(dims.map(|d| d as usize))
    }

    /// Append a feedback record to the log and return its identifier.
    pub async fn append_feedback(&self, record: &FeedbackRecord) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO feedback (id, natural_language, generated_query, corrected_query, rating, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&record.natural_language)
        .bind(&record.generated_query)
        .bind(&record.corrected_query)
        .bind(record.rating.as_str())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(id)
    }

    pub async fn feedback_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feedback")
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(count as usize)
    }
}

fn decode_item(id: String, text: String, metadata_json: &str) -> Result<ContextItem> {
    let metadata: ItemMetadata = serde_json::from_str(metadata_json)
        .map_err(|e| storage(format!("corrupt metadata for item '{}': {}", id, e)))?;
    Ok(ContextItem { id, text, metadata })
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert(
        &self,
        kind: CollectionKind,
        item: &ContextItem,
        vector: &[f32],
    ) -> Result<()> {
        check_kind(kind, item)?;
        let _w = self.write_lock.lock().await;

        if let Some(expected) = self.stored_dims(None).await? {
            if expected != vector.len() {
                return Err(CoreError::DimensionMismatch {
                    expected,
                    got: vector.len(),
                });
            }
        }

        let metadata_json = serde_json::to_string(&item.metadata).map_err(storage)?;
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // A new id takes the next position; a replaced id keeps its own.
        sqlx::query(
            r#"
            INSERT INTO context_items (collection, id, seq, text, vector, dims, metadata_json)
            VALUES (?, ?, (SELECT COALESCE(MAX(seq), -1) + 1 FROM context_items WHERE collection = ?), ?, ?, ?, ?)
            ON CONFLICT(collection, id) DO UPDATE SET
                text = excluded.text,
                vector = excluded.vector,
                dims = excluded.dims,
                metadata_json = excluded.metadata_json
            "#,
        )
        .bind(kind.as_str())
        .bind(&item.id)
        .bind(kind.as_str())
        .bind(&item.text)
        .bind(vec_to_blob(vector))
        .bind(vector.len() as i64)
        .bind(&metadata_json)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            INSERT INTO collections (name, item_count, refreshed_at)
            VALUES (?, (SELECT COUNT(*) FROM context_items WHERE collection = ?), ?)
            ON CONFLICT(name) DO UPDATE SET
                item_count = excluded.item_count,
                refreshed_at = excluded.refreshed_at
            "#,
        )
        .bind(kind.as_str())
        .bind(kind.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn query(
        &self,
        kind: CollectionKind,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>> {
        let rows = sqlx::query(
            "SELECT id, seq, text, vector, dims, metadata_json FROM context_items WHERE collection = ? ORDER BY seq",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in rows {
            let dims: i64 = row.get("dims");
            if dims as usize != vector.len() {
                return Err(CoreError::DimensionMismatch {
                    expected: dims as usize,
                    got: vector.len(),
                });
            }
            let seq: i64 = row.get("seq");
            let blob: Vec<u8> = row.get("vector");
            let metadata_json: String = row.get("metadata_json");
            let item = decode_item(row.get("id"), row.get("text"), &metadata_json)?;
            scored.push(RetrievalResult {
                item,
                similarity: cosine_similarity(vector, &blob_to_vec(&blob)),
                position: seq as usize,
            });
        }

        Ok(rank_candidates(scored, top_k))
    }

    async fn rebuild(
        &self,
        kind: CollectionKind,
        entries: Vec<(ContextItem, Vec<f32>)>,
    ) -> Result<()> {
        let fail = |reason: String| CoreError::StoreRebuildFailure {
            collection: kind,
            reason,
        };
        let _w = self.write_lock.lock().await;

        let expected = self
            .stored_dims(Some(kind))
            .await
            .map_err(|e| fail(e.to_string()))?
            .or_else(|| entries.first().map(|(_, v)| v.len()));
        let mut rows = Vec::with_capacity(entries.len());
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
            let metadata_json =
                serde_json::to_string(&item.metadata).map_err(|e| fail(e.to_string()))?;
            rows.push((item, vector, metadata_json));
        }

        let result: std::result::Result<(), sqlx::Error> = async {
            let mut tx = self.pool.begin().await?;

            sqlx::query("DELETE FROM context_items WHERE collection = ?")
                .bind(kind.as_str())
                .execute(&mut *tx)
                .await?;

            for (seq, (item, vector, metadata_json)) in rows.iter().enumerate() {
                // Later duplicates replace earlier ones in place.
                sqlx::query(
                    r#"
                    INSERT INTO context_items (collection, id, seq, text, vector, dims, metadata_json)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(collection, id) DO UPDATE SET
                        text = excluded.text,
                        vector = excluded.vector,
                        metadata_json = excluded.metadata_json
                    "#,
                )
                .bind(kind.as_str())
                .bind(&item.id)
                .bind(seq as i64)
                .bind(&item.text)
                .bind(vec_to_blob(vector))
                .bind(vector.len() as i64)
                .bind(metadata_json)
                .execute(&mut *tx)
                .await?;
            }

            sqlx::query(
                r#"
                INSERT INTO collections (name, item_count, refreshed_at)
                VALUES (?, (SELECT COUNT(*) FROM context_items WHERE collection = ?), ?)
                ON CONFLICT(name) DO UPDATE SET
                    item_count = excluded.item_count,
                    refreshed_at = excluded.refreshed_at
                "#,
            )
            .bind(kind.as_str())
            .bind(kind.as_str())
            .bind(Utc::now().timestamp())
            .execute(&mut *tx)
            .await?;

            tx.commit().await
        }
        .await;

        // Dropping an uncommitted transaction rolls it back.
        result.map_err(|e| fail(e.to_string()))
    }

    async fn items(&self, kind: CollectionKind) -> Result<Vec<ContextItem>> {
        let rows = sqlx::query(
            "SELECT id, text, metadata_json FROM context_items WHERE collection = ? ORDER BY seq",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.into_iter()
            .map(|row| {
                let metadata_json: String = row.get("metadata_json");
                decode_item(row.get("id"), row.get("text"), &metadata_json)
            })
            .collect()
    }

    async fn get(&self, kind: CollectionKind, id: &str) -> Result<Option<ContextItem>> {
        let row = sqlx::query(
            "SELECT id, text, metadata_json FROM context_items WHERE collection = ? AND id = ?",
        )
        .bind(kind.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        match row {
            Some(row) => {
                let metadata_json: String = row.get("metadata_json");
                Ok(Some(decode_item(
                    row.get("id"),
                    row.get("text"),
                    &metadata_json,
                )?))
            }
            None => Ok(None),
        }
    }

    async fn stats(&self) -> Result<Vec<CollectionStats>> {
        let mut stats = Vec::with_capacity(CollectionKind::ALL.len());
        for kind in CollectionKind::ALL {
            let row = sqlx::query("SELECT item_count, refreshed_at FROM collections WHERE name = ?")
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
            let (count, refreshed) = match row {
                Some(row) => {
                    let count: i64 = row.get("item_count");
                    let refreshed: Option<i64> = row.get("refreshed_at");
                    (count as usize, from_ts(refreshed))
                }
                None => (0, None),
            };
            stats.push(CollectionStats {
                kind,
                count,
                last_refreshed: refreshed,
            });
        }
        Ok(stats)
    }
}
