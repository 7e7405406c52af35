use anyhow::Result;
use sqlx::SqlitePool;

/// Create the schema on an open pool. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One row per context item; `seq` is the insertion position used to
    // break similarity ties.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS context_items (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            text TEXT NOT NULL,
            vector BLOB NOT NULL,
            dims INTEGER NOT NULL,
            metadata_json TEXT NOT NULL,
            PRIMARY KEY (collection, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            item_count INTEGER NOT NULL DEFAULT 0,
            refreshed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feedback (
            id TEXT PRIMARY KEY,
            natural_language TEXT NOT NULL,
            generated_query TEXT NOT NULL,
            corrected_query TEXT,
            rating TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_context_items_seq ON context_items(collection, seq)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_feedback_created_at ON feedback(created_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
