use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create both databases and their schemas. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let events = db::connect(&config.db.events).await?;
    migrate_event_db(&events).await?;
    events.close().await;

    let vectors = db::connect(&config.db.vectors).await?;
    migrate_vector_db(&vectors).await?;
    vectors.close().await;

    Ok(())
}

/// Event log schema: `events` and `notes`.
pub async fn migrate_event_db(pool: &SqlitePool) -> Result<()> {
    // AUTOINCREMENT: ids are never reused, even after a crash mid-append
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp_ms INTEGER NOT NULL,
            kind TEXT NOT NULL,
            source TEXT NOT NULL,
            subject TEXT NOT NULL,
            commit_hash TEXT,
            detail TEXT NOT NULL DEFAULT '',
            author TEXT,
            dedup_key TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at_ms INTEGER NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            body TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_dedup ON events(dedup_key, timestamp_ms)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp_ms)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_subject ON events(subject)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Index schema: `index_entries`, `index_cursors`, `indexer_status`.
pub async fn migrate_vector_db(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_entries (
            item_kind TEXT NOT NULL,
            item_id INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            model TEXT NOT NULL,
            indexed_at_ms INTEGER NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            source TEXT NOT NULL,
            subject TEXT NOT NULL,
            excerpt TEXT,
            revision INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (item_kind, item_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    // Indexes created before content indexing and the in-memory vector index
    add_column_if_missing(pool, "index_entries", "excerpt", "TEXT").await?;
    add_column_if_missing(
        pool,
        "index_entries",
        "revision",
        "INTEGER NOT NULL DEFAULT 0",
    )
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_cursors (
            stream TEXT PRIMARY KEY,
            position INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS indexer_status (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            state TEXT NOT NULL,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            updated_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_index_entries_ts ON index_entries(timestamp_ms DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_index_entries_source ON index_entries(source)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_index_entries_revision ON index_entries(revision)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<()> {
    let present: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_one(pool)
            .await?;
    if present == 0 {
        sqlx::query(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            table, column, definition
        ))
        .execute(pool)
        .await?;
    }
    Ok(())
}
