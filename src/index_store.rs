//! Persistence for the derived vector index.
//!
//! Lives in its own database so it can be deleted and rebuilt from the
//! event log at any time. Holds three tables:
//!
//! - `index_entries`: one vector per event or note, keyed by `(item_kind, item_id)`,
//!   with a content excerpt for file events and the `revision` of the
//!   batch that last wrote it.
//! - `index_cursors`: the highest item id already indexed, per stream.
//! - `indexer_status`: the indexer's last persisted state, so other
//!   processes can tell whether the index is stale.
//!
//! Entries and the cursor that covers them are written in one transaction;
//! re-indexing an item replaces its entry in place. Every batch takes the
//! next revision number, so readers holding a copy of the index can fetch
//! just the rows written since they last looked.

use std::collections::HashMap;

use chrono::Utc;
use futures_util::TryStreamExt;
use sqlx::sqlite::{Sqlite, SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row};

use crate::db::push_prefix_match;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{MemoryError, Result};
use crate::models::{from_millis, IndexEntry, ItemRef};

pub const EVENTS_STREAM: &str = "events";
pub const NOTES_STREAM: &str = "notes";

/// Indexer status as last written by the indexer.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredStatus {
    pub state: String,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub updated_at: chrono::DateTime<Utc>,
}

/// Range and attribute constraints pushed down to the index query.
#[derive(Debug, Clone, Default)]
pub struct CandidateFilter {
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
    pub source: Option<String>,
    pub subject_prefix: Option<String>,
}

impl CandidateFilter {
    /// The in-memory equivalent of the SQL predicate: `since` inclusive,
    /// `until` exclusive, exact source, case-sensitive subject prefix.
    pub fn matches(&self, timestamp_ms: i64, source: &str, subject: &str) -> bool {
        self.since_ms.map_or(true, |s| timestamp_ms >= s)
            && self.until_ms.map_or(true, |u| timestamp_ms < u)
            && self.source.as_deref().map_or(true, |s| s == source)
            && self
                .subject_prefix
                .as_deref()
                .map_or(true, |p| subject.starts_with(p))
    }
}

/// A stored vector with the metadata needed to filter and rank it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub item: ItemRef,
    pub embedding: Vec<f32>,
    pub timestamp_ms: i64,
    pub source: String,
    pub subject: String,
    pub revision: i64,
}

const CANDIDATE_COLUMNS: &str =
    "SELECT item_kind, item_id, embedding, timestamp_ms, source, subject, revision FROM index_entries";

pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the vector database at `path`, creating the schema if needed.
    pub async fn open(path: &std::path::Path) -> anyhow::Result<Self> {
        let pool = crate::db::connect(path).await?;
        crate::migrate::migrate_vector_db(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Highest item id already indexed for `stream`, 0 if none.
    pub async fn cursor(&self, stream: &str) -> Result<i64> {
        let position: Option<i64> =
            sqlx::query_scalar("SELECT position FROM index_cursors WHERE stream = ?")
                .bind(stream)
                .fetch_optional(&self.pool)
                .await?;
        Ok(position.unwrap_or(0))
    }

    /// Move `stream`'s cursor, e.g. back to 0 to rebuild the index.
    pub async fn set_cursor(&self, stream: &str, position: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO index_cursors (stream, position, updated_at_ms) VALUES (?, ?, ?)
            ON CONFLICT(stream) DO UPDATE SET position = excluded.position, updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(stream)
        .bind(position)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert `entries` and advance `stream` to `position` atomically.
    pub async fn commit_batch(
        &self,
        stream: &str,
        position: i64,
        model: &str,
        entries: &[IndexEntry],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let revision: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(revision), 0) + 1 FROM index_entries")
                .fetch_one(&mut *tx)
                .await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO index_entries
                    (item_kind, item_id, embedding, dims, model, indexed_at_ms, timestamp_ms, source, subject, excerpt, revision)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(item_kind, item_id) DO UPDATE SET
                    embedding = excluded.embedding,
                    dims = excluded.dims,
                    model = excluded.model,
                    indexed_at_ms = excluded.indexed_at_ms,
                    timestamp_ms = excluded.timestamp_ms,
                    source = excluded.source,
                    subject = excluded.subject,
                    excerpt = excluded.excerpt,
                    revision = excluded.revision
                "#,
            )
            .bind(entry.item.kind_str())
            .bind(entry.item.id())
            .bind(vec_to_blob(&entry.embedding))
            .bind(entry.embedding.len() as i64)
            .bind(model)
            .bind(entry.indexed_at.timestamp_millis())
            .bind(entry.timestamp.timestamp_millis())
            .bind(&entry.source)
            .bind(&entry.subject)
            .bind(&entry.excerpt)
            .bind(revision)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO index_cursors (stream, position, updated_at_ms) VALUES (?, ?, ?)
            ON CONFLICT(stream) DO UPDATE SET position = excluded.position, updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(stream)
        .bind(position)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn count_entries(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Stream every entry matching `filter` through `visit`.
    ///
    /// Rows are decoded one at a time so memory stays bounded by what the
    /// caller keeps, not by the size of the index.
    pub async fn for_each_candidate<F>(&self, filter: &CandidateFilter, mut visit: F) -> Result<()>
    where
        F: FnMut(Candidate),
    {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(CANDIDATE_COLUMNS);
        qb.push(" WHERE 1 = 1");
        if let Some(since) = filter.since_ms {
            qb.push(" AND timestamp_ms >= ").push_bind(since);
        }
        if let Some(until) = filter.until_ms {
            qb.push(" AND timestamp_ms < ").push_bind(until);
        }
        if let Some(source) = &filter.source {
            qb.push(" AND source = ").push_bind(source.clone());
        }
        if let Some(prefix) = &filter.subject_prefix {
            push_prefix_match(&mut qb, "subject", prefix);
        }

        let mut rows = qb.build().fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            visit(row_to_candidate(&row)?);
        }
        Ok(())
    }

    /// Stream entries written after `revision`, oldest revision first.
    pub async fn for_each_since<F>(&self, revision: i64, mut visit: F) -> Result<()>
    where
        F: FnMut(Candidate),
    {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(CANDIDATE_COLUMNS);
        qb.push(" WHERE revision > ")
            .push_bind(revision)
            .push(" ORDER BY revision ASC");

        let mut rows = qb.build().fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            visit(row_to_candidate(&row)?);
        }
        Ok(())
    }

    /// Stored content excerpts for those of `items` that have one.
    pub async fn excerpts(&self, items: &[ItemRef]) -> Result<HashMap<ItemRef, String>> {
        let event_ids: Vec<i64> = items
            .iter()
            .filter_map(|i| match i {
                ItemRef::Event(id) => Some(*id),
                ItemRef::Note(_) => None,
            })
            .collect();
        if event_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT item_id, excerpt FROM index_entries WHERE item_kind = 'event' AND excerpt IS NOT NULL AND item_id IN (",
        );
        let mut sep = qb.separated(", ");
        for id in &event_ids {
            sep.push_bind(*id);
        }
        qb.push(")");

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| (ItemRef::Event(row.get("item_id")), row.get("excerpt")))
            .collect())
    }

    pub async fn save_status(&self, status: &StoredStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO indexer_status (id, state, consecutive_failures, last_error, updated_at_ms)
            VALUES (1, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                consecutive_failures = excluded.consecutive_failures,
                last_error = excluded.last_error,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(&status.state)
        .bind(status.consecutive_failures as i64)
        .bind(&status.last_error)
        .bind(status.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_status(&self) -> Result<Option<StoredStatus>> {
        let row = sqlx::query(
            "SELECT state, consecutive_failures, last_error, updated_at_ms FROM indexer_status WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| {
            let failures: i64 = row.get("consecutive_failures");
            let updated: i64 = row.get("updated_at_ms");
            StoredStatus {
                state: row.get("state"),
                consecutive_failures: failures.max(0) as u32,
                last_error: row.get("last_error"),
                updated_at: from_millis(updated),
            }
        }))
    }
}

fn row_to_candidate(row: &SqliteRow) -> Result<Candidate> {
    let kind: String = row.get("item_kind");
    let id: i64 = row.get("item_id");
    let blob: Vec<u8> = row.get("embedding");
    let item = match kind.as_str() {
        "event" => ItemRef::Event(id),
        "note" => ItemRef::Note(id),
        other => {
            return Err(MemoryError::Storage(sqlx::Error::Decode(
                format!("unknown item kind: {}", other).into(),
            )))
        }
    };
    Ok(Candidate {
        item,
        embedding: blob_to_vec(&blob),
        timestamp_ms: row.get("timestamp_ms"),
        source: row.get("source"),
        subject: row.get("subject"),
        revision: row.get("revision"),
    })
}
