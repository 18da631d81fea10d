//! Append-only, durable event log.
//!
//! The [`EventStore`] exclusively owns the canonical event sequence. Watchers
//! only [`append`](EventStore::append); the indexer and retrieval engine only
//! read. Appends are serialized through a single writer lock and committed in
//! a SQLite transaction, so ids are assigned atomically and without gaps, and
//! a successful return means the row survives a restart.
//!
//! # Deduplication
//!
//! Every event carries a dedup key (see [`NewEvent::dedup_key`]):
//!
//! | Kind | Key | Duplicate when |
//! |------|-----|----------------|
//! | file events | `source, kind, path` | an equal key exists within ± the dedup window |
//! | `COMMIT` | `source, repo, hash` | an equal key exists at all |
//!
//! Duplicates are rejected with [`MemoryError::DuplicateEvent`].
//!
//! # Change signal
//!
//! The store never pushes rows to consumers. It bumps a generation counter
//! after every successful append; the indexer subscribes to it as a wake-up
//! hint and then pulls rows above its own cursor.

use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{Sqlite, SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::db::push_prefix_match;
use crate::error::{MemoryError, Result};
use crate::models::{
    from_millis, Event, EventFilter, EventId, EventKind, EventSource, NewEvent, Note, NoteId,
    Subject,
};

const EVENT_COLUMNS: &str =
    "SELECT id, timestamp_ms, kind, source, subject, commit_hash, detail, author FROM events";

pub struct EventStore {
    pool: SqlitePool,
    dedup_window: Duration,
    write_lock: Mutex<()>,
    changes: watch::Sender<u64>,
}

impl EventStore {
    /// Wrap an already-migrated pool.
    pub fn new(pool: SqlitePool, dedup_window: Duration) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            pool,
            dedup_window,
            write_lock: Mutex::new(()),
            changes,
        }
    }

    /// Connect to the event database at `path`, creating the schema if needed.
    pub async fn open(path: &std::path::Path, dedup_window: Duration) -> anyhow::Result<Self> {
        let pool = crate::db::connect(path).await?;
        crate::migrate::migrate_event_db(&pool).await?;
        Ok(Self::new(pool, dedup_window))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn dedup_window(&self) -> Duration {
        self.dedup_window
    }

    /// Subscribe to the append generation counter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Durably append `event`, returning its id.
    pub async fn append(&self, event: &NewEvent) -> Result<EventId> {
        let dedup_key = event.dedup_key();
        let ts = event.timestamp.timestamp_millis();

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> = if event.is_content_keyed() {
            sqlx::query_scalar("SELECT id FROM events WHERE dedup_key = ? LIMIT 1")
                .bind(&dedup_key)
                .fetch_optional(&mut *tx)
                .await?
        } else {
            let window = self.dedup_window.as_millis() as i64;
            sqlx::query_scalar(
                "SELECT id FROM events WHERE dedup_key = ? AND timestamp_ms > ? AND timestamp_ms < ? LIMIT 1",
            )
            .bind(&dedup_key)
            .bind(ts - window)
            .bind(ts + window)
            .fetch_optional(&mut *tx)
            .await?
        };

        if let Some(id) = existing {
            debug!(%dedup_key, existing = id, "duplicate event dropped");
            return Err(MemoryError::DuplicateEvent { dedup_key });
        }

        let result = sqlx::query(
            r#"
            INSERT INTO events (timestamp_ms, kind, source, subject, commit_hash, detail, author, dedup_key)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(event.kind.as_str())
        .bind(event.source.as_str())
        .bind(event.subject.location())
        .bind(event.subject.commit_hash())
        .bind(&event.detail)
        .bind(&event.author)
        .bind(&dedup_key)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let id = result.last_insert_rowid();
        self.changes.send_modify(|g| *g += 1);
        debug!(id, kind = %event.kind, subject = %event.subject, "event appended");
        Ok(id)
    }

    /// Events matching `filter`, ordered by id ascending unless
    /// `newest_first` is set.
    pub async fn query(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(EVENT_COLUMNS);
        qb.push(" WHERE 1 = 1");

        if let Some(after) = filter.after_id {
            qb.push(" AND id > ").push_bind(after);
        }
        if let Some(since) = filter.since {
            qb.push(" AND timestamp_ms >= ")
                .push_bind(since.timestamp_millis());
        }
        if let Some(until) = filter.until {
            qb.push(" AND timestamp_ms < ")
                .push_bind(until.timestamp_millis());
        }
        if !filter.kinds.is_empty() {
            qb.push(" AND kind IN (");
            let mut sep = qb.separated(", ");
            for kind in &filter.kinds {
                sep.push_bind(kind.as_str());
            }
            qb.push(")");
        }
        if !filter.sources.is_empty() {
            qb.push(" AND source IN (");
            let mut sep = qb.separated(", ");
            for source in &filter.sources {
                sep.push_bind(source.as_str());
            }
            qb.push(")");
        }
        if let Some(prefix) = &filter.subject_prefix {
            push_prefix_match(&mut qb, "subject", prefix);
        }

        qb.push(if filter.newest_first {
            " ORDER BY id DESC"
        } else {
            " ORDER BY id ASC"
        });
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Fetch specific events; missing ids are skipped.
    pub async fn get_events(&self, ids: &[EventId]) -> Result<Vec<Event>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(EVENT_COLUMNS);
        qb.push(" WHERE id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(*id);
        }
        qb.push(") ORDER BY id ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Hash of the most recently recorded commit for `repo_path`.
    pub async fn last_commit_hash(&self, repo_path: &str) -> Result<Option<String>> {
        let hash: Option<Option<String>> = sqlx::query_scalar(
            "SELECT commit_hash FROM events WHERE kind = 'COMMIT' AND subject = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(repo_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(hash.flatten())
    }

    /// Highest assigned event id, or 0 for an empty log.
    pub async fn high_watermark(&self) -> Result<EventId> {
        let id: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    // ============ Notes ============

    /// Append a user-authored note.
    pub async fn add_note(&self, title: &str, body: &str) -> Result<NoteId> {
        let now = Utc::now().timestamp_millis();
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("INSERT INTO notes (created_at_ms, title, body) VALUES (?, ?, ?)")
            .bind(now)
            .bind(title)
            .bind(body)
            .execute(&self.pool)
            .await?;
        self.changes.send_modify(|g| *g += 1);
        Ok(result.last_insert_rowid())
    }

    /// Notes with `id > after`, ordered by id.
    pub async fn notes_after(&self, after: NoteId, limit: i64) -> Result<Vec<Note>> {
        let rows = sqlx::query(
            "SELECT id, created_at_ms, title, body FROM notes WHERE id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_note).collect())
    }

    pub async fn get_notes(&self, ids: &[NoteId]) -> Result<Vec<Note>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, created_at_ms, title, body FROM notes WHERE id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(*id);
        }
        qb.push(") ORDER BY id ASC");
        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_note).collect())
    }
}

fn decode_err(msg: String) -> MemoryError {
    MemoryError::Storage(sqlx::Error::Decode(msg.into()))
}

fn row_to_event(row: &SqliteRow) -> Result<Event> {
    let kind: String = row.get("kind");
    let source: String = row.get("source");
    let subject: String = row.get("subject");
    let commit_hash: Option<String> = row.get("commit_hash");
    let timestamp_ms: i64 = row.get("timestamp_ms");

    let kind: EventKind = kind.parse().map_err(decode_err)?;
    let source: EventSource = source.parse().map_err(decode_err)?;
    let subject = match commit_hash {
        Some(commit_hash) => Subject::Commit {
            repo_path: subject,
            commit_hash,
        },
        None => Subject::Path(subject),
    };

    Ok(Event {
        id: row.get("id"),
        timestamp: from_millis(timestamp_ms),
        kind,
        subject,
        detail: row.get("detail"),
        source,
        author: row.get("author"),
    })
}

fn row_to_note(row: &SqliteRow) -> Note {
    let created_at_ms: i64 = row.get("created_at_ms");
    Note {
        id: row.get("id"),
        created_at: from_millis(created_at_ms),
        title: row.get("title"),
        body: row.get("body"),
    }
}
