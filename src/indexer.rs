//! Incremental memory indexer.
//!
//! Pulls events and notes above its cursors, embeds them in batches, and
//! commits the vectors together with the advanced cursor. Runs as a single
//! background task; callers observe it through an [`IndexerHandle`].
//!
//! # States
//!
//! ```text
//! IDLE ──wake──▶ SCANNING ──items──▶ EMBEDDING ──ok──▶ COMMITTING ──▶ SCANNING
//!                   │ none                │ backend error
//!                   ▼                     ▼
//!                  IDLE           backoff, retry same batch
//!                                         │ max consecutive failures
//!                                         ▼
//!                                     DEGRADED ──manual reset──▶ SCANNING
//! ```
//!
//! The indexer wakes on the store's change signal or every
//! `interval_secs`. Backoff is
//! exponential from `backoff_base_ms`, capped at `backoff_max_secs`. While
//! degraded, ingestion continues but no new vectors are written; retrieval
//! reports its context as stale.
//!
//! A batch's vectors and cursor land in one transaction, so a crash between
//! embedding and commit re-embeds that batch on restart and nothing is
//! skipped or indexed twice.
//!
//! # File content
//!
//! For `CREATED`, `MODIFIED` and `RENAMED` file events the indexer reads
//! the file through [`crate::content`]. The entry's vector is then the mean
//! of the event text's embedding and one embedding per content chunk, and
//! the entry keeps a short excerpt. Unreadable or unsupported files are
//! indexed from the event text alone.

use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::IndexerConfig;
use crate::content::{read_file_content, ContentLimits, FileContent};
use crate::embedding::{embed_with_timeout, mean_vector, Embedder};
use crate::error::{MemoryError, Result};
use crate::event_store::EventStore;
use crate::index_store::{IndexStore, StoredStatus, EVENTS_STREAM, NOTES_STREAM};
use crate::models::{Event, EventFilter, EventKind, EventSource, IndexEntry, ItemRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerState {
    Idle,
    Scanning,
    Embedding,
    Committing,
    Degraded,
}

impl IndexerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexerState::Idle => "IDLE",
            IndexerState::Scanning => "SCANNING",
            IndexerState::Embedding => "EMBEDDING",
            IndexerState::Committing => "COMMITTING",
            IndexerState::Degraded => "DEGRADED",
        }
    }
}

impl fmt::Display for IndexerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexerStatus {
    pub state: IndexerState,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl IndexerStatus {
    pub fn is_degraded(&self) -> bool {
        self.state == IndexerState::Degraded
    }
}

impl Default for IndexerStatus {
    fn default() -> Self {
        Self {
            state: IndexerState::Idle,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Result of one scan/embed/commit step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Indexed(usize),
    CaughtUp,
}

/// Observer and control side of a running [`Indexer`].
#[derive(Clone)]
pub struct IndexerHandle {
    status: watch::Receiver<IndexerStatus>,
    reset: Arc<Notify>,
}

impl IndexerHandle {
    pub fn status(&self) -> IndexerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<IndexerStatus> {
        self.status.clone()
    }

    /// Leave `DEGRADED` and start scanning again. Has no effect, and is not
    /// remembered, while the indexer is in any other state.
    pub fn reset(&self) {
        self.reset.notify_waiters();
    }
}

pub struct Indexer {
    events: Arc<EventStore>,
    index: Arc<IndexStore>,
    embedder: Arc<dyn Embedder>,
    config: IndexerConfig,
    embed_timeout: Duration,
    status: watch::Sender<IndexerStatus>,
    reset: Arc<Notify>,
}

impl Indexer {
    pub fn new(
        events: Arc<EventStore>,
        index: Arc<IndexStore>,
        embedder: Arc<dyn Embedder>,
        config: IndexerConfig,
        embed_timeout: Duration,
    ) -> (Self, IndexerHandle) {
        let (status, rx) = watch::channel(IndexerStatus::default());
        let reset = Arc::new(Notify::new());
        let handle = IndexerHandle {
            status: rx,
            reset: Arc::clone(&reset),
        };
        let indexer = Self {
            events,
            index,
            embedder,
            config,
            embed_timeout,
            status,
            reset,
        };
        (indexer, handle)
    }

    pub fn status(&self) -> IndexerStatus {
        self.status.borrow().clone()
    }

    fn set_state(&self, state: IndexerState) {
        self.status.send_modify(|s| s.state = state);
    }

    async fn persist_status(&self) {
        let status = self.status();
        let stored = StoredStatus {
            state: status.state.as_str().to_string(),
            consecutive_failures: status.consecutive_failures,
            last_error: status.last_error,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.index.save_status(&stored).await {
            warn!(error = %e, "failed to persist indexer status");
        }
    }

    /// Index at most one batch from whichever stream has pending items.
    ///
    /// Events are drained before notes. On an embedding failure nothing is
    /// written and the same batch is picked up by the next call.
    pub async fn index_batch(&self) -> Result<BatchOutcome> {
        self.set_state(IndexerState::Scanning);
        let limit = self.config.batch_size as i64;

        let event_cursor = self.index.cursor(EVENTS_STREAM).await?;
        let events = self
            .events
            .query(&EventFilter::after(event_cursor).with_limit(limit))
            .await?;

        let (stream, position, texts, spans, mut entries) = if let Some(last) = events.last() {
            let position = last.id;
            let contents = self.read_contents(&events).await;
            let mut texts = Vec::new();
            let mut spans = Vec::with_capacity(events.len());
            let mut entries = Vec::with_capacity(events.len());
            for (e, content) in events.iter().zip(contents) {
                let start = texts.len();
                texts.push(e.embedding_text());
                let excerpt = content.map(|c| {
                    texts.extend(c.chunks);
                    c.excerpt
                });
                spans.push(start..texts.len());
                entries.push(IndexEntry {
                    item: ItemRef::Event(e.id),
                    embedding: Vec::new(),
                    indexed_at: Utc::now(),
                    timestamp: e.timestamp,
                    source: e.source.as_str().to_string(),
                    subject: e.subject.location().to_string(),
                    excerpt,
                });
            }
            (EVENTS_STREAM, position, texts, spans, entries)
        } else {
            let note_cursor = self.index.cursor(NOTES_STREAM).await?;
            let notes = self.events.notes_after(note_cursor, limit).await?;
            let Some(last) = notes.last() else {
                return Ok(BatchOutcome::CaughtUp);
            };
            let position = last.id;
            let texts: Vec<String> = notes.iter().map(|n| n.embedding_text()).collect();
            let spans: Vec<Range<usize>> = (0..texts.len()).map(|i| i..i + 1).collect();
            let entries: Vec<IndexEntry> = notes
                .iter()
                .map(|n| IndexEntry {
                    item: ItemRef::Note(n.id),
                    embedding: Vec::new(),
                    indexed_at: Utc::now(),
                    timestamp: n.created_at,
                    source: "note".to_string(),
                    subject: n.title.clone(),
                    excerpt: None,
                })
                .collect();
            (NOTES_STREAM, position, texts, spans, entries)
        };

        self.set_state(IndexerState::Embedding);
        debug!(stream, count = texts.len(), "embedding batch");
        let vectors =
            embed_with_timeout(self.embedder.as_ref(), &texts, self.embed_timeout).await?;

        self.set_state(IndexerState::Committing);
        for (entry, span) in entries.iter_mut().zip(spans) {
            entry.embedding = if span.len() == 1 {
                vectors[span.start].clone()
            } else {
                mean_vector(&vectors[span])
            };
        }
        self.index
            .commit_batch(stream, position, self.embedder.model_name(), &entries)
            .await?;

        debug!(stream, position, count = entries.len(), "batch committed");
        Ok(BatchOutcome::Indexed(entries.len()))
    }

    /// File content for each of `events`, `None` where there is nothing to read.
    async fn read_contents(&self, events: &[Event]) -> Vec<Option<FileContent>> {
        let count = events.len();
        if !self.config.index_content {
            return vec![None; count];
        }
        let paths: Vec<Option<PathBuf>> = events.iter().map(content_path).collect();
        let limits = ContentLimits {
            max_file_bytes: self.config.max_content_bytes,
            max_chunks: self.config.max_content_chunks,
        };
        let read = tokio::task::spawn_blocking(move || {
            paths
                .into_iter()
                .map(|path| {
                    let path = path?;
                    match read_file_content(&path, &limits) {
                        Ok(content) => content,
                        Err(e) => {
                            debug!(path = %path.display(), error = %e, "file content not indexed");
                            None
                        }
                    }
                })
                .collect::<Vec<_>>()
        })
        .await;
        read.unwrap_or_else(|e| {
            warn!(error = %e, "reading file content failed");
            vec![None; count]
        })
    }

    /// Index until caught up, stopping at the first failure.
    pub async fn drain(&self) -> Result<usize> {
        let mut total = 0;
        let result = loop {
            match self.index_batch().await {
                Ok(BatchOutcome::Indexed(n)) => total += n,
                Ok(BatchOutcome::CaughtUp) => break Ok(total),
                Err(e) => break Err(e),
            }
        };
        match &result {
            Ok(_) => self.status.send_modify(|s| {
                s.state = IndexerState::Idle;
                s.consecutive_failures = 0;
                s.last_error = None;
            }),
            Err(e) => {
                let msg = e.to_string();
                self.status.send_modify(|s| {
                    s.state = IndexerState::Idle;
                    s.last_error = Some(msg);
                });
            }
        }
        self.persist_status().await;
        result
    }

    /// Delay before retry number `failures` (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let base = Duration::from_millis(self.config.backoff_base_ms);
        let max = Duration::from_secs(self.config.backoff_max_secs);
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        base.saturating_mul(factor).min(max)
    }

    /// Run until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut changes = self.events.subscribe();
        let interval = Duration::from_secs_f64(self.config.interval_secs);
        info!(model = self.embedder.model_name(), "indexer started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.index_batch().await {
                Ok(BatchOutcome::Indexed(n)) => {
                    let recovered = self.status().consecutive_failures > 0;
                    self.status.send_modify(|s| {
                        s.consecutive_failures = 0;
                        s.last_error = None;
                    });
                    if recovered {
                        info!("embedding backend recovered");
                        self.persist_status().await;
                    }
                    debug!(count = n, "indexed batch");
                }
                Ok(BatchOutcome::CaughtUp) => {
                    self.set_state(IndexerState::Idle);
                    self.persist_status().await;
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                        _ = changes.changed() => {}
                    }
                }
                Err(MemoryError::EmbeddingUnavailable(reason)) => {
                    let failures = self.status().consecutive_failures + 1;
                    self.status.send_modify(|s| {
                        s.consecutive_failures = failures;
                        s.last_error = Some(reason.clone());
                    });

                    if failures >= self.config.max_consecutive_failures {
                        // Register before publishing DEGRADED so a reset sent
                        // as soon as the state is observed is not lost.
                        let reset = self.reset.notified();
                        tokio::pin!(reset);
                        reset.as_mut().enable();
                        self.set_state(IndexerState::Degraded);
                        self.persist_status().await;
                        error!(
                            failures,
                            error = %reason,
                            "embedding backend unavailable; indexer degraded until reset"
                        );
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = reset => {
                                info!("indexer reset");
                                self.status.send_modify(|s| {
                                    s.state = IndexerState::Scanning;
                                    s.consecutive_failures = 0;
                                    s.last_error = None;
                                });
                                self.persist_status().await;
                            }
                        }
                    } else {
                        let delay = self.backoff(failures);
                        self.persist_status().await;
                        warn!(failures, error = %reason, retry_in = ?delay, "embedding failed");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "indexer storage error");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
        }

        self.set_state(IndexerState::Idle);
        info!("indexer stopped");
    }
}

/// Files whose current content describes the event.
fn content_path(event: &Event) -> Option<PathBuf> {
    match (event.source, event.kind) {
        (EventSource::Filesystem, EventKind::Created | EventKind::Modified | EventKind::Renamed) => {
            Some(PathBuf::from(event.subject.location()))
        }
        _ => None,
    }
}
