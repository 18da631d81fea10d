//! Core data models used throughout the activity memory.
//!
//! These types represent the events, notes, and index entries that flow
//! through the ingestion, indexing, and retrieval pipeline. Events and notes
//! are immutable once persisted; index entries are derived and may be
//! rewritten (upserted) by the indexer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Identity of a persisted [`Event`]. Assigned by the event store, gap-free
/// and strictly increasing in append order.
pub type EventId = i64;

/// Identity of a persisted [`Note`]. Lives in its own namespace, disjoint
/// from [`EventId`].
pub type NoteId = i64;

/// What happened to a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
    Renamed,
    Commit,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "CREATED",
            EventKind::Modified => "MODIFIED",
            EventKind::Deleted => "DELETED",
            EventKind::Renamed => "RENAMED",
            EventKind::Commit => "COMMIT",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(EventKind::Created),
            "MODIFIED" => Ok(EventKind::Modified),
            "DELETED" => Ok(EventKind::Deleted),
            "RENAMED" => Ok(EventKind::Renamed),
            "COMMIT" => Ok(EventKind::Commit),
            other => Err(format!("unknown event kind: '{}'", other)),
        }
    }
}

/// Which watcher produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Filesystem,
    Git,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Filesystem => "filesystem",
            EventSource::Git => "git",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "filesystem" | "fs" => Ok(EventSource::Filesystem),
            "git" => Ok(EventSource::Git),
            other => Err(format!("unknown event source: '{}'", other)),
        }
    }
}

/// The thing an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum Subject {
    /// A filesystem path.
    Path(String),
    /// A commit within a repository.
    Commit {
        repo_path: String,
        commit_hash: String,
    },
}

impl Subject {
    /// The path-like part of the subject: the file path, or the repository
    /// path for commits. Subject-prefix filters match against this.
    pub fn location(&self) -> &str {
        match self {
            Subject::Path(p) => p,
            Subject::Commit { repo_path, .. } => repo_path,
        }
    }

    pub fn commit_hash(&self) -> Option<&str> {
        match self {
            Subject::Path(_) => None,
            Subject::Commit { commit_hash, .. } => Some(commit_hash),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Path(p) => f.write_str(p),
            Subject::Commit {
                repo_path,
                commit_hash,
            } => write!(f, "{}@{}", repo_path, commit_hash),
        }
    }
}

/// An event that has not been appended yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub subject: Subject,
    pub detail: String,
    pub source: EventSource,
    pub author: Option<String>,
}

impl NewEvent {
    /// A filesystem event for `path`.
    pub fn file(
        kind: EventKind,
        path: impl Into<String>,
        detail: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            kind,
            subject: Subject::Path(path.into()),
            detail: detail.into(),
            source: EventSource::Filesystem,
            author: None,
        }
    }

    /// A `COMMIT` event; `summary` is the commit subject line.
    pub fn commit(
        repo_path: impl Into<String>,
        commit_hash: impl Into<String>,
        summary: impl Into<String>,
        author: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            kind: EventKind::Commit,
            subject: Subject::Commit {
                repo_path: repo_path.into(),
                commit_hash: commit_hash.into(),
            },
            detail: summary.into(),
            source: EventSource::Git,
            author,
        }
    }

    /// Key under which duplicates of this event are detected.
    ///
    /// Commits are keyed by content (repository + hash) so a replayed commit
    /// is recognised no matter when it is re-emitted. File events are keyed
    /// by source, kind and path and are only duplicates within the store's
    /// dedup window.
    pub fn dedup_key(&self) -> String {
        match &self.subject {
            Subject::Commit {
                repo_path,
                commit_hash,
            } => format!("{}|{}|{}", self.source, repo_path, commit_hash),
            Subject::Path(path) => format!("{}|{}|{}", self.source, self.kind, path),
        }
    }

    /// Whether duplicates are detected by content rather than by time window.
    pub fn is_content_keyed(&self) -> bool {
        self.kind == EventKind::Commit
    }
}

/// An immutable, persisted record of something that happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub subject: Subject,
    pub detail: String,
    pub source: EventSource,
    pub author: Option<String>,
}

impl Event {
    /// Normalized text fed to the embedding backend: kind, subject, detail.
    pub fn embedding_text(&self) -> String {
        let mut text = format!("{} {}", self.kind, self.subject.location());
        if let Some(hash) = self.subject.commit_hash() {
            text.push(' ');
            text.push_str(hash);
        }
        if !self.detail.is_empty() {
            text.push(' ');
            text.push_str(&self.detail);
        }
        text
    }
}

/// User-authored text, embedded and retrieved alongside events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Note {
    pub id: NoteId,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub body: String,
}

impl Note {
    pub fn embedding_text(&self) -> String {
        if self.title.is_empty() {
            self.body.clone()
        } else {
            format!("{}\n{}", self.title, self.body)
        }
    }
}

/// Reference to an embeddable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum ItemRef {
    Event(EventId),
    Note(NoteId),
}

impl ItemRef {
    pub fn kind_str(&self) -> &'static str {
        match self {
            ItemRef::Event(_) => "event",
            ItemRef::Note(_) => "note",
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            ItemRef::Event(id) | ItemRef::Note(id) => *id,
        }
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind_str(), self.id())
    }
}

/// Derived embedding record linking an event or note to a vector.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub item: ItemRef,
    pub embedding: Vec<f32>,
    pub indexed_at: DateTime<Utc>,
    /// Copied from the item so retrieval filters run against the index alone.
    pub timestamp: DateTime<Utc>,
    /// `filesystem`, `git`, or `note`.
    pub source: String,
    pub subject: String,
    /// Start of the file's text, for file events whose content was read.
    pub excerpt: Option<String>,
}

/// Structured filter over the event log.
///
/// All constraints are conjunctive; empty `kinds`/`sources` mean "any".
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub kinds: Vec<EventKind>,
    pub sources: Vec<EventSource>,
    pub subject_prefix: Option<String>,
    /// Only events with `id > after_id`.
    pub after_id: Option<EventId>,
    pub limit: Option<i64>,
    /// Order by id descending, so `limit` keeps the newest events.
    pub newest_first: bool,
}

impl EventFilter {
    pub fn after(id: EventId) -> Self {
        Self {
            after_id: Some(id),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The newest `limit` matching events, newest first.
    pub fn latest(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self.newest_first = true;
        self
    }
}

/// Convert a millisecond UNIX timestamp into a UTC datetime.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
