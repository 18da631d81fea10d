//! Error taxonomy for the ingestion and retrieval core.
//!
//! Operations with a contractual failure mode return [`MemoryError`];
//! orchestration code wraps these in `anyhow` with context.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Error, Debug)]
pub enum MemoryError {
    /// An equivalent event is already in the log. Recoverable: callers drop it.
    #[error("duplicate event: {dedup_key}")]
    DuplicateEvent { dedup_key: String },

    /// The embedding backend could not be reached, timed out, or answered garbage.
    #[error("embedding backend unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// A watched root could not be observed.
    #[error("cannot watch {path}: {reason}")]
    WatcherIo { path: String, reason: String },

    /// A configured repository is missing, invalid, or git failed on it.
    #[error("cannot read repository {repo}: {reason}")]
    RepoAccess { repo: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl MemoryError {
    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::EmbeddingUnavailable(msg.into())
    }

    pub fn repo(repo: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RepoAccess {
            repo: repo.into(),
            reason: reason.into(),
        }
    }

    pub fn watcher(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WatcherIo {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateEvent { .. })
    }
}
