//! Watcher bookkeeping owned by each watcher task.
//!
//! Filesystem watchers track the last change recorded per path, so a
//! restarted watcher does not record it again within the dedup window; the
//! commit watcher tracks the last commit recorded per repository. Both are
//! rebuilt from the event log at startup, so a restarted watcher resumes
//! where the previous run stopped instead of replaying history.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::event_store::EventStore;
use crate::models::{EventFilter, EventKind, EventSource, NewEvent};

#[derive(Debug, Default, Clone)]
pub struct WatchState {
    last_emitted: HashMap<String, (EventKind, DateTime<Utc>)>,
    last_commit: HashMap<String, String>,
}

impl WatchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed per-path emissions from filesystem events newer than `lookback`.
    pub async fn for_filesystem(store: &EventStore, lookback: Duration) -> Result<Self> {
        let lookback = chrono::Duration::from_std(lookback).unwrap_or_else(|_| chrono::Duration::zero());
        let recent = store
            .query(&EventFilter {
                since: Some(Utc::now() - lookback),
                sources: vec![EventSource::Filesystem],
                ..Default::default()
            })
            .await?;
        let mut state = Self::new();
        for event in recent {
            state.record_emission(event.subject.location(), event.kind, event.timestamp);
        }
        Ok(state)
    }

    /// Seed the last recorded commit of `repo`, unless already known.
    pub async fn load_repo(&mut self, store: &EventStore, repo: &str) -> Result<()> {
        if self.last_commit.contains_key(repo) {
            return Ok(());
        }
        if let Some(hash) = store.last_commit_hash(repo).await? {
            self.last_commit.insert(repo.to_string(), hash);
        }
        Ok(())
    }

    pub fn record_emission(&mut self, subject: &str, kind: EventKind, at: DateTime<Utc>) {
        match self.last_emitted.get_mut(subject) {
            Some(slot) if slot.1 >= at => {}
            Some(slot) => *slot = (kind, at),
            None => {
                self.last_emitted.insert(subject.to_string(), (kind, at));
            }
        }
    }

    pub fn last_emitted(&self, subject: &str) -> Option<DateTime<Utc>> {
        self.last_emitted.get(subject).map(|(_, at)| *at)
    }

    /// The same change to the same path was already recorded less than
    /// `window` before `event`, here or by a previous run.
    pub fn already_recorded(&self, event: &NewEvent, window: Duration) -> bool {
        let Some((kind, at)) = self.last_emitted.get(event.subject.location()) else {
            return false;
        };
        let Ok(window) = chrono::Duration::from_std(window) else {
            return false;
        };
        *kind == event.kind && (event.timestamp - *at).abs() < window
    }

    pub fn last_commit(&self, repo: &str) -> Option<&str> {
        self.last_commit.get(repo).map(String::as_str)
    }

    pub fn set_last_commit(&mut self, repo: &str, hash: &str) {
        self.last_commit.insert(repo.to_string(), hash.to_string());
    }

    pub fn tracked_paths(&self) -> usize {
        self.last_emitted.len()
    }
}
