//! Commit watcher.
//!
//! Polls each configured repository with the `git` CLI and appends one
//! `COMMIT` event per commit reachable from the current `HEAD` that has not
//! been recorded yet.
//!
//! # Resumption
//!
//! The last recorded hash per repository lives in [`WatchState`], seeded
//! from the event log at startup. Each poll asks for `last..HEAD`; when the
//! last hash is no longer known to the repository (history was rewritten),
//! the full history is replayed and the store's content-keyed dedup drops
//! commits that were already recorded. The last hash only advances once
//! every commit of the poll has been appended, so a crash mid-poll replays
//! the tail rather than skipping it.
//!
//! A repository that cannot be read is reported as
//! [`MemoryError::RepoAccess`] and skipped for that cycle only.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::MemoryError;
use crate::event_store::EventStore;
use crate::models::NewEvent;
use crate::watch_state::WatchState;

/// Directories never descended into during repository discovery.
const DISCOVERY_SKIP_DIRS: &[&str] = &[
    ".git",
    ".venv",
    "venv",
    "node_modules",
    "__pycache__",
    "target",
    "build",
    "dist",
];

const FIELD_SEP: char = '\u{1f}';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub summary: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub appended: usize,
    pub duplicates: usize,
    pub failed_repos: usize,
}

async fn git(repo: &Path, args: &[&str]) -> std::result::Result<std::process::Output, MemoryError> {
    Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .await
        .map_err(|e| {
            MemoryError::repo(
                repo.display().to_string(),
                format!("failed to execute git (is it installed?): {}", e),
            )
        })
}

/// Fail with `RepoAccess` unless `repo` is a readable git working tree.
pub async fn validate_repo(repo: &Path) -> std::result::Result<(), MemoryError> {
    if !repo.is_dir() {
        return Err(MemoryError::repo(
            repo.display().to_string(),
            "path does not exist",
        ));
    }
    let output = git(repo, &["rev-parse", "--git-dir"]).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MemoryError::repo(
            repo.display().to_string(),
            stderr.trim().to_string(),
        ));
    }
    Ok(())
}

async fn has_commit(repo: &Path, rev: &str) -> std::result::Result<bool, MemoryError> {
    let object = format!("{}^{{commit}}", rev);
    let output = git(repo, &["rev-parse", "--verify", "--quiet", &object]).await?;
    Ok(output.status.success())
}

/// Commits on the current branch newer than `since`, oldest first.
///
/// With no `since` (or an unknown one) the whole history is listed, capped
/// to the most recent `limit` commits when given. An empty repository
/// yields no commits.
pub async fn list_new_commits(
    repo: &Path,
    since: Option<&str>,
    limit: Option<usize>,
) -> std::result::Result<Vec<Commit>, MemoryError> {
    validate_repo(repo).await?;
    if !has_commit(repo, "HEAD").await? {
        return Ok(Vec::new());
    }

    let mut args: Vec<String> = vec![
        "log".into(),
        "--reverse".into(),
        "--topo-order".into(),
        format!("--format=%H{0}%ct{0}%an{0}%s", FIELD_SEP),
    ];

    let mut resume_from = None;
    if let Some(last) = since {
        if has_commit(repo, last).await? {
            resume_from = Some(last);
        } else {
            warn!(repo = %repo.display(), last, "last recorded commit not found; replaying history");
        }
    }
    match resume_from {
        Some(last) => args.push(format!("{}..HEAD", last)),
        None => {
            if let Some(n) = limit {
                args.push(format!("--max-count={}", n));
            }
            args.push("HEAD".into());
        }
    }

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = git(repo, &arg_refs).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MemoryError::repo(
            repo.display().to_string(),
            format!("git log failed: {}", stderr.trim()),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(parse_log_line)
        .collect())
}

fn parse_log_line(line: &str) -> Option<Commit> {
    let mut fields = line.splitn(4, FIELD_SEP);
    let hash = fields.next()?.trim();
    let ts: i64 = fields.next()?.trim().parse().ok()?;
    let author = fields.next()?.to_string();
    let summary = fields.next().unwrap_or("").to_string();
    if hash.is_empty() {
        return None;
    }
    Some(Commit {
        hash: hash.to_string(),
        timestamp: DateTime::from_timestamp(ts, 0)?,
        author,
        summary,
    })
}

/// Find git working trees at or beneath `root`.
///
/// Does not descend into a repository once found, nor into dependency and
/// build directories.
pub fn discover_repos(root: &Path) -> Vec<PathBuf> {
    let mut repos = Vec::new();
    let mut walker = WalkDir::new(root).follow_links(false).into_iter();
    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if entry.depth() > 0 && DISCOVERY_SKIP_DIRS.contains(&name.as_ref()) {
            walker.skip_current_dir();
            continue;
        }
        if entry.path().join(".git").exists() {
            repos.push(entry.path().to_path_buf());
            walker.skip_current_dir();
        }
    }
    repos
}

fn repo_key(repo: &Path) -> String {
    repo.to_string_lossy().into_owned()
}

pub struct CommitWatcher {
    store: Arc<EventStore>,
    configured: Vec<PathBuf>,
    discovery_roots: Vec<PathBuf>,
    repos: Vec<PathBuf>,
    poll: Duration,
    rediscover_every: Duration,
    last_discovery: Option<Instant>,
    initial_history_limit: Option<usize>,
    state: WatchState,
}

impl CommitWatcher {
    pub async fn new(store: Arc<EventStore>, config: &Config) -> Result<Self> {
        let configured: Vec<PathBuf> = config
            .git
            .repos
            .iter()
            .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
            .collect();
        let discovery_roots = if config.git.auto_discover {
            config
                .watch
                .paths
                .iter()
                .filter_map(|p| std::fs::canonicalize(p).ok())
                .collect()
        } else {
            Vec::new()
        };

        let mut watcher = Self {
            store,
            configured,
            discovery_roots,
            repos: Vec::new(),
            poll: config.git.poll_interval(&config.watch),
            rediscover_every: Duration::from_secs(config.watch.rescan_secs.max(1)),
            last_discovery: None,
            initial_history_limit: config.git.initial_history_limit,
            state: WatchState::new(),
        };
        watcher.refresh_repos().await?;
        Ok(watcher)
    }

    pub fn repos(&self) -> &[PathBuf] {
        &self.repos
    }

    async fn refresh_repos(&mut self) -> Result<()> {
        let mut repos = self.configured.clone();

        if !self.discovery_roots.is_empty() {
            let roots = self.discovery_roots.clone();
            let found = tokio::task::spawn_blocking(move || {
                roots
                    .iter()
                    .flat_map(|r| discover_repos(r))
                    .collect::<Vec<_>>()
            })
            .await?;
            for repo in found {
                if !repos.contains(&repo) && validate_repo(&repo).await.is_ok() {
                    repos.push(repo);
                }
            }
            self.last_discovery = Some(Instant::now());
        }

        for repo in &repos {
            if !self.repos.contains(repo) {
                debug!(repo = %repo.display(), "tracking repository");
                self.state.load_repo(&self.store, &repo_key(repo)).await?;
            }
        }
        self.repos = repos;
        Ok(())
    }

    /// One pass over every repository.
    pub async fn poll_once(&mut self) -> PollReport {
        let due = self
            .last_discovery
            .map(|t| t.elapsed() >= self.rediscover_every)
            .unwrap_or(false);
        if due {
            if let Err(e) = self.refresh_repos().await {
                warn!(error = %e, "repository discovery failed");
            }
        }

        let mut report = PollReport::default();
        for repo in self.repos.clone() {
            let key = repo_key(&repo);
            let since = self.state.last_commit(&key).map(str::to_string);
            let commits =
                match list_new_commits(&repo, since.as_deref(), self.initial_history_limit).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "skipping repository this cycle");
                        report.failed_repos += 1;
                        continue;
                    }
                };

            let mut complete = true;
            for commit in &commits {
                let event = NewEvent::commit(
                    &key,
                    &commit.hash,
                    &commit.summary,
                    Some(commit.author.clone()),
                    commit.timestamp,
                );
                match self.store.append(&event).await {
                    Ok(id) => {
                        info!(id, repo = %key, hash = %commit.hash, "recorded commit");
                        report.appended += 1;
                    }
                    Err(e) if e.is_duplicate() => report.duplicates += 1,
                    Err(e) => {
                        error!(error = %e, repo = %key, "failed to record commit");
                        complete = false;
                        break;
                    }
                }
            }

            if complete {
                if let Some(last) = commits.last() {
                    self.state.set_last_commit(&key, &last.hash);
                }
            }
        }
        report
    }

    /// Poll until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) -> WatchState {
        info!(repos = self.repos.len(), interval = ?self.poll, "commit watcher started");
        let mut ticker = tokio::time::interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.poll_once().await;
                    if report.appended > 0 {
                        debug!(?report, "poll complete");
                    }
                }
            }
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_lines() {
        let line = format!("abc123{0}1700000000{0}Ada{0}Fix parser | edge case", FIELD_SEP);
        let commit = parse_log_line(&line).unwrap();
        assert_eq!(commit.hash, "abc123");
        assert_eq!(commit.author, "Ada");
        assert_eq!(commit.summary, "Fix parser | edge case");
        assert_eq!(commit.timestamp.timestamp(), 1_700_000_000);

        assert!(parse_log_line("garbage").is_none());
    }

    #[test]
    fn discovery_skips_dependency_dirs_and_nested_repos() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("a/.git")).unwrap();
        std::fs::create_dir_all(root.join("a/vendor/.git")).unwrap();
        std::fs::create_dir_all(root.join("b/src")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg/.git")).unwrap();

        let repos = discover_repos(root);
        assert_eq!(repos, vec![root.join("a")]);
    }

    #[tokio::test]
    async fn missing_repo_is_repo_access_error() {
        let err = list_new_commits(Path::new("/definitely/not/here"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::RepoAccess { .. }));
    }
}
