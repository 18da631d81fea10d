//! Filesystem change watcher.
//!
//! Observes the configured roots recursively and turns raw notifications
//! into debounced `CREATED`/`MODIFIED`/`DELETED`/`RENAMED` events appended
//! to the [`EventStore`].
//!
//! # Pipeline
//!
//! ```text
//! notify thread ──blocking_send──▶ bounded queue ──▶ debounce task ──append──▶ EventStore
//! ```
//!
//! The notify callback never touches shared state; it only enqueues. A
//! single task owns the [`Debouncer`], so pending slots need no locking.
//! When the queue is full the notify thread blocks, which pushes
//! backpressure onto the OS notification buffer instead of dropping events.
//!
//! # Exclusions
//!
//! Patterns are applied to notification paths before anything else looks at
//! them, so excluded files are never stat-ed, hashed or debounced. A pattern
//! without glob metacharacters matches a whole path segment
//! (`node_modules`); anything else is a glob matched against the full path
//! (`*.swp`, `build/**`).
//! The event and vector database files (with their `-wal`, `-shm` and
//! `-journal` siblings) are always excluded so the watcher never records
//! its own writes.
//!
//! # Fingerprints
//!
//! Rename pairing needs the content of a file from before it disappeared.
//! At startup a bounded walk fingerprints existing files under the roots;
//! after that a file is hashed once each time its debounce slot is emitted,
//! and a new file only while a deletion is pending. Individual
//! notifications never trigger a read.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind as NotifyKind, RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::debounce::{Debouncer, RawChange, RawKind};
use crate::error::MemoryError;
use crate::event_store::EventStore;
use crate::models::{EventKind, NewEvent};
use crate::watch_state::WatchState;

/// Segments excluded even when the user configures nothing.
const DEFAULT_EXCLUDED_SEGMENTS: &[&str] = &[".git", "node_modules", "target"];

/// Files larger than this are fingerprinted by size and mtime only.
const MAX_FINGERPRINT_BYTES: u64 = 16 * 1024 * 1024;

/// Startup walk limits.
const SEED_MAX_FILES: usize = 5_000;
const SEED_MAX_FILE_BYTES: u64 = 1024 * 1024;
const SEED_MAX_TOTAL_BYTES: u64 = 64 * 1024 * 1024;

pub type RawNotification = notify::Result<notify::Event>;

// ============ Exclusions ============

pub struct ExcludeMatcher {
    segments: Vec<String>,
    globs: GlobSet,
    files: HashSet<PathBuf>,
}

impl ExcludeMatcher {
    /// Build a matcher from user `patterns` plus exact `files` to ignore.
    pub fn new(patterns: &[String], files: &[PathBuf]) -> Result<Self> {
        let mut segments: Vec<String> = DEFAULT_EXCLUDED_SEGMENTS
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut builder = GlobSetBuilder::new();

        for pattern in patterns {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                continue;
            }
            if !pattern.contains(['*', '?', '[', '{']) {
                segments.push(pattern.trim_matches('/').to_string());
                continue;
            }
            builder.add(
                Glob::new(pattern).with_context(|| format!("Invalid exclude glob: {}", pattern))?,
            );
            if !pattern.starts_with('/') && !pattern.starts_with("**") {
                builder.add(Glob::new(&format!("**/{}", pattern))?);
            }
        }

        let mut excluded_files = HashSet::new();
        for file in files {
            let file = absolutize(file);
            let name = file.as_os_str().to_string_lossy().into_owned();
            for suffix in ["", "-wal", "-shm", "-journal"] {
                excluded_files.insert(PathBuf::from(format!("{}{}", name, suffix)));
            }
        }

        Ok(Self {
            segments,
            globs: builder.build()?,
            files: excluded_files,
        })
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.files.contains(path) {
            return true;
        }
        let segment_hit = path.components().any(|c| match c {
            Component::Normal(seg) => {
                let seg = seg.to_string_lossy();
                self.segments.iter().any(|s| s == seg.as_ref())
            }
            _ => false,
        });
        segment_hit || self.globs.is_match(path)
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    // The file may not exist yet; canonicalize its directory instead.
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
        let parent = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        if let Ok(dir) = std::fs::canonicalize(parent) {
            return dir.join(name);
        }
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

// ============ Translation ============

/// Content fingerprint used to pair a delete with a create as a rename.
pub async fn fingerprint(path: &Path) -> Option<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || fingerprint_file(&path))
        .await
        .ok()
        .flatten()
}

fn fingerprint_file(path: &Path) -> Option<String> {
    let meta = std::fs::metadata(path).ok()?;
    if !meta.is_file() {
        return None;
    }
    let mut hasher = Sha256::new();
    if meta.len() > MAX_FINGERPRINT_BYTES {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        hasher.update(meta.len().to_le_bytes());
        hasher.update(mtime.to_le_bytes());
    } else {
        let content = std::fs::read(path).ok()?;
        hasher.update(&content);
    }
    Some(format!("{:x}", hasher.finalize()))
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Fingerprint regular files beneath `roots`, skipping excluded paths and
/// stopping at the seed limits.
pub fn seed_fingerprints(roots: &[PathBuf], exclude: &ExcludeMatcher) -> Vec<(String, String)> {
    let mut seeded = Vec::new();
    let mut budget = SEED_MAX_TOTAL_BYTES;
    for root in roots {
        let mut walker = WalkDir::new(root).follow_links(false).into_iter();
        while let Some(entry) = walker.next() {
            let Ok(entry) = entry else { continue };
            if exclude.is_excluded(entry.path()) {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if meta.len() > SEED_MAX_FILE_BYTES || meta.len() > budget {
                continue;
            }
            if let Some(fp) = fingerprint_file(entry.path()) {
                budget -= meta.len();
                seeded.push((path_string(entry.path()), fp));
                if seeded.len() >= SEED_MAX_FILES {
                    return seeded;
                }
            }
        }
    }
    seeded
}

async fn file_change(path: &Path, kind: RawKind) -> Option<RawChange> {
    if is_dir(path).await {
        return None;
    }
    Some(RawChange::new(path_string(path), kind))
}

/// Remove excluded paths from `event`. Returns `None` when nothing is left.
///
/// A two-ended rename is kept whole so [`apply_exclusions`] can turn a move
/// across the boundary into a creation or deletion.
pub fn prune_excluded(matcher: &ExcludeMatcher, mut event: notify::Event) -> Option<notify::Event> {
    let both_ends = matches!(
        event.kind,
        NotifyKind::Modify(ModifyKind::Name(RenameMode::Both))
    ) && event.paths.len() == 2;
    if both_ends {
        if event.paths.iter().all(|p| matcher.is_excluded(p)) {
            return None;
        }
        return Some(event);
    }
    event.paths.retain(|p| !matcher.is_excluded(p));
    if event.paths.is_empty() {
        None
    } else {
        Some(event)
    }
}

/// Normalize one notify event into zero or more single-path changes.
///
/// Directory events and access/metadata notifications are dropped. Moves
/// reported one end at a time are tagged so the debouncer can pair them.
pub async fn translate(event: notify::Event) -> Vec<RawChange> {
    let mut out = Vec::new();
    match event.kind {
        NotifyKind::Create(CreateKind::Folder) => {}
        NotifyKind::Create(_) => {
            for path in &event.paths {
                out.extend(file_change(path, RawKind::Created).await);
            }
        }
        NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [from, to] = event.paths.as_slice() {
                let kind = RawKind::Renamed {
                    from: path_string(from),
                };
                out.extend(file_change(to, kind).await);
            }
        }
        NotifyKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in &event.paths {
                out.push(RawChange::new(path_string(path), RawKind::Deleted).moved());
            }
        }
        NotifyKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in &event.paths {
                out.extend(
                    file_change(path, RawKind::Created)
                        .await
                        .map(RawChange::moved),
                );
            }
        }
        NotifyKind::Modify(ModifyKind::Name(_)) => {
            // Backends that cannot tell the two ends apart
            for path in &event.paths {
                if tokio::fs::metadata(path).await.is_ok() {
                    out.extend(
                        file_change(path, RawKind::Created)
                            .await
                            .map(RawChange::moved),
                    );
                } else {
                    out.push(RawChange::new(path_string(path), RawKind::Deleted).moved());
                }
            }
        }
        NotifyKind::Modify(ModifyKind::Metadata(_)) => {}
        NotifyKind::Modify(_) => {
            for path in &event.paths {
                out.extend(file_change(path, RawKind::Modified).await);
            }
        }
        NotifyKind::Remove(RemoveKind::Folder) => {}
        NotifyKind::Remove(_) => {
            for path in &event.paths {
                out.push(RawChange::new(path_string(path), RawKind::Deleted));
            }
        }
        NotifyKind::Access(_) | NotifyKind::Any | NotifyKind::Other => {}
    }
    out
}

/// Drop the excluded side of a change. A rename out of an excluded
/// directory degrades to a creation and vice versa.
fn apply_exclusions(matcher: &ExcludeMatcher, change: RawChange) -> Option<RawChange> {
    let to_excluded = matcher.is_excluded(Path::new(&change.path));
    match change.kind {
        RawKind::Renamed { ref from } => {
            let from_excluded = matcher.is_excluded(Path::new(from));
            match (from_excluded, to_excluded) {
                (false, false) => Some(change),
                (true, false) => Some(RawChange {
                    kind: RawKind::Created,
                    ..change
                }),
                (false, true) => Some(RawChange {
                    path: from.clone(),
                    kind: RawKind::Deleted,
                    fingerprint: None,
                    moved: false,
                    observed_at: change.observed_at,
                }),
                (true, true) => None,
            }
        }
        _ if to_excluded => None,
        _ => Some(change),
    }
}

// ============ Roots ============

/// Watched roots, split into those currently observed and those waiting
/// to (re)appear.
pub struct Roots {
    watcher: Option<RecommendedWatcher>,
    active: Vec<PathBuf>,
    missing: Vec<PathBuf>,
}

impl Roots {
    /// Roots with no OS watcher attached; notifications are supplied by the caller.
    pub fn detached(roots: Vec<PathBuf>) -> Self {
        Self {
            watcher: None,
            active: roots,
            missing: Vec::new(),
        }
    }

    fn try_watch(&mut self, root: &Path) -> std::result::Result<(), MemoryError> {
        if !root.is_dir() {
            return Err(MemoryError::watcher(
                path_string(root),
                "not an existing directory",
            ));
        }
        if let Some(watcher) = self.watcher.as_mut() {
            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(|e| MemoryError::watcher(path_string(root), e.to_string()))?;
        }
        Ok(())
    }

    fn mark_missing(&mut self, root: &Path) {
        if let Some(pos) = self.active.iter().position(|r| r == root) {
            let root = self.active.remove(pos);
            if let Some(watcher) = self.watcher.as_mut() {
                let _ = watcher.unwatch(&root);
            }
            let err = MemoryError::watcher(path_string(&root), "root disappeared");
            warn!(error = %err, "watch root lost; will retry");
            self.missing.push(root);
        }
    }

    /// Re-check every root: drop vanished ones, re-attach recovered ones.
    fn rescan(&mut self) {
        let vanished: Vec<PathBuf> = self
            .active
            .iter()
            .filter(|r| !r.is_dir())
            .cloned()
            .collect();
        for root in vanished {
            self.mark_missing(&root);
        }

        let waiting = std::mem::take(&mut self.missing);
        for root in waiting {
            match self.try_watch(&root) {
                Ok(()) => {
                    info!(root = %root.display(), "watch root available again");
                    self.active.push(root);
                }
                Err(e) => {
                    debug!(error = %e, "watch root still unavailable");
                    self.missing.push(root);
                }
            }
        }
    }
}

// ============ Watcher ============

pub struct ChangeWatcher {
    store: Arc<EventStore>,
    roots: Vec<PathBuf>,
    exclude: Arc<ExcludeMatcher>,
    debounce: Duration,
    queue_capacity: usize,
    rescan: Duration,
}

impl ChangeWatcher {
    pub fn new(store: Arc<EventStore>, config: &Config) -> Result<Self> {
        let exclude = ExcludeMatcher::new(
            &config.watch.exclude,
            &[config.db.events.clone(), config.db.vectors.clone()],
        )?;
        Ok(Self {
            store,
            roots: config.watch.paths.iter().map(|p| absolutize(p)).collect(),
            exclude: Arc::new(exclude),
            debounce: config.watch.debounce(),
            queue_capacity: config.watch.queue_capacity,
            rescan: Duration::from_secs(config.watch.rescan_secs.max(1)),
        })
    }

    /// Watch the configured roots until `shutdown` fires.
    ///
    /// Fails only when none of the roots can be watched at startup; roots
    /// that fail later are retried every rescan interval.
    pub async fn run(self, shutdown: CancellationToken) -> Result<WatchState> {
        let (tx, rx) = mpsc::channel::<RawNotification>(self.queue_capacity);

        let watcher = RecommendedWatcher::new(
            move |res: RawNotification| {
                // Receiver gone means we are shutting down
                let _ = tx.blocking_send(res);
            },
            notify::Config::default(),
        )
        .context("Failed to create filesystem watcher")?;

        let mut roots = Roots {
            watcher: Some(watcher),
            active: Vec::new(),
            missing: Vec::new(),
        };
        for root in &self.roots {
            match roots.try_watch(root) {
                Ok(()) => {
                    info!(root = %root.display(), "watching");
                    roots.active.push(root.clone());
                }
                Err(e) => {
                    error!(error = %e, "cannot watch root");
                    roots.missing.push(root.clone());
                }
            }
        }
        if roots.active.is_empty() {
            bail!("None of the configured watch roots can be watched");
        }

        self.run_with(rx, roots, shutdown).await
    }

    /// Drive the debounce loop from an existing notification queue.
    pub async fn run_with(
        self,
        mut rx: mpsc::Receiver<RawNotification>,
        mut roots: Roots,
        shutdown: CancellationToken,
    ) -> Result<WatchState> {
        let mut state = WatchState::for_filesystem(&self.store, self.store.dedup_window()).await?;
        let mut debouncer = Debouncer::new(self.debounce);
        self.seed(&roots, &mut debouncer).await;
        let mut rescan = tokio::time::interval(self.rescan);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        rescan.tick().await;

        loop {
            let deadline = debouncer.next_deadline();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Some(notification) => {
                        self.ingest(notification, &mut roots, &mut debouncer).await;
                    }
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let ready = debouncer.drain_expired(Instant::now());
                    self.emit(ready, &mut state, &mut debouncer).await;
                }
                _ = rescan.tick() => roots.rescan(),
            }
        }

        // Take whatever is already queued, then flush pending slots as-is.
        while let Ok(notification) = rx.try_recv() {
            self.ingest(notification, &mut roots, &mut debouncer).await;
        }
        let pending = debouncer.flush_all();
        if !pending.is_empty() {
            info!(count = pending.len(), "flushing pending changes on shutdown");
        }
        self.emit(pending, &mut state, &mut debouncer).await;

        Ok(state)
    }

    async fn seed(&self, roots: &Roots, debouncer: &mut Debouncer) {
        let active = roots.active.clone();
        let exclude = Arc::clone(&self.exclude);
        match tokio::task::spawn_blocking(move || seed_fingerprints(&active, &exclude)).await {
            Ok(seeded) => {
                debug!(files = seeded.len(), "seeded content fingerprints");
                for (path, fp) in seeded {
                    debouncer.remember(&path, fp);
                }
            }
            Err(e) => warn!(error = %e, "fingerprint seeding failed"),
        }
    }

    async fn ingest(
        &self,
        notification: RawNotification,
        roots: &mut Roots,
        debouncer: &mut Debouncer,
    ) {
        let event = match notification {
            Ok(event) => event,
            Err(e) => {
                let err = MemoryError::watcher(
                    e.paths
                        .first()
                        .map(|p| path_string(p))
                        .unwrap_or_default(),
                    e.to_string(),
                );
                warn!(error = %err, "watch error");
                return;
            }
        };

        if matches!(event.kind, NotifyKind::Remove(_)) {
            let lost: Vec<PathBuf> = event
                .paths
                .iter()
                .filter(|p| roots.active.contains(p))
                .cloned()
                .collect();
            for root in lost {
                roots.mark_missing(&root);
            }
        }

        let Some(event) = prune_excluded(&self.exclude, event) else {
            return;
        };
        for change in translate(event).await {
            let Some(mut change) = apply_exclusions(&self.exclude, change) else {
                continue;
            };
            if change.kind == RawKind::Created && debouncer.awaits_rename() {
                change.fingerprint = fingerprint(Path::new(&change.path)).await;
            }
            debug!(path = %change.path, kind = ?change.kind, "raw change");
            debouncer.observe(change, Instant::now());
        }
    }

    async fn emit(
        &self,
        events: Vec<NewEvent>,
        state: &mut WatchState,
        debouncer: &mut Debouncer,
    ) {
        let window = self.store.dedup_window();
        for event in events {
            let subject = event.subject.location().to_string();
            if event.kind != EventKind::Deleted {
                if let Some(fp) = fingerprint(Path::new(&subject)).await {
                    debouncer.remember(&subject, fp);
                }
            }
            if state.already_recorded(&event, window) {
                debug!(kind = %event.kind, path = %subject, "already recorded");
                continue;
            }
            match self.store.append(&event).await {
                Ok(id) => {
                    info!(id, kind = %event.kind, path = %subject, "recorded change");
                    state.record_emission(&subject, event.kind, event.timestamp);
                }
                Err(e) if e.is_duplicate() => {
                    state.record_emission(&subject, event.kind, event.timestamp);
                }
                Err(e) => error!(error = %e, path = %subject, "failed to record change"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_patterns_match_whole_components() {
        let m = ExcludeMatcher::new(&["build".to_string()], &[]).unwrap();
        assert!(m.is_excluded(Path::new("/proj/build/out.o")));
        assert!(!m.is_excluded(Path::new("/proj/builder/out.o")));
        assert!(m.is_excluded(Path::new("/proj/node_modules/x/index.js")));
        assert!(m.is_excluded(Path::new("/proj/.git/HEAD")));
    }

    #[test]
    fn glob_patterns_match_anywhere() {
        let m = ExcludeMatcher::new(&["*.swp".to_string(), "logs/**".to_string()], &[]).unwrap();
        assert!(m.is_excluded(Path::new("/proj/src/.main.rs.swp")));
        assert!(m.is_excluded(Path::new("/proj/logs/today.log")));
        assert!(!m.is_excluded(Path::new("/proj/src/main.rs")));
    }

    #[test]
    fn database_files_and_siblings_are_excluded() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("events.db");
        let m = ExcludeMatcher::new(&[], &[db.clone()]).unwrap();
        let db = absolutize(&db);
        assert!(m.is_excluded(&db));
        assert!(m.is_excluded(Path::new(&format!("{}-wal", db.display()))));
        assert!(m.is_excluded(Path::new(&format!("{}-journal", db.display()))));
        assert!(!m.is_excluded(&db.with_file_name("notes.md")));
    }

    #[test]
    fn rename_into_excluded_area_becomes_delete() {
        let m = ExcludeMatcher::new(&["trash".to_string()], &[]).unwrap();
        let change = RawChange::new(
            "/proj/trash/a.txt",
            RawKind::Renamed {
                from: "/proj/a.txt".into(),
            },
        );
        let out = apply_exclusions(&m, change).unwrap();
        assert_eq!(out.path, "/proj/a.txt");
        assert_eq!(out.kind, RawKind::Deleted);

        let back = RawChange::new(
            "/proj/a.txt",
            RawKind::Renamed {
                from: "/proj/trash/a.txt".into(),
            },
        );
        assert_eq!(apply_exclusions(&m, back).unwrap().kind, RawKind::Created);
    }

    #[tokio::test]
    async fn translate_skips_directories_without_reading_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "hello").unwrap();

        let create = notify::Event::new(NotifyKind::Create(CreateKind::Any))
            .add_path(file.clone())
            .add_path(dir.path().to_path_buf());
        let changes = translate(create).await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, RawKind::Created);
        assert!(changes[0].fingerprint.is_none());
        assert!(!changes[0].moved);

        let access = notify::Event::new(NotifyKind::Access(notify::event::AccessKind::Any))
            .add_path(file.clone());
        assert!(translate(access).await.is_empty());
    }

    #[tokio::test]
    async fn one_ended_moves_are_tagged() {
        let dir = tempfile::TempDir::new().unwrap();
        let gone = dir.path().join("old.txt");
        let here = dir.path().join("new.txt");
        std::fs::write(&here, "moved").unwrap();

        let either = notify::Event::new(NotifyKind::Modify(ModifyKind::Name(RenameMode::Any)))
            .add_path(gone.clone())
            .add_path(here.clone());
        let changes = translate(either).await;
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].kind, RawKind::Deleted);
        assert_eq!(changes[1].kind, RawKind::Created);
        assert!(changes.iter().all(|c| c.moved));
    }

    #[test]
    fn excluded_paths_are_pruned_before_translation() {
        let m = ExcludeMatcher::new(&["*.swp".to_string()], &[]).unwrap();
        let mixed = notify::Event::new(NotifyKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/proj/target/debug/app"))
            .add_path(PathBuf::from("/proj/src/.lib.rs.swp"))
            .add_path(PathBuf::from("/proj/src/lib.rs"));
        let kept = prune_excluded(&m, mixed).unwrap();
        assert_eq!(kept.paths, vec![PathBuf::from("/proj/src/lib.rs")]);

        let noise = notify::Event::new(NotifyKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/proj/.git/index.lock"));
        assert!(prune_excluded(&m, noise).is_none());

        let out_of_build = notify::Event::new(NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/proj/target/out.txt"))
            .add_path(PathBuf::from("/proj/out.txt"));
        assert_eq!(prune_excluded(&m, out_of_build).unwrap().paths.len(), 2);
    }

    #[test]
    fn seeding_skips_excluded_trees_and_large_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        std::fs::write(root.join("node_modules/pkg/index.js"), "x").unwrap();
        std::fs::write(root.join("notes.md"), "keep").unwrap();
        std::fs::write(
            root.join("big.bin"),
            vec![0u8; (SEED_MAX_FILE_BYTES + 1) as usize],
        )
        .unwrap();

        let m = ExcludeMatcher::new(&[], &[]).unwrap();
        let seeded = seed_fingerprints(&[root.clone()], &m);
        let paths: Vec<&str> = seeded.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec![path_string(&root.join("notes.md")).as_str()]);
    }

    #[tokio::test]
    async fn same_content_gives_same_fingerprint() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "same").unwrap();
        std::fs::write(&b, "same").unwrap();
        assert_eq!(fingerprint(&a).await, fingerprint(&b).await);
        assert_eq!(fingerprint(dir.path()).await, None);
    }
}
