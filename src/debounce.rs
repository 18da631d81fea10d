//! Per-subject debounce and coalescing of raw filesystem notifications.
//!
//! [`Debouncer`] is a plain state machine: it owns one pending slot per path
//! and is driven by [`observe`](Debouncer::observe) (a raw notification
//! arrived) and [`drain_expired`](Debouncer::drain_expired) (time passed).
//! It never sleeps and holds no locks; the owning task decides when to wake
//! up by asking for [`next_deadline`](Debouncer::next_deadline).
//!
//! # Coalescing rules
//!
//! Within one window (notifications for the same path less than `window`
//! apart), the emitted kind is the kind of the last notification, except:
//!
//! - `CREATED … DELETED` cancels the slot; nothing is emitted.
//! - `DELETED A` then `CREATED B` with the same content fingerprint becomes
//!   a single `RENAMED B` with detail `from:A`. When the platform marked both
//!   halves as parts of a move but A's content was never seen, they are
//!   paired anyway, oldest deletion first.
//! - A pending `RENAMED` stays `RENAMED` when the file is modified again;
//!   if the renamed file is deleted, the net effect `DELETED A` is emitted.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::models::{EventKind, NewEvent};

/// Kind of a raw, uncoalesced notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawKind {
    Created,
    Modified,
    Deleted,
    /// The platform reported both ends of a move.
    Renamed { from: String },
}

/// One raw notification, already normalized to a single path.
#[derive(Debug, Clone)]
pub struct RawChange {
    pub path: String,
    pub kind: RawKind,
    /// Content fingerprint for created/modified files, when readable.
    pub fingerprint: Option<String>,
    /// One half of a move whose other end the platform did not report.
    pub moved: bool,
    pub observed_at: DateTime<Utc>,
}

impl RawChange {
    pub fn new(path: impl Into<String>, kind: RawKind) -> Self {
        Self {
            path: path.into(),
            kind,
            fingerprint: None,
            moved: false,
            observed_at: Utc::now(),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn moved(mut self) -> Self {
        self.moved = true;
        self
    }
}

#[derive(Debug, Clone)]
struct PendingSlot {
    kind: EventKind,
    /// The path did not exist before this window opened.
    created_in_window: bool,
    renamed_from: Option<String>,
    /// Content of the file at deletion time, for rename matching.
    fingerprint: Option<String>,
    /// Deleted by a move away, not an unlink.
    moved_away: bool,
    deadline: Instant,
    last_seen: DateTime<Utc>,
    seq: u64,
}

impl PendingSlot {
    fn detail(&self) -> String {
        match &self.renamed_from {
            Some(from) if self.kind == EventKind::Renamed => format!("from:{}", from),
            _ => String::new(),
        }
    }
}

pub struct Debouncer {
    window: Duration,
    slots: HashMap<String, PendingSlot>,
    fingerprints: HashMap<String, String>,
    seq: u64,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            slots: HashMap::new(),
            fingerprints: HashMap::new(),
            seq: 0,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_pending(&self, path: &str) -> bool {
        self.slots.contains_key(path)
    }

    /// A pending deletion could still turn into a rename, so new files are
    /// worth fingerprinting.
    pub fn awaits_rename(&self) -> bool {
        self.slots.values().any(|s| s.kind == EventKind::Deleted)
    }

    /// Record the current content fingerprint of `path`.
    pub fn remember(&mut self, path: &str, fingerprint: String) {
        self.fingerprints.insert(path.to_string(), fingerprint);
    }

    pub fn fingerprint_of(&self, path: &str) -> Option<&str> {
        self.fingerprints.get(path).map(String::as_str)
    }

    /// Earliest deadline among pending slots.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.values().map(|s| s.deadline).min()
    }

    /// Fold one raw notification into the pending state.
    pub fn observe(&mut self, raw: RawChange, now: Instant) {
        let deadline = now + self.window;
        match raw.kind {
            RawKind::Created => {
                if let Some(fp) = &raw.fingerprint {
                    self.fingerprints.insert(raw.path.clone(), fp.clone());
                }
                if let Some(from) = self.take_rename_source(&raw) {
                    self.start_rename(raw.path, from, deadline, raw.observed_at);
                    return;
                }
                self.merge(raw.path, EventKind::Created, deadline, raw.observed_at);
            }
            RawKind::Modified => {
                if let Some(fp) = raw.fingerprint {
                    self.fingerprints.insert(raw.path.clone(), fp);
                }
                self.merge(raw.path, EventKind::Modified, deadline, raw.observed_at);
            }
            RawKind::Deleted => {
                let path = raw.path;
                self.merge(path.clone(), EventKind::Deleted, deadline, raw.observed_at);
                if let Some(slot) = self.slots.get_mut(&path) {
                    if slot.kind == EventKind::Deleted {
                        slot.moved_away = raw.moved;
                    }
                }
            }
            RawKind::Renamed { from } => {
                if let Some(fp) = self.fingerprints.remove(&from) {
                    self.fingerprints.insert(raw.path.clone(), fp);
                }
                match self.slots.remove(&from) {
                    // Created and moved within one window: only the destination exists
                    Some(prev) if prev.created_in_window => {
                        self.slots.remove(&raw.path);
                        self.merge(raw.path, EventKind::Created, deadline, raw.observed_at);
                    }
                    Some(prev) => {
                        let origin = prev.renamed_from.unwrap_or(from);
                        self.start_rename(raw.path, origin, deadline, raw.observed_at);
                    }
                    None => self.start_rename(raw.path, from, deadline, raw.observed_at),
                }
            }
        }
    }

    /// Remove and return slots whose deadline has passed, oldest first.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<NewEvent> {
        let expired: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        self.take(expired)
    }

    /// Remove and return every pending slot regardless of deadline.
    pub fn flush_all(&mut self) -> Vec<NewEvent> {
        let all: Vec<String> = self.slots.keys().cloned().collect();
        self.take(all)
    }

    fn take(&mut self, paths: Vec<String>) -> Vec<NewEvent> {
        let mut taken: Vec<(String, PendingSlot)> = paths
            .into_iter()
            .filter_map(|p| self.slots.remove(&p).map(|slot| (p, slot)))
            .collect();
        taken.sort_by(|a, b| a.1.deadline.cmp(&b.1.deadline).then(a.1.seq.cmp(&b.1.seq)));

        taken
            .into_iter()
            .map(|(path, slot)| {
                if slot.kind == EventKind::Deleted {
                    self.fingerprints.remove(&path);
                }
                NewEvent::file(slot.kind, path, slot.detail(), slot.last_seen)
            })
            .collect()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn merge(&mut self, path: String, kind: EventKind, deadline: Instant, seen: DateTime<Utc>) {
        let seq = self.next_seq();
        let Some(slot) = self.slots.get_mut(&path) else {
            let fingerprint = if kind == EventKind::Deleted {
                self.fingerprints.remove(&path)
            } else {
                None
            };
            self.slots.insert(
                path,
                PendingSlot {
                    kind,
                    created_in_window: kind == EventKind::Created,
                    renamed_from: None,
                    fingerprint,
                    moved_away: false,
                    deadline,
                    last_seen: seen,
                    seq,
                },
            );
            return;
        };

        slot.deadline = deadline;
        slot.last_seen = seen;
        slot.seq = seq;

        match kind {
            EventKind::Deleted if slot.created_in_window => {
                self.slots.remove(&path);
                self.fingerprints.remove(&path);
            }
            EventKind::Deleted if slot.kind == EventKind::Renamed => {
                let origin = slot.renamed_from.take();
                self.slots.remove(&path);
                self.fingerprints.remove(&path);
                if let Some(origin) = origin {
                    self.merge(origin, EventKind::Deleted, deadline, seen);
                }
            }
            EventKind::Deleted => {
                slot.kind = EventKind::Deleted;
                slot.fingerprint = self.fingerprints.remove(&path);
            }
            _ if slot.kind == EventKind::Renamed => {}
            other => {
                slot.kind = other;
                slot.fingerprint = None;
                slot.moved_away = false;
            }
        }
    }

    fn start_rename(&mut self, to: String, from: String, deadline: Instant, seen: DateTime<Utc>) {
        let seq = self.next_seq();
        self.slots.insert(
            to,
            PendingSlot {
                kind: EventKind::Renamed,
                created_in_window: false,
                renamed_from: Some(from),
                fingerprint: None,
                moved_away: false,
                deadline,
                last_seen: seen,
                seq,
            },
        );
    }

    fn pending_deletions<'a>(
        &'a self,
        except: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a PendingSlot)> + 'a {
        self.slots
            .iter()
            .filter(move |(path, slot)| path.as_str() != except && slot.kind == EventKind::Deleted)
    }

    /// Take the pending `DELETED` slot that `created` completes as a rename,
    /// returning its path.
    ///
    /// A matching content fingerprint wins. Failing that, a creation the
    /// platform tagged as a move pairs with the oldest deletion also tagged
    /// as a move, unless both sides have fingerprints that differ.
    fn take_rename_source(&mut self, created: &RawChange) -> Option<String> {
        let by_content = created.fingerprint.as_deref().and_then(|fp| {
            self.pending_deletions(&created.path)
                .filter(|(_, slot)| slot.fingerprint.as_deref() == Some(fp))
                .min_by_key(|(_, slot)| slot.seq)
                .map(|(path, _)| path.clone())
        });
        let path = by_content.or_else(|| {
            if !created.moved {
                return None;
            }
            self.pending_deletions(&created.path)
                .filter(|(_, slot)| {
                    slot.moved_away
                        && match (&slot.fingerprint, &created.fingerprint) {
                            (Some(a), Some(b)) => a == b,
                            _ => true,
                        }
                })
                .min_by_key(|(_, slot)| slot.seq)
                .map(|(path, _)| path.clone())
        })?;
        self.slots.remove(&path);
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(400);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn kinds(events: &[NewEvent]) -> Vec<(EventKind, String)> {
        events
            .iter()
            .map(|e| (e.kind, e.subject.location().to_string()))
            .collect()
    }

    #[test]
    fn create_then_two_modifies_yields_one_modified() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.observe(RawChange::new("a.txt", RawKind::Created), t0);
        d.observe(RawChange::new("a.txt", RawKind::Modified), t0 + ms(100));
        d.observe(RawChange::new("a.txt", RawKind::Modified), t0 + ms(250));

        assert!(d.drain_expired(t0 + ms(600)).is_empty());
        let events = d.drain_expired(t0 + ms(650));
        assert_eq!(kinds(&events), vec![(EventKind::Modified, "a.txt".into())]);
        assert_eq!(d.pending_len(), 0);
    }

    #[test]
    fn kind_is_last_observed() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.observe(RawChange::new("a.txt", RawKind::Modified), t0);
        d.observe(RawChange::new("a.txt", RawKind::Modified), t0 + ms(10));
        d.observe(RawChange::new("a.txt", RawKind::Deleted), t0 + ms(20));
        let events = d.flush_all();
        assert_eq!(kinds(&events), vec![(EventKind::Deleted, "a.txt".into())]);
    }

    #[test]
    fn create_then_delete_is_cancelled() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.observe(RawChange::new("tmp.swp", RawKind::Created), t0);
        d.observe(RawChange::new("tmp.swp", RawKind::Modified), t0 + ms(50));
        d.observe(RawChange::new("tmp.swp", RawKind::Deleted), t0 + ms(100));
        assert_eq!(d.pending_len(), 0);
        assert!(d.drain_expired(t0 + ms(10_000)).is_empty());
    }

    #[test]
    fn delete_then_create_with_same_content_is_a_rename() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        // Seen earlier, outside this window
        d.observe(
            RawChange::new("old.txt", RawKind::Modified).with_fingerprint("f1"),
            t0,
        );
        d.drain_expired(t0 + ms(500));

        d.observe(RawChange::new("old.txt", RawKind::Deleted), t0 + ms(1_000));
        d.observe(
            RawChange::new("new.txt", RawKind::Created).with_fingerprint("f1"),
            t0 + ms(1_100),
        );

        let events = d.drain_expired(t0 + ms(2_000));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Renamed);
        assert_eq!(events[0].subject.location(), "new.txt");
        assert_eq!(events[0].detail, "from:old.txt");
    }

    #[test]
    fn delete_then_create_with_other_content_stays_separate() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.observe(
            RawChange::new("old.txt", RawKind::Modified).with_fingerprint("f1"),
            t0,
        );
        d.drain_expired(t0 + ms(500));

        d.observe(RawChange::new("old.txt", RawKind::Deleted), t0 + ms(1_000));
        d.observe(
            RawChange::new("new.txt", RawKind::Created).with_fingerprint("f2"),
            t0 + ms(1_100),
        );
        let events = d.flush_all();
        assert_eq!(
            kinds(&events),
            vec![
                (EventKind::Deleted, "old.txt".into()),
                (EventKind::Created, "new.txt".into())
            ]
        );
    }

    #[test]
    fn move_halves_pair_without_prior_fingerprint() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.observe(RawChange::new("old.txt", RawKind::Deleted).moved(), t0);
        assert!(d.awaits_rename());
        d.observe(
            RawChange::new("new.txt", RawKind::Created)
                .with_fingerprint("f9")
                .moved(),
            t0 + ms(20),
        );

        let events = d.flush_all();
        assert_eq!(kinds(&events), vec![(EventKind::Renamed, "new.txt".into())]);
        assert_eq!(events[0].detail, "from:old.txt");
        assert_eq!(d.fingerprint_of("new.txt"), Some("f9"));
    }

    #[test]
    fn unlink_and_unrelated_create_are_not_paired_without_content() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.observe(RawChange::new("old.txt", RawKind::Deleted), t0);
        d.observe(
            RawChange::new("new.txt", RawKind::Created).with_fingerprint("f9"),
            t0 + ms(20),
        );
        let events = d.flush_all();
        assert_eq!(
            kinds(&events),
            vec![
                (EventKind::Deleted, "old.txt".into()),
                (EventKind::Created, "new.txt".into())
            ]
        );
    }

    #[test]
    fn move_halves_with_different_content_stay_separate() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.remember("old.txt", "f1".into());
        d.observe(RawChange::new("old.txt", RawKind::Deleted).moved(), t0);
        d.observe(
            RawChange::new("new.txt", RawKind::Created)
                .with_fingerprint("f2")
                .moved(),
            t0 + ms(20),
        );
        let events = d.flush_all();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind != EventKind::Renamed));
    }

    #[test]
    fn remembered_fingerprint_pairs_a_later_rename() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        // As recorded by a startup walk, before any notification
        d.remember("old.txt", "f1".into());
        d.observe(RawChange::new("old.txt", RawKind::Deleted), t0);
        d.observe(
            RawChange::new("new.txt", RawKind::Created).with_fingerprint("f1"),
            t0 + ms(20),
        );
        let events = d.flush_all();
        assert_eq!(kinds(&events), vec![(EventKind::Renamed, "new.txt".into())]);
        assert_eq!(events[0].detail, "from:old.txt");
    }

    #[test]
    fn platform_rename_becomes_renamed_event() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.observe(
            RawChange::new(
                "new.txt",
                RawKind::Renamed {
                    from: "old.txt".into(),
                },
            ),
            t0,
        );
        d.observe(RawChange::new("new.txt", RawKind::Modified), t0 + ms(10));

        let events = d.flush_all();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Renamed);
        assert_eq!(events[0].detail, "from:old.txt");
    }

    #[test]
    fn created_then_moved_is_a_create_at_the_destination() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.observe(RawChange::new("draft.txt", RawKind::Created), t0);
        d.observe(
            RawChange::new(
                "final.txt",
                RawKind::Renamed {
                    from: "draft.txt".into(),
                },
            ),
            t0 + ms(10),
        );
        let events = d.flush_all();
        assert_eq!(kinds(&events), vec![(EventKind::Created, "final.txt".into())]);
    }

    #[test]
    fn renamed_then_deleted_reports_the_original_deletion() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.observe(
            RawChange::new("b.txt", RawKind::Renamed { from: "a.txt".into() }),
            t0,
        );
        d.observe(RawChange::new("b.txt", RawKind::Deleted), t0 + ms(10));
        let events = d.flush_all();
        assert_eq!(kinds(&events), vec![(EventKind::Deleted, "a.txt".into())]);
    }

    #[test]
    fn each_notification_resets_the_deadline() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.observe(RawChange::new("a.txt", RawKind::Modified), t0);
        d.observe(RawChange::new("a.txt", RawKind::Modified), t0 + ms(300));
        assert_eq!(d.next_deadline(), Some(t0 + ms(700)));
        assert!(d.drain_expired(t0 + ms(500)).is_empty());
        assert_eq!(d.drain_expired(t0 + ms(700)).len(), 1);
    }

    #[test]
    fn subjects_are_debounced_independently() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.observe(RawChange::new("a.txt", RawKind::Modified), t0);
        d.observe(RawChange::new("b.txt", RawKind::Modified), t0 + ms(300));

        let first = d.drain_expired(t0 + ms(450));
        assert_eq!(kinds(&first), vec![(EventKind::Modified, "a.txt".into())]);
        assert!(d.is_pending("b.txt"));

        let second = d.drain_expired(t0 + ms(800));
        assert_eq!(kinds(&second), vec![(EventKind::Modified, "b.txt".into())]);
    }

    #[test]
    fn separate_windows_emit_in_temporal_order() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        let mut emitted = Vec::new();

        d.observe(RawChange::new("a.txt", RawKind::Created), t0);
        emitted.extend(d.drain_expired(t0 + ms(500)));
        d.observe(RawChange::new("a.txt", RawKind::Modified), t0 + ms(600));
        emitted.extend(d.drain_expired(t0 + ms(1_100)));
        d.observe(RawChange::new("a.txt", RawKind::Deleted), t0 + ms(1_200));
        emitted.extend(d.flush_all());

        let order: Vec<EventKind> = emitted.iter().map(|e| e.kind).collect();
        assert_eq!(
            order,
            vec![EventKind::Created, EventKind::Modified, EventKind::Deleted]
        );
    }

    #[test]
    fn flush_all_orders_by_deadline() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.observe(RawChange::new("late.txt", RawKind::Modified), t0 + ms(50));
        d.observe(RawChange::new("early.txt", RawKind::Modified), t0);
        let events = d.flush_all();
        assert_eq!(
            kinds(&events),
            vec![
                (EventKind::Modified, "early.txt".into()),
                (EventKind::Modified, "late.txt".into())
            ]
        );
        assert_eq!(d.next_deadline(), None);
    }
}
