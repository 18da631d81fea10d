//! Retrieval engine: query → ranked activity context.
//!
//! 1. Embed the query with the same backend the indexer uses.
//! 2. Find entries that pass the structured filter (time range, source,
//!    subject prefix) and score them by cosine similarity, adjusted for
//!    recency:
//!
//!    ```text
//!    score = similarity × (1 + recency_weight / (1 + age_days))
//!    ```
//!
//! 3. Keep the best `top_k` in a bounded heap and hydrate them from the
//!    event log, with the stored content excerpt of file events.
//!
//! Small indexes are scanned straight from SQLite with the filter pushed
//! down. Once the index holds `exact_scan_below` entries or more, the
//! engine loads a [`VectorIndex`] and keeps it refreshed; it prunes whole
//! partitions but returns the same ranking as the scan.
//!
//! Ties are broken by newer timestamp, then by item reference, so equal
//! scores always rank the same way. Retrieval never calls a language model.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::embedding::{cosine_similarity, embed_query, Embedder};
use crate::error::Result;
use crate::event_store::EventStore;
use crate::index_store::{Candidate, CandidateFilter, IndexStore};
use crate::models::{Event, ItemRef, Note};
use crate::vector_index::{CandidateSink, VectorIndex};

const MS_PER_DAY: f64 = 86_400_000.0;

pub const DEFAULT_EXACT_SCAN_BELOW: usize = 5_000;

fn local_midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    let midnight = date.and_hms_opt(0, 0, 0)?;
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

/// Structured constraints applied before similarity ranking.
#[derive(Debug, Clone, Default)]
pub struct RetrievalFilter {
    pub since: Option<DateTime<Utc>>,
    /// Exclusive.
    pub until: Option<DateTime<Utc>>,
    /// `filesystem`, `git`, or `note`.
    pub source: Option<String>,
    /// Matched against event paths/repositories and note titles.
    pub subject_prefix: Option<String>,
}

impl RetrievalFilter {
    /// Everything since local midnight of the day containing `now`.
    pub fn today(now: DateTime<Utc>) -> Self {
        let date = now.with_timezone(&Local).date_naive();
        Self {
            since: Some(local_midnight(date).unwrap_or(now)),
            until: date.succ_opt().and_then(local_midnight),
            ..Default::default()
        }
    }

    fn to_candidate_filter(&self) -> CandidateFilter {
        CandidateFilter {
            since_ms: self.since.map(|t| t.timestamp_millis()),
            until_ms: self.until.map(|t| t.timestamp_millis()),
            source: self.source.clone(),
            subject_prefix: self.subject_prefix.clone(),
        }
    }
}

/// A hydrated event or note.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContextItem {
    Event(Event),
    Note(Note),
}

impl ContextItem {
    pub fn item_ref(&self) -> ItemRef {
        match self {
            ContextItem::Event(e) => ItemRef::Event(e.id),
            ContextItem::Note(n) => ItemRef::Note(n.id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredItem {
    pub item: ContextItem,
    pub similarity: f64,
    pub score: f64,
    /// Start of the file's text when it was indexed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

/// Recency-adjusted score for an item `age_days` old.
pub fn recency_score(similarity: f64, age_days: f64, weight: f64) -> f64 {
    similarity * (1.0 + weight / (1.0 + age_days.max(0.0)))
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Ranked {
    pub score: f64,
    pub similarity: f64,
    pub timestamp_ms: i64,
    pub item: ItemRef,
}

impl Ranked {
    /// `Greater` means ranks higher.
    fn rank_cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then(self.timestamp_ms.cmp(&other.timestamp_ms))
            .then(other.item.cmp(&self.item))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.rank_cmp(other) == Ordering::Equal
    }
}
impl Eq for Ranked {}
impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank_cmp(other)
    }
}

/// Keeps the `k` best-ranked candidates seen so far, scoring recency
/// relative to `now_ms`.
pub(crate) struct TopK {
    k: usize,
    now_ms: i64,
    weight: f64,
    heap: BinaryHeap<Reverse<Ranked>>,
}

impl TopK {
    pub fn new(k: usize, now_ms: i64, weight: f64) -> Self {
        Self {
            k,
            now_ms,
            weight,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    fn push(&mut self, r: Ranked) {
        if self.k == 0 {
            return;
        }
        if self.heap.len() < self.k {
            self.heap.push(Reverse(r));
        } else if let Some(Reverse(worst)) = self.heap.peek() {
            if r > *worst {
                self.heap.pop();
                self.heap.push(Reverse(r));
            }
        }
    }

    /// Best first.
    pub fn into_sorted(self) -> Vec<Ranked> {
        let mut v: Vec<Ranked> = self.heap.into_iter().map(|Reverse(r)| r).collect();
        v.sort_by(|a, b| b.cmp(a));
        v
    }
}

impl CandidateSink for TopK {
    fn offer(&mut self, item: ItemRef, timestamp_ms: i64, similarity: f64) {
        let age_days = (self.now_ms - timestamp_ms) as f64 / MS_PER_DAY;
        self.push(Ranked {
            score: recency_score(similarity, age_days, self.weight),
            similarity,
            timestamp_ms,
            item,
        });
    }

    fn floor(&self) -> Option<f64> {
        if self.heap.len() < self.k {
            return None;
        }
        self.heap.peek().map(|Reverse(worst)| worst.score)
    }
}

pub struct RetrievalEngine {
    events: Arc<EventStore>,
    index: Arc<IndexStore>,
    embedder: Arc<dyn Embedder>,
    recency_weight: f64,
    embed_timeout: Duration,
    exact_scan_below: usize,
    vectors: Mutex<VectorIndex>,
}

impl RetrievalEngine {
    pub fn new(
        events: Arc<EventStore>,
        index: Arc<IndexStore>,
        embedder: Arc<dyn Embedder>,
        recency_weight: f64,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            events,
            index,
            embedder,
            recency_weight,
            embed_timeout,
            exact_scan_below: DEFAULT_EXACT_SCAN_BELOW,
            vectors: Mutex::new(VectorIndex::new()),
        }
    }

    /// Scan the table for indexes smaller than `entries`; use the
    /// in-memory vector index from there on.
    pub fn with_exact_scan_below(mut self, entries: usize) -> Self {
        self.exact_scan_below = entries;
        self
    }

    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }

    pub async fn retrieve(
        &self,
        query: &str,
        filter: &RetrievalFilter,
        top_k: usize,
    ) -> Result<Vec<ScoredItem>> {
        self.retrieve_at(query, filter, top_k, Utc::now()).await
    }

    /// As [`retrieve`](Self::retrieve), measuring recency from `now`.
    ///
    /// Fails with `EmbeddingUnavailable` when the query cannot be embedded.
    /// Items not yet indexed are simply absent from the result.
    pub async fn retrieve_at(
        &self,
        query: &str,
        filter: &RetrievalFilter,
        top_k: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredItem>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = embed_query(self.embedder.as_ref(), query, self.embed_timeout).await?;
        let weight = self.recency_weight;
        let filter = filter.to_candidate_filter();

        let mut top = TopK::new(top_k, now.timestamp_millis(), weight);
        let mut vectors = self.vectors.lock().await;
        let threshold = i64::try_from(self.exact_scan_below).unwrap_or(i64::MAX);
        if vectors.is_loaded() || self.index.count_entries().await? >= threshold {
            let loaded = vectors.refresh(&self.index).await?;
            let scanned = vectors.search(&query_vec, &filter, 1.0 + weight.max(0.0), &mut top);
            debug!(loaded, scanned, entries = vectors.len(), "searched vector index");
        } else {
            drop(vectors);
            self.index
                .for_each_candidate(&filter, |c: Candidate| {
                    if c.embedding.len() != query_vec.len() {
                        return;
                    }
                    let similarity = cosine_similarity(&query_vec, &c.embedding) as f64;
                    top.offer(c.item, c.timestamp_ms, similarity);
                })
                .await?;
        }

        self.hydrate(top.into_sorted()).await
    }

    async fn hydrate(&self, ranked: Vec<Ranked>) -> Result<Vec<ScoredItem>> {
        let event_ids: Vec<i64> = ranked
            .iter()
            .filter_map(|r| match r.item {
                ItemRef::Event(id) => Some(id),
                ItemRef::Note(_) => None,
            })
            .collect();
        let note_ids: Vec<i64> = ranked
            .iter()
            .filter_map(|r| match r.item {
                ItemRef::Note(id) => Some(id),
                ItemRef::Event(_) => None,
            })
            .collect();

        let refs: Vec<ItemRef> = ranked.iter().map(|r| r.item).collect();
        let mut excerpts = self.index.excerpts(&refs).await?;
        let mut items: HashMap<ItemRef, ContextItem> = HashMap::new();
        for e in self.events.get_events(&event_ids).await? {
            items.insert(ItemRef::Event(e.id), ContextItem::Event(e));
        }
        for n in self.events.get_notes(&note_ids).await? {
            items.insert(ItemRef::Note(n.id), ContextItem::Note(n));
        }

        Ok(ranked
            .into_iter()
            .filter_map(|r| {
                items.remove(&r.item).map(|item| ScoredItem {
                    item,
                    similarity: r.similarity,
                    score: r.score,
                    excerpt: excerpts.remove(&r.item),
                })
            })
            .collect())
    }
}
