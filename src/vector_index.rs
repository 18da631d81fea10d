//! In-memory exact nearest-neighbour index over `index_entries`.
//!
//! Vectors are grouped by dimension. Within a group they are split into
//! partitions around unit centroids, and each partition records the cosine
//! of the widest angle between its centroid and any member. For a query at
//! angle θ from a centroid and a partition radius r, no member can be more
//! similar than `cos(max(0, θ − r))`. Multiplied by the largest recency
//! factor a score can get, that bounds every score in the partition.
//!
//! [`VectorIndex::search`] visits partitions best bound first and stops once
//! the bound falls below the current `k`-th score. Similarities are
//! computed exactly as the table scan computes them, so the ranked result
//! is the same as scoring every entry.
//!
//! The index follows the table through its `revision` column:
//! [`VectorIndex::refresh`] loads only rows written since the previous
//! refresh. A rewritten entry leaves a dead slot behind; slots are
//! compacted and partitions rebuilt whenever a group has doubled since it
//! was last partitioned.

use std::collections::HashMap;

use tracing::debug;

use crate::embedding::cosine_similarity;
use crate::error::Result;
use crate::index_store::{Candidate, CandidateFilter, IndexStore};
use crate::models::ItemRef;

/// At most this many partitions per group.
const MAX_PARTITIONS: usize = 64;

/// Slack added to similarity bounds to absorb `f32` rounding.
const BOUND_MARGIN: f64 = 1e-4;

/// Receives scored entries from a search and reports the score an entry
/// must exceed to still matter.
pub trait CandidateSink {
    fn offer(&mut self, item: ItemRef, timestamp_ms: i64, similarity: f64);

    /// `None` while every offered entry is kept.
    fn floor(&self) -> Option<f64>;
}

#[derive(Debug, Clone)]
struct Slot {
    item: ItemRef,
    timestamp_ms: i64,
    source: String,
    subject: String,
    live: bool,
}

#[derive(Debug, Clone)]
struct Partition {
    /// Unit length.
    centroid: Vec<f32>,
    /// Lowest cosine between the centroid and a member.
    min_cos: f64,
    members: Vec<usize>,
}

#[derive(Debug, Default)]
struct Group {
    dims: usize,
    /// Row-major, `dims` floats per slot, as stored.
    vectors: Vec<f32>,
    slots: Vec<Slot>,
    partitions: Vec<Partition>,
    /// Zero vectors have similarity 0 to everything and no direction.
    zero: Vec<usize>,
    /// Slot count at the last repartition.
    partitioned_at: usize,
}

fn norm(v: &[f32]) -> f64 {
    v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt()
}

fn unit_dot(a: &[f32], b: &[f32], b_norm: f64) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    dot / b_norm
}

/// Upper bound on the cosine between any member and a query whose cosine
/// to the centroid is `cos_q`.
fn similarity_bound(cos_q: f64, min_cos: f64) -> f64 {
    let cos_q = cos_q.clamp(-1.0, 1.0);
    let min_cos = min_cos.clamp(-1.0, 1.0);
    // θ ≤ r: the query's direction may lie inside the partition
    if cos_q >= min_cos {
        return 1.0;
    }
    let sin_q = (1.0 - cos_q * cos_q).sqrt();
    let sin_r = (1.0 - min_cos * min_cos).sqrt();
    (cos_q * min_cos + sin_q * sin_r + BOUND_MARGIN).min(1.0)
}

/// Best score reachable with `similarity` when recency can multiply it by
/// anything in `[1, max_factor]`.
fn score_bound(similarity: f64, max_factor: f64) -> f64 {
    if similarity > 0.0 {
        similarity * max_factor
    } else {
        similarity
    }
}

impl Group {
    fn new(dims: usize) -> Self {
        Self {
            dims,
            ..Default::default()
        }
    }

    fn row(&self, slot: usize) -> &[f32] {
        &self.vectors[slot * self.dims..(slot + 1) * self.dims]
    }

    fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.live).count()
    }

    fn push(&mut self, c: Candidate) -> usize {
        let slot = self.slots.len();
        self.vectors.extend_from_slice(&c.embedding);
        self.slots.push(Slot {
            item: c.item,
            timestamp_ms: c.timestamp_ms,
            source: c.source,
            subject: c.subject,
            live: true,
        });
        self.place(slot);
        slot
    }

    /// Put `slot` in the nearest partition, widening it as needed.
    fn place(&mut self, slot: usize) {
        let row_norm = norm(self.row(slot));
        if row_norm < f64::from(f32::EPSILON) {
            self.zero.push(slot);
            return;
        }
        let row = &self.vectors[slot * self.dims..(slot + 1) * self.dims];
        let nearest = self
            .partitions
            .iter()
            .enumerate()
            .map(|(i, p)| (i, unit_dot(&p.centroid, row, row_norm)))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        match nearest {
            Some((i, cos)) => {
                let p = &mut self.partitions[i];
                p.min_cos = p.min_cos.min(cos);
                p.members.push(slot);
            }
            None => {
                // First vector of an unpartitioned group seeds one partition
                let centroid = row.iter().map(|x| (*x as f64 / row_norm) as f32).collect();
                self.partitions.push(Partition {
                    centroid,
                    min_cos: 1.0,
                    members: vec![slot],
                });
            }
        }
    }

    fn needs_repartition(&self) -> bool {
        self.slots.len() >= 2 * self.partitioned_at.max(1)
    }

    /// Drop dead slots and rebuild partitions from evenly spaced seeds.
    /// Returns the new slot of every live item.
    fn repartition(&mut self) -> Vec<(ItemRef, usize)> {
        let mut vectors = Vec::with_capacity(self.live_count() * self.dims);
        let mut slots = Vec::with_capacity(self.live_count());
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.live {
                vectors.extend_from_slice(self.row(i));
                slots.push(slot.clone());
            }
        }
        self.vectors = vectors;
        self.slots = slots;
        self.partitions.clear();
        self.zero.clear();

        let n = self.slots.len();
        let directed: Vec<usize> = (0..n)
            .filter(|&i| norm(self.row(i)) >= f64::from(f32::EPSILON))
            .collect();
        let wanted = ((directed.len() as f64).sqrt() as usize).clamp(1, MAX_PARTITIONS);
        let stride = (directed.len() / wanted).max(1);
        let seeds: Vec<Vec<f32>> = directed
            .iter()
            .step_by(stride)
            .take(wanted)
            .map(|&i| {
                let row = self.row(i);
                let n = norm(row);
                row.iter().map(|x| (*x as f64 / n) as f32).collect()
            })
            .collect();

        // Assign to the nearest seed, then recentre on the members' mean
        // direction and measure each partition's radius from there.
        let mut members: Vec<Vec<usize>> = vec![Vec::new(); seeds.len()];
        for &i in &directed {
            let row = self.row(i);
            let row_norm = norm(row);
            let best = seeds
                .iter()
                .enumerate()
                .map(|(s, c)| (s, unit_dot(c, row, row_norm)))
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(s, _)| s)
                .unwrap_or(0);
            members[best].push(i);
        }

        for (seed, group_members) in seeds.into_iter().zip(members) {
            if group_members.is_empty() {
                continue;
            }
            let mut sum = vec![0.0f64; self.dims];
            for &i in &group_members {
                let row = self.row(i);
                let row_norm = norm(row);
                for (s, x) in sum.iter_mut().zip(row) {
                    *s += *x as f64 / row_norm;
                }
            }
            let sum_norm = sum.iter().map(|x| x * x).sum::<f64>().sqrt();
            let centroid: Vec<f32> = if sum_norm > f64::EPSILON {
                sum.iter().map(|x| (x / sum_norm) as f32).collect()
            } else {
                seed
            };
            let min_cos = group_members
                .iter()
                .map(|&i| {
                    let row = self.row(i);
                    unit_dot(&centroid, row, norm(row))
                })
                .fold(1.0f64, f64::min);
            self.partitions.push(Partition {
                centroid,
                min_cos,
                members: group_members,
            });
        }
        self.zero = (0..n)
            .filter(|&i| norm(self.row(i)) < f64::from(f32::EPSILON))
            .collect();
        self.partitioned_at = n;

        self.slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.item, i))
            .collect()
    }

    fn visit<S: CandidateSink>(
        &self,
        slot: usize,
        query: &[f32],
        filter: &CandidateFilter,
        sink: &mut S,
    ) {
        let s = &self.slots[slot];
        if s.live && filter.matches(s.timestamp_ms, &s.source, &s.subject) {
            let similarity = cosine_similarity(query, self.row(slot)) as f64;
            sink.offer(s.item, s.timestamp_ms, similarity);
        }
    }

    fn search<S: CandidateSink>(
        &self,
        query: &[f32],
        filter: &CandidateFilter,
        max_factor: f64,
        sink: &mut S,
    ) -> usize {
        for &slot in &self.zero {
            self.visit(slot, query, filter, sink);
        }

        let query_norm = norm(query);
        let mut order: Vec<(f64, &Partition)> = self
            .partitions
            .iter()
            .map(|p| {
                // Near-zero vectors score exactly 0, so no bound goes below it
                let bound = if query_norm < f64::from(f32::EPSILON) {
                    0.0
                } else {
                    let cos_q = unit_dot(&p.centroid, query, query_norm);
                    score_bound(similarity_bound(cos_q, p.min_cos).max(0.0), max_factor)
                };
                (bound, p)
            })
            .collect();
        order.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut visited = 0;
        for (bound, partition) in order {
            if sink.floor().is_some_and(|floor| bound < floor) {
                break;
            }
            visited += 1;
            for &slot in &partition.members {
                self.visit(slot, query, filter, sink);
            }
        }
        visited
    }
}

/// See the module documentation.
#[derive(Debug)]
pub struct VectorIndex {
    groups: HashMap<usize, Group>,
    /// Item to (dims, slot) of its live entry.
    positions: HashMap<ItemRef, (usize, usize)>,
    /// Highest revision loaded; -1 before the first refresh.
    revision: i64,
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorIndex {
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
            positions: HashMap::new(),
            revision: -1,
        }
    }

    /// Whether any refresh has happened yet.
    pub fn is_loaded(&self) -> bool {
        self.revision >= 0
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Insert or replace one entry.
    pub fn upsert(&mut self, candidate: Candidate) {
        self.revision = self.revision.max(candidate.revision);
        if let Some((dims, slot)) = self.positions.remove(&candidate.item) {
            if let Some(group) = self.groups.get_mut(&dims) {
                group.slots[slot].live = false;
            }
        }
        let item = candidate.item;
        let dims = candidate.embedding.len();
        let group = self.groups.entry(dims).or_insert_with(|| Group::new(dims));
        let slot = group.push(candidate);
        self.positions.insert(item, (dims, slot));
    }

    /// Rebuild partitions of groups that have doubled since their last build.
    fn maintain(&mut self) {
        for (dims, group) in self.groups.iter_mut() {
            if group.needs_repartition() {
                for (item, slot) in group.repartition() {
                    self.positions.insert(item, (*dims, slot));
                }
                debug!(
                    dims,
                    entries = group.slots.len(),
                    partitions = group.partitions.len(),
                    "vector index repartitioned"
                );
            }
        }
    }

    /// Load entries written to `store` since the last refresh. Returns how
    /// many were loaded.
    pub async fn refresh(&mut self, store: &IndexStore) -> Result<usize> {
        let since = self.revision;
        let mut loaded = 0;
        store
            .for_each_since(since, |candidate| {
                loaded += 1;
                self.upsert(candidate);
            })
            .await?;
        // An empty table still counts as loaded
        self.revision = self.revision.max(0);
        self.maintain();
        Ok(loaded)
    }

    /// Offer `sink` every entry that could rank among its best, given that
    /// recency multiplies a positive similarity by at most `max_factor`.
    ///
    /// Only entries with the query's dimension are considered. Returns the
    /// number of partitions scanned.
    pub fn search<S: CandidateSink>(
        &self,
        query: &[f32],
        filter: &CandidateFilter,
        max_factor: f64,
        sink: &mut S,
    ) -> usize {
        match self.groups.get(&query.len()) {
            Some(group) if !query.is_empty() => group.search(query, filter, max_factor.max(1.0), sink),
            _ => 0,
        }
    }
}
