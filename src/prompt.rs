//! Context gathering and prompt assembly for `ask`.

use chrono::{DateTime, Local, Utc};
use tracing::warn;

use crate::error::{MemoryError, Result};
use crate::models::{EventFilter, EventSource};
use crate::retrieval::{ContextItem, RetrievalEngine, RetrievalFilter, ScoredItem};

const MAX_NOTE_CHARS: usize = 400;
const MAX_EXCERPT_CHARS: usize = 400;

/// Retrieved context plus what the answer should warn about.
#[derive(Debug, Clone, Default)]
pub struct ContextBundle {
    pub items: Vec<ScoredItem>,
    /// The indexer is degraded; recent activity may be missing.
    pub stale: bool,
    /// The query could not be embedded; items are the most recent events
    /// matching the filter, not the most similar ones.
    pub recency_fallback: bool,
}

/// Retrieve context for `query`, degrading to recent events when the
/// embedding backend is down.
pub async fn gather_context(
    engine: &RetrievalEngine,
    query: &str,
    filter: &RetrievalFilter,
    top_k: usize,
    indexer_degraded: bool,
) -> Result<ContextBundle> {
    match engine.retrieve(query, filter, top_k).await {
        Ok(items) => Ok(ContextBundle {
            items,
            stale: indexer_degraded,
            recency_fallback: false,
        }),
        Err(MemoryError::EmbeddingUnavailable(reason)) => {
            warn!(error = %reason, "query embedding failed; using most recent activity");
            let items = recent_events(engine, filter, top_k).await?;
            Ok(ContextBundle {
                items,
                stale: true,
                recency_fallback: true,
            })
        }
        Err(e) => Err(e),
    }
}

async fn recent_events(
    engine: &RetrievalEngine,
    filter: &RetrievalFilter,
    top_k: usize,
) -> Result<Vec<ScoredItem>> {
    let sources = match filter.source.as_deref().map(str::parse::<EventSource>) {
        Some(Ok(source)) => vec![source],
        // Notes only: nothing to fall back to in the event log
        Some(Err(_)) => return Ok(Vec::new()),
        None => Vec::new(),
    };
    let event_filter = EventFilter {
        since: filter.since,
        until: filter.until,
        sources,
        subject_prefix: filter.subject_prefix.clone(),
        ..Default::default()
    }
    .latest(top_k as i64);
    let events = engine.events().query(&event_filter).await?;
    Ok(events
        .into_iter()
        .map(|e| ScoredItem {
            item: ContextItem::Event(e),
            similarity: 0.0,
            score: 0.0,
            excerpt: None,
        })
        .collect())
}

fn local_time(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// One line of context, as shown to the model and in `search` output.
pub fn format_item(scored: &ScoredItem) -> String {
    match &scored.item {
        ContextItem::Event(e) => {
            let mut line = format!("[{}] {} {}", local_time(e.timestamp), e.kind, e.subject);
            if !e.detail.is_empty() {
                line.push_str(": ");
                line.push_str(&e.detail);
            }
            if let Some(author) = &e.author {
                line.push_str(&format!(" ({})", author));
            }
            line
        }
        ContextItem::Note(n) => {
            let body: String = n.body.chars().take(MAX_NOTE_CHARS).collect();
            let ellipsis = if n.body.chars().count() > MAX_NOTE_CHARS {
                "…"
            } else {
                ""
            };
            let title = if n.title.is_empty() {
                String::new()
            } else {
                format!("{}: ", n.title)
            };
            format!(
                "[{}] NOTE {}{}{}",
                local_time(n.created_at),
                title,
                body.replace('\n', " "),
                ellipsis
            )
        }
    }
}

/// The item's content excerpt on one line, cut to `max_chars`.
pub fn format_excerpt(scored: &ScoredItem, max_chars: usize) -> Option<String> {
    let excerpt = scored.excerpt.as_deref()?;
    let flat = excerpt.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > max_chars {
        let cut: String = flat.chars().take(max_chars).collect();
        Some(format!("content: {}…", cut.trim_end()))
    } else {
        Some(format!("content: {}", flat))
    }
}

/// Assemble the generation prompt for `query` from `bundle`.
pub fn build_prompt(query: &str, bundle: &ContextBundle) -> String {
    let mut prompt = String::from(
        "You are a personal memory assistant. Answer using the user's recorded activity below.\n",
    );
    if bundle.stale {
        prompt.push_str(
            "Warning: the memory index is behind; the most recent activity may be missing.\n",
        );
    }
    if bundle.recency_fallback {
        prompt.push_str("Note: context below is the most recent activity, not ranked by relevance.\n");
    }

    prompt.push_str("\nCONTEXT:\n");
    if bundle.items.is_empty() {
        prompt.push_str("(no matching activity recorded)\n");
    }
    for scored in &bundle.items {
        prompt.push_str("- ");
        prompt.push_str(&format_item(scored));
        prompt.push('\n');
        if let Some(excerpt) = format_excerpt(scored, MAX_EXCERPT_CHARS) {
            prompt.push_str("  ");
            prompt.push_str(&excerpt);
            prompt.push('\n');
        }
    }

    prompt.push_str("\nQUESTION:\n");
    prompt.push_str(query.trim());
    prompt.push_str("\n\nAnswer clearly and concisely.\n");
    prompt
}
