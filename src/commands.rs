//! Implementations of the `amem` subcommands.
//!
//! Results go to stdout; diagnostics go through `tracing` to stderr.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use tracing::debug;

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::index_store::{EVENTS_STREAM, NOTES_STREAM};
use crate::indexer::{IndexerState, Indexer};
use crate::llm::create_generator;
use crate::migrate;
use crate::models::{EventFilter, EventKind, EventSource};
use crate::pipeline::{Pipeline, Stores};
use crate::prompt::{build_prompt, format_excerpt, format_item, gather_context};
use crate::retrieval::{RetrievalEngine, RetrievalFilter};
use crate::watch_git::CommitWatcher;

/// Time and subject constraints shared by `events`, `search` and `ask`.
#[derive(Debug, Clone, Default)]
pub struct FilterArgs {
    pub today: bool,
    /// `YYYY-MM-DD` (local) or RFC 3339.
    pub since: Option<String>,
    /// Exclusive; same formats as `since`.
    pub until: Option<String>,
    pub source: Option<String>,
    pub prefix: Option<String>,
}

impl FilterArgs {
    pub fn to_retrieval_filter(&self) -> Result<RetrievalFilter> {
        let mut filter = if self.today {
            RetrievalFilter::today(Utc::now())
        } else {
            RetrievalFilter::default()
        };
        if let Some(since) = &self.since {
            filter.since = Some(parse_time(since)?);
        }
        if let Some(until) = &self.until {
            filter.until = Some(parse_time(until)?);
        }
        if let Some(source) = &self.source {
            let source = source.to_ascii_lowercase();
            if source != "note" {
                source
                    .parse::<EventSource>()
                    .map_err(anyhow::Error::msg)?;
            }
            filter.source = Some(if source == "fs" {
                "filesystem".to_string()
            } else {
                source
            });
        }
        filter.subject_prefix = self.prefix.clone();
        Ok(filter)
    }
}

/// Parse `YYYY-MM-DD` as local midnight, or a full RFC 3339 timestamp.
pub fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}': expected YYYY-MM-DD or RFC 3339", s))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow::anyhow!("Invalid date '{}'", s))?;
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| anyhow::anyhow!("Date '{}' does not exist in the local time zone", s))
}

pub async fn run_init(config: &Config) -> Result<()> {
    migrate::run_migrations(config).await?;
    println!("Databases initialized.");
    println!("  events:  {}", config.db.events.display());
    println!("  vectors: {}", config.db.vectors.display());
    Ok(())
}

/// Watch, poll and index until Ctrl-C.
pub async fn run_watch(config: &Config) -> Result<()> {
    let stores = Stores::open(config).await?;
    let pipeline = Pipeline::start(config, &stores).await?;
    pipeline
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

pub async fn run_poll_git(config: &Config) -> Result<()> {
    let stores = Stores::open(config).await?;
    let mut watcher = CommitWatcher::new(Arc::clone(&stores.events), config).await?;
    if watcher.repos().is_empty() {
        bail!("No repositories configured: set git.repos, GIT_WATCH_PATHS, or git.auto_discover");
    }
    let report = watcher.poll_once().await;
    println!(
        "Polled {} repositories: {} new commits, {} already recorded, {} unreadable.",
        watcher.repos().len(),
        report.appended,
        report.duplicates,
        report.failed_repos
    );
    Ok(())
}

/// Index everything pending. With `rebuild`, re-embed every item.
pub async fn run_index(config: &Config, rebuild: bool) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled; set [embedding] provider");
    }
    let stores = Stores::open(config).await?;
    if rebuild {
        stores.index.set_cursor(EVENTS_STREAM, 0).await?;
        stores.index.set_cursor(NOTES_STREAM, 0).await?;
    }
    let embedder = create_embedder(&config.embedding)?;
    let (indexer, _) = Indexer::new(
        Arc::clone(&stores.events),
        Arc::clone(&stores.index),
        embedder,
        config.indexer.clone(),
        config.embedding.timeout(),
    );
    let indexed = indexer.drain().await?;
    println!(
        "Indexed {} item(s); {} entries in index.",
        indexed,
        stores.index.count_entries().await?
    );
    Ok(())
}

pub async fn run_events(
    config: &Config,
    filter: &FilterArgs,
    kinds: &[String],
    limit: usize,
    json: bool,
) -> Result<()> {
    let stores = Stores::open(config).await?;
    let rf = filter.to_retrieval_filter()?;
    let kinds = kinds
        .iter()
        .map(|k| k.parse::<EventKind>().map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()?;
    let sources = match rf.source.as_deref() {
        Some("note") => bail!("Notes are not events; use `amem search --source note`"),
        Some(s) => vec![s.parse::<EventSource>().map_err(anyhow::Error::msg)?],
        None => Vec::new(),
    };
    let query = EventFilter {
        since: rf.since,
        until: rf.until,
        kinds,
        sources,
        subject_prefix: rf.subject_prefix,
        ..Default::default()
    }
    .latest(limit as i64);

    let mut events = stores.events.query(&query).await?;
    // Printed oldest first
    events.reverse();

    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }
    if events.is_empty() {
        println!("No events.");
        return Ok(());
    }
    for e in &events {
        let ts = e.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S");
        let mut line = format!("{:>6}  {}  {:<8}  {}", e.id, ts, e.kind.as_str(), e.subject);
        if !e.detail.is_empty() {
            line.push_str("  ");
            line.push_str(&e.detail);
        }
        println!("{}", line);
    }
    Ok(())
}

pub async fn run_note_add(config: &Config, title: Option<String>, body: &str) -> Result<()> {
    if body.trim().is_empty() {
        bail!("Note body is empty");
    }
    let stores = Stores::open(config).await?;
    let id = stores
        .events
        .add_note(title.as_deref().unwrap_or(""), body)
        .await?;
    println!("Added note {}.", id);
    Ok(())
}

fn engine(config: &Config, stores: &Stores) -> Result<RetrievalEngine> {
    Ok(RetrievalEngine::new(
        Arc::clone(&stores.events),
        Arc::clone(&stores.index),
        create_embedder(&config.embedding)?,
        config.retrieval.recency_weight,
        config.embedding.timeout(),
    )
    .with_exact_scan_below(config.retrieval.exact_scan_below))
}

async fn indexer_degraded(stores: &Stores) -> Result<bool> {
    Ok(stores
        .index
        .load_status()
        .await?
        .map(|s| s.state == IndexerState::Degraded.as_str())
        .unwrap_or(false))
}

pub async fn run_search(
    config: &Config,
    query: &str,
    filter: &FilterArgs,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let stores = Stores::open(config).await?;
    let engine = engine(config, &stores)?;
    let top_k = limit.unwrap_or(config.retrieval.top_k);
    let results = engine
        .retrieve(query, &filter.to_retrieval_filter()?, top_k)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, r) in results.iter().enumerate() {
        println!("{}. [{:.3}] {}", i + 1, r.score, format_item(r));
        println!("    similarity: {:.3}  ref: {}", r.similarity, r.item.item_ref());
        if let Some(excerpt) = format_excerpt(r, 160) {
            println!("    {}", excerpt);
        }
    }
    if indexer_degraded(&stores).await? {
        eprintln!("warning: indexer is degraded; recent activity may be missing");
    }
    Ok(())
}

pub async fn run_ask(
    config: &Config,
    query: &str,
    filter: &FilterArgs,
    limit: Option<usize>,
    show_prompt: bool,
) -> Result<()> {
    let stores = Stores::open(config).await?;
    let engine = engine(config, &stores)?;
    let top_k = limit.unwrap_or(config.retrieval.top_k);
    let degraded = indexer_degraded(&stores).await?;

    let bundle = gather_context(
        &engine,
        query,
        &filter.to_retrieval_filter()?,
        top_k,
        degraded,
    )
    .await?;
    let prompt = build_prompt(query, &bundle);
    if show_prompt {
        eprintln!("{}", prompt);
    }

    let generator = create_generator(&config.llm)?;
    debug!(
        generator = generator.name(),
        items = bundle.items.len(),
        stale = bundle.stale,
        "generating answer"
    );
    let answer = generator.generate(&prompt).await?;
    println!("{}", answer);
    Ok(())
}

pub async fn run_status(config: &Config) -> Result<()> {
    let stores = Stores::open(config).await?;
    let events = stores.events.count().await?;
    let high = stores.events.high_watermark().await?;
    let cursor = stores.index.cursor(EVENTS_STREAM).await?;
    let notes_cursor = stores.index.cursor(NOTES_STREAM).await?;
    let entries = stores.index.count_entries().await?;
    let backlog = stores
        .events
        .query(&EventFilter::after(cursor))
        .await?
        .len();

    println!("events:         {} (highest id {})", events, high);
    println!("index entries:  {}", entries);
    println!("event cursor:   {} ({} pending)", cursor, backlog);
    println!("note cursor:    {}", notes_cursor);
    println!("embedding:      {}", config.embedding.provider);
    match stores.index.load_status().await? {
        Some(status) => {
            println!(
                "indexer:        {} (updated {})",
                status.state,
                status
                    .updated_at
                    .with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S")
            );
            if status.consecutive_failures > 0 {
                println!("failures:       {}", status.consecutive_failures);
            }
            if let Some(err) = status.last_error {
                println!("last error:     {}", err);
            }
        }
        None => println!("indexer:        never run"),
    }
    Ok(())
}
