use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use activity_memory::config::IndexerConfig;
use activity_memory::embedding::{Embedder, HashEmbedder};
use activity_memory::error::{MemoryError, Result};
use activity_memory::event_store::EventStore;
use activity_memory::index_store::{IndexStore, EVENTS_STREAM};
use activity_memory::indexer::{Indexer, IndexerState};
use activity_memory::models::{EventKind, ItemRef, NewEvent};
use activity_memory::prompt::{build_prompt, gather_context};
use activity_memory::retrieval::{ContextItem, RetrievalEngine, RetrievalFilter};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Hash embeddings behind a switch that simulates the backend going down.
struct FlakyEmbedder {
    inner: HashEmbedder,
    up: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyEmbedder {
    fn new(up: bool) -> Self {
        Self {
            inner: HashEmbedder::new(64),
            up: AtomicBool::new(up),
            calls: AtomicUsize::new(0),
        }
    }

    fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.up.load(Ordering::SeqCst) {
            return Err(MemoryError::EmbeddingUnavailable(
                "connection refused".into(),
            ));
        }
        self.inner.embed(texts).await
    }
}

struct Fixture {
    _dir: TempDir,
    events: Arc<EventStore>,
    index: Arc<IndexStore>,
}

async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let events = EventStore::open(&dir.path().join("events.db"), Duration::from_secs(1))
        .await
        .unwrap();
    let index = IndexStore::open(&dir.path().join("vectors.db")).await.unwrap();
    Fixture {
        _dir: dir,
        events: Arc::new(events),
        index: Arc::new(index),
    }
}

fn indexer_config() -> IndexerConfig {
    IndexerConfig {
        batch_size: 4,
        interval_secs: 0.05,
        backoff_base_ms: 1,
        backoff_max_secs: 1,
        max_consecutive_failures: 3,
        ..Default::default()
    }
}

#[tokio::test]
async fn today_filter_excludes_yesterday() {
    let f = fixture().await;
    let now = Utc::now();
    f.events
        .append(&NewEvent::file(
            EventKind::Modified,
            "/proj/src/parser.rs",
            "",
            now - ChronoDuration::hours(36),
        ))
        .await
        .unwrap();
    f.events
        .append(&NewEvent::file(
            EventKind::Modified,
            "/proj/src/parser_tests.rs",
            "",
            now,
        ))
        .await
        .unwrap();

    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
    let (indexer, _) = Indexer::new(
        Arc::clone(&f.events),
        Arc::clone(&f.index),
        Arc::clone(&embedder),
        indexer_config(),
        Duration::from_secs(5),
    );
    assert_eq!(indexer.drain().await.unwrap(), 2);

    let engine = RetrievalEngine::new(
        Arc::clone(&f.events),
        Arc::clone(&f.index),
        embedder,
        0.5,
        Duration::from_secs(5),
    );
    let results = engine
        .retrieve_at("parser", &RetrievalFilter::today(now), 10, now)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    match &results[0].item {
        ContextItem::Event(e) => assert_eq!(e.subject.location(), "/proj/src/parser_tests.rs"),
        other => panic!("expected event, got {:?}", other),
    }

    let everything = engine
        .retrieve_at("parser", &RetrievalFilter::default(), 10, now)
        .await
        .unwrap();
    assert_eq!(everything.len(), 2);
}

#[tokio::test]
async fn file_content_is_indexed_with_the_event() {
    let f = fixture().await;
    let docs = f._dir.path().join("docs");
    std::fs::create_dir_all(&docs).unwrap();
    let plan = docs.join("plan.md");
    std::fs::write(&plan, "The quarterly forecast assumes steady hiring.\n").unwrap();
    let list = docs.join("list.txt");
    std::fs::write(&list, "milk eggs bread\n").unwrap();

    let now = Utc::now();
    for path in [&plan, &list] {
        f.events
            .append(&NewEvent::file(
                EventKind::Modified,
                path.to_string_lossy(),
                "",
                now,
            ))
            .await
            .unwrap();
    }
    f.events
        .append(&NewEvent::file(
            EventKind::Deleted,
            list.to_string_lossy(),
            "",
            now,
        ))
        .await
        .unwrap();

    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(256));
    let (indexer, _) = Indexer::new(
        Arc::clone(&f.events),
        Arc::clone(&f.index),
        Arc::clone(&embedder),
        indexer_config(),
        Duration::from_secs(5),
    );
    assert_eq!(indexer.drain().await.unwrap(), 3);

    let engine = RetrievalEngine::new(
        Arc::clone(&f.events),
        Arc::clone(&f.index),
        embedder,
        0.5,
        Duration::from_secs(5),
    );
    let results = engine
        .retrieve_at("forecast hiring", &RetrievalFilter::default(), 3, now)
        .await
        .unwrap();
    match &results[0].item {
        ContextItem::Event(e) => assert_eq!(e.subject.location(), plan.to_string_lossy()),
        other => panic!("expected event, got {:?}", other),
    }
    assert_eq!(
        results[0].excerpt.as_deref(),
        Some("The quarterly forecast assumes steady hiring.")
    );
    // Deletions carry no content
    let deleted = results
        .iter()
        .find(|r| matches!(&r.item, ContextItem::Event(e) if e.kind == EventKind::Deleted))
        .unwrap();
    assert!(deleted.excerpt.is_none());
}

#[tokio::test]
async fn vector_index_ranks_exactly_like_the_table_scan() {
    let f = fixture().await;
    let now = Utc::now();
    let words = ["parser", "lexer", "budget", "notes", "deploy", "schema", "docs"];
    for i in 0..400i64 {
        let dir = if i % 3 == 0 { "a" } else { "b" };
        let name = format!(
            "/proj/{}/{}_{}_{}.rs",
            dir,
            words[(i % 7) as usize],
            words[(i / 7 % 7) as usize],
            i
        );
        f.events
            .append(&NewEvent::file(
                EventKind::Modified,
                name,
                "",
                now - ChronoDuration::hours(i),
            ))
            .await
            .unwrap();
    }
    for i in 0..20i64 {
        f.events
            .append(&NewEvent::commit(
                "/proj",
                format!("hash{}", i),
                format!("{} cleanup {}", words[(i % 7) as usize], i),
                None,
                now - ChronoDuration::hours(3 * i),
            ))
            .await
            .unwrap();
    }

    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(32));
    let (indexer, _) = Indexer::new(
        Arc::clone(&f.events),
        Arc::clone(&f.index),
        Arc::clone(&embedder),
        indexer_config(),
        Duration::from_secs(5),
    );
    assert_eq!(indexer.drain().await.unwrap(), 420);

    let engine = |threshold: usize| {
        RetrievalEngine::new(
            Arc::clone(&f.events),
            Arc::clone(&f.index),
            Arc::clone(&embedder),
            0.5,
            Duration::from_secs(5),
        )
        .with_exact_scan_below(threshold)
    };
    let scan = engine(usize::MAX);
    let indexed = engine(0);

    let filters = [
        RetrievalFilter::default(),
        RetrievalFilter::today(now),
        RetrievalFilter {
            subject_prefix: Some("/proj/a".into()),
            ..Default::default()
        },
        RetrievalFilter {
            source: Some("git".into()),
            ..Default::default()
        },
    ];
    let ranked = |results: Vec<activity_memory::retrieval::ScoredItem>| -> Vec<(ItemRef, f64)> {
        results
            .into_iter()
            .map(|r| (r.item.item_ref(), r.score))
            .collect()
    };
    for query in ["parser lexer", "budget", "deploy schema docs"] {
        for filter in &filters {
            for k in [1, 10, 50] {
                let expected = ranked(scan.retrieve_at(query, filter, k, now).await.unwrap());
                let actual = ranked(indexed.retrieve_at(query, filter, k, now).await.unwrap());
                assert_eq!(actual, expected, "query {:?} filter {:?} k {}", query, filter, k);
            }
        }
    }

    // Entries indexed after the first search are picked up
    f.events
        .append(&NewEvent::file(
            EventKind::Created,
            "/proj/a/zebra_zebra.rs",
            "",
            now,
        ))
        .await
        .unwrap();
    assert_eq!(indexer.drain().await.unwrap(), 1);
    let top = indexed
        .retrieve_at("zebra", &RetrievalFilter::default(), 1, now)
        .await
        .unwrap();
    match &top[0].item {
        ContextItem::Event(e) => assert_eq!(e.subject.location(), "/proj/a/zebra_zebra.rs"),
        other => panic!("expected event, got {:?}", other),
    }
}

#[tokio::test]
async fn reindexing_does_not_duplicate_entries() {
    let f = fixture().await;
    for i in 0..6 {
        f.events
            .append(&NewEvent::commit(
                "/repo",
                format!("hash{}", i),
                format!("commit {}", i),
                None,
                Utc::now(),
            ))
            .await
            .unwrap();
    }
    f.events.add_note("", "remember the migration").await.unwrap();

    let embedder = Arc::new(HashEmbedder::new(64));
    let (indexer, _) = Indexer::new(
        Arc::clone(&f.events),
        Arc::clone(&f.index),
        embedder,
        indexer_config(),
        Duration::from_secs(5),
    );
    assert_eq!(indexer.drain().await.unwrap(), 7);
    assert_eq!(f.index.cursor(EVENTS_STREAM).await.unwrap(), 6);

    // Crash between embedding and cursor update: the batch is replayed
    f.index.set_cursor(EVENTS_STREAM, 2).await.unwrap();
    assert_eq!(indexer.drain().await.unwrap(), 4);
    assert_eq!(f.index.count_entries().await.unwrap(), 7);
}

#[tokio::test]
async fn embedding_outage_degrades_then_recovers() {
    let f = fixture().await;
    let embedder = Arc::new(FlakyEmbedder::new(false));
    let (indexer, handle) = Indexer::new(
        Arc::clone(&f.events),
        Arc::clone(&f.index),
        Arc::clone(&embedder) as Arc<dyn Embedder>,
        indexer_config(),
        Duration::from_secs(5),
    );
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(indexer.run(shutdown.clone()));

    f.events
        .append(&NewEvent::file(EventKind::Created, "/proj/a.rs", "", Utc::now()))
        .await
        .unwrap();

    let mut status = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(10), status.wait_for(|s| s.is_degraded()))
        .await
        .expect("indexer never degraded")
        .unwrap();
    let degraded_calls = embedder.calls.load(Ordering::SeqCst);
    assert_eq!(degraded_calls, 3);

    // Events keep flowing while degraded; the indexer stays parked
    f.events
        .append(&NewEvent::file(EventKind::Created, "/proj/b.rs", "", Utc::now()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(embedder.calls.load(Ordering::SeqCst), degraded_calls);
    assert_eq!(f.index.count_entries().await.unwrap(), 0);

    let stored = f.index.load_status().await.unwrap().unwrap();
    assert_eq!(stored.state, IndexerState::Degraded.as_str());
    assert_eq!(stored.consecutive_failures, 3);
    assert_eq!(stored.last_error.as_deref(), Some("connection refused"));

    embedder.set_up(true);
    handle.reset();
    tokio::time::timeout(
        Duration::from_secs(10),
        status.wait_for(|s| s.state == IndexerState::Idle && s.consecutive_failures == 0),
    )
    .await
    .expect("indexer never recovered")
    .unwrap();
    assert_eq!(f.index.count_entries().await.unwrap(), 2);

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn reset_while_healthy_does_not_cut_degraded_short() {
    let f = fixture().await;
    let embedder = Arc::new(FlakyEmbedder::new(false));
    let (indexer, handle) = Indexer::new(
        Arc::clone(&f.events),
        Arc::clone(&f.index),
        Arc::clone(&embedder) as Arc<dyn Embedder>,
        indexer_config(),
        Duration::from_secs(5),
    );
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(indexer.run(shutdown.clone()));

    // Nothing to index yet: the indexer is idle and healthy
    let mut status = handle.subscribe();
    tokio::time::timeout(
        Duration::from_secs(10),
        status.wait_for(|s| s.state == IndexerState::Idle),
    )
    .await
    .unwrap()
    .unwrap();
    handle.reset();

    f.events
        .append(&NewEvent::file(EventKind::Created, "/proj/a.rs", "", Utc::now()))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), status.wait_for(|s| s.is_degraded()))
        .await
        .expect("indexer never degraded")
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(handle.status().is_degraded());
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn ask_falls_back_to_recent_activity_when_embeddings_are_down() {
    let f = fixture().await;
    for name in ["old.rs", "mid.rs", "new.rs"] {
        f.events
            .append(&NewEvent::file(
                EventKind::Modified,
                format!("/proj/{}", name),
                "",
                Utc::now(),
            ))
            .await
            .unwrap();
    }

    let engine = RetrievalEngine::new(
        Arc::clone(&f.events),
        Arc::clone(&f.index),
        Arc::new(FlakyEmbedder::new(false)),
        0.5,
        Duration::from_secs(5),
    );
    assert!(engine
        .retrieve("what changed?", &RetrievalFilter::default(), 2)
        .await
        .is_err());

    let bundle = gather_context(&engine, "what changed?", &RetrievalFilter::default(), 2, false)
        .await
        .unwrap();
    assert!(bundle.stale);
    assert!(bundle.recency_fallback);
    assert_eq!(bundle.items.len(), 2);
    match &bundle.items[0].item {
        ContextItem::Event(e) => assert_eq!(e.subject.location(), "/proj/new.rs"),
        other => panic!("expected event, got {:?}", other),
    }

    let prompt = build_prompt("what changed?", &bundle);
    assert!(prompt.contains("Warning: the memory index is behind"));
    assert!(prompt.contains("/proj/mid.rs"));
    assert!(!prompt.contains("/proj/old.rs"));
}
