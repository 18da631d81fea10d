//! Long-running ingestion service: watchers plus indexer.
//!
//! Each component runs as its own task and shares only the stores. A
//! [`CancellationToken`] stops them all; the change watcher flushes its
//! pending debounce slots before exiting.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::event_store::EventStore;
use crate::index_store::IndexStore;
use crate::indexer::{Indexer, IndexerHandle};
use crate::watch_fs::ChangeWatcher;
use crate::watch_git::CommitWatcher;

/// Stores opened from a configuration.
pub struct Stores {
    pub events: Arc<EventStore>,
    pub index: Arc<IndexStore>,
}

impl Stores {
    pub async fn open(config: &Config) -> Result<Self> {
        let events = EventStore::open(&config.db.events, config.watch.dedup_window())
            .await
            .with_context(|| format!("Failed to open event log {}", config.db.events.display()))?;
        let index = IndexStore::open(&config.db.vectors)
            .await
            .with_context(|| format!("Failed to open index {}", config.db.vectors.display()))?;
        Ok(Self {
            events: Arc::new(events),
            index: Arc::new(index),
        })
    }
}

/// Handles to the running service.
pub struct Pipeline {
    tasks: JoinSet<Result<()>>,
    shutdown: CancellationToken,
    indexer: Option<IndexerHandle>,
}

impl Pipeline {
    /// Start every configured component.
    pub async fn start(config: &Config, stores: &Stores) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let watch_fs = !config.watch.paths.is_empty();
        let watch_git = !config.git.repos.is_empty() || config.git.auto_discover;
        if !watch_fs && !watch_git {
            bail!("Nothing to watch: set watch.paths or git.repos (or WATCH_PATHS / GIT_WATCH_PATHS)");
        }

        if watch_fs {
            let watcher = ChangeWatcher::new(Arc::clone(&stores.events), config)?;
            let token = shutdown.child_token();
            tasks.spawn(async move {
                let state = watcher.run(token).await?;
                info!(paths = state.tracked_paths(), "change watcher stopped");
                Ok(())
            });
        }

        if watch_git {
            let watcher = CommitWatcher::new(Arc::clone(&stores.events), config).await?;
            info!(repos = watcher.repos().len(), "tracking git repositories");
            let token = shutdown.child_token();
            tasks.spawn(async move {
                watcher.run(token).await;
                Ok(())
            });
        }

        let indexer = if config.embedding.is_enabled() {
            let embedder = create_embedder(&config.embedding)?;
            let (indexer, handle) = Indexer::new(
                Arc::clone(&stores.events),
                Arc::clone(&stores.index),
                embedder,
                config.indexer.clone(),
                config.embedding.timeout(),
            );
            let token = shutdown.child_token();
            tasks.spawn(async move {
                indexer.run(token).await;
                Ok(())
            });
            Some(handle)
        } else {
            info!("embedding disabled; events are recorded but not indexed");
            None
        };

        Ok(Self {
            tasks,
            shutdown,
            indexer,
        })
    }

    /// Run until `stop` resolves or a component fails, then stop everything.
    pub async fn run_until<F>(mut self, stop: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let mut failure = None;
        tokio::select! {
            _ = stop => info!("shutting down"),
            Some(joined) = self.tasks.join_next() => {
                failure = component_error(joined);
            }
        }

        if let Some(status) = self.indexer.as_ref().map(IndexerHandle::status) {
            if status.is_degraded() {
                warn!(
                    failures = status.consecutive_failures,
                    "indexer was degraded at shutdown; run `amem index` once the embedding backend is back"
                );
            }
        }

        self.shutdown.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Some(e) = component_error(joined) {
                error!(error = %e, "component failed during shutdown");
                failure.get_or_insert(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn component_error(
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> Option<anyhow::Error> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => Some(anyhow::anyhow!("component task panicked: {}", e)),
    }
}
