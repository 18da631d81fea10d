//! # Activity Memory
//!
//! A private, continuously-updated memory of what happened on this machine:
//! file changes and git commits are recorded as immutable events, embedded
//! into a local vector index, and retrieved as context for answering
//! questions like "what did I work on this morning?".
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  ┌──────────────┐
//! │ Change       │  │ Commit       │
//! │ Watcher (fs) │  │ Watcher (git)│
//! └──────┬───────┘  └──────┬───────┘
//!        │ append          │ append
//!        ▼                 ▼
//!     ┌─────────────────────────┐      ┌──────────┐      ┌────────────┐
//!     │ Event Store (events.db) │─────▶│ Indexer  │─────▶│ Index      │
//!     └─────────────────────────┘ pull └──────────┘      │ (vectors.db)│
//!                  ▲                                     └─────┬──────┘
//!                  │ hydrate                                   │ rank
//!                  └──────────── Retrieval Engine ◀────────────┘
//!                                      │
//!                                      ▼
//!                              prompt → generator
//! ```
//!
//! Watchers only append. The indexer and retrieval engine only read the
//! event log. The index is derived data and can be rebuilt from the log at
//! any time.
//!
//! ## Quick Start
//!
//! ```bash
//! amem init
//! WATCH_PATHS=~/src/proj GIT_WATCH_PATHS=~/src/proj amem watch
//! amem ask "what did I change in the parser today?" --today
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`models`] | Events, notes, index entries, filters |
//! | [`error`] | Error taxonomy |
//! | [`event_store`] | Append-only event log with dedup |
//! | [`debounce`] | Per-path debounce and coalescing |
//! | [`watch_fs`] | Filesystem change watcher |
//! | [`watch_git`] | Commit watcher |
//! | [`watch_state`] | Watcher resumption state |
//! | [`embedding`] | Embedding backends and vector utilities |
//! | [`content`] | Text, PDF and DOCX extraction, excerpts and chunks |
//! | [`index_store`] | Vector index persistence |
//! | [`indexer`] | Incremental indexer with backoff and degraded mode |
//! | [`vector_index`] | In-memory exact nearest-neighbour search |
//! | [`retrieval`] | Filtered, recency-weighted similarity search |
//! | [`prompt`] | Context gathering and prompt assembly |
//! | [`llm`] | Answer generation backends |
//! | [`pipeline`] | Long-running watch + index service |
//! | [`commands`] | CLI subcommands |
//! | [`db`] | SQLite connections |
//! | [`migrate`] | Schema creation |
//! | [`logging`] | `tracing` subscriber setup |

pub mod commands;
pub mod config;
pub mod content;
pub mod db;
pub mod debounce;
pub mod embedding;
pub mod error;
pub mod event_store;
pub mod index_store;
pub mod indexer;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod retrieval;
pub mod vector_index;
pub mod watch_fs;
pub mod watch_git;
pub mod watch_state;
