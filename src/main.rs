//! # Activity Memory CLI (`amem`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `amem init` | Create both databases and their schemas |
//! | `amem watch` | Record file changes and commits, index continuously |
//! | `amem poll-git` | Record new commits once and exit |
//! | `amem index` | Embed everything not yet indexed |
//! | `amem events` | List recorded events |
//! | `amem note add` | Record a free-text note |
//! | `amem search "<query>"` | Show ranked context for a query |
//! | `amem ask "<question>"` | Answer a question from recorded activity |
//! | `amem status` | Event counts and indexer state |
//! | `amem completions <shell>` | Print a shell completion script |

use std::path::PathBuf;

use activity_memory::commands::{self, FilterArgs};
use activity_memory::{config, logging};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

/// Activity Memory: a private, searchable memory of your file and git activity.
///
/// All commands accept `--config` pointing to a TOML file; a missing file
/// means defaults. Environment variables (WATCH_PATHS, GIT_WATCH_PATHS,
/// EXCLUDE_PATTERNS, DEBOUNCE_SEC, EVENT_DB, VECTOR_DB, GIT_AUTO_DISCOVER,
/// LLM_BACKEND) override the file.
#[derive(Parser)]
#[command(name = "amem", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/amem.toml")]
    config: PathBuf,

    /// Debug-level logging for this crate (RUST_LOG takes precedence).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the event and vector databases. Idempotent.
    Init,

    /// Watch files and repositories, recording and indexing until Ctrl-C.
    Watch,

    /// Record new commits from the configured repositories once.
    PollGit,

    /// Embed all events and notes not yet in the index.
    Index {
        /// Re-embed every item from the start of the log.
        #[arg(long)]
        rebuild: bool,
    },

    /// List recorded events, oldest first.
    Events {
        #[command(flatten)]
        filter: FilterOpts,

        /// Only these kinds (CREATED, MODIFIED, DELETED, RENAMED, COMMIT).
        #[arg(long = "kind")]
        kinds: Vec<String>,

        /// Show at most this many of the newest matching events.
        #[arg(long, default_value_t = 50)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Manage notes.
    Note {
        #[command(subcommand)]
        action: NoteAction,
    },

    /// Show the context retrieved for a query, with scores.
    Search {
        query: String,

        #[command(flatten)]
        filter: FilterOpts,

        /// Number of results (defaults to retrieval.top_k).
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Answer a question using recorded activity as context.
    Ask {
        question: String,

        #[command(flatten)]
        filter: FilterOpts,

        /// Number of context items (defaults to retrieval.top_k).
        #[arg(long)]
        limit: Option<usize>,

        /// Print the assembled prompt to stderr.
        #[arg(long)]
        show_prompt: bool,
    },

    /// Show event counts, index coverage, and indexer state.
    Status,

    /// Print a shell completion script.
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum NoteAction {
    /// Record a note; it is indexed and retrieved like any event.
    Add {
        body: String,

        #[arg(long)]
        title: Option<String>,
    },
}

#[derive(Args)]
struct FilterOpts {
    /// Only activity from today (local time).
    #[arg(long)]
    today: bool,

    /// Start of range: YYYY-MM-DD (local) or RFC 3339.
    #[arg(long)]
    since: Option<String>,

    /// End of range, exclusive.
    #[arg(long)]
    until: Option<String>,

    /// filesystem, git, or note.
    #[arg(long)]
    source: Option<String>,

    /// Only subjects (paths or repositories) starting with this prefix.
    #[arg(long)]
    prefix: Option<String>,
}

impl From<FilterOpts> for FilterArgs {
    fn from(o: FilterOpts) -> Self {
        FilterArgs {
            today: o.today,
            since: o.since,
            until: o.until,
            source: o.source,
            prefix: o.prefix,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "amem", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Watch => commands::run_watch(&cfg).await?,
        Commands::PollGit => commands::run_poll_git(&cfg).await?,
        Commands::Index { rebuild } => commands::run_index(&cfg, rebuild).await?,
        Commands::Events {
            filter,
            kinds,
            limit,
            json,
        } => commands::run_events(&cfg, &filter.into(), &kinds, limit, json).await?,
        Commands::Note { action } => match action {
            NoteAction::Add { body, title } => commands::run_note_add(&cfg, title, &body).await?,
        },
        Commands::Search {
            query,
            filter,
            limit,
            json,
        } => commands::run_search(&cfg, &query, &filter.into(), limit, json).await?,
        Commands::Ask {
            question,
            filter,
            limit,
            show_prompt,
        } => commands::run_ask(&cfg, &question, &filter.into(), limit, show_prompt).await?,
        Commands::Status => commands::run_status(&cfg).await?,
        Commands::Completions { .. } => unreachable!("handled before config loading"),
    }

    Ok(())
}
