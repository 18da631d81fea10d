use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// Event log (events + notes).
    #[serde(default = "default_events_db")]
    pub events: PathBuf,
    /// Index entries, cursors, and indexer status.
    #[serde(default = "default_vectors_db")]
    pub vectors: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            events: default_events_db(),
            vectors: default_vectors_db(),
        }
    }
}

fn default_events_db() -> PathBuf {
    PathBuf::from("./data/events.db")
}
fn default_vectors_db() -> PathBuf {
    PathBuf::from("./data/memory_vectors.db")
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Path segments (`node_modules`) or globs (`**/*.tmp`) to ignore.
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: f64,
    /// Defaults to the debounce interval.
    #[serde(default)]
    pub dedup_window_secs: Option<f64>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How often roots that could not be watched are retried.
    #[serde(default = "default_rescan_secs")]
    pub rescan_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            exclude: Vec::new(),
            debounce_secs: default_debounce_secs(),
            dedup_window_secs: None,
            queue_capacity: default_queue_capacity(),
            rescan_secs: default_rescan_secs(),
        }
    }
}

fn default_debounce_secs() -> f64 {
    1.0
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_rescan_secs() -> u64 {
    30
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs_f64(self.debounce_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs_f64(self.dedup_window_secs.unwrap_or(self.debounce_secs))
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GitConfig {
    #[serde(default)]
    pub repos: Vec<PathBuf>,
    /// Discover repositories beneath `watch.paths`.
    #[serde(default)]
    pub auto_discover: bool,
    /// Defaults to the debounce interval.
    #[serde(default)]
    pub poll_secs: Option<f64>,
    /// Cap on commits recorded for a repository seen for the first time.
    #[serde(default)]
    pub initial_history_limit: Option<usize>,
}

impl GitConfig {
    pub fn poll_interval(&self, watch: &WatchConfig) -> Duration {
        Duration::from_secs_f64(self.poll_secs.unwrap_or(watch.debounce_secs))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Wake-up period when no "new data" signal arrives.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: f64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Embed the text of created, modified and renamed files along with
    /// their events.
    #[serde(default = "default_true")]
    pub index_content: bool,
    /// Files larger than this are indexed by path only.
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: u64,
    #[serde(default = "default_max_content_chunks")]
    pub max_content_chunks: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            interval_secs: default_interval_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_secs: default_backoff_max_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            index_content: true,
            max_content_bytes: default_max_content_bytes(),
            max_content_chunks: default_max_content_chunks(),
        }
    }
}

fn default_batch_size() -> usize {
    32
}
fn default_interval_secs() -> f64 {
    5.0
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_secs() -> u64 {
    60
}
fn default_max_consecutive_failures() -> u32 {
    5
}
fn default_true() -> bool {
    true
}
fn default_max_content_bytes() -> u64 {
    4 * 1024 * 1024
}
fn default_max_content_chunks() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    /// Below this many index entries, search scans the index table
    /// directly instead of loading the in-memory vector index.
    #[serde(default = "default_exact_scan_below")]
    pub exact_scan_below: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            recency_weight: default_recency_weight(),
            exact_scan_below: default_exact_scan_below(),
        }
    }
}

fn default_top_k() -> usize {
    8
}
fn default_recency_weight() -> f64 {
    0.5
}
fn default_exact_scan_below() -> usize {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: None,
            url: None,
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_provider() -> String {
    "stub".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}

/// Load configuration from `path`, falling back to defaults when the file
/// does not exist, then apply environment overrides and validate.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

/// Apply the recognised environment options on top of `config`.
///
/// `lookup` resolves a variable name to its value; list-valued options are
/// comma separated.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("WATCH_PATHS") {
        config.watch.paths = split_list(&v).into_iter().map(PathBuf::from).collect();
    }
    if let Some(v) = lookup("GIT_WATCH_PATHS") {
        config.git.repos = split_list(&v).into_iter().map(PathBuf::from).collect();
    }
    if let Some(v) = lookup("EXCLUDE_PATTERNS") {
        config.watch.exclude = split_list(&v);
    }
    if let Some(v) = lookup("DEBOUNCE_SEC") {
        config.watch.debounce_secs = v
            .trim()
            .parse()
            .with_context(|| format!("DEBOUNCE_SEC is not a number: '{}'", v))?;
    }
    if let Some(v) = lookup("EVENT_DB") {
        config.db.events = PathBuf::from(v.trim());
    }
    if let Some(v) = lookup("VECTOR_DB") {
        config.db.vectors = PathBuf::from(v.trim());
    }
    if let Some(v) = lookup("GIT_AUTO_DISCOVER") {
        config.git.auto_discover = v.trim().eq_ignore_ascii_case("true");
    }
    if let Some(v) = lookup("LLM_BACKEND") {
        if !v.trim().is_empty() {
            config.llm.provider = v.trim().to_ascii_lowercase();
        }
    }
    Ok(())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Durations are built with `Duration::from_secs_f64`, which panics on
/// non-finite input, so every seconds value must be finite.
fn check_secs(name: &str, value: f64, allow_zero: bool) -> Result<()> {
    if !value.is_finite() {
        bail!("{} must be a finite number of seconds", name);
    }
    if allow_zero && value < 0.0 {
        bail!("{} must be >= 0", name);
    }
    if !allow_zero && value <= 0.0 {
        bail!("{} must be > 0", name);
    }
    Ok(())
}

pub fn validate(config: &Config) -> Result<()> {
    check_secs("watch.debounce_secs", config.watch.debounce_secs, false)?;
    if let Some(w) = config.watch.dedup_window_secs {
        check_secs("watch.dedup_window_secs", w, true)?;
    }
    if config.watch.queue_capacity == 0 {
        bail!("watch.queue_capacity must be > 0");
    }
    if let Some(p) = config.git.poll_secs {
        check_secs("git.poll_secs", p, false)?;
    }

    if config.indexer.batch_size == 0 {
        bail!("indexer.batch_size must be > 0");
    }
    check_secs("indexer.interval_secs", config.indexer.interval_secs, false)?;
    if config.indexer.max_consecutive_failures == 0 {
        bail!("indexer.max_consecutive_failures must be >= 1");
    }
    if config.indexer.max_content_chunks == 0 {
        bail!("indexer.max_content_chunks must be >= 1");
    }

    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    let recency = config.retrieval.recency_weight;
    if !recency.is_finite() || recency < 0.0 {
        bail!("retrieval.recency_weight must be a finite number >= 0");
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, ollama, openai, or local.",
            other
        ),
    }

    match config.llm.provider.as_str() {
        "stub" | "ollama" | "openai" => {}
        other => bail!(
            "Unknown llm provider: '{}'. Must be stub, ollama, or openai.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        validate(&config).unwrap();
        assert_eq!(config.watch.dedup_window(), config.watch.debounce());
        assert_eq!(config.git.poll_interval(&config.watch), config.watch.debounce());
    }

    #[test]
    fn env_lists_are_split_and_trimmed() {
        let mut config = Config::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("WATCH_PATHS", " /proj , ,/notes"),
                ("EXCLUDE_PATTERNS", "node_modules,*.swp"),
                ("DEBOUNCE_SEC", "0.4"),
                ("EVENT_DB", "/tmp/e.db"),
            ]),
        )
        .unwrap();

        assert_eq!(
            config.watch.paths,
            vec![PathBuf::from("/proj"), PathBuf::from("/notes")]
        );
        assert_eq!(config.watch.exclude, vec!["node_modules", "*.swp"]);
        assert!((config.watch.debounce_secs - 0.4).abs() < 1e-9);
        assert_eq!(config.db.events, PathBuf::from("/tmp/e.db"));
    }

    #[test]
    fn bad_debounce_is_rejected() {
        let mut config = Config::default();
        assert!(apply_env_overrides(&mut config, env(&[("DEBOUNCE_SEC", "soon")])).is_err());

        config.watch.debounce_secs = 0.0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn non_finite_durations_are_rejected() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, env(&[("DEBOUNCE_SEC", "inf")])).unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("watch.debounce_secs"), "{}", err);

        let mut config = Config::default();
        config.watch.dedup_window_secs = Some(f64::NAN);
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.git.poll_secs = Some(f64::INFINITY);
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.indexer.interval_secs = f64::INFINITY;
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.watch.dedup_window_secs = Some(0.0);
        validate(&config).unwrap();
        assert_eq!(config.watch.dedup_window(), Duration::ZERO);
    }

    #[test]
    fn zero_embedding_dims_are_rejected_for_every_provider() {
        for provider in ["hash", "local", "ollama", "openai"] {
            let mut config = Config::default();
            config.embedding.provider = provider.into();
            config.embedding.model = Some("m".into());
            config.embedding.dims = Some(0);
            let err = validate(&config).unwrap_err();
            assert!(err.to_string().contains("embedding.dims"), "{}: {}", provider, err);
        }
    }

    #[test]
    fn network_embedding_requires_model_and_dims() {
        let mut config = Config::default();
        config.embedding.provider = "ollama".into();
        assert!(validate(&config).is_err());
        config.embedding.model = Some("nomic-embed-text".into());
        config.embedding.dims = Some(768);
        validate(&config).unwrap();
    }

    #[test]
    fn parses_toml_sections() {
        let config: Config = toml::from_str(
            r#"
            [db]
            events = "/data/ev.db"

            [watch]
            paths = ["/proj"]
            debounce_secs = 0.4

            [git]
            repos = ["/proj"]
            poll_secs = 10.0

            [retrieval]
            top_k = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.db.events, PathBuf::from("/data/ev.db"));
        assert_eq!(config.db.vectors, default_vectors_db());
        assert_eq!(config.retrieval.top_k, 3);
        assert_eq!(
            config.git.poll_interval(&config.watch),
            Duration::from_secs(10)
        );
        validate(&config).unwrap();
    }
}
