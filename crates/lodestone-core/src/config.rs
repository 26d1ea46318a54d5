use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::LodestoneError;

/// Top-level configuration loaded from `.lodestone.toml`.
///
/// Supports layered resolution: CLI flags > env vars > local config > defaults.
///
/// # Examples
///
/// ```
/// use lodestone_core::LodestoneConfig;
///
/// let config = LodestoneConfig::default();
/// assert_eq!(config.store.busy_timeout_ms, 5000);
/// assert_eq!(config.query.default_k, 5);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LodestoneConfig {
    /// Persistent store settings.
    #[serde(default)]
    pub store: StoreConfig,
    /// Embedding backends used for dense retrieval.
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Chat-completions backend used by the listwise rerank fallback.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Reranking behavior.
    #[serde(default)]
    pub rerank: RerankConfig,
    /// Passage splitting limits.
    #[serde(default)]
    pub chunking: ChunkingConfig,
    /// Query pipeline sizing.
    #[serde(default)]
    pub query: QueryConfig,
    /// Answer cache behavior.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl LodestoneConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::Io`] if the file cannot be read, or
    /// [`LodestoneError::Toml`] if the content is not valid TOML.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use lodestone_core::LodestoneConfig;
    /// use std::path::Path;
    ///
    /// let config = LodestoneConfig::from_file(Path::new(".lodestone.toml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, LodestoneError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::Toml`] if parsing fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use lodestone_core::LodestoneConfig;
    ///
    /// let toml = r#"
    /// [query]
    /// default_k = 8
    /// "#;
    /// let config = LodestoneConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.query.default_k, 8);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, LodestoneError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides (`LODESTONE_DB`, `OPENAI_API_KEY`).
    ///
    /// Values already present in the file take precedence over the API key
    /// variable; `LODESTONE_DB` always wins over the file.
    pub fn apply_env(&mut self) {
        if let Ok(db) = std::env::var("LODESTONE_DB") {
            if !db.is_empty() {
                self.store.path = PathBuf::from(db);
            }
        }
        if self.embedding.api_key.is_none() {
            self.embedding.api_key = std::env::var("OPENAI_API_KEY").ok();
        }
        if self.llm.api_key.is_none() {
            self.llm.api_key = std::env::var("OPENAI_API_KEY").ok();
        }
    }

    fn validate(&self) -> Result<(), LodestoneError> {
        if self.store.retry.max_attempts == 0 {
            return Err(LodestoneError::Config(
                "store.retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.store.retry.multiplier < 1.0 {
            return Err(LodestoneError::Config(
                "store.retry.multiplier must be >= 1.0".into(),
            ));
        }
        if self.rerank.llm_window == 0 || self.rerank.llm_window > MAX_LLM_WINDOW {
            return Err(LodestoneError::Config(format!(
                "rerank.llm_window must be between 1 and {MAX_LLM_WINDOW}"
            )));
        }
        if self.embedding.hash_dimensions == 0 {
            return Err(LodestoneError::Config(
                "embedding.hash_dimensions must be positive".into(),
            ));
        }
        let hash = self.embedding.hash_dimensions;
        if hash == LOCAL_SMALL_DIM
            || hash == LOCAL_BASE_DIM
            || self.embedding.remote_dimensions.contains(&hash)
        {
            return Err(LodestoneError::Config(format!(
                "embedding.hash_dimensions = {hash} collides with a model embedding width; \
                 the index width selects the query backend"
            )));
        }
        Ok(())
    }
}

/// Upper bound on passages sent to the LLM listwise reranker.
pub const MAX_LLM_WINDOW: usize = 25;

/// Persistent store configuration.
///
/// # Examples
///
/// ```
/// use lodestone_core::StoreConfig;
///
/// let config = StoreConfig::default();
/// assert_eq!(config.path.to_str(), Some(".lodestone/index.db"));
/// assert_eq!(config.retry.max_attempts, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file (default: `.lodestone/index.db`).
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// SQLite busy timeout in milliseconds (default: 5000).
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Backoff applied to connection acquisition and commits.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".lodestone/index.db")
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }
}

/// Exponential backoff with jitter for store contention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts before giving up with `StorageBusy` (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds (default: 50).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor applied per attempt (default: 2.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound of the uniform jitter added to each delay (default: 25).
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_jitter_ms() -> u64 {
    25
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_jitter_ms: default_max_jitter_ms(),
        }
    }
}

/// Which embedder to use when ingesting into an empty index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestBackend {
    /// Remote when an API key is configured, hashing fallback otherwise.
    #[default]
    Auto,
    /// Always the remote API.
    Remote,
    /// The small local model.
    Local,
    /// The deterministic hashing embedder.
    Hash,
}

/// Embedding backends and the dimension ranges that select them.
///
/// # Examples
///
/// ```
/// use lodestone_core::EmbeddingConfig;
///
/// let config = EmbeddingConfig::default();
/// assert_eq!(config.remote_model, "text-embedding-3-small");
/// assert_eq!(config.remote_dimensions, vec![1536, 3072]);
/// assert_eq!(config.hash_dimensions, 256);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// API key for the remote OpenAI-compatible provider.
    pub api_key: Option<String>,
    /// Base URL of the remote provider (default: `https://api.openai.com/v1`).
    #[serde(default = "default_remote_base_url")]
    pub base_url: String,
    /// Remote model for 1536-wide indexes.
    #[serde(default = "default_remote_model")]
    pub remote_model: String,
    /// Remote model for 3072-wide indexes.
    #[serde(default = "default_remote_large_model")]
    pub remote_large_model: String,
    /// Index widths served by the remote backend.
    #[serde(default = "default_remote_dimensions")]
    pub remote_dimensions: Vec<usize>,
    /// Base URL of the local Ollama-compatible server.
    #[serde(default = "default_local_base_url")]
    pub local_base_url: String,
    /// Local model producing 384-wide vectors.
    #[serde(default = "default_local_small_model")]
    pub local_small_model: String,
    /// Local model producing 768-wide vectors.
    #[serde(default = "default_local_base_model")]
    pub local_base_model: String,
    /// Width of the hashing fallback embedder (default: 256).
    #[serde(default = "default_hash_dimensions")]
    pub hash_dimensions: usize,
    /// Backend used when ingesting into an empty index.
    #[serde(default)]
    pub ingest_backend: IngestBackend,
    /// Request timeout for embedding calls in seconds (default: 30).
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

/// Width produced by [`EmbeddingConfig::local_small_model`].
pub const LOCAL_SMALL_DIM: usize = 384;
/// Width produced by [`EmbeddingConfig::local_base_model`].
pub const LOCAL_BASE_DIM: usize = 768;

fn default_remote_base_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_remote_model() -> String {
    "text-embedding-3-small".into()
}

fn default_remote_large_model() -> String {
    "text-embedding-3-large".into()
}

fn default_remote_dimensions() -> Vec<usize> {
    vec![1536, 3072]
}

fn default_local_base_url() -> String {
    "http://localhost:11434".into()
}

fn default_local_small_model() -> String {
    "all-minilm".into()
}

fn default_local_base_model() -> String {
    "nomic-embed-text".into()
}

fn default_hash_dimensions() -> usize {
    256
}

fn default_embedding_timeout_secs() -> u64 {
    30
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_remote_base_url(),
            remote_model: default_remote_model(),
            remote_large_model: default_remote_large_model(),
            remote_dimensions: default_remote_dimensions(),
            local_base_url: default_local_base_url(),
            local_small_model: default_local_small_model(),
            local_base_model: default_local_base_model(),
            hash_dimensions: default_hash_dimensions(),
            ingest_backend: IngestBackend::default(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

/// LLM provider configuration.
///
/// # Examples
///
/// ```
/// use lodestone_core::LlmConfig;
///
/// let config = LlmConfig::default();
/// assert_eq!(config.model, "gpt-4o-mini");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model identifier.
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// API key for the provider.
    pub api_key: Option<String>,
    /// Custom base URL for API requests.
    pub base_url: Option<String>,
    /// Request timeout in seconds (default: 60).
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_llm_model() -> String {
    "gpt-4o-mini".into()
}

fn default_llm_timeout_secs() -> u64 {
    60
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_llm_model(),
            api_key: None,
            base_url: None,
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

/// Reranking configuration.
///
/// # Examples
///
/// ```
/// use lodestone_core::RerankConfig;
///
/// let config = RerankConfig::default();
/// assert!(config.cross_encoder_url.is_none());
/// assert_eq!(config.llm_window, 20);
/// assert!(!config.llm_fallback);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    /// Base URL of a TEI-compatible `/rerank` endpoint serving the cross-encoder.
    pub cross_encoder_url: Option<String>,
    /// Cross-encoder model name sent with each request.
    #[serde(default = "default_cross_encoder_model")]
    pub cross_encoder_model: String,
    /// Enable the LLM listwise fallback (requires `[llm]` credentials).
    #[serde(default)]
    pub llm_fallback: bool,
    /// Passages sent to the LLM fallback, at most 25 (default: 20).
    #[serde(default = "default_llm_window")]
    pub llm_window: usize,
    /// Fused candidates handed to the reranker (default: 50).
    #[serde(default = "default_rerank_pool")]
    pub pool: usize,
}

fn default_cross_encoder_model() -> String {
    "BAAI/bge-reranker-base".into()
}

fn default_llm_window() -> usize {
    20
}

fn default_rerank_pool() -> usize {
    50
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            cross_encoder_url: None,
            cross_encoder_model: default_cross_encoder_model(),
            llm_fallback: false,
            llm_window: default_llm_window(),
            pool: default_rerank_pool(),
        }
    }
}

/// Passage splitting limits, in characters.
///
/// # Examples
///
/// ```
/// use lodestone_core::ChunkingConfig;
///
/// let config = ChunkingConfig::default();
/// assert_eq!(config.markdown_max_chars, 1500);
/// assert_eq!(config.code_max_chars, 1400);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Hard-wrap width for markdown sections (default: 1500).
    #[serde(default = "default_markdown_max_chars")]
    pub markdown_max_chars: usize,
    /// Packing and hard-wrap width for source code (default: 1400).
    #[serde(default = "default_code_max_chars")]
    pub code_max_chars: usize,
    /// Leading window kept for plain text (default: 2000).
    #[serde(default = "default_text_window_chars")]
    pub text_window_chars: usize,
}

fn default_markdown_max_chars() -> usize {
    1500
}

fn default_code_max_chars() -> usize {
    1400
}

fn default_text_window_chars() -> usize {
    2000
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            markdown_max_chars: default_markdown_max_chars(),
            code_max_chars: default_code_max_chars(),
            text_window_chars: default_text_window_chars(),
        }
    }
}

/// Query pipeline sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Matches returned when the caller does not specify `k` (default: 5).
    #[serde(default = "default_k")]
    pub default_k: usize,
    /// Recall depth per search as a multiple of `k` (default: 4).
    #[serde(default = "default_recall_multiplier")]
    pub recall_multiplier: usize,
    /// Minimum recall depth per search (default: 20).
    #[serde(default = "default_min_recall")]
    pub min_recall: usize,
    /// Maximum snippet length in characters (default: 480).
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
}

fn default_k() -> usize {
    5
}

fn default_recall_multiplier() -> usize {
    4
}

fn default_min_recall() -> usize {
    20
}

fn default_snippet_chars() -> usize {
    480
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            recall_multiplier: default_recall_multiplier(),
            min_recall: default_min_recall(),
            snippet_chars: default_snippet_chars(),
        }
    }
}

impl QueryConfig {
    /// Candidates fetched from each recall stage for a request of `k` matches.
    ///
    /// # Examples
    ///
    /// ```
    /// use lodestone_core::QueryConfig;
    ///
    /// let config = QueryConfig::default();
    /// assert_eq!(config.recall_depth(2), 20);
    /// assert_eq!(config.recall_depth(10), 40);
    /// ```
    pub fn recall_depth(&self, k: usize) -> usize {
        k.saturating_mul(self.recall_multiplier).max(self.min_recall)
    }
}

/// Answer cache behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Memoize query responses (default: true).
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    /// Entries older than this many seconds are treated as misses.
    pub ttl_secs: Option<u64>,
}

fn default_cache_enabled() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            ttl_secs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = LodestoneConfig::default();
        assert_eq!(config.store.busy_timeout_ms, 5000);
        assert_eq!(config.store.retry.max_attempts, 5);
        assert_eq!(config.store.retry.multiplier, 2.0);
        assert_eq!(config.embedding.local_small_model, "all-minilm");
        assert_eq!(config.embedding.ingest_backend, IngestBackend::Auto);
        assert_eq!(config.chunking.text_window_chars, 2000);
        assert_eq!(config.query.snippet_chars, 480);
        assert!(config.cache.enabled);
        assert!(config.cache.ttl_secs.is_none());
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
[store]
path = "/var/lib/lodestone/index.db"
busy_timeout_ms = 2000

[store.retry]
max_attempts = 3
base_delay_ms = 10

[embedding]
ingest_backend = "hash"
hash_dimensions = 128

[rerank]
cross_encoder_url = "http://localhost:8080"
llm_fallback = true
llm_window = 10

[cache]
ttl_secs = 3600
"#;
        let config = LodestoneConfig::from_toml(toml).unwrap();
        assert_eq!(config.store.path, PathBuf::from("/var/lib/lodestone/index.db"));
        assert_eq!(config.store.retry.max_attempts, 3);
        assert_eq!(config.store.retry.max_jitter_ms, 25);
        assert_eq!(config.embedding.ingest_backend, IngestBackend::Hash);
        assert_eq!(config.embedding.hash_dimensions, 128);
        assert_eq!(
            config.rerank.cross_encoder_url.as_deref(),
            Some("http://localhost:8080")
        );
        assert!(config.rerank.llm_fallback);
        assert_eq!(config.cache.ttl_secs, Some(3600));
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = LodestoneConfig::from_toml("").unwrap();
        assert_eq!(config.query.default_k, 5);
        assert_eq!(config.llm.model, "gpt-4o-mini");
    }

    #[test]
    fn invalid_toml_returns_error() {
        assert!(LodestoneConfig::from_toml("{{invalid}}").is_err());
    }

    #[test]
    fn oversized_llm_window_is_rejected() {
        let err = LodestoneConfig::from_toml("[rerank]\nllm_window = 40\n").unwrap_err();
        assert!(err.to_string().contains("llm_window"), "{err}");
    }

    #[test]
    fn zero_retry_attempts_is_rejected() {
        let err =
            LodestoneConfig::from_toml("[store.retry]\nmax_attempts = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_attempts"), "{err}");
    }

    #[test]
    fn hash_width_must_not_match_a_model_width() {
        for width in [384, 768, 1536, 3072] {
            let toml = format!("[embedding]\nhash_dimensions = {width}\n");
            let err = LodestoneConfig::from_toml(&toml).unwrap_err();
            assert!(err.to_string().contains("hash_dimensions"), "{err}");
        }

        let toml = "[embedding]\nhash_dimensions = 1536\nremote_dimensions = [1024]\n";
        assert!(LodestoneConfig::from_toml(toml).is_ok());
    }
}
