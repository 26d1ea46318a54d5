//! Embedding backends and the registry that selects between them.
//!
//! Three backends sit behind the [`Embedder`] trait:
//! - [`RemoteEmbedder`]: an OpenAI-compatible `/embeddings` API
//! - [`LocalEmbedder`]: an Ollama-compatible `/api/embed` server
//! - [`HashEmbedder`]: deterministic feature hashing, always available
//!
//! Which one serves a request is decided by [`select_backend`] from the
//! width of the vectors already stored, so queries always embed into the
//! same space as the index.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lodestone_core::{
    EmbedMode, EmbeddingConfig, IngestBackend, LodestoneError, LOCAL_BASE_DIM, LOCAL_SMALL_DIM,
};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

const REMOTE_BATCH_SIZE: usize = 64;
const LOCAL_BATCH_SIZE: usize = 32;
const REMOTE_LARGE_DIM: usize = 3072;

/// A text embedding backend.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Width of the vectors produced.
    fn dimensions(&self) -> usize;

    /// Embed `texts`, returning one vector per input in the same order.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::EmbedderUnavailable`] when the backend cannot
    /// produce vectors.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LodestoneError>;
}

/// A resolved backend: which path, which model, and at what width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendChoice {
    /// Retrieval path reported to callers.
    pub mode: EmbedMode,
    /// Model name, for the remote and local backends.
    pub model: Option<String>,
    /// Expected vector width.
    pub dimensions: usize,
}

impl BackendChoice {
    /// The hashing fallback at `dimensions`.
    pub fn hash(dimensions: usize) -> Self {
        Self {
            mode: EmbedMode::HashFallback,
            model: None,
            dimensions,
        }
    }
}

/// Pick the backend whose vectors match an index of width `index_dim`.
///
/// Widths listed in `remote_dimensions` go to the remote API (3072 uses the
/// large model), 384 and 768 go to the local small and base models, and
/// anything else, including an empty index, uses the hashing embedder.
///
/// # Examples
///
/// ```
/// use lodestone_core::{EmbedMode, EmbeddingConfig};
/// use lodestone_retrieval::embedding::select_backend;
///
/// let config = EmbeddingConfig::default();
/// assert_eq!(select_backend(Some(1536), &config).mode, EmbedMode::RemoteEmbedder);
/// assert_eq!(select_backend(Some(768), &config).mode, EmbedMode::LocalEmbedder);
/// assert_eq!(select_backend(None, &config).mode, EmbedMode::HashFallback);
/// ```
pub fn select_backend(index_dim: Option<usize>, config: &EmbeddingConfig) -> BackendChoice {
    match index_dim {
        Some(dim) if config.remote_dimensions.contains(&dim) => {
            let model = if dim == REMOTE_LARGE_DIM {
                &config.remote_large_model
            } else {
                &config.remote_model
            };
            BackendChoice {
                mode: EmbedMode::RemoteEmbedder,
                model: Some(model.clone()),
                dimensions: dim,
            }
        }
        Some(LOCAL_SMALL_DIM) => BackendChoice {
            mode: EmbedMode::LocalEmbedder,
            model: Some(config.local_small_model.clone()),
            dimensions: LOCAL_SMALL_DIM,
        },
        Some(LOCAL_BASE_DIM) => BackendChoice {
            mode: EmbedMode::LocalEmbedder,
            model: Some(config.local_base_model.clone()),
            dimensions: LOCAL_BASE_DIM,
        },
        Some(dim) => BackendChoice::hash(dim),
        None => BackendChoice::hash(config.hash_dimensions),
    }
}

/// Pick the backend for ingesting into an index with no vectors yet.
///
/// # Examples
///
/// ```
/// use lodestone_core::{EmbedMode, EmbeddingConfig, IngestBackend};
/// use lodestone_retrieval::embedding::ingest_backend;
///
/// let mut config = EmbeddingConfig::default();
/// assert_eq!(ingest_backend(&config).mode, EmbedMode::HashFallback);
///
/// config.api_key = Some("sk-test".into());
/// assert_eq!(ingest_backend(&config).dimensions, 1536);
///
/// config.ingest_backend = IngestBackend::Local;
/// assert_eq!(ingest_backend(&config).dimensions, 384);
/// ```
pub fn ingest_backend(config: &EmbeddingConfig) -> BackendChoice {
    let remote_dim = config.remote_dimensions.first().copied();
    match config.ingest_backend {
        IngestBackend::Auto if config.api_key.is_some() => {
            select_backend(remote_dim.or(Some(config.hash_dimensions)), config)
        }
        IngestBackend::Auto | IngestBackend::Hash => BackendChoice::hash(config.hash_dimensions),
        IngestBackend::Remote => select_backend(remote_dim.or(Some(config.hash_dimensions)), config),
        IngestBackend::Local => select_backend(Some(LOCAL_SMALL_DIM), config),
    }
}

/// Deterministic feature-hashing embedder.
///
/// Lowercased alphanumeric terms are hashed with FNV-1a into signed buckets,
/// weighted by term frequency, and the result is L2-normalized. Equal inputs
/// always yield equal vectors.
///
/// # Examples
///
/// ```
/// use lodestone_retrieval::embedding::HashEmbedder;
///
/// let embedder = HashEmbedder::new(64);
/// let a = embedder.embed_one("ledger reconciliation");
/// let b = embedder.embed_one("ledger reconciliation");
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    /// Create a hashing embedder producing `dimensions`-wide vectors.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn fnv1a(term: &str) -> u64 {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in term.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        h
    }

    /// Embed a single text synchronously.
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let terms = text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);

        for term in terms {
            let h = Self::fnv1a(&term);
            let bucket = (h % self.dimensions as u64) as usize;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        "hash"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LodestoneError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[derive(Serialize)]
struct RemoteRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct RemoteResponse {
    data: Vec<RemoteItem>,
}

#[derive(Deserialize)]
struct RemoteItem {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use lodestone_retrieval::embedding::{Embedder, RemoteEmbedder};
///
/// let client = RemoteEmbedder::new(
///     "https://api.openai.com/v1",
///     Some("sk-test"),
///     "text-embedding-3-small",
///     1536,
///     Duration::from_secs(30),
/// ).unwrap();
/// assert_eq!(client.dimensions(), 1536);
/// assert_eq!(client.model(), "text-embedding-3-small");
/// ```
pub struct RemoteEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

impl std::fmt::Debug for RemoteEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEmbedder")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

impl RemoteEmbedder {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::EmbedderUnavailable`] if the HTTP client
    /// cannot be built.
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        model: &str,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self, LodestoneError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LodestoneError::EmbedderUnavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(String::from),
            model: model.to_string(),
            dimensions,
        })
    }

    /// Create a client for `choice` from the `[embedding]` config section.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::EmbedderUnavailable`] if no API key is configured.
    pub fn with_config(config: &EmbeddingConfig, choice: &BackendChoice) -> Result<Self, LodestoneError> {
        let api_key = config.api_key.as_deref().ok_or_else(|| {
            LodestoneError::EmbedderUnavailable(
                "no embedding API key: set embedding.api_key in .lodestone.toml or OPENAI_API_KEY".into(),
            )
        })?;
        let model = choice.model.as_deref().unwrap_or(&config.remote_model);
        Self::new(
            &config.base_url,
            Some(api_key),
            model,
            choice.dimensions,
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, LodestoneError> {
        let request = RemoteRequest {
            model: &self.model,
            input: batch,
            dimensions: Some(self.dimensions),
        };

        let mut builder = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| LodestoneError::EmbedderUnavailable(format!("HTTP request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read response body".into());
            return Err(LodestoneError::EmbedderUnavailable(format!(
                "embedding API returned {status}: {body}"
            )));
        }

        let parsed: RemoteResponse = response.json().await.map_err(|e| {
            LodestoneError::EmbedderUnavailable(format!("failed to parse response: {e}"))
        })?;

        let mut items = parsed.data;
        items.sort_by_key(|item| item.index.unwrap_or(usize::MAX));
        Ok(items.into_iter().map(|item| item.embedding).collect())
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    fn name(&self) -> &str {
        "remote"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LodestoneError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(REMOTE_BATCH_SIZE) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }
}

#[derive(Serialize)]
struct LocalRequest<'a> {
    model: &'a str,
    input: &'a [String],
    truncate: bool,
}

#[derive(Deserialize)]
struct LocalResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Client for an Ollama-compatible `/api/embed` server.
#[derive(Debug)]
pub struct LocalEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: usize,
}

impl LocalEmbedder {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::EmbedderUnavailable`] if the HTTP client
    /// cannot be built.
    pub fn new(
        base_url: &str,
        model: &str,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self, LodestoneError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LodestoneError::EmbedderUnavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimensions,
        })
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, LodestoneError> {
        let request = LocalRequest {
            model: &self.model,
            input: batch,
            truncate: true,
        };

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    LodestoneError::EmbedderUnavailable(format!(
                        "cannot connect to local embedder at {}",
                        self.base_url
                    ))
                } else {
                    LodestoneError::EmbedderUnavailable(format!("local embed request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 404 || body.contains("not found") {
                return Err(LodestoneError::EmbedderUnavailable(format!(
                    "local model '{}' not found",
                    self.model
                )));
            }
            return Err(LodestoneError::EmbedderUnavailable(format!(
                "local embedder returned {status}: {body}"
            )));
        }

        let parsed: LocalResponse = response.json().await.map_err(|e| {
            LodestoneError::EmbedderUnavailable(format!("failed to parse response: {e}"))
        })?;
        Ok(parsed.embeddings)
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    fn name(&self) -> &str {
        "local"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LodestoneError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(LOCAL_BATCH_SIZE) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }
}

/// Lazily-built embedder handles, shared by every request of an engine.
///
/// Each network backend is constructed on first use and then reused. Tests
/// and embedding applications can inject their own handles up front.
pub struct EmbedderRegistry {
    config: EmbeddingConfig,
    remote: OnceCell<Arc<dyn Embedder>>,
    remote_large: OnceCell<Arc<dyn Embedder>>,
    local_small: OnceCell<Arc<dyn Embedder>>,
    local_base: OnceCell<Arc<dyn Embedder>>,
}

impl std::fmt::Debug for EmbedderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbedderRegistry")
            .field("remote", &self.remote.initialized())
            .field("remote_large", &self.remote_large.initialized())
            .field("local_small", &self.local_small.initialized())
            .field("local_base", &self.local_base.initialized())
            .finish_non_exhaustive()
    }
}

impl EmbedderRegistry {
    /// Create an empty registry.
    pub fn new(config: EmbeddingConfig) -> Self {
        Self {
            config,
            remote: OnceCell::new(),
            remote_large: OnceCell::new(),
            local_small: OnceCell::new(),
            local_base: OnceCell::new(),
        }
    }

    /// The `[embedding]` config this registry was built from.
    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    /// Install `embedder` as the handle serving `choice`.
    ///
    /// Has no effect for the hashing backend, which is never cached.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::Config`] if the slot was already initialized.
    pub fn inject(&self, choice: &BackendChoice, embedder: Arc<dyn Embedder>) -> Result<(), LodestoneError> {
        match self.slot(choice) {
            Some(cell) => cell.set(embedder).map_err(|_| {
                LodestoneError::Config(format!(
                    "{} embedder at {} dims is already initialized",
                    choice.mode, choice.dimensions
                ))
            }),
            None => Ok(()),
        }
    }

    fn slot(&self, choice: &BackendChoice) -> Option<&OnceCell<Arc<dyn Embedder>>> {
        match (choice.mode, choice.dimensions) {
            (EmbedMode::RemoteEmbedder, REMOTE_LARGE_DIM) => Some(&self.remote_large),
            (EmbedMode::RemoteEmbedder, _) => Some(&self.remote),
            (EmbedMode::LocalEmbedder, LOCAL_BASE_DIM) => Some(&self.local_base),
            (EmbedMode::LocalEmbedder, _) => Some(&self.local_small),
            (EmbedMode::HashFallback, _) => None,
        }
    }

    /// Resolve the handle for `choice`, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::EmbedderUnavailable`] if the backend cannot
    /// be constructed (for example, no API key for the remote backend).
    pub async fn get(&self, choice: &BackendChoice) -> Result<Arc<dyn Embedder>, LodestoneError> {
        let Some(cell) = self.slot(choice) else {
            return Ok(Arc::new(HashEmbedder::new(choice.dimensions)));
        };

        let embedder = cell
            .get_or_try_init(|| async {
                debug!(mode = %choice.mode, dims = choice.dimensions, "initializing embedder");
                self.build(choice)
            })
            .await?;
        Ok(Arc::clone(embedder))
    }

    fn build(&self, choice: &BackendChoice) -> Result<Arc<dyn Embedder>, LodestoneError> {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        match choice.mode {
            EmbedMode::RemoteEmbedder => {
                Ok(Arc::new(RemoteEmbedder::with_config(&self.config, choice)?))
            }
            EmbedMode::LocalEmbedder => {
                let model = choice
                    .model
                    .as_deref()
                    .unwrap_or(&self.config.local_small_model);
                Ok(Arc::new(LocalEmbedder::new(
                    &self.config.local_base_url,
                    model,
                    choice.dimensions,
                    timeout,
                )?))
            }
            EmbedMode::HashFallback => Ok(Arc::new(HashEmbedder::new(choice.dimensions))),
        }
    }

    /// Embed `texts` with the backend for `choice`, checking the output shape.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::EmbedderUnavailable`] if the backend fails or
    /// returns the wrong number or width of vectors.
    pub async fn embed(&self, choice: &BackendChoice, texts: &[String]) -> Result<Vec<Vec<f32>>, LodestoneError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let embedder = self.get(choice).await?;
        let vectors = embedder.embed(texts).await?;

        if vectors.len() != texts.len() {
            return Err(LodestoneError::EmbedderUnavailable(format!(
                "{} returned {} vectors for {} inputs",
                embedder.name(),
                vectors.len(),
                texts.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != choice.dimensions) {
            return Err(LodestoneError::EmbedderUnavailable(format!(
                "{} returned {}-dim vectors, expected {}",
                embedder.name(),
                bad.len(),
                choice.dimensions
            )));
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<f32>);

    #[async_trait]
    impl Embedder for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn dimensions(&self) -> usize {
            self.0.len()
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LodestoneError> {
            Ok(texts.iter().map(|_| self.0.clone()).collect())
        }
    }

    #[test]
    fn hash_vectors_are_unit_length() {
        let v = HashEmbedder::new(128).embed_one("Ledger reconciliation runs nightly");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hash_of_empty_text_is_zero() {
        let v = HashEmbedder::new(32).embed_one("  ");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn hash_is_case_insensitive_and_shares_terms() {
        let e = HashEmbedder::new(256);
        assert_eq!(e.embed_one("Ledger"), e.embed_one("ledger"));

        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        let q = e.embed_one("ledger reconciliation");
        let near = e.embed_one("the ledger reconciliation job");
        let far = e.embed_one("marketing newsletter template");
        assert!(dot(&q, &near) > dot(&q, &far));
    }

    #[test]
    fn backend_selection_by_width() {
        let config = EmbeddingConfig::default();

        let large = select_backend(Some(3072), &config);
        assert_eq!(large.mode, EmbedMode::RemoteEmbedder);
        assert_eq!(large.model.as_deref(), Some("text-embedding-3-large"));

        let small = select_backend(Some(1536), &config);
        assert_eq!(small.model.as_deref(), Some("text-embedding-3-small"));

        let local = select_backend(Some(384), &config);
        assert_eq!(local.mode, EmbedMode::LocalEmbedder);
        assert_eq!(local.model.as_deref(), Some("all-minilm"));

        let odd = select_backend(Some(100), &config);
        assert_eq!(odd, BackendChoice::hash(100));

        assert_eq!(select_backend(None, &config), BackendChoice::hash(256));
    }

    #[test]
    fn ingest_backend_follows_config() {
        let mut config = EmbeddingConfig::default();
        config.ingest_backend = IngestBackend::Hash;
        config.api_key = Some("key".into());
        assert_eq!(ingest_backend(&config), BackendChoice::hash(256));

        config.ingest_backend = IngestBackend::Remote;
        let choice = ingest_backend(&config);
        assert_eq!(choice.mode, EmbedMode::RemoteEmbedder);
        assert_eq!(choice.dimensions, 1536);
    }

    #[tokio::test]
    async fn remote_without_key_is_unavailable() {
        let registry = EmbedderRegistry::new(EmbeddingConfig::default());
        let choice = select_backend(Some(1536), registry.config());
        let err = registry.get(&choice).await.err().unwrap();
        assert!(matches!(err, LodestoneError::EmbedderUnavailable(_)));
    }

    #[tokio::test]
    async fn injected_embedder_is_used() {
        let registry = EmbedderRegistry::new(EmbeddingConfig::default());
        let choice = select_backend(Some(384), registry.config());
        registry
            .inject(&choice, Arc::new(Fixed(vec![0.5; 384])))
            .unwrap();

        let vectors = registry.embed(&choice, &["a".into(), "b".into()]).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(registry.inject(&choice, Arc::new(Fixed(vec![0.0; 384]))).is_err());
    }

    #[tokio::test]
    async fn wrong_width_is_rejected() {
        let registry = EmbedderRegistry::new(EmbeddingConfig::default());
        let choice = select_backend(Some(768), registry.config());
        registry.inject(&choice, Arc::new(Fixed(vec![1.0; 3]))).unwrap();

        let err = registry.embed(&choice, &["a".into()]).await.unwrap_err();
        assert!(err.to_string().contains("expected 768"), "{err}");
    }

    #[tokio::test]
    async fn hash_choice_needs_no_initialization() {
        let registry = EmbedderRegistry::new(EmbeddingConfig::default());
        let vectors = registry
            .embed(&BackendChoice::hash(16), &["x".into()])
            .await
            .unwrap();
        assert_eq!(vectors[0].len(), 16);
    }

    #[test]
    fn remote_request_shape() {
        let input = vec!["a".to_string()];
        let request = RemoteRequest {
            model: "text-embedding-3-small",
            input: &input,
            dimensions: Some(1536),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "text-embedding-3-small");
        assert_eq!(json["dimensions"], 1536);
        assert_eq!(json["input"][0], "a");
    }

    #[test]
    fn remote_response_reorders_by_index() {
        let raw = r#"{"data":[{"embedding":[2.0],"index":1},{"embedding":[1.0],"index":0}]}"#;
        let parsed: RemoteResponse = serde_json::from_str(raw).unwrap();
        let mut items = parsed.data;
        items.sort_by_key(|i| i.index.unwrap_or(usize::MAX));
        assert_eq!(items[0].embedding, vec![1.0]);
    }
}
