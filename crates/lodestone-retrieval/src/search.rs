//! The retrieval engine: ingestion and the hybrid query pipeline.
//!
//! A query moves through fixed stages:
//!
//! ```text
//! Received -> LexicalDone -> DenseDone -> Fused -> Filtered -> Reranked -> Responded
//! Received -> LegacyVectorScan -> Responded        (when fusion yields nothing)
//! ```
//!
//! Lexical and dense recall run concurrently. All store work happens on the
//! blocking pool with a fresh connection per task, so no connection is held
//! across an embedding or LLM call.

use std::collections::HashMap;
use std::fmt;

use lodestone_core::{
    Document, DocumentMeta, EmbedMode, IngestReport, LodestoneConfig, LodestoneError, Match,
    QueryResponse,
};
use tracing::{debug, info, warn};

use crate::cache::AnswerCache;
use crate::chunker::Chunker;
use crate::embedding::{ingest_backend, select_backend, BackendChoice, EmbedderRegistry};
use crate::fusion::{fuse, FusedCandidate};
use crate::rerank::{RerankCandidate, RerankStrategy, Reranker};
use crate::store::{DocumentWrite, NewChunk, Store, StoreConn, StoreStats};

/// Pipeline stage of a query, used in debug logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStage {
    Received,
    LexicalDone,
    DenseDone,
    Fused,
    Filtered,
    Reranked,
    LegacyVectorScan,
    Responded,
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryStage::Received => "received",
            QueryStage::LexicalDone => "lexical_done",
            QueryStage::DenseDone => "dense_done",
            QueryStage::Fused => "fused",
            QueryStage::Filtered => "filtered",
            QueryStage::Reranked => "reranked",
            QueryStage::LegacyVectorScan => "legacy_vector_scan",
            QueryStage::Responded => "responded",
        };
        f.write_str(name)
    }
}

/// Hybrid retrieval engine over one store.
///
/// `Engine` is `Send + Sync`; share it behind an `Arc` between concurrent
/// requests. Model handles are built lazily on first use.
///
/// # Examples
///
/// ```
/// use lodestone_core::{DocumentMeta, LodestoneConfig};
/// use lodestone_retrieval::search::Engine;
///
/// # #[tokio::main]
/// # async fn main() {
/// let dir = tempfile::tempdir().unwrap();
/// let mut config = LodestoneConfig::default();
/// config.store.path = dir.path().join("index.db");
///
/// let engine = Engine::new(config);
/// let report = engine
///     .ingest("demo", "guide", "Ledger reconciliation is part of accounting.", DocumentMeta::default())
///     .await
///     .unwrap();
/// assert_eq!(report.inserted, 1);
///
/// let response = engine.query("ledger", 5, Some("demo")).await.unwrap();
/// assert!(response.matches[0].snippet.contains("Ledger"));
/// # }
/// ```
pub struct Engine {
    config: LodestoneConfig,
    store: Store,
    chunker: Chunker,
    embedders: EmbedderRegistry,
    reranker: Reranker,
    cache: AnswerCache,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.store)
            .field("embedders", &self.embedders)
            .field("reranker", &self.reranker)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine from configuration. No connection is opened until first use.
    pub fn new(config: LodestoneConfig) -> Self {
        Self {
            store: Store::new(&config.store),
            chunker: Chunker::new(config.chunking.clone()),
            embedders: EmbedderRegistry::new(config.embedding.clone()),
            reranker: Reranker::new(config.rerank.clone(), config.llm.clone()),
            cache: AnswerCache::new(&config.cache),
            config,
        }
    }

    /// Replace the reranker, e.g. to inject model handles.
    pub fn with_reranker(mut self, reranker: Reranker) -> Self {
        self.reranker = reranker;
        self
    }

    /// Configuration in effect.
    pub fn config(&self) -> &LodestoneConfig {
        &self.config
    }

    /// The underlying store handle.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Embedding backends, for injecting handles.
    pub fn embedders(&self) -> &EmbedderRegistry {
        &self.embedders
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, LodestoneError>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreConn) -> Result<T, LodestoneError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = store.connect()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| LodestoneError::Database(format!("store task failed: {e}")))?
    }

    /// Ingest (or re-ingest) one document under `project_id`.
    ///
    /// The document's previous chunks are replaced atomically and the cache
    /// scopes that could have seen it are invalidated. Embedding failures are
    /// absorbed: the chunks stay lexically searchable.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::Validation`] if `project_id` or `doc_id` is
    /// empty, or a storage error if the write cannot be committed.
    pub async fn ingest(
        &self,
        project_id: &str,
        doc_id: &str,
        text: &str,
        meta: DocumentMeta,
    ) -> Result<IngestReport, LodestoneError> {
        if project_id.trim().is_empty() {
            return Err(LodestoneError::Validation("project_id must not be empty".into()));
        }
        if doc_id.trim().is_empty() {
            return Err(LodestoneError::Validation("doc_id must not be empty".into()));
        }

        let passages = self.chunker.split(text, &meta);
        let document = Document::from_meta(doc_id, text, meta);

        let index_dim = self.blocking(|conn| conn.index_dim()).await?;
        let choice = match index_dim {
            Some(_) => select_backend(index_dim, &self.config.embedding),
            None => ingest_backend(&self.config.embedding),
        };

        let doc_window: String = text
            .chars()
            .take(self.config.chunking.text_window_chars)
            .collect();
        let has_doc_vector = !doc_window.trim().is_empty();
        let mut texts: Vec<String> = passages.iter().map(|p| p.content.clone()).collect();
        if has_doc_vector {
            texts.push(doc_window);
        }

        let vectors = self.embed_for_ingest(&choice, index_dim, &texts).await;
        let (chunk_vectors, doc_vector) = match vectors {
            Some(mut vectors) => {
                let doc_vector = if has_doc_vector { vectors.pop() } else { None };
                (Some(vectors), doc_vector)
            }
            None => (None, None),
        };

        let chunks = passages
            .into_iter()
            .map(|p| NewChunk {
                doc_id: document.id.clone(),
                ordinal: p.ordinal,
                content: p.content,
                content_hash: p.content_hash,
                project_id: Some(project_id.to_string()),
                source_path: document.path.clone(),
                title: p.title,
                meta: document.meta.clone(),
            })
            .collect();

        let write = DocumentWrite {
            document,
            project_id: project_id.to_string(),
            chunks,
            chunk_vectors,
            doc_vector,
        };
        let inserted = self
            .blocking(move |conn| conn.replace_document(&write))
            .await?;

        info!(project_id, doc_id, inserted, mode = %choice.mode, "document ingested");
        Ok(IngestReport { ok: true, inserted })
    }

    async fn embed_for_ingest(
        &self,
        choice: &BackendChoice,
        index_dim: Option<usize>,
        texts: &[String],
    ) -> Option<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return None;
        }
        match self.embedders.embed(choice, texts).await {
            Ok(vectors) => Some(vectors),
            Err(e) => {
                let hash_dim = self.config.embedding.hash_dimensions;
                let hash_compatible = index_dim.map_or(true, |d| d == hash_dim);
                if hash_compatible {
                    warn!(error = %e, mode = %choice.mode, "embedder unavailable, using hash fallback for ingest");
                    let fallback = BackendChoice::hash(hash_dim);
                    self.embedders.embed(&fallback, texts).await.ok()
                } else {
                    warn!(error = %e, mode = %choice.mode, "embedder unavailable, storing chunks without vectors");
                    None
                }
            }
        }
    }

    /// Retrieve up to `k` passages for `question`, optionally scoped to a project.
    ///
    /// An empty question or `k == 0` returns an empty response without
    /// touching the indexes.
    ///
    /// # Errors
    ///
    /// Only storage failures propagate; embedder, reranker and cache
    /// failures degrade to fallbacks.
    pub async fn query(
        &self,
        question: &str,
        k: usize,
        project_id: Option<&str>,
    ) -> Result<QueryResponse, LodestoneError> {
        debug!(stage = %QueryStage::Received, k, project_id, "query");
        if question.trim().is_empty() || k == 0 {
            return Ok(QueryResponse::empty(EmbedMode::HashFallback));
        }

        let question = question.to_string();
        let project = project_id.map(String::from);

        let (cached, generation) = {
            let cache = self.cache.clone();
            let (q, p) = (question.clone(), project.clone());
            self.blocking(move |conn| {
                let generation = cache.generation(conn, p.as_deref());
                Ok((cache.get(conn, p.as_deref(), &q, k), generation))
            })
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "answer cache unavailable");
                (None, None)
            })
        };
        if let Some(hit) = cached {
            debug!(stage = %QueryStage::Responded, cached = true, "query");
            return Ok(hit);
        }

        let index_dim = self.blocking(|conn| conn.index_dim()).await?;
        let depth = self.config.query.recall_depth(k);

        let lexical = {
            let q = question.clone();
            self.blocking(move |conn| conn.lexical_search(&q, depth))
        };
        let dense = async {
            let (choice, vector) = self.embed_query(index_dim, &question).await;
            let hits = {
                let v = vector.clone();
                self.blocking(move |conn| conn.dense_search(&v, depth)).await?
            };
            Ok::<_, LodestoneError>((choice, vector, hits))
        };

        let (lexical, dense) = tokio::join!(lexical, dense);
        let lexical = lexical?;
        debug!(stage = %QueryStage::LexicalDone, hits = lexical.len(), "query");
        let (choice, vector, dense) = dense?;
        debug!(stage = %QueryStage::DenseDone, hits = dense.len(), mode = %choice.mode, "query");

        let fused = fuse(&lexical, &dense);
        debug!(stage = %QueryStage::Fused, candidates = fused.len(), "query");

        let response = if fused.is_empty() {
            self.legacy_scan(vector, k, project.clone(), choice.mode).await?
        } else {
            self.rank(&question, fused, k, project.clone(), choice.mode).await?
        };

        debug!(stage = %QueryStage::Responded, matches = response.matches.len(), "query");
        if let Some(generation) = generation {
            let cache = self.cache.clone();
            let stored = response.clone();
            let put = self
                .blocking(move |conn| {
                    Ok(cache.put_if_current(conn, project.as_deref(), &question, k, &stored, generation))
                })
                .await;
            if let Err(e) = put {
                warn!(error = %e, "answer cache write skipped");
            }
        }
        Ok(response)
    }

    /// Embed the query with the backend matching the index, degrading to hashing.
    async fn embed_query(&self, index_dim: Option<usize>, question: &str) -> (BackendChoice, Vec<f32>) {
        let choice = select_backend(index_dim, &self.config.embedding);
        let input = [question.to_string()];
        match self.embedders.embed(&choice, &input).await {
            Ok(mut vectors) => (choice, vectors.pop().unwrap_or_default()),
            Err(e) => {
                warn!(error = %e, mode = %choice.mode, "query embedder unavailable, using hash fallback");
                let fallback = BackendChoice::hash(choice.dimensions);
                let vector = self
                    .embedders
                    .embed(&fallback, &input)
                    .await
                    .ok()
                    .and_then(|mut v| v.pop())
                    .unwrap_or_default();
                (fallback, vector)
            }
        }
    }

    async fn rank(
        &self,
        question: &str,
        fused: Vec<FusedCandidate>,
        k: usize,
        project: Option<String>,
        mode: EmbedMode,
    ) -> Result<QueryResponse, LodestoneError> {
        let ids: Vec<i64> = fused.iter().map(|c| c.chunk_id).collect();
        let pool_size = self.config.rerank.pool.max(k);

        let chunks = self
            .blocking(move |conn| {
                let mut ids = ids;
                if let Some(project) = &project {
                    ids = conn.filter_by_project(&ids, project)?;
                }
                ids.truncate(pool_size);
                conn.chunks_by_ids(&ids)
            })
            .await?;
        debug!(stage = %QueryStage::Filtered, candidates = chunks.len(), "query");

        let candidates: Vec<RerankCandidate> = chunks
            .iter()
            .map(|c| RerankCandidate {
                id: c.id.to_string(),
                text: c.content.clone(),
            })
            .collect();
        let (ranked, strategy) = self.reranker.rerank(question, &candidates, k).await;
        debug!(stage = %QueryStage::Reranked, strategy = %strategy, kept = ranked.len(), "query");

        let rrf: HashMap<String, f64> = fused
            .iter()
            .map(|c| (c.chunk_id.to_string(), c.rrf_score))
            .collect();
        let by_id: HashMap<String, _> = chunks.into_iter().map(|c| (c.id.to_string(), c)).collect();
        let snippet_chars = self.config.query.snippet_chars;

        let matches = ranked
            .into_iter()
            .filter_map(|(id, score)| {
                let chunk = by_id.get(&id)?;
                let score = match strategy {
                    RerankStrategy::Identity => rrf.get(&id).map(|s| *s as f32),
                    _ => Some(score),
                };
                Some(Match {
                    id,
                    repo: chunk.meta.repo.clone(),
                    path: chunk.source_path.clone(),
                    title: chunk.title.clone(),
                    snippet: snippet(&chunk.content, snippet_chars),
                    score,
                })
            })
            .collect();

        Ok(QueryResponse { matches, mode })
    }

    async fn legacy_scan(
        &self,
        vector: Vec<f32>,
        k: usize,
        project: Option<String>,
        mode: EmbedMode,
    ) -> Result<QueryResponse, LodestoneError> {
        debug!(stage = %QueryStage::LegacyVectorScan, "query");
        let hits = self
            .blocking(move |conn| conn.legacy_scan(&vector, k, project.as_deref()))
            .await?;
        let snippet_chars = self.config.query.snippet_chars;
        let matches = hits
            .into_iter()
            .map(|hit| Match {
                id: hit.document.id,
                repo: hit.document.repo,
                path: hit.document.path,
                title: hit.document.title,
                snippet: snippet(&hit.document.text, snippet_chars),
                score: Some(hit.score),
            })
            .collect();
        Ok(QueryResponse { matches, mode })
    }

    /// Delete a document and everything derived from it.
    ///
    /// Returns `false` if the document did not exist.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::Validation`] for an empty id, or a storage error.
    pub async fn forget(&self, doc_id: &str) -> Result<bool, LodestoneError> {
        let doc_id = doc_id.to_string();
        self.blocking(move |conn| conn.delete_document(&doc_id)).await
    }

    /// Resynchronize the lexical index from stored chunks.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the rebuild cannot be committed.
    pub async fn rebuild_lexical_index(&self) -> Result<(), LodestoneError> {
        self.blocking(|conn| conn.rebuild_lexical_index()).await
    }

    /// Store statistics.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub async fn stats(&self) -> Result<StoreStats, LodestoneError> {
        self.blocking(|conn| conn.stats()).await
    }

    /// The embedding path a query would take right now.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub async fn planned_mode(&self) -> Result<EmbedMode, LodestoneError> {
        let index_dim = self.blocking(|conn| conn.index_dim()).await?;
        Ok(select_backend(index_dim, &self.config.embedding).mode)
    }
}

fn snippet(text: &str, max_chars: usize) -> String {
    text.trim().chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(dir: &tempfile::TempDir) -> Engine {
        let mut config = LodestoneConfig::default();
        config.store.path = dir.path().join("index.db");
        Engine::new(config)
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn engine_is_send_and_sync() {
        assert_send_sync::<Engine>();
    }

    #[test]
    fn stage_names() {
        assert_eq!(QueryStage::LegacyVectorScan.to_string(), "legacy_vector_scan");
        assert_eq!(QueryStage::Received.to_string(), "received");
    }

    #[test]
    fn snippet_is_bounded() {
        assert_eq!(snippet("  abcdef ", 3), "abc");
    }

    #[tokio::test]
    async fn empty_question_or_zero_k_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let empty = engine.query("   ", 5, None).await.unwrap();
        assert!(empty.matches.is_empty());
        assert_eq!(empty.mode, EmbedMode::HashFallback);
        assert!(engine.query("ledger", 0, None).await.unwrap().matches.is_empty());
        assert!(!dir.path().join("index.db").exists());
    }

    #[tokio::test]
    async fn ingest_validates_ids() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let err = engine
            .ingest("", "doc", "text", DocumentMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LodestoneError::Validation(_)));
        let err = engine
            .ingest("demo", " ", "text", DocumentMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LodestoneError::Validation(_)));
    }

    #[tokio::test]
    async fn hash_ingest_sets_index_dim() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        engine
            .ingest("demo", "a", "ledger text", DocumentMeta::default())
            .await
            .unwrap();
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.index_dim, Some(256));
        assert_eq!(stats.embeddings, 2);
        assert_eq!(engine.planned_mode().await.unwrap(), EmbedMode::HashFallback);
    }

    #[tokio::test]
    async fn forget_removes_matches() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        engine
            .ingest("demo", "a", "ledger reconciliation", DocumentMeta::default())
            .await
            .unwrap();
        assert!(engine.forget("a").await.unwrap());
        let response = engine.query("ledger", 5, Some("demo")).await.unwrap();
        assert!(response.matches.is_empty());
        assert!(!engine.forget("a").await.unwrap());
    }
}
