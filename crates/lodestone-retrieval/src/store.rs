//! SQLite persistence for documents, chunks, embeddings, the FTS5 lexical
//! mirror, and the answer cache.
//!
//! Every connection runs in WAL mode with `synchronous=NORMAL` and a bounded
//! busy timeout. Multi-statement writes run in a single `IMMEDIATE`
//! transaction whose commit is wrapped by the [`RetryPolicy`], so partial
//! writes are never observable. The `chunks_fts` mirror is maintained by
//! triggers inside the writer's transaction.
//!
//! Dense search is a brute-force cosine scan computed in Rust over BLOB
//! vectors (little-endian `f32`).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lodestone_core::{Chunk, Document, DocumentMeta, LodestoneError, StoreConfig};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache;
use crate::retry::RetryPolicy;

/// Above this many stored chunk vectors the brute-force scan should be
/// replaced by an approximate nearest-neighbor index behind [`StoreConn::dense_search`].
pub const MAX_BRUTE_FORCE_VECTORS: usize = 50_000;

/// Upper bound on bound parameters per `IN (...)` query.
const ID_BATCH: usize = 500;

/// Entity an embedding vector represents.
///
/// # Examples
///
/// ```
/// use lodestone_retrieval::store::EmbeddingOwner;
///
/// let owner = EmbeddingOwner::Chunk(42);
/// assert_eq!(owner.kind(), "chunk");
/// assert_eq!(owner.key(), "42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingOwner {
    /// A chunk, by store id.
    Chunk(i64),
    /// A whole document, by caller id (used by the legacy vector scan).
    Document(String),
}

impl EmbeddingOwner {
    /// Discriminator stored in `embeddings.owner_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            EmbeddingOwner::Chunk(_) => "chunk",
            EmbeddingOwner::Document(_) => "document",
        }
    }

    /// Key stored in `embeddings.owner_id`.
    pub fn key(&self) -> String {
        match self {
            EmbeddingOwner::Chunk(id) => id.to_string(),
            EmbeddingOwner::Document(id) => id.clone(),
        }
    }
}

/// A chunk to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    /// Owning document.
    pub doc_id: String,
    /// Position within the document.
    pub ordinal: u32,
    /// Passage text.
    pub content: String,
    /// SHA-256 of `content`.
    pub content_hash: String,
    /// Scope, if any.
    pub project_id: Option<String>,
    /// Source path, if any.
    pub source_path: Option<String>,
    /// Section or document title.
    pub title: Option<String>,
    /// Metadata inherited from the document.
    pub meta: DocumentMeta,
}

/// Everything written when a document is (re-)ingested.
#[derive(Debug, Clone)]
pub struct DocumentWrite {
    /// The document record.
    pub document: Document,
    /// Scope for the document and all its chunks.
    pub project_id: String,
    /// Fresh chunks, superseding any previous ones for the document.
    pub chunks: Vec<NewChunk>,
    /// One vector per chunk, or `None` to leave chunks without embeddings.
    pub chunk_vectors: Option<Vec<Vec<f32>>>,
    /// Document-level vector for the legacy scan.
    pub doc_vector: Option<Vec<f32>>,
}

/// A lexical (BM25) hit. Higher `score` is more relevant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LexicalHit {
    /// Matched chunk.
    pub chunk_id: i64,
    /// Negated FTS5 `bm25()` value.
    pub score: f64,
}

/// A dense (cosine) hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenseHit {
    /// Matched chunk.
    pub chunk_id: i64,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
}

/// A document-level hit from the legacy whole-corpus scan.
#[derive(Debug, Clone)]
pub struct LegacyHit {
    /// The matched document.
    pub document: Document,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
}

/// Store statistics.
///
/// # Examples
///
/// ```
/// use lodestone_retrieval::store::StoreStats;
///
/// let stats = StoreStats {
///     documents: 2,
///     chunks: 10,
///     embeddings: 12,
///     cache_entries: 0,
///     index_dim: Some(256),
///     size_bytes: 40960,
/// };
/// assert_eq!(stats.chunks, 10);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// Documents stored.
    pub documents: usize,
    /// Chunks stored.
    pub chunks: usize,
    /// Embedding vectors stored (chunk and document level).
    pub embeddings: usize,
    /// Answer cache rows.
    pub cache_entries: usize,
    /// Dominant embedding width, if any vectors exist.
    pub index_dim: Option<usize>,
    /// Size of the database file in bytes.
    pub size_bytes: u64,
}

/// Handle to the on-disk store. Cheap to clone; each call to
/// [`connect`](Store::connect) opens an independent connection.
///
/// # Examples
///
/// ```
/// use lodestone_core::StoreConfig;
/// use lodestone_retrieval::store::Store;
///
/// let dir = tempfile::tempdir().unwrap();
/// let store = Store::new(&StoreConfig {
///     path: dir.path().join("index.db"),
///     ..StoreConfig::default()
/// });
/// let conn = store.connect().unwrap();
/// assert_eq!(conn.index_dim().unwrap(), None);
/// ```
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
    busy_timeout: Duration,
    policy: RetryPolicy,
}

impl Store {
    /// Create a store handle from the `[store]` config section.
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            path: config.path.clone(),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            policy: RetryPolicy::from_config(&config.retry),
        }
    }

    /// Database file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a configured connection, creating the database and schema if needed.
    ///
    /// Lock contention while opening is retried with backoff.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::StorageBusy`] when contention outlasts the
    /// retry budget, or [`LodestoneError::Database`] for other failures.
    pub fn connect(&self) -> Result<StoreConn, LodestoneError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LodestoneError::Database(format!("failed to create store directory: {e}"))
                })?;
            }
        }

        let conn = self.policy.run("connect", || {
            let conn = Connection::open(&self.path)?;
            conn.busy_timeout(self.busy_timeout)?;
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA foreign_keys = ON;
                ",
            )?;
            init_schema(&conn)?;
            Ok(conn)
        })?;

        Ok(StoreConn {
            conn,
            policy: self.policy.clone(),
        })
    }
}

/// One open connection to the store.
pub struct StoreConn {
    pub(crate) conn: Connection,
    pub(crate) policy: RetryPolicy,
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            project_id TEXT,
            repo TEXT,
            path TEXT,
            sha TEXT,
            title TEXT,
            text TEXT NOT NULL,
            meta TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            doc_id TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            project_id TEXT,
            source_path TEXT,
            title TEXT,
            meta TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS chunks_doc_idx ON chunks(doc_id, ordinal);
        CREATE INDEX IF NOT EXISTS chunks_project_idx ON chunks(project_id);

        CREATE TABLE IF NOT EXISTS embeddings (
            owner_kind TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            vector BLOB NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (owner_kind, owner_id)
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
            content, title,
            content='chunks', content_rowid='id'
        );

        CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
            INSERT INTO chunks_fts(rowid, content, title)
            VALUES (new.id, new.content, new.title);
        END;

        CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, content, title)
            VALUES ('delete', old.id, old.content, old.title);
        END;

        CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, content, title)
            VALUES ('delete', old.id, old.content, old.title);
            INSERT INTO chunks_fts(rowid, content, title)
            VALUES (new.id, new.content, new.title);
        END;

        CREATE TABLE IF NOT EXISTS answer_cache (
            project_id TEXT NOT NULL,
            query_hash TEXT NOT NULL,
            answer TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (project_id, query_hash)
        );

        CREATE TABLE IF NOT EXISTS cache_generations (
            project_id TEXT PRIMARY KEY,
            generation INTEGER NOT NULL
        );
        ",
    )
}

const CHUNK_COLUMNS: &str =
    "id, doc_id, ordinal, content, project_id, source_path, title, meta, created_at";

const DOCUMENT_COLUMNS: &str = "d.id, d.repo, d.path, d.sha, d.title, d.text, d.meta";

impl StoreConn {
    /// Run a read, retrying contention.
    pub(crate) fn read<T, F>(&self, what: &str, f: F) -> Result<T, LodestoneError>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        self.policy.run(what, || f(&self.conn))
    }

    /// Run `f` inside one `IMMEDIATE` transaction, retrying contention on
    /// begin and commit.
    pub(crate) fn write<T, F>(&mut self, what: &str, f: F) -> Result<T, LodestoneError>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        let policy = self.policy.clone();
        let conn = &mut self.conn;
        policy.run(what, || {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Insert or replace a document record by id.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::Validation`] if the id is empty.
    pub fn upsert_document(
        &mut self,
        doc: &Document,
        project_id: Option<&str>,
    ) -> Result<(), LodestoneError> {
        validate_id("document id", &doc.id)?;
        let meta = serde_json::to_string(&doc.meta)?;
        self.write("upsert document", |conn| {
            let previous = document_project(conn, &doc.id)?;
            write_document(conn, doc, project_id, &meta)?;
            cache::invalidate_scope(conn, project_id)?;
            if let Some(old) = previous.as_deref().filter(|old| Some(*old) != project_id) {
                cache::invalidate_scope(conn, Some(old))?;
            }
            Ok(())
        })
    }

    /// Insert or overwrite the embedding for `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::Validation`] for empty or non-finite vectors.
    pub fn upsert_embedding(
        &mut self,
        owner: &EmbeddingOwner,
        vector: &[f32],
    ) -> Result<(), LodestoneError> {
        validate_vector(vector)?;
        if let EmbeddingOwner::Document(id) = owner {
            validate_id("document id", id)?;
        }
        let bytes = floats_to_bytes(vector);
        self.write("upsert embedding", |conn| {
            write_embedding(conn, owner, &bytes)?;
            let project = owner_project(conn, owner)?;
            cache::invalidate_scope(conn, project.as_deref())?;
            Ok(())
        })
    }

    /// Insert one chunk; the lexical mirror is updated in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::Validation`] if the content or document id is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use lodestone_core::{DocumentMeta, StoreConfig};
    /// use lodestone_retrieval::store::{NewChunk, Store};
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let store = Store::new(&StoreConfig {
    ///     path: dir.path().join("index.db"),
    ///     ..StoreConfig::default()
    /// });
    /// let mut conn = store.connect().unwrap();
    /// let id = conn.insert_chunk(&NewChunk {
    ///     doc_id: "guide".into(),
    ///     ordinal: 0,
    ///     content: "Ledger reconciliation".into(),
    ///     content_hash: "h".into(),
    ///     project_id: Some("demo".into()),
    ///     source_path: None,
    ///     title: None,
    ///     meta: DocumentMeta::default(),
    /// }).unwrap();
    /// assert_eq!(conn.lexical_search("ledger", 5).unwrap()[0].chunk_id, id);
    /// ```
    pub fn insert_chunk(&mut self, chunk: &NewChunk) -> Result<i64, LodestoneError> {
        validate_chunk(chunk)?;
        let meta = serde_json::to_string(&chunk.meta)?;
        let now = Utc::now().to_rfc3339();
        self.write("insert chunk", |conn| {
            let id = write_chunk(conn, chunk, &meta, &now)?;
            cache::invalidate_scope(conn, chunk.project_id.as_deref())?;
            Ok(id)
        })
    }

    /// Atomically replace a document, its chunks, and their embeddings.
    ///
    /// Previous chunks of the document (and their vectors) are deleted, the
    /// fresh ones inserted, and the cache scopes that could have seen the
    /// document are invalidated, all in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::Validation`] before any write if ids are empty,
    /// chunk contents are empty, or vector counts do not match.
    pub fn replace_document(&mut self, write: &DocumentWrite) -> Result<usize, LodestoneError> {
        validate_id("project_id", &write.project_id)?;
        validate_id("document id", &write.document.id)?;
        for chunk in &write.chunks {
            validate_chunk(chunk)?;
        }
        let chunk_vectors = match &write.chunk_vectors {
            Some(vectors) => {
                if vectors.len() != write.chunks.len() {
                    return Err(LodestoneError::Validation(format!(
                        "{} chunk vectors for {} chunks",
                        vectors.len(),
                        write.chunks.len()
                    )));
                }
                for v in vectors {
                    validate_vector(v)?;
                }
                Some(vectors.iter().map(|v| floats_to_bytes(v)).collect::<Vec<_>>())
            }
            None => None,
        };
        if let Some(v) = &write.doc_vector {
            validate_vector(v)?;
        }
        let doc_bytes = write.doc_vector.as_deref().map(floats_to_bytes);

        let doc_meta = serde_json::to_string(&write.document.meta)?;
        let chunk_metas = write
            .chunks
            .iter()
            .map(|c| serde_json::to_string(&c.meta))
            .collect::<Result<Vec<_>, _>>()?;
        let now = Utc::now().to_rfc3339();
        let doc_id = write.document.id.as_str();

        self.write("replace document", |conn| {
            let previous_project: Option<Option<String>> = conn
                .query_row(
                    "SELECT project_id FROM documents WHERE id = ?1",
                    params![doc_id],
                    |row| row.get(0),
                )
                .optional()?;

            delete_chunks_of(conn, doc_id)?;
            write_document(conn, &write.document, Some(&write.project_id), &doc_meta)?;

            for (i, chunk) in write.chunks.iter().enumerate() {
                let id = write_chunk(conn, chunk, &chunk_metas[i], &now)?;
                if let Some(vectors) = &chunk_vectors {
                    write_embedding(conn, &EmbeddingOwner::Chunk(id), &vectors[i])?;
                }
            }

            let doc_owner = EmbeddingOwner::Document(doc_id.to_string());
            match &doc_bytes {
                Some(bytes) => write_embedding(conn, &doc_owner, bytes)?,
                None => delete_embedding(conn, &doc_owner)?,
            }

            cache::invalidate_scope(conn, Some(&write.project_id))?;
            if let Some(Some(old)) = previous_project {
                if old != write.project_id {
                    cache::invalidate_scope(conn, Some(&old))?;
                }
            }
            Ok(write.chunks.len())
        })
    }

    /// Delete a document with its chunks, lexical entries, and embeddings.
    ///
    /// Returns `false` if no such document existed.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::Validation`] if the id is empty.
    pub fn delete_document(&mut self, doc_id: &str) -> Result<bool, LodestoneError> {
        validate_id("document id", doc_id)?;
        self.write("delete document", |conn| {
            let project: Option<Option<String>> = conn
                .query_row(
                    "SELECT project_id FROM documents WHERE id = ?1",
                    params![doc_id],
                    |row| row.get(0),
                )
                .optional()?;
            let removed_chunks = delete_chunks_of(conn, doc_id)?;
            delete_embedding(conn, &EmbeddingOwner::Document(doc_id.to_string()))?;
            let removed_docs = conn.execute("DELETE FROM documents WHERE id = ?1", params![doc_id])?;
            if let Some(project) = &project {
                cache::invalidate_scope(conn, project.as_deref())?;
            }
            Ok(removed_docs > 0 || removed_chunks > 0)
        })
    }

    /// Resynchronize the lexical mirror from chunk text.
    pub fn rebuild_lexical_index(&mut self) -> Result<(), LodestoneError> {
        self.write("rebuild lexical index", |conn| {
            conn.execute("INSERT INTO chunks_fts(chunks_fts) VALUES ('rebuild')", [])?;
            Ok(())
        })
    }

    /// Dominant stored embedding width, tie-broken toward the larger width.
    ///
    /// Aggregates over BLOB lengths; no vector is loaded.
    pub fn index_dim(&self) -> Result<Option<usize>, LodestoneError> {
        self.read("index dim", |conn| {
            conn.query_row(
                "SELECT length(vector) / 4 AS dim, COUNT(*) AS n
                 FROM embeddings
                 GROUP BY dim
                 ORDER BY n DESC, dim DESC
                 LIMIT 1",
                [],
                |row| row.get::<_, i64>(0),
            )
            .optional()
        })
        .map(|dim| dim.filter(|d| *d > 0).map(|d| d as usize))
    }

    /// BM25 keyword search over chunk content.
    ///
    /// Results are ordered by relevance, ties broken by insertion order. A
    /// query with no searchable terms yields an empty list.
    pub fn lexical_search(&self, query: &str, top_k: usize) -> Result<Vec<LexicalHit>, LodestoneError> {
        let match_expr = sanitize_fts_query(query);
        if match_expr.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        self.read("lexical search", |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT c.id, bm25(chunks_fts) AS rank
                 FROM chunks_fts
                 JOIN chunks c ON c.id = chunks_fts.rowid
                 WHERE chunks_fts MATCH ?1
                 ORDER BY rank ASC, c.id ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![match_expr, top_k as i64], |row| {
                let rank: f64 = row.get(1)?;
                Ok(LexicalHit {
                    chunk_id: row.get(0)?,
                    score: -rank,
                })
            })?;
            rows.collect()
        })
    }

    /// Cosine nearest-neighbor search over chunk embeddings.
    ///
    /// Vectors whose width differs from the query are skipped. Ties are broken
    /// by ascending chunk id.
    pub fn dense_search(&self, query: &[f32], top_n: usize) -> Result<Vec<DenseHit>, LodestoneError> {
        let Some(query) = normalize(query) else {
            return Ok(Vec::new());
        };
        if top_n == 0 {
            return Ok(Vec::new());
        }

        let (mut scored, scanned) = self.read("dense search", |conn| {
            let mut stmt = conn
                .prepare_cached("SELECT owner_id, vector FROM embeddings WHERE owner_kind = 'chunk'")?;
            let mut rows = stmt.query([])?;
            let mut scored = Vec::new();
            let mut scanned = 0usize;
            while let Some(row) = rows.next()? {
                scanned += 1;
                let bytes: Vec<u8> = row.get(1)?;
                if bytes.len() != query.len() * 4 {
                    continue;
                }
                let owner: String = row.get(0)?;
                let Ok(chunk_id) = owner.parse::<i64>() else {
                    continue;
                };
                let score = cosine_to_unit(&query, &bytes_to_floats(&bytes));
                scored.push(DenseHit { chunk_id, score });
            }
            Ok((scored, scanned))
        })?;

        if scanned > MAX_BRUTE_FORCE_VECTORS {
            warn!(
                scanned,
                limit = MAX_BRUTE_FORCE_VECTORS,
                "brute-force dense scan over a large index; consider an ANN index"
            );
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        scored.truncate(top_n);
        Ok(scored)
    }

    /// Whole-corpus cosine scan over document-level embeddings.
    ///
    /// Used when neither structured index produced candidates.
    pub fn legacy_scan(
        &self,
        query: &[f32],
        top_n: usize,
        project_id: Option<&str>,
    ) -> Result<Vec<LegacyHit>, LodestoneError> {
        let Some(query) = normalize(query) else {
            return Ok(Vec::new());
        };

        let mut hits = self.read("legacy scan", |conn| {
            let sql = format!(
                "SELECT {DOCUMENT_COLUMNS}, e.vector
                 FROM embeddings e
                 JOIN documents d ON d.id = e.owner_id
                 WHERE e.owner_kind = 'document'
                   AND (?1 IS NULL OR d.project_id = ?1)"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut rows = stmt.query(params![project_id])?;
            let mut hits = Vec::new();
            while let Some(row) = rows.next()? {
                let bytes: Vec<u8> = row.get(7)?;
                if bytes.len() != query.len() * 4 {
                    continue;
                }
                let score = cosine_to_unit(&query, &bytes_to_floats(&bytes));
                hits.push(LegacyHit {
                    document: row_to_document(row)?,
                    score,
                });
            }
            Ok(hits)
        })?;

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        hits.truncate(top_n);
        Ok(hits)
    }

    /// Keep only candidates in `project_id`, preserving their order.
    pub fn filter_by_project(&self, ids: &[i64], project_id: &str) -> Result<Vec<i64>, LodestoneError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut allowed = HashSet::new();
        for batch in ids.chunks(ID_BATCH) {
            let found = self.read("filter by project", |conn| {
                let sql = format!(
                    "SELECT id FROM chunks WHERE project_id = ? AND id IN ({})",
                    placeholders(batch.len())
                );
                let mut stmt = conn.prepare(&sql)?;
                let args = std::iter::once(rusqlite::types::Value::Text(project_id.to_string()))
                    .chain(batch.iter().map(|id| rusqlite::types::Value::Integer(*id)));
                let rows = stmt.query_map(params_from_iter(args), |row| row.get::<_, i64>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })?;
            allowed.extend(found);
        }
        Ok(ids.iter().copied().filter(|id| allowed.contains(id)).collect())
    }

    /// Load chunks by id, in the order given. Unknown ids are skipped.
    pub fn chunks_by_ids(&self, ids: &[i64]) -> Result<Vec<Chunk>, LodestoneError> {
        let mut by_id: HashMap<i64, Chunk> = HashMap::with_capacity(ids.len());
        for batch in ids.chunks(ID_BATCH) {
            let chunks = self.read("load chunks", |conn| {
                let sql = format!(
                    "SELECT {CHUNK_COLUMNS} FROM chunks WHERE id IN ({})",
                    placeholders(batch.len())
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(batch.iter()), row_to_chunk)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })?;
            for chunk in chunks {
                by_id.insert(chunk.id, chunk);
            }
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// All chunks of a document, ordered by ordinal.
    pub fn chunks_for_document(&self, doc_id: &str) -> Result<Vec<Chunk>, LodestoneError> {
        self.read("load document chunks", |conn| {
            let sql = format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE doc_id = ?1 ORDER BY ordinal");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![doc_id], row_to_chunk)?;
            rows.collect()
        })
    }

    /// Index statistics.
    pub fn stats(&self) -> Result<StoreStats, LodestoneError> {
        let count = |table: &str| -> Result<usize, LodestoneError> {
            let sql = format!("SELECT COUNT(*) FROM {table}");
            self.read("count rows", |conn| conn.query_row(&sql, [], |row| row.get::<_, i64>(0)))
                .map(|n| n as usize)
        };

        let page_count: i64 = self
            .conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .unwrap_or(0);
        let page_size: i64 = self
            .conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .unwrap_or(4096);

        Ok(StoreStats {
            documents: count("documents")?,
            chunks: count("chunks")?,
            embeddings: count("embeddings")?,
            cache_entries: count("answer_cache")?,
            index_dim: self.index_dim()?,
            size_bytes: (page_count * page_size) as u64,
        })
    }

    /// Check that the lexical mirror agrees with the chunk table.
    pub fn lexical_index_consistent(&self) -> Result<bool, LodestoneError> {
        self.read("check lexical index", |conn| {
            match conn.execute("INSERT INTO chunks_fts(chunks_fts) VALUES ('integrity-check')", []) {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(e, msg))
                    if e.code == rusqlite::ErrorCode::DatabaseCorrupt =>
                {
                    debug!(?msg, "lexical index integrity check failed");
                    Ok(false)
                }
                Err(e) => Err(e),
            }
        })
    }
}

fn write_document(
    conn: &Connection,
    doc: &Document,
    project_id: Option<&str>,
    meta: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO documents (id, project_id, repo, path, sha, title, text, meta, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            project_id = excluded.project_id,
            repo = excluded.repo,
            path = excluded.path,
            sha = excluded.sha,
            title = excluded.title,
            text = excluded.text,
            meta = excluded.meta,
            updated_at = excluded.updated_at",
        params![
            doc.id,
            project_id,
            doc.repo,
            doc.path,
            doc.sha,
            doc.title,
            doc.text,
            meta,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Project of an existing document, if it is stored and scoped.
fn document_project(conn: &Connection, doc_id: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT project_id FROM documents WHERE id = ?1",
        params![doc_id],
        |row| row.get::<_, Option<String>>(0),
    )
    .optional()
    .map(Option::flatten)
}

/// Project whose answers an embedding can influence.
fn owner_project(conn: &Connection, owner: &EmbeddingOwner) -> rusqlite::Result<Option<String>> {
    match owner {
        EmbeddingOwner::Document(id) => document_project(conn, id),
        EmbeddingOwner::Chunk(id) => conn
            .query_row(
                "SELECT project_id FROM chunks WHERE id = ?1",
                params![id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map(Option::flatten),
    }
}

fn write_chunk(conn: &Connection, chunk: &NewChunk, meta: &str, now: &str) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO chunks
         (doc_id, ordinal, content, content_hash, project_id, source_path, title, meta, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            chunk.doc_id,
            chunk.ordinal,
            chunk.content,
            chunk.content_hash,
            chunk.project_id,
            chunk.source_path,
            chunk.title,
            meta,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn write_embedding(conn: &Connection, owner: &EmbeddingOwner, bytes: &[u8]) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO embeddings (owner_kind, owner_id, vector, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(owner_kind, owner_id) DO UPDATE SET
            vector = excluded.vector,
            updated_at = excluded.updated_at",
        params![owner.kind(), owner.key(), bytes, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn delete_embedding(conn: &Connection, owner: &EmbeddingOwner) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM embeddings WHERE owner_kind = ?1 AND owner_id = ?2",
        params![owner.kind(), owner.key()],
    )?;
    Ok(())
}

/// Delete a document's chunks and their vectors; triggers clean the FTS mirror.
fn delete_chunks_of(conn: &Connection, doc_id: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM embeddings
         WHERE owner_kind = 'chunk'
           AND owner_id IN (SELECT CAST(id AS TEXT) FROM chunks WHERE doc_id = ?1)",
        params![doc_id],
    )?;
    conn.execute("DELETE FROM chunks WHERE doc_id = ?1", params![doc_id])
}

fn row_to_chunk(row: &Row<'_>) -> rusqlite::Result<Chunk> {
    let meta: String = row.get(7)?;
    let created_at: String = row.get(8)?;
    Ok(Chunk {
        id: row.get(0)?,
        doc_id: row.get(1)?,
        ordinal: row.get(2)?,
        content: row.get(3)?,
        project_id: row.get(4)?,
        source_path: row.get(5)?,
        title: row.get(6)?,
        meta: parse_meta(7, &meta)?,
        created_at: parse_timestamp(8, &created_at)?,
    })
}

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<Document> {
    let meta: String = row.get(6)?;
    Ok(Document {
        id: row.get(0)?,
        repo: row.get(1)?,
        path: row.get(2)?,
        sha: row.get(3)?,
        title: row.get(4)?,
        text: row.get(5)?,
        meta: parse_meta(6, &meta)?,
    })
}

fn parse_meta(idx: usize, raw: &str) -> rusqlite::Result<DocumentMeta> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn validate_id(what: &str, value: &str) -> Result<(), LodestoneError> {
    if value.trim().is_empty() {
        return Err(LodestoneError::Validation(format!("{what} must not be empty")));
    }
    Ok(())
}

fn validate_chunk(chunk: &NewChunk) -> Result<(), LodestoneError> {
    validate_id("chunk doc_id", &chunk.doc_id)?;
    if chunk.content.trim().is_empty() {
        return Err(LodestoneError::Validation(format!(
            "chunk {} of '{}' has empty content",
            chunk.ordinal, chunk.doc_id
        )));
    }
    Ok(())
}

fn validate_vector(vector: &[f32]) -> Result<(), LodestoneError> {
    if vector.is_empty() {
        return Err(LodestoneError::Validation("embedding vector is empty".into()));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(LodestoneError::Validation(
            "embedding vector contains non-finite values".into(),
        ));
    }
    Ok(())
}

fn floats_to_bytes(floats: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(floats.len() * 4);
    for f in floats {
        bytes.extend_from_slice(&f.to_le_bytes());
    }
    bytes
}

fn bytes_to_floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Scale `v` to unit length; `None` for empty or zero vectors.
pub fn normalize(v: &[f32]) -> Option<Vec<f32>> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if v.is_empty() || norm <= f32::EPSILON || !norm.is_finite() {
        return None;
    }
    Some(v.iter().map(|x| x / norm).collect())
}

/// Cosine similarity of a unit vector `unit` against an arbitrary `other`.
fn cosine_to_unit(unit: &[f32], other: &[f32]) -> f32 {
    match normalize(other) {
        Some(other) => unit.iter().zip(&other).map(|(a, b)| a * b).sum(),
        None => 0.0,
    }
}

fn sanitize_fts_query(query: &str) -> String {
    // Quote each alphanumeric term so FTS5 operators in user input are inert
    let terms: Vec<String> = query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{}\"", w.to_lowercase()))
        .collect();
    terms.join(" OR ")
}
