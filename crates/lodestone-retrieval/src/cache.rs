//! Memoized query responses, scoped by project.
//!
//! Entries are keyed by `sha256(k + "\n" + normalized query)` within a
//! project scope; unscoped queries use the `''` scope. Entries are never
//! authoritative: any read or write failure is logged and treated as a miss.
//!
//! Every scope carries a generation counter that invalidation bumps. A query
//! reads the generation before it touches the indexes and stores its answer
//! only if the counter is unchanged, so a write that commits mid-query
//! cannot be masked by the answer computed before it.

use chrono::{DateTime, TimeDelta, Utc};
use lodestone_core::{CacheConfig, LodestoneError, QueryResponse};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::store::StoreConn;

const UNSCOPED: &str = "";

/// Lowercase `query` and collapse runs of whitespace to single spaces.
///
/// # Examples
///
/// ```
/// use lodestone_retrieval::cache::normalize_query;
///
/// assert_eq!(normalize_query("  How DO I\treconcile?  "), "how do i reconcile?");
/// ```
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cache key for `query` at depth `k`.
pub fn query_hash(query: &str, k: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{k}\n{}", normalize_query(query)).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Drop entries that may have seen a change to `project_id`.
///
/// The unscoped scope is always included since unscoped queries span every
/// project.
pub(crate) fn invalidate_scope(conn: &Connection, project_id: Option<&str>) -> rusqlite::Result<usize> {
    let scope = project_id.unwrap_or(UNSCOPED);
    let mut bump = conn.prepare_cached(
        "INSERT INTO cache_generations (project_id, generation) VALUES (?1, 1)
         ON CONFLICT(project_id) DO UPDATE SET generation = generation + 1",
    )?;
    bump.execute(params![scope])?;
    if scope != UNSCOPED {
        bump.execute(params![UNSCOPED])?;
    }
    conn.execute(
        "DELETE FROM answer_cache WHERE project_id = ?1 OR project_id = ?2",
        params![scope, UNSCOPED],
    )
}

fn read_generation(conn: &Connection, scope: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE((SELECT generation FROM cache_generations WHERE project_id = ?1), 0)",
        params![scope],
        |row| row.get(0),
    )
}

/// Answer cache operations over a [`StoreConn`].
///
/// # Examples
///
/// ```
/// use lodestone_core::{CacheConfig, EmbedMode, QueryResponse, StoreConfig};
/// use lodestone_retrieval::cache::AnswerCache;
/// use lodestone_retrieval::store::Store;
///
/// let dir = tempfile::tempdir().unwrap();
/// let store = Store::new(&StoreConfig { path: dir.path().join("index.db"), ..Default::default() });
/// let mut conn = store.connect().unwrap();
/// let cache = AnswerCache::new(&CacheConfig::default());
///
/// let answer = QueryResponse::empty(EmbedMode::HashFallback);
/// cache.put(&mut conn, Some("demo"), "Ledger?", 5, &answer);
/// assert_eq!(cache.get(&conn, Some("demo"), "  ledger? ", 5), Some(answer));
/// assert_eq!(cache.get(&conn, Some("demo"), "ledger?", 6), None);
/// ```
#[derive(Debug, Clone)]
pub struct AnswerCache {
    enabled: bool,
    ttl: Option<TimeDelta>,
}

impl AnswerCache {
    /// Create a cache from the `[cache]` config section.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            ttl: config
                .ttl_secs
                .and_then(|s| i64::try_from(s).ok())
                .and_then(TimeDelta::try_seconds),
        }
    }

    /// Look up a cached response. Failures and expired or corrupt entries are misses.
    pub fn get(
        &self,
        conn: &StoreConn,
        project_id: Option<&str>,
        query: &str,
        k: usize,
    ) -> Option<QueryResponse> {
        if !self.enabled {
            return None;
        }
        let scope = project_id.unwrap_or(UNSCOPED);
        let key = query_hash(query, k);

        let row = conn.read("cache get", |c| {
            c.query_row(
                "SELECT answer, created_at FROM answer_cache WHERE project_id = ?1 AND query_hash = ?2",
                params![scope, key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
        });

        let (answer, created_at) = match row {
            Ok(Some(row)) => row,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "answer cache read failed");
                return None;
            }
        };

        if let Some(ttl) = self.ttl {
            let fresh = DateTime::parse_from_rfc3339(&created_at)
                .map(|t| Utc::now().signed_duration_since(t.with_timezone(&Utc)) <= ttl)
                .unwrap_or(false);
            if !fresh {
                debug!(scope, "answer cache entry expired");
                return None;
            }
        }

        match serde_json::from_str(&answer) {
            Ok(response) => Some(response),
            Err(e) => {
                debug!(error = %e, scope, "discarding corrupt answer cache entry");
                None
            }
        }
    }

    /// Current generation of the scope `project_id` queries read from.
    ///
    /// Returns `None` when the cache is disabled or the counter cannot be read;
    /// a caller without a generation should skip [`AnswerCache::put_if_current`].
    pub fn generation(&self, conn: &StoreConn, project_id: Option<&str>) -> Option<i64> {
        if !self.enabled {
            return None;
        }
        let scope = project_id.unwrap_or(UNSCOPED);
        match conn.read("cache generation", |c| read_generation(c, scope)) {
            Ok(generation) => Some(generation),
            Err(e) => {
                warn!(error = %e, "answer cache generation unavailable");
                None
            }
        }
    }

    /// Store a response unconditionally. Failures are logged and ignored.
    pub fn put(
        &self,
        conn: &mut StoreConn,
        project_id: Option<&str>,
        query: &str,
        k: usize,
        response: &QueryResponse,
    ) {
        self.store(conn, project_id, query, k, response, None);
    }

    /// Store a response only if the scope is still at `generation`.
    ///
    /// Returns whether the entry was written. An invalidation committed since
    /// `generation` was read means `response` may predate the change, so it is
    /// dropped.
    pub fn put_if_current(
        &self,
        conn: &mut StoreConn,
        project_id: Option<&str>,
        query: &str,
        k: usize,
        response: &QueryResponse,
        generation: i64,
    ) -> bool {
        self.store(conn, project_id, query, k, response, Some(generation))
    }

    fn store(
        &self,
        conn: &mut StoreConn,
        project_id: Option<&str>,
        query: &str,
        k: usize,
        response: &QueryResponse,
        generation: Option<i64>,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        let payload = match serde_json::to_string(response) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "answer cache serialization failed");
                return false;
            }
        };
        let scope = project_id.unwrap_or(UNSCOPED);
        let key = query_hash(query, k);
        let now = Utc::now().to_rfc3339();

        let result = conn.write("cache put", |c| {
            c.execute(
                "INSERT INTO answer_cache (project_id, query_hash, answer, created_at)
                 SELECT ?1, ?2, ?3, ?4
                 WHERE ?5 IS NULL
                    OR COALESCE((SELECT generation FROM cache_generations WHERE project_id = ?1), 0) = ?5
                 ON CONFLICT(project_id, query_hash) DO UPDATE SET
                    answer = excluded.answer,
                    created_at = excluded.created_at",
                params![scope, key, payload, now, generation],
            )
        });
        match result {
            Ok(0) => {
                debug!(scope, "answer cache write dropped, scope changed during query");
                false
            }
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "answer cache write failed");
                false
            }
        }
    }

    /// Drop every entry that could reflect `project_id`, including unscoped ones.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::StorageBusy`] or [`LodestoneError::Database`]
    /// if the delete cannot be committed.
    pub fn invalidate_project(
        &self,
        conn: &mut StoreConn,
        project_id: Option<&str>,
    ) -> Result<usize, LodestoneError> {
        conn.write("cache invalidate", |c| invalidate_scope(c, project_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use lodestone_core::{EmbedMode, Match, StoreConfig};

    fn open_temp() -> (tempfile::TempDir, StoreConn) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(&StoreConfig {
            path: dir.path().join("index.db"),
            ..StoreConfig::default()
        });
        let conn = store.connect().unwrap();
        (dir, conn)
    }

    fn answer(snippet: &str) -> QueryResponse {
        QueryResponse {
            matches: vec![Match {
                id: "1".into(),
                repo: None,
                path: None,
                title: None,
                snippet: snippet.into(),
                score: Some(1.0),
            }],
            mode: EmbedMode::HashFallback,
        }
    }

    #[test]
    fn key_depends_on_k_and_normalized_text() {
        assert_eq!(query_hash("Hello  World", 3), query_hash("hello world", 3));
        assert_ne!(query_hash("hello world", 3), query_hash("hello world", 4));
        assert_ne!(query_hash("hello", 3), query_hash("world", 3));
    }

    #[test]
    fn scopes_are_isolated() {
        let (_dir, mut conn) = open_temp();
        let cache = AnswerCache::new(&CacheConfig::default());
        cache.put(&mut conn, Some("alpha"), "q", 5, &answer("a"));
        cache.put(&mut conn, None, "q", 5, &answer("global"));

        assert_eq!(cache.get(&conn, Some("alpha"), "q", 5), Some(answer("a")));
        assert_eq!(cache.get(&conn, None, "q", 5), Some(answer("global")));
        assert_eq!(cache.get(&conn, Some("beta"), "q", 5), None);
    }

    #[test]
    fn invalidation_clears_project_and_unscoped() {
        let (_dir, mut conn) = open_temp();
        let cache = AnswerCache::new(&CacheConfig::default());
        cache.put(&mut conn, Some("alpha"), "q", 5, &answer("a"));
        cache.put(&mut conn, Some("beta"), "q", 5, &answer("b"));
        cache.put(&mut conn, None, "q", 5, &answer("g"));

        assert_eq!(cache.invalidate_project(&mut conn, Some("alpha")).unwrap(), 2);
        assert_eq!(cache.get(&conn, Some("alpha"), "q", 5), None);
        assert_eq!(cache.get(&conn, None, "q", 5), None);
        assert_eq!(cache.get(&conn, Some("beta"), "q", 5), Some(answer("b")));
    }

    #[test]
    fn put_overwrites() {
        let (_dir, mut conn) = open_temp();
        let cache = AnswerCache::new(&CacheConfig::default());
        cache.put(&mut conn, None, "q", 1, &answer("old"));
        cache.put(&mut conn, None, "q", 1, &answer("new"));
        assert_eq!(cache.get(&conn, None, "q", 1), Some(answer("new")));
    }

    #[test]
    fn corrupt_payload_is_a_miss() {
        let (_dir, mut conn) = open_temp();
        let cache = AnswerCache::new(&CacheConfig::default());
        let key = query_hash("q", 2);
        conn.write("seed", |c| {
            c.execute(
                "INSERT INTO answer_cache (project_id, query_hash, answer, created_at)
                 VALUES ('', ?1, 'not json', ?2)",
                params![key, Utc::now().to_rfc3339()],
            )
        })
        .unwrap();
        assert_eq!(cache.get(&conn, None, "q", 2), None);
    }

    #[test]
    fn expired_entries_are_misses() {
        let (_dir, mut conn) = open_temp();
        let cache = AnswerCache::new(&CacheConfig {
            enabled: true,
            ttl_secs: Some(60),
        });
        let payload = serde_json::to_string(&answer("stale")).unwrap();
        let old = (Utc::now() - TimeDelta::seconds(3600)).to_rfc3339();
        conn.write("seed", |c| {
            c.execute(
                "INSERT INTO answer_cache (project_id, query_hash, answer, created_at)
                 VALUES ('', ?1, ?2, ?3)",
                params![query_hash("q", 2), payload, old],
            )
        })
        .unwrap();
        assert_eq!(cache.get(&conn, None, "q", 2), None);

        cache.put(&mut conn, None, "q", 2, &answer("fresh"));
        assert_eq!(cache.get(&conn, None, "q", 2), Some(answer("fresh")));
    }

    #[test]
    fn disabled_cache_never_hits() {
        let (_dir, mut conn) = open_temp();
        let cache = AnswerCache::new(&CacheConfig {
            enabled: false,
            ttl_secs: None,
        });
        cache.put(&mut conn, None, "q", 1, &answer("x"));
        assert_eq!(cache.get(&conn, None, "q", 1), None);
    }

    #[test]
    fn write_after_invalidation_is_dropped() {
        let (_dir, mut conn) = open_temp();
        let cache = AnswerCache::new(&CacheConfig::default());
        let seen = cache.generation(&conn, Some("alpha")).unwrap();
        let unscoped = cache.generation(&conn, None).unwrap();

        cache.invalidate_project(&mut conn, Some("alpha")).unwrap();

        assert!(!cache.put_if_current(&mut conn, Some("alpha"), "q", 5, &answer("old"), seen));
        assert!(!cache.put_if_current(&mut conn, None, "q", 5, &answer("old"), unscoped));
        assert_eq!(cache.get(&conn, Some("alpha"), "q", 5), None);
        assert_eq!(cache.get(&conn, None, "q", 5), None);

        let current = cache.generation(&conn, Some("alpha")).unwrap();
        assert_ne!(current, seen);
        assert!(cache.put_if_current(&mut conn, Some("alpha"), "q", 5, &answer("new"), current));
        assert_eq!(cache.get(&conn, Some("alpha"), "q", 5), Some(answer("new")));
    }

    #[test]
    fn other_projects_keep_their_generation() {
        let (_dir, mut conn) = open_temp();
        let cache = AnswerCache::new(&CacheConfig::default());
        let beta = cache.generation(&conn, Some("beta")).unwrap();
        cache.invalidate_project(&mut conn, Some("alpha")).unwrap();
        assert!(cache.put_if_current(&mut conn, Some("beta"), "q", 5, &answer("b"), beta));
    }

    #[test]
    fn oversized_ttl_means_no_expiry() {
        let (_dir, mut conn) = open_temp();
        for ttl_secs in [u64::MAX, 100_000_000_000_000_000] {
            let cache = AnswerCache::new(&CacheConfig {
                enabled: true,
                ttl_secs: Some(ttl_secs),
            });
            cache.put(&mut conn, None, "q", 1, &answer("kept"));
            assert_eq!(cache.get(&conn, None, "q", 1), Some(answer("kept")));
        }
    }
}
