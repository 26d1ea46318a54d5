use std::path::PathBuf;

/// Errors that can occur across the lodestone engine.
///
/// Library crates return this type directly; the binary renders it through
/// `miette` at the boundary. Degraded-capability variants
/// ([`EmbedderUnavailable`](LodestoneError::EmbedderUnavailable),
/// [`RerankUnavailable`](LodestoneError::RerankUnavailable)) are absorbed
/// inside the engine and only surface from the individual adapters.
///
/// # Examples
///
/// ```
/// use lodestone_core::LodestoneError;
///
/// let err = LodestoneError::Validation("project_id must not be empty".into());
/// assert!(err.to_string().contains("project_id"));
/// ```
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum LodestoneError {
    /// Caller-supplied input is invalid (missing ids, malformed payload).
    #[error("validation error: {0}")]
    #[diagnostic(code(lodestone::validation))]
    Validation(String),

    /// Lock contention persisted past the retry budget.
    #[error("storage busy: gave up after {attempts} attempts")]
    #[diagnostic(
        code(lodestone::storage_busy),
        help("another process holds the index lock; retry later or raise store.retry.max_attempts")
    )]
    StorageBusy {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// SQLite failure that is not transient contention.
    #[error("database error: {0}")]
    #[diagnostic(code(lodestone::database))]
    Database(String),

    /// Embedding backend network or auth failure.
    #[error("embedder unavailable: {0}")]
    #[diagnostic(code(lodestone::embedder_unavailable))]
    EmbedderUnavailable(String),

    /// Cross-encoder and LLM rerank both failed.
    #[error("rerank unavailable: {0}")]
    #[diagnostic(code(lodestone::rerank_unavailable))]
    RerankUnavailable(String),

    /// LLM API or response error.
    #[error("LLM error: {0}")]
    #[diagnostic(code(lodestone::llm))]
    Llm(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    #[diagnostic(code(lodestone::config))]
    Config(String),

    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    #[diagnostic(code(lodestone::io))]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    #[diagnostic(code(lodestone::serialization))]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    #[diagnostic(code(lodestone::toml))]
    Toml(#[from] toml::de::Error),

    /// A required file was not found.
    #[error("file not found: {}", .0.display())]
    #[diagnostic(code(lodestone::file_not_found))]
    FileNotFound(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: LodestoneError = io_err.into();
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn storage_busy_reports_attempts() {
        let err = LodestoneError::StorageBusy { attempts: 5 };
        assert_eq!(err.to_string(), "storage busy: gave up after 5 attempts");
    }

    #[test]
    fn file_not_found_shows_path() {
        let err = LodestoneError::FileNotFound(PathBuf::from("/tmp/missing.md"));
        assert!(err.to_string().contains("/tmp/missing.md"));
    }
}
