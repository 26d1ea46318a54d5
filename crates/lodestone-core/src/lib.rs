//! Core types, configuration, and error handling for lodestone.
//!
//! This crate provides the shared foundation used by the retrieval engine
//! and the CLI:
//! - [`LodestoneError`] — unified error type using `thiserror`
//! - [`LodestoneConfig`] — configuration loaded from `.lodestone.toml`
//! - Shared types: [`Document`], [`DocumentMeta`], [`Chunk`], [`Match`],
//!   [`QueryResponse`], [`EmbedMode`], [`IngestReport`], [`OutputFormat`]

mod config;
mod error;
mod types;

pub use config::{
    CacheConfig, ChunkingConfig, EmbeddingConfig, IngestBackend, LlmConfig, LodestoneConfig,
    QueryConfig, RerankConfig, RetryConfig, StoreConfig, LOCAL_BASE_DIM, LOCAL_SMALL_DIM,
    MAX_LLM_WINDOW,
};
pub use error::LodestoneError;
pub use types::{
    Chunk, ContentKind, Document, DocumentMeta, EmbedMode, IngestReport, Match, OutputFormat,
    QueryResponse,
};

/// A convenience `Result` type for lodestone operations.
pub type Result<T> = std::result::Result<T, LodestoneError>;
