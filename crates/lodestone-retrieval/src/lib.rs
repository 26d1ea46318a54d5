//! Hybrid retrieval over a local SQLite index.
//!
//! Documents are split into passages, indexed for BM25 keyword search and
//! for cosine similarity over embeddings, and queried through a pipeline
//! that fuses both recall lists with Reciprocal Rank Fusion before an
//! optional rerank. See [`search::Engine`] for the entry point.

pub mod cache;
pub mod chunker;
pub mod embedding;
pub mod fusion;
pub mod llm;
pub mod rerank;
pub mod retry;
pub mod search;
pub mod store;
pub mod walker;

pub use search::{Engine, QueryStage};
