use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Broad shape of ingested text, deciding how it is split into passages.
///
/// # Examples
///
/// ```
/// use lodestone_core::ContentKind;
///
/// assert_eq!(ContentKind::from_extension("md"), Some(ContentKind::Markdown));
/// assert_eq!(ContentKind::from_extension("rs"), Some(ContentKind::Code));
/// assert_eq!(ContentKind::from_extension("csv"), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Markdown split at headings.
    Markdown,
    /// Source code split at declarations.
    Code,
    /// Anything else.
    Text,
}

impl ContentKind {
    /// Classify a file extension (without the dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "md" | "markdown" | "mdx" => Some(ContentKind::Markdown),
            "rs" | "py" | "ts" | "tsx" | "js" | "jsx" | "mjs" | "go" | "java" | "c" | "h"
            | "cpp" | "cc" | "cxx" | "hpp" | "hh" | "rb" | "kt" | "swift" | "php" | "scala"
            | "sh" | "toml" | "yaml" | "yml" | "json" | "sql" => Some(ContentKind::Code),
            "txt" | "text" | "rst" => Some(ContentKind::Text),
            _ => None,
        }
    }
}

/// Typed metadata attached to documents and their chunks.
///
/// Known keys are typed fields; anything else lands in `extra` and survives a
/// round-trip unchanged.
///
/// # Examples
///
/// ```
/// use lodestone_core::DocumentMeta;
///
/// let meta: DocumentMeta =
///     serde_json::from_str(r#"{"title":"Guide","audience":"ops"}"#).unwrap();
/// assert_eq!(meta.title.as_deref(), Some("Guide"));
/// assert_eq!(meta.extra["audience"], "ops");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMeta {
    /// Explicit content kind; inferred from the path or text when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentKind>,
    /// Path of the source file, relative to its corpus root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    /// Human-readable title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Repository the document came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// Revision of the source (e.g. a git commit SHA).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    /// Programming language hint for code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Free-form labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Unrecognized keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A source document. Re-ingesting the same `id` replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Caller-assigned identifier.
    pub id: String,
    /// Repository name, if known.
    pub repo: Option<String>,
    /// Source path, if known.
    pub path: Option<String>,
    /// Source revision, if known.
    pub sha: Option<String>,
    /// Title, if known.
    pub title: Option<String>,
    /// Full text.
    pub text: String,
    /// Metadata.
    pub meta: DocumentMeta,
}

impl Document {
    /// Build a document, lifting `repo`/`path`/`sha`/`title` out of `meta`.
    ///
    /// # Examples
    ///
    /// ```
    /// use lodestone_core::{Document, DocumentMeta};
    ///
    /// let meta = DocumentMeta {
    ///     source_path: Some("docs/intro.md".into()),
    ///     ..DocumentMeta::default()
    /// };
    /// let doc = Document::from_meta("intro", "hello", meta);
    /// assert_eq!(doc.path.as_deref(), Some("docs/intro.md"));
    /// ```
    pub fn from_meta(id: &str, text: &str, meta: DocumentMeta) -> Self {
        Self {
            id: id.to_string(),
            repo: meta.repo.clone(),
            path: meta.source_path.clone(),
            sha: meta.sha.clone(),
            title: meta.title.clone(),
            text: text.to_string(),
            meta,
        }
    }
}

/// A retrieval-sized passage of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Store-assigned id (insertion order).
    pub id: i64,
    /// Owning document.
    pub doc_id: String,
    /// Stable position within the document.
    pub ordinal: u32,
    /// Passage text.
    pub content: String,
    /// Scope the chunk belongs to.
    pub project_id: Option<String>,
    /// Source path copied from the document.
    pub source_path: Option<String>,
    /// Section or document title.
    pub title: Option<String>,
    /// Metadata copied from the document.
    pub meta: DocumentMeta,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

/// Which dense retrieval path served a query.
///
/// # Examples
///
/// ```
/// use lodestone_core::EmbedMode;
///
/// let json = serde_json::to_string(&EmbedMode::HashFallback).unwrap();
/// assert_eq!(json, "\"hash-fallback\"");
/// assert_eq!(EmbedMode::LocalEmbedder.to_string(), "local-embedder");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmbedMode {
    /// Remote embedding API.
    RemoteEmbedder,
    /// Local embedding model.
    LocalEmbedder,
    /// Deterministic hashing embedder.
    HashFallback,
}

impl fmt::Display for EmbedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbedMode::RemoteEmbedder => write!(f, "remote-embedder"),
            EmbedMode::LocalEmbedder => write!(f, "local-embedder"),
            EmbedMode::HashFallback => write!(f, "hash-fallback"),
        }
    }
}

/// A single retrieved passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    /// Chunk id, or document id for legacy-scan matches.
    pub id: String,
    /// Repository, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// Source path, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Title, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Leading excerpt of the passage.
    pub snippet: String,
    /// Relevance score from the final ranking stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

/// The result of a query: ranked matches and the dense path that served them.
///
/// # Examples
///
/// ```
/// use lodestone_core::{EmbedMode, QueryResponse};
///
/// let empty = QueryResponse::empty(EmbedMode::HashFallback);
/// let json = serde_json::to_value(&empty).unwrap();
/// assert_eq!(json["matches"].as_array().unwrap().len(), 0);
/// assert_eq!(json["mode"], "hash-fallback");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    /// Ranked matches, best first.
    pub matches: Vec<Match>,
    /// Dense retrieval path used.
    pub mode: EmbedMode,
}

impl QueryResponse {
    /// A response with no matches.
    pub fn empty(mode: EmbedMode) -> Self {
        Self {
            matches: Vec::new(),
            mode,
        }
    }
}

/// Outcome of ingesting one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    /// Always `true` for a returned report; failures surface as errors.
    pub ok: bool,
    /// Chunks written.
    pub inserted: usize,
}

/// Output format for CLI commands.
///
/// # Examples
///
/// ```
/// use lodestone_core::OutputFormat;
///
/// let fmt: OutputFormat = "json".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Json);
///
/// let fmt: OutputFormat = "md".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Markdown);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text.
    #[default]
    Text,
    /// JSON with camelCase keys.
    Json,
    /// GitHub-flavored Markdown.
    Markdown,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Markdown => write!(f, "markdown"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("sarif".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::default(), OutputFormat::Text);
    }

    #[test]
    fn meta_preserves_unknown_keys() {
        let raw = r#"{"contentType":"markdown","tags":["a"],"owner":{"team":"core"}}"#;
        let meta: DocumentMeta = serde_json::from_str(raw).unwrap();
        assert_eq!(meta.content_type, Some(ContentKind::Markdown));
        assert_eq!(meta.tags, vec!["a"]);

        let back = serde_json::to_value(&meta).unwrap();
        assert_eq!(back["owner"]["team"], "core");
        assert_eq!(back["contentType"], "markdown");
    }

    #[test]
    fn empty_meta_serializes_to_empty_object() {
        let json = serde_json::to_string(&DocumentMeta::default()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn match_omits_missing_optionals() {
        let m = Match {
            id: "7".into(),
            repo: None,
            path: None,
            title: Some("Ledger".into()),
            snippet: "text".into(),
            score: None,
        };
        let json = serde_json::to_value(&m).unwrap();
        assert!(json.get("repo").is_none());
        assert!(json.get("score").is_none());
        assert_eq!(json["title"], "Ledger");
    }

    #[test]
    fn embed_mode_round_trips_through_json() {
        for mode in [
            EmbedMode::RemoteEmbedder,
            EmbedMode::LocalEmbedder,
            EmbedMode::HashFallback,
        ] {
            let json = serde_json::to_string(&mode).unwrap();
            assert_eq!(json, format!("\"{mode}\""));
        }
    }
}
