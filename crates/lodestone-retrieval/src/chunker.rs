//! Splitting documents into retrieval-sized passages.
//!
//! Markdown is split at headings, source code at tree-sitter top-level
//! declaration boundaries, and plain text keeps a single leading window.
//! Oversized pieces are hard-wrapped without overlap.

use std::path::Path;

use lodestone_core::{ChunkingConfig, ContentKind, DocumentMeta};
use sha2::{Digest, Sha256};
use tree_sitter::{Node, Parser};

/// A passage produced by the chunker, ready to be stored.
///
/// # Examples
///
/// ```
/// use lodestone_core::{ChunkingConfig, DocumentMeta};
/// use lodestone_retrieval::chunker::Chunker;
///
/// let chunker = Chunker::new(ChunkingConfig::default());
/// let passages = chunker.split("# Intro\nhello\n# Usage\nrun it", &DocumentMeta::default());
/// assert_eq!(passages.len(), 2);
/// assert_eq!(passages[1].title.as_deref(), Some("Usage"));
/// assert_eq!(passages[1].ordinal, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Passage {
    /// Position within the document, starting at 0.
    pub ordinal: u32,
    /// Passage text, trimmed.
    pub content: String,
    /// Heading of the enclosing markdown section, or the document title.
    pub title: Option<String>,
    /// SHA-256 of `content`.
    pub content_hash: String,
}

/// Programming languages with a bundled tree-sitter grammar.
///
/// # Examples
///
/// ```
/// use lodestone_retrieval::chunker::Language;
///
/// assert_eq!(Language::from_extension("rs"), Language::Rust);
/// assert_eq!(Language::from_name("TypeScript"), Language::TypeScript);
/// assert_eq!(Language::from_extension("txt"), Language::Unknown);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Rust,
    Python,
    TypeScript,
    JavaScript,
    Go,
    Java,
    C,
    Cpp,
    Ruby,
    Unknown,
}

impl Language {
    /// Detect language from a file extension (without the dot).
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "rs" => Language::Rust,
            "py" => Language::Python,
            "ts" | "tsx" => Language::TypeScript,
            "js" | "jsx" | "mjs" => Language::JavaScript,
            "go" => Language::Go,
            "java" => Language::Java,
            "c" | "h" => Language::C,
            "cpp" | "cc" | "cxx" | "hpp" | "hxx" | "hh" => Language::Cpp,
            "rb" => Language::Ruby,
            _ => Language::Unknown,
        }
    }

    /// Detect language from a name such as `"rust"` or `"c++"`.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "rust" => Language::Rust,
            "python" => Language::Python,
            "typescript" => Language::TypeScript,
            "javascript" => Language::JavaScript,
            "go" | "golang" => Language::Go,
            "java" => Language::Java,
            "c" => Language::C,
            "cpp" | "c++" => Language::Cpp,
            "ruby" => Language::Ruby,
            _ => Language::Unknown,
        }
    }

    /// The tree-sitter grammar, or `None` for [`Language::Unknown`].
    pub fn tree_sitter_language(&self) -> Option<tree_sitter::Language> {
        match self {
            Language::Rust => Some(tree_sitter_rust::LANGUAGE.into()),
            Language::Python => Some(tree_sitter_python::LANGUAGE.into()),
            Language::TypeScript => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
            Language::JavaScript => Some(tree_sitter_javascript::LANGUAGE.into()),
            Language::Go => Some(tree_sitter_go::LANGUAGE.into()),
            Language::Java => Some(tree_sitter_java::LANGUAGE.into()),
            Language::C => Some(tree_sitter_c::LANGUAGE.into()),
            Language::Cpp => Some(tree_sitter_cpp::LANGUAGE.into()),
            Language::Ruby => Some(tree_sitter_ruby::LANGUAGE.into()),
            Language::Unknown => None,
        }
    }

    fn detect(meta: &DocumentMeta) -> Self {
        if let Some(name) = &meta.language {
            let lang = Language::from_name(name);
            if lang != Language::Unknown {
                return lang;
            }
        }
        meta.source_path
            .as_deref()
            .and_then(|p| Path::new(p).extension())
            .and_then(|e| e.to_str())
            .map(Language::from_extension)
            .unwrap_or(Language::Unknown)
    }
}

/// Node kinds that start a new top-level segment.
const DECLARATION_KINDS: &[&str] = &[
    // rust
    "function_item",
    "struct_item",
    "enum_item",
    "trait_item",
    "impl_item",
    "mod_item",
    "macro_definition",
    "const_item",
    "static_item",
    "type_item",
    // python
    "function_definition",
    "class_definition",
    "decorated_definition",
    // javascript / typescript
    "function_declaration",
    "class_declaration",
    "interface_declaration",
    "type_alias_declaration",
    "enum_declaration",
    "lexical_declaration",
    "export_statement",
    // go
    "method_declaration",
    "type_declaration",
    // java
    "record_declaration",
    // c / c++
    "struct_specifier",
    "class_specifier",
    "namespace_definition",
    "template_declaration",
    // ruby
    "method",
    "singleton_method",
    "class",
    "module",
];

/// Decide how a document should be split.
///
/// Explicit `content_type` wins, then the source path extension, then a
/// `# ` heading anywhere in the text; otherwise plain text.
///
/// # Examples
///
/// ```
/// use lodestone_core::{ContentKind, DocumentMeta};
/// use lodestone_retrieval::chunker::resolve_kind;
///
/// let meta = DocumentMeta { source_path: Some("src/lib.rs".into()), ..Default::default() };
/// assert_eq!(resolve_kind("fn main() {}", &meta), ContentKind::Code);
/// assert_eq!(resolve_kind("# Title\nbody", &DocumentMeta::default()), ContentKind::Markdown);
/// assert_eq!(resolve_kind("just words", &DocumentMeta::default()), ContentKind::Text);
/// ```
pub fn resolve_kind(text: &str, meta: &DocumentMeta) -> ContentKind {
    if let Some(kind) = meta.content_type {
        return kind;
    }
    let from_path = meta
        .source_path
        .as_deref()
        .and_then(|p| Path::new(p).extension())
        .and_then(|e| e.to_str())
        .and_then(ContentKind::from_extension);
    if let Some(kind) = from_path {
        return kind;
    }
    if text.lines().any(|l| l.starts_with("# ")) {
        return ContentKind::Markdown;
    }
    ContentKind::Text
}

/// SHA-256 hex digest of `content`.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cut `text` into pieces of at most `max_chars` characters.
///
/// Within each window the cut prefers the last newline, then the last
/// whitespace, in the second half of the window; otherwise it falls exactly
/// at `max_chars`. Pieces never overlap and concatenate back to `text`.
///
/// # Examples
///
/// ```
/// use lodestone_retrieval::chunker::hard_wrap;
///
/// let pieces = hard_wrap("alpha beta gamma", 11);
/// assert_eq!(pieces, vec!["alpha beta ", "gamma"]);
/// assert_eq!(pieces.concat(), "alpha beta gamma");
/// ```
pub fn hard_wrap(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut pieces = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let Some((limit, _)) = rest.char_indices().nth(max_chars) else {
            pieces.push(rest.to_string());
            break;
        };
        let window = &rest[..limit];
        let half = window
            .char_indices()
            .nth(max_chars / 2)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let tail = &window[half..];

        let cut = tail
            .rfind('\n')
            .map(|i| half + i + 1)
            .or_else(|| {
                tail.rfind(char::is_whitespace).map(|i| {
                    let width = tail[i..].chars().next().map(char::len_utf8).unwrap_or(1);
                    half + i + width
                })
            })
            .unwrap_or(limit);

        pieces.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }

    pieces
}

/// Splits documents according to their [`ContentKind`].
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    /// Create a chunker with the given limits.
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// Split `text` into ordered, non-empty passages.
    pub fn split(&self, text: &str, meta: &DocumentMeta) -> Vec<Passage> {
        let pieces: Vec<(String, Option<String>)> = match resolve_kind(text, meta) {
            ContentKind::Markdown => self.split_markdown(text, meta.title.as_deref()),
            ContentKind::Code => self
                .split_code(text, Language::detect(meta))
                .into_iter()
                .map(|p| (p, meta.title.clone()))
                .collect(),
            ContentKind::Text => {
                let window: String = text.chars().take(self.config.text_window_chars).collect();
                vec![(window, meta.title.clone())]
            }
        };

        pieces
            .into_iter()
            .filter_map(|(content, title)| {
                let content = content.trim();
                (!content.is_empty()).then(|| (content.to_string(), title))
            })
            .enumerate()
            .map(|(i, (content, title))| Passage {
                ordinal: i as u32,
                content_hash: content_hash(&content),
                content,
                title,
            })
            .collect()
    }

    fn split_markdown(&self, text: &str, doc_title: Option<&str>) -> Vec<(String, Option<String>)> {
        let mut sections: Vec<(String, Option<String>)> = Vec::new();
        let mut current = String::new();
        let mut current_title = doc_title.map(String::from);
        let mut in_fence = false;

        for line in text.split_inclusive('\n') {
            let trimmed = line.trim_start();
            if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
                in_fence = !in_fence;
            }
            if !in_fence {
                if let Some(heading) = heading_text(line) {
                    if !current.trim().is_empty() {
                        sections.push((std::mem::take(&mut current), current_title.clone()));
                    }
                    current.clear();
                    current_title = Some(heading);
                }
            }
            current.push_str(line);
        }
        if !current.trim().is_empty() {
            sections.push((current, current_title));
        }

        sections
            .into_iter()
            .flat_map(|(body, title)| {
                hard_wrap(&body, self.config.markdown_max_chars)
                    .into_iter()
                    .map(move |piece| (piece, title.clone()))
            })
            .collect()
    }

    fn split_code(&self, text: &str, language: Language) -> Vec<String> {
        let max = self.config.code_max_chars;
        let segments = declaration_segments(text, language);
        if segments.len() <= 1 {
            return hard_wrap(text, max);
        }

        let mut packed = Vec::new();
        let mut current = String::new();
        let mut current_len = 0usize;
        for segment in segments {
            let len = segment.chars().count();
            if current_len + len <= max {
                current.push_str(segment);
                current_len += len;
                continue;
            }
            if !current.is_empty() {
                packed.push(std::mem::take(&mut current));
                current_len = 0;
            }
            if len > max {
                packed.extend(hard_wrap(segment, max));
            } else {
                current.push_str(segment);
                current_len = len;
            }
        }
        if !current.is_empty() {
            packed.push(current);
        }
        packed
    }
}

/// Heading text of an ATX heading line, if `line` is one.
fn heading_text(line: &str) -> Option<String> {
    let line = line.trim_end_matches(['\n', '\r']);
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.is_empty() && !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    Some(rest.trim().trim_end_matches('#').trim().to_string())
}

/// Split source into contiguous segments, each starting at a top-level
/// declaration (or the comments directly above it).
fn declaration_segments(text: &str, language: Language) -> Vec<&str> {
    let Some(ts_language) = language.tree_sitter_language() else {
        return vec![text];
    };
    let mut parser = Parser::new();
    if parser.set_language(&ts_language).is_err() {
        return vec![text];
    }
    let Some(tree) = parser.parse(text, None) else {
        return vec![text];
    };

    let boundaries = top_level_boundaries(tree.root_node(), text);
    if boundaries.is_empty() {
        return vec![text];
    }

    let mut segments = Vec::with_capacity(boundaries.len() + 1);
    let mut start = 0usize;
    for boundary in boundaries {
        if boundary > start {
            segments.push(&text[start..boundary]);
            start = boundary;
        }
    }
    segments.push(&text[start..]);
    segments
}

fn top_level_boundaries(root: Node, text: &str) -> Vec<usize> {
    let mut boundaries = Vec::new();
    let mut comment_start: Option<usize> = None;
    let mut cursor = root.walk();

    for child in root.children(&mut cursor) {
        let kind = child.kind();
        if kind.contains("comment") {
            comment_start.get_or_insert(child.start_byte());
            continue;
        }
        if DECLARATION_KINDS.contains(&kind) {
            let start = comment_start.unwrap_or(child.start_byte());
            if start > 0 && text.is_char_boundary(start) {
                boundaries.push(start);
            }
        }
        comment_start = None;
    }
    boundaries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rust_meta() -> DocumentMeta {
        DocumentMeta {
            source_path: Some("src/lib.rs".into()),
            ..DocumentMeta::default()
        }
    }

    #[test]
    fn hard_wrap_respects_limit_and_preserves_text() {
        let text = "word ".repeat(200);
        let pieces = hard_wrap(&text, 64);
        assert!(pieces.iter().all(|p| p.chars().count() <= 64));
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn hard_wrap_prefers_newlines() {
        let text = "first line here\nsecond line continues on";
        let pieces = hard_wrap(text, 20);
        assert_eq!(pieces[0], "first line here\n");
    }

    #[test]
    fn hard_wrap_cuts_unbroken_text_exactly() {
        let pieces = hard_wrap(&"x".repeat(25), 10);
        let lens: Vec<usize> = pieces.iter().map(|p| p.len()).collect();
        assert_eq!(lens, vec![10, 10, 5]);
    }

    #[test]
    fn hard_wrap_handles_multibyte_chars() {
        let text = "é".repeat(30);
        let pieces = hard_wrap(&text, 7);
        assert!(pieces.iter().all(|p| p.chars().count() <= 7));
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn markdown_splits_at_headings_but_not_inside_fences() {
        let text = "# Setup\nInstall it.\n```sh\n# not a heading\n```\n## Usage\nRun it.\n";
        let chunker = Chunker::default();
        let passages = chunker.split(text, &DocumentMeta::default());
        assert_eq!(passages.len(), 2);
        assert_eq!(passages[0].title.as_deref(), Some("Setup"));
        assert!(passages[0].content.contains("# not a heading"));
        assert_eq!(passages[1].title.as_deref(), Some("Usage"));
    }

    #[test]
    fn markdown_preamble_takes_document_title() {
        let meta = DocumentMeta {
            content_type: Some(ContentKind::Markdown),
            title: Some("Guide".into()),
            ..DocumentMeta::default()
        };
        let passages = Chunker::default().split("intro text\n# Part\nbody\n", &meta);
        assert_eq!(passages[0].title.as_deref(), Some("Guide"));
        assert_eq!(passages[1].title.as_deref(), Some("Part"));
    }

    #[test]
    fn long_markdown_section_is_wrapped() {
        let meta = DocumentMeta {
            content_type: Some(ContentKind::Markdown),
            ..DocumentMeta::default()
        };
        let body = "sentence about ledgers. ".repeat(200);
        let text = format!("# Ledger\n{body}");
        let passages = Chunker::default().split(&text, &meta);
        assert!(passages.len() > 1);
        assert!(passages.iter().all(|p| p.content.chars().count() <= 1500));
        assert!(passages.iter().all(|p| p.title.as_deref() == Some("Ledger")));
    }

    #[test]
    fn text_keeps_single_leading_window() {
        let text = "a".repeat(5000);
        let passages = Chunker::default().split(&text, &DocumentMeta::default());
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].content.len(), 2000);
    }

    #[test]
    fn code_is_split_at_declarations() {
        let source = "\
use std::io;

/// Adds.
fn add(a: i32, b: i32) -> i32 {
    a + b
}

struct Point {
    x: i32,
}

fn sub(a: i32, b: i32) -> i32 {
    a - b
}
";
        let chunker = Chunker::new(ChunkingConfig {
            code_max_chars: 60,
            ..ChunkingConfig::default()
        });
        let passages = chunker.split(source, &rust_meta());
        assert!(passages.len() >= 3, "{passages:?}");
        assert!(passages.iter().any(|p| p.content.starts_with("/// Adds.")));
        assert!(passages.iter().any(|p| p.content.starts_with("struct Point")));
        assert!(passages.iter().all(|p| p.content.chars().count() <= 60));
    }

    #[test]
    fn small_code_is_packed_together() {
        let source = "fn a() {}\nfn b() {}\nfn c() {}\n";
        let passages = Chunker::default().split(source, &rust_meta());
        assert_eq!(passages.len(), 1);
        assert!(passages[0].content.contains("fn c()"));
    }

    #[test]
    fn unknown_language_code_is_wrapped() {
        let meta = DocumentMeta {
            source_path: Some("config.yaml".into()),
            ..DocumentMeta::default()
        };
        let text = "key: value\n".repeat(300);
        let passages = Chunker::default().split(&text, &meta);
        assert!(passages.len() > 1);
        assert!(passages.iter().all(|p| p.content.chars().count() <= 1400));
    }

    #[test]
    fn ordinals_are_dense_and_empty_chunks_dropped() {
        let text = "# A\n\n\n# B\nbody\n# C\nmore\n";
        let passages = Chunker::default().split(text, &DocumentMeta::default());
        let ordinals: Vec<u32> = passages.iter().map(|p| p.ordinal).collect();
        assert_eq!(ordinals, (0..passages.len() as u32).collect::<Vec<_>>());
        assert!(passages.iter().all(|p| !p.content.is_empty()));
    }

    #[test]
    fn whitespace_only_text_yields_nothing() {
        assert!(Chunker::default().split("   \n\t", &DocumentMeta::default()).is_empty());
    }

    #[test]
    fn explicit_content_type_wins() {
        let meta = DocumentMeta {
            content_type: Some(ContentKind::Text),
            source_path: Some("README.md".into()),
            ..DocumentMeta::default()
        };
        assert_eq!(resolve_kind("# Heading", &meta), ContentKind::Text);
    }

    #[test]
    fn content_hash_is_deterministic() {
        assert_eq!(content_hash("hello"), content_hash("hello"));
        assert_ne!(content_hash("hello"), content_hash("world"));
        assert_eq!(content_hash("hello").len(), 64);
    }

    #[test]
    fn heading_detection() {
        assert_eq!(heading_text("## Usage ##\n").as_deref(), Some("Usage"));
        assert_eq!(heading_text("#hashtag"), None);
        assert_eq!(heading_text("####### seven"), None);
    }
}
