use std::path::{Path, PathBuf};

use lodestone_core::{ContentKind, DocumentMeta, LodestoneError};
use tracing::debug;

use crate::chunker::Language;

/// Maximum file size to ingest (1 MB).
const MAX_FILE_SIZE: u64 = 1_048_576;

/// Number of bytes to check for binary detection.
const BINARY_CHECK_SIZE: usize = 8192;

/// A text file discovered while walking a corpus directory.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use lodestone_core::ContentKind;
/// use lodestone_retrieval::walker::CorpusFile;
///
/// let file = CorpusFile {
///     path: PathBuf::from("docs/intro.md"),
///     kind: ContentKind::Markdown,
///     language: None,
///     text: "# Intro".into(),
/// };
/// assert_eq!(file.doc_id(), "docs/intro.md");
/// ```
#[derive(Debug, Clone)]
pub struct CorpusFile {
    /// Path relative to the walk root.
    pub path: PathBuf,
    /// Content kind detected from the extension.
    pub kind: ContentKind,
    /// Programming language name for code files.
    pub language: Option<String>,
    /// Full file content.
    pub text: String,
}

impl CorpusFile {
    /// Stable document id: the relative path with `/` separators.
    pub fn doc_id(&self) -> String {
        self.path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Metadata for ingesting this file, stamped with repository details.
    pub fn meta(&self, repo: Option<&RepoInfo>) -> DocumentMeta {
        let title = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string());
        DocumentMeta {
            content_type: Some(self.kind),
            source_path: Some(self.doc_id()),
            title,
            repo: repo.and_then(|r| r.name.clone()),
            sha: repo.and_then(|r| r.head_sha.clone()),
            language: self.language.clone(),
            ..DocumentMeta::default()
        }
    }
}

/// The git repository enclosing a corpus, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoInfo {
    /// Directory name of the repository root.
    pub name: Option<String>,
    /// Commit id at `HEAD`.
    pub head_sha: Option<String>,
}

/// Discover the git repository containing `path`.
///
/// Returns `None` outside a repository.
pub fn repo_info(path: &Path) -> Option<RepoInfo> {
    let repo = git2::Repository::discover(path).ok()?;
    let name = repo
        .workdir()
        .and_then(|w| w.file_name())
        .map(|n| n.to_string_lossy().to_string());
    let head_sha = repo
        .head()
        .ok()
        .and_then(|h| h.target())
        .map(|oid| oid.to_string());
    Some(RepoInfo { name, head_sha })
}

/// Walk `root`, respecting `.gitignore`, and return ingestible text files.
///
/// When `include` is non-empty only paths matching one of the glob patterns
/// (relative to `root`) are returned. Binary files, files over 1 MB, and
/// files with unrecognized extensions are skipped. A `root` that is itself a
/// file yields just that file.
///
/// # Errors
///
/// Returns [`LodestoneError::FileNotFound`] if `root` does not exist, or
/// [`LodestoneError::Validation`] for an invalid glob pattern.
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use lodestone_retrieval::walker::walk_corpus;
///
/// let files = walk_corpus(Path::new("docs"), &["**/*.md".to_string()]).unwrap();
/// for f in &files {
///     println!("{} ({:?})", f.path.display(), f.kind);
/// }
/// ```
pub fn walk_corpus(root: &Path, include: &[String]) -> Result<Vec<CorpusFile>, LodestoneError> {
    if !root.exists() {
        return Err(LodestoneError::FileNotFound(root.to_path_buf()));
    }

    let patterns = include
        .iter()
        .map(|p| {
            glob::Pattern::new(p)
                .map_err(|e| LodestoneError::Validation(format!("invalid glob '{p}': {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if root.is_file() {
        let name = root.file_name().map(PathBuf::from).unwrap_or_default();
        return Ok(read_candidate(root, name).into_iter().collect());
    }

    let mut files = Vec::new();
    for entry in ignore::WalkBuilder::new(root).build() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path).to_path_buf();
        if !patterns.is_empty() && !patterns.iter().any(|p| p.matches_path(&relative)) {
            continue;
        }
        if let Some(file) = read_candidate(path, relative) {
            files.push(file);
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn read_candidate(path: &Path, relative: PathBuf) -> Option<CorpusFile> {
    let metadata = std::fs::metadata(path).ok()?;
    if metadata.len() > MAX_FILE_SIZE {
        return None;
    }

    let ext = path.extension().and_then(|e| e.to_str())?;
    let kind = ContentKind::from_extension(ext)?;

    let text = std::fs::read_to_string(path).ok()?;
    let check_len = text.len().min(BINARY_CHECK_SIZE);
    if text.as_bytes()[..check_len].contains(&0) {
        return None;
    }

    let language = match Language::from_extension(ext) {
        Language::Unknown => None,
        lang => Some(format!("{lang:?}").to_lowercase()),
    };

    Some(CorpusFile {
        path: relative,
        kind,
        language,
        text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_corpus() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("docs/intro.md"), "# Intro\nhello").unwrap();
        fs::write(root.join("docs/notes.txt"), "plain notes").unwrap();
        fs::write(root.join("src/lib.rs"), "fn main() {}").unwrap();
        fs::write(root.join("data.csv"), "a,b,c").unwrap();
        dir
    }

    #[test]
    fn walk_finds_known_kinds() {
        let dir = make_corpus();
        let files = walk_corpus(dir.path(), &[]).unwrap();
        let paths: Vec<String> = files.iter().map(|f| f.doc_id()).collect();
        assert_eq!(paths, vec!["docs/intro.md", "docs/notes.txt", "src/lib.rs"]);

        let rust = files.iter().find(|f| f.kind == ContentKind::Code).unwrap();
        assert_eq!(rust.language.as_deref(), Some("rust"));
    }

    #[test]
    fn include_globs_filter_paths() {
        let dir = make_corpus();
        let files = walk_corpus(dir.path(), &["docs/*.md".to_string()]).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].kind, ContentKind::Markdown);
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let dir = make_corpus();
        let err = walk_corpus(dir.path(), &["[".to_string()]).unwrap_err();
        assert!(matches!(err, LodestoneError::Validation(_)));
    }

    #[test]
    fn walk_respects_gitignore() {
        let dir = make_corpus();
        let root = dir.path();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::create_dir_all(root.join("build")).unwrap();
        fs::write(root.join("build/out.md"), "# generated").unwrap();
        fs::write(root.join(".gitignore"), "build/\n").unwrap();

        let files = walk_corpus(root, &[]).unwrap();
        assert!(files.iter().all(|f| !f.path.starts_with("build")));
    }

    #[test]
    fn walk_skips_binary_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bin.md"), b"# a\0b").unwrap();
        fs::write(dir.path().join("ok.md"), "# ok").unwrap();
        let files = walk_corpus(dir.path(), &[]).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, PathBuf::from("ok.md"));
    }

    #[test]
    fn single_file_root() {
        let dir = make_corpus();
        let files = walk_corpus(&dir.path().join("docs/intro.md"), &[]).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].doc_id(), "intro.md");
    }

    #[test]
    fn missing_root_is_file_not_found() {
        let err = walk_corpus(Path::new("/definitely/not/here"), &[]).unwrap_err();
        assert!(matches!(err, LodestoneError::FileNotFound(_)));
    }

    #[test]
    fn meta_carries_repo_details() {
        let file = CorpusFile {
            path: PathBuf::from("docs/guide.md"),
            kind: ContentKind::Markdown,
            language: None,
            text: String::new(),
        };
        let repo = RepoInfo {
            name: Some("handbook".into()),
            head_sha: Some("abc123".into()),
        };
        let meta = file.meta(Some(&repo));
        assert_eq!(meta.title.as_deref(), Some("guide"));
        assert_eq!(meta.repo.as_deref(), Some("handbook"));
        assert_eq!(meta.sha.as_deref(), Some("abc123"));
        assert_eq!(meta.content_type, Some(ContentKind::Markdown));
    }

    #[test]
    fn repo_info_outside_git_is_none() {
        let dir = tempfile::tempdir().unwrap();
        // tempdirs normally live outside any repository
        if git2::Repository::discover(dir.path()).is_err() {
            assert!(repo_info(dir.path()).is_none());
        }
    }
}
