use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use miette::{Context, IntoDiagnostic, Result};
use tracing_subscriber::EnvFilter;

use lodestone_core::{LodestoneConfig, OutputFormat, QueryResponse};
use lodestone_retrieval::store::StoreStats;
use lodestone_retrieval::walker::{repo_info, walk_corpus};
use lodestone_retrieval::Engine;

const CONFIG_FILE: &str = ".lodestone.toml";

#[derive(Parser)]
#[command(
    name = "lodestone",
    version,
    about = "Hybrid retrieval over a local document index",
    long_about = "Lodestone indexes documents into a local SQLite store and answers questions\n\
                   with the passages most likely to ground an answer.\n\n\
                   Keyword (BM25) and vector recall are fused with Reciprocal Rank Fusion,\n\
                   then reranked by a cross-encoder or an LLM when one is configured.\n\n\
                   Examples:\n  \
                     lodestone init                              Create a .lodestone.toml\n  \
                     lodestone ingest --project docs ./handbook  Index a directory\n  \
                     lodestone query 'expense policy' --k 3      Retrieve passages\n  \
                     lodestone doctor                            Check setup and store health"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (default: .lodestone.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        global = true,
        default_value = "text",
        long_help = "Output format for command results.\n\n\
                       Formats:\n  \
                         text      Human-readable summaries (default)\n  \
                         json      Machine-readable JSON with camelCase keys\n  \
                         markdown  GitHub-flavored Markdown"
    )]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Index database path (overrides config and LODESTONE_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Create a default .lodestone.toml configuration file
    #[command(long_about = "Create a default .lodestone.toml configuration file.\n\n\
        Generates a commented-out template with all available options.\n\
        Fails if .lodestone.toml already exists.")]
    Init,
    /// Ingest a file or directory into a project
    #[command(long_about = "Ingest a file or directory into a project.\n\n\
        Directories are walked respecting .gitignore; binary files and files over\n\
        1 MB are skipped. Re-ingesting a document replaces its previous passages.\n\n\
        Examples:\n  lodestone ingest --project docs ./handbook\n  \
        lodestone ingest --project docs --glob '**/*.md' .\n  \
        lodestone ingest --project notes --doc-id close-checklist notes/close.txt")]
    Ingest {
        /// Project the documents belong to
        #[arg(long)]
        project: String,

        /// Document id (single-file ingest only; default: relative path)
        #[arg(long)]
        doc_id: Option<String>,

        /// Only ingest paths matching this glob (repeatable)
        #[arg(long = "glob")]
        globs: Vec<String>,

        /// File or directory to ingest
        path: PathBuf,
    },
    /// Retrieve the passages best matching a question
    #[command(long_about = "Retrieve the passages best matching a question.\n\n\
        Examples:\n  lodestone query 'how do I reconcile the ledger'\n  \
        lodestone query 'travel policy' --k 3 --project handbook --format json")]
    Query {
        /// Natural-language question
        question: String,

        /// Number of passages to return (default: query.default_k)
        #[arg(long)]
        k: Option<usize>,

        /// Restrict results to one project
        #[arg(long)]
        project: Option<String>,
    },
    /// Rebuild the keyword index from stored passages
    RebuildIndex,
    /// Delete a document and everything derived from it
    Forget {
        /// Document id to delete
        doc_id: String,
    },
    /// Show index statistics
    Stats,
    /// Check configuration, store health, and the embedding path in use
    #[command(long_about = "Check configuration, store health, and the embedding path in use.\n\n\
        Use --format json for machine-readable output.")]
    Doctor,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // a second init (e.g. in tests) is harmless
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(cli: &Cli) -> Result<LodestoneConfig> {
    let mut config = match &cli.config {
        Some(path) => LodestoneConfig::from_file(path)
            .wrap_err(format!("loading {}", path.display()))?,
        None => {
            let default_path = Path::new(CONFIG_FILE);
            if default_path.exists() {
                LodestoneConfig::from_file(default_path).wrap_err("loading .lodestone.toml")?
            } else {
                LodestoneConfig::default()
            }
        }
    };
    config.apply_env();
    if let Some(db) = &cli.db {
        config.store.path = db.clone();
    }
    Ok(config)
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestSummary {
    project: String,
    documents: usize,
    chunks: usize,
}

async fn run_ingest(
    engine: &Engine,
    project: &str,
    doc_id: Option<&str>,
    globs: &[String],
    path: &Path,
    format: OutputFormat,
) -> Result<IngestSummary> {
    let files = walk_corpus(path, globs)?;
    if doc_id.is_some() && !path.is_file() {
        miette::bail!(miette::miette!(
            help = "omit --doc-id to use relative paths as document ids",
            "--doc-id requires a single file, but {} is a directory",
            path.display()
        ));
    }
    if files.is_empty() {
        miette::bail!(miette::miette!(
            help = "supported extensions: .md, .txt, and common source files",
            "no ingestible files under {}",
            path.display()
        ));
    }

    let repo = repo_info(path);
    let progress = if format == OutputFormat::Text && std::io::stderr().is_terminal() {
        let pb = ProgressBar::new(files.len() as u64);
        pb.set_style(
            ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}")
                .into_diagnostic()?
                .progress_chars("=> "),
        );
        Some(pb)
    } else {
        None
    };

    let mut summary = IngestSummary {
        project: project.to_string(),
        documents: 0,
        chunks: 0,
    };
    for file in &files {
        let id = doc_id.map_or_else(|| file.doc_id(), String::from);
        if let Some(pb) = &progress {
            pb.set_message(id.clone());
        }
        let report = engine
            .ingest(project, &id, &file.text, file.meta(repo.as_ref()))
            .await
            .inspect_err(|_e| {
                if let Some(pb) = &progress {
                    pb.abandon_with_message(format!("failed on {id}"));
                }
            })?;
        summary.documents += 1;
        summary.chunks += report.inserted;
        if let Some(pb) = &progress {
            pb.inc(1);
        }
    }
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    Ok(summary)
}

fn print_response(question: &str, response: &QueryResponse, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(response).into_diagnostic()?);
        }
        OutputFormat::Markdown => {
            println!("## Results for \"{question}\"\n");
            println!("_mode: {}_\n", response.mode);
            if response.matches.is_empty() {
                println!("No matches.");
            }
            for (i, m) in response.matches.iter().enumerate() {
                let heading = m.title.as_deref().unwrap_or(&m.id);
                match &m.path {
                    Some(path) => println!("{}. **{heading}** (`{path}`)\n", i + 1),
                    None => println!("{}. **{heading}**\n", i + 1),
                }
                for line in m.snippet.lines() {
                    println!("   > {line}");
                }
                println!();
            }
        }
        OutputFormat::Text => {
            println!("mode: {}", response.mode);
            if response.matches.is_empty() {
                println!("No matches.");
                return Ok(());
            }
            for (i, m) in response.matches.iter().enumerate() {
                let heading = m.title.as_deref().unwrap_or(&m.id);
                let score = m.score.map(|s| format!("{s:.3}")).unwrap_or_else(|| "-".into());
                println!("\n{}. {heading}  [score {score}]", i + 1);
                if let Some(path) = &m.path {
                    println!("   {path}");
                }
                let first_line = m.snippet.lines().next().unwrap_or_default();
                println!("   {first_line}");
            }
        }
    }
    Ok(())
}

fn print_stats(path: &Path, stats: &StoreStats, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(stats).into_diagnostic()?);
        }
        OutputFormat::Markdown => {
            println!("| Metric | Value |");
            println!("|---|---|");
            println!("| Store | `{}` |", path.display());
            println!("| Documents | {} |", stats.documents);
            println!("| Chunks | {} |", stats.chunks);
            println!("| Embeddings | {} |", stats.embeddings);
            println!("| Cached answers | {} |", stats.cache_entries);
            println!("| Vector width | {} |", dim_label(stats.index_dim));
            println!("| Size | {} bytes |", stats.size_bytes);
        }
        OutputFormat::Text => {
            println!("store:          {}", path.display());
            println!("documents:      {}", stats.documents);
            println!("chunks:         {}", stats.chunks);
            println!("embeddings:     {}", stats.embeddings);
            println!("cached answers: {}", stats.cache_entries);
            println!("vector width:   {}", dim_label(stats.index_dim));
            println!("size:           {} bytes", stats.size_bytes);
        }
    }
    Ok(())
}

fn dim_label(dim: Option<usize>) -> String {
    dim.map_or_else(|| "none".into(), |d| d.to_string())
}

#[derive(serde::Serialize)]
struct CheckResult {
    name: &'static str,
    status: &'static str,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: "pass",
            detail: detail.into(),
            hint: None,
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            name,
            status: "fail",
            detail: detail.into(),
            hint: Some(hint.into()),
        }
    }

    fn info(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: "info",
            detail: detail.into(),
            hint: None,
        }
    }

    fn symbol(&self) -> &'static str {
        match self.status {
            "pass" => "\u{2713}",
            "fail" => "\u{2717}",
            _ => "~",
        }
    }
}

async fn run_doctor(engine: &Engine, config_path: Option<&Path>, format: OutputFormat) -> Result<()> {
    let config = engine.config();
    let mut checks: Vec<CheckResult> = Vec::new();

    match config_path {
        Some(path) => checks.push(CheckResult::pass(
            "config_file",
            format!("{} loaded", path.display()),
        )),
        None => checks.push(CheckResult::info(
            "config_file",
            "no .lodestone.toml, using defaults (run 'lodestone init' to create one)",
        )),
    }

    let store_path = engine.store().path().to_path_buf();
    if store_path.exists() {
        match engine.stats().await {
            Ok(stats) => {
                checks.push(CheckResult::pass(
                    "store",
                    format!(
                        "{} ({} documents, {} chunks)",
                        store_path.display(),
                        stats.documents,
                        stats.chunks
                    ),
                ));
                let store = engine.store().clone();
                let consistent = tokio::task::spawn_blocking(move || {
                    store.connect()?.lexical_index_consistent()
                })
                .await
                .into_diagnostic()?;
                match consistent {
                    Ok(true) => checks.push(CheckResult::pass("keyword_index", "in sync with passages")),
                    Ok(false) | Err(_) => checks.push(CheckResult::fail(
                        "keyword_index",
                        "integrity check failed",
                        "run 'lodestone rebuild-index'",
                    )),
                }
                let mode = engine.planned_mode().await?;
                checks.push(CheckResult::info(
                    "embed_mode",
                    format!("{mode} (vector width {})", dim_label(stats.index_dim)),
                ));
            }
            Err(e) => checks.push(CheckResult::fail(
                "store",
                format!("{}: {e}", store_path.display()),
                "check the path and permissions, or pass --db",
            )),
        }
    } else {
        checks.push(CheckResult::info(
            "store",
            format!("{} not created yet (run 'lodestone ingest')", store_path.display()),
        ));
    }

    if config.embedding.api_key.is_some() {
        checks.push(CheckResult::pass("embedding_api_key", "configured"));
    } else {
        checks.push(CheckResult::info(
            "embedding_api_key",
            "not set; new indexes use the hashing embedder",
        ));
    }

    match &config.rerank.cross_encoder_url {
        Some(url) => checks.push(CheckResult::pass("cross_encoder", url.clone())),
        None => checks.push(CheckResult::info("cross_encoder", "not configured")),
    }

    if config.rerank.llm_fallback {
        if config.llm.api_key.is_some() || config.llm.base_url.is_some() {
            checks.push(CheckResult::pass("llm_rerank", format!("enabled ({})", config.llm.model)));
        } else {
            checks.push(CheckResult::fail(
                "llm_rerank",
                "enabled without credentials",
                "export OPENAI_API_KEY=... or set [llm] api_key / base_url",
            ));
        }
    } else {
        checks.push(CheckResult::info("llm_rerank", "disabled"));
    }

    let version = env!("CARGO_PKG_VERSION");
    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "version": version,
                "checks": checks,
            });
            println!("{}", serde_json::to_string_pretty(&json).into_diagnostic()?);
        }
        _ => {
            println!("Lodestone v{version} environment check\n");
            for check in &checks {
                let label = check.name.replace('_', " ");
                println!("  {} {label:<20} {}", check.symbol(), check.detail);
                if let Some(hint) = &check.hint {
                    println!("    hint: {hint}");
                }
            }
            let passed = checks.iter().filter(|c| c.status == "pass").count();
            let failed = checks.iter().filter(|c| c.status == "fail").count();
            let info = checks.iter().filter(|c| c.status == "info").count();
            println!("\n{passed} checks passed, {failed} failed, {info} info");
        }
    }

    Ok(())
}

const DEFAULT_CONFIG: &str = r#"# Lodestone configuration
# Environment overrides: LODESTONE_DB (store path), OPENAI_API_KEY (embedding and llm keys)

[store]
# path = ".lodestone/index.db"
# busy_timeout_ms = 5000

[store.retry]
# max_attempts = 5
# base_delay_ms = 50
# multiplier = 2.0
# max_jitter_ms = 25

[embedding]
# ingest_backend = "auto"   # auto | remote | local | hash
# base_url = "https://api.openai.com/v1"
# remote_model = "text-embedding-3-small"
# remote_large_model = "text-embedding-3-large"
# remote_dimensions = [1536, 3072]
# local_base_url = "http://localhost:11434"
# local_small_model = "all-minilm"
# hash_dimensions = 256

[llm]
# model = "gpt-4o-mini"
# base_url = "https://api.openai.com"

[rerank]
# cross_encoder_url = "http://localhost:8080"
# llm_fallback = false
# llm_window = 20
# pool = 50

[chunking]
# markdown_max_chars = 1500
# code_max_chars = 1400
# text_window_chars = 2000

[query]
# default_k = 5
# recall_multiplier = 4
# min_recall = 20
# snippet_chars = 480

[cache]
# enabled = true
# ttl_secs = 86400
"#;

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .build(),
        )
    }))
    .into_diagnostic()?;
    human_panic::setup_panic!();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Command::Init = cli.command {
        let path = Path::new(CONFIG_FILE);
        if path.exists() {
            miette::bail!(".lodestone.toml already exists");
        }
        std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
        println!("Created .lodestone.toml with default configuration");
        return Ok(());
    }

    let config = load_config(&cli)?;
    tracing::debug!(store = %config.store.path.display(), format = %cli.format, "configuration loaded");
    let engine = Engine::new(config);

    match &cli.command {
        Command::Init => {}
        Command::Ingest {
            project,
            doc_id,
            globs,
            path,
        } => {
            let summary =
                run_ingest(&engine, project, doc_id.as_deref(), globs, path, cli.format).await?;
            match cli.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&summary).into_diagnostic()?);
                }
                _ => println!(
                    "Ingested {} documents ({} passages) into project '{}'",
                    summary.documents, summary.chunks, summary.project
                ),
            }
        }
        Command::Query {
            question,
            k,
            project,
        } => {
            let k = k.unwrap_or(engine.config().query.default_k);
            let response = engine.query(question, k, project.as_deref()).await?;
            print_response(question, &response, cli.format)?;
        }
        Command::RebuildIndex => {
            engine.rebuild_lexical_index().await?;
            println!("Keyword index rebuilt");
        }
        Command::Forget { doc_id } => {
            if engine.forget(doc_id).await? {
                println!("Forgot '{doc_id}'");
            } else {
                miette::bail!(miette::miette!(
                    help = "document ids default to the path relative to the ingest root",
                    "no document with id '{doc_id}'"
                ));
            }
        }
        Command::Stats => {
            let stats = engine.stats().await?;
            print_stats(engine.store().path(), &stats, cli.format)?;
        }
        Command::Doctor => {
            let config_path = cli
                .config
                .clone()
                .or_else(|| Some(PathBuf::from(CONFIG_FILE)).filter(|p| p.exists()));
            run_doctor(&engine, config_path.as_deref(), cli.format).await?;
        }
    }

    Ok(())
}
