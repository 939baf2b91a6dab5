use std::io::{BufRead, BufReader, IsTerminal};
use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use miette::{Context, IntoDiagnostic, Result};
use tracing_subscriber::EnvFilter;

use regla_core::{Chunk, OutputFormat, ProviderKind, ReglaConfig, SearchResponse};
use regla_embed::ProbeStatus;
use regla_retrieval::{HybridParams, Retriever};

const DEFAULT_CONFIG_PATH: &str = ".regla.toml";

#[derive(Parser)]
#[command(
    name = "regla",
    version,
    about = "Hybrid semantic + lexical retrieval over regulation documents",
    long_about = "regla indexes a corpus of regulation documents and answers queries by\n\
                   fusing embedding search with SQLite full-text search.\n\n\
                   Examples:\n  \
                     regla init                              Create a .regla.toml config file\n  \
                     regla rebuild --data-dir ./reglamentos  Chunk, embed and index a corpus\n  \
                     regla search 'requisitos de permisos'   Run a hybrid query\n  \
                     regla add --file nuevos.jsonl           Append chunks to the index\n  \
                     regla doctor                            Check provider chain and index"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (default: .regla.toml)
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
                         json      Machine-readable JSON\n  \
                         markdown  Markdown, suitable for pasting into a prompt"
    )]
    format: OutputFormat,

    /// Log progress to stderr (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    /// When to use colors
    #[arg(long, global = true, default_value = "auto")]
    color: ColorChoice,
}

#[derive(Subcommand)]
enum Command {
    /// Run a hybrid query against the index and the document store
    #[command(long_about = "Run a hybrid query against the index and the document store.\n\n\
        Embeds the query with the first healthy provider, searches the vector index\n\
        and the full-text store, fuses both lists and prints the top results.\n\
        Missing pieces degrade the search instead of failing it; the reasons are\n\
        listed under the results.\n\n\
        Examples:\n  regla search 'permisos de construcción'\n  regla search 'zonas históricas' --final-k 3 --format json")]
    Search {
        /// Query text
        query: String,

        /// Semantic candidates kept after reranking (default from config)
        #[arg(long)]
        k_vec: Option<usize>,

        /// Full-text candidates requested (default from config)
        #[arg(long)]
        k_lex: Option<usize>,

        /// Results returned (default from config)
        #[arg(long)]
        final_k: Option<usize>,

        /// Minimum cosine similarity for semantic candidates (default from config)
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Append chunks from a JSONL file to the store and the index
    #[command(long_about = "Append chunks from a JSONL file to the store and the index.\n\n\
        Each line is an object with chunk_id, doc_id, heading_path, page_start,\n\
        page_end and text. Missing chunk ids are derived from doc_id and text.\n\
        Re-adding a chunk id shadows the older vector until 'regla compact'.\n\n\
        Example:\n  regla add --file nuevos.jsonl --batch-size 32")]
    Add {
        /// JSONL file with one chunk per line
        #[arg(long)]
        file: PathBuf,

        /// Texts per embedding request (default from config)
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Rebuild the store and the index from a directory of documents
    #[command(long_about = "Rebuild the store and the index from a directory of documents.\n\n\
        Walks .txt and .md files, splits them at regulation headings, embeds every\n\
        chunk and replaces both the document store and the vector index. The\n\
        previous index is kept as *.backup. Requires a working embedding provider.\n\n\
        With --from-store, re-embeds the chunks already in the document store\n\
        instead, leaving the store untouched. Use it after switching provider.\n\n\
        Examples:\n  regla rebuild --data-dir ./reglamentos\n  regla rebuild --from-store")]
    Rebuild {
        /// Corpus root
        #[arg(long, required_unless_present = "from_store", conflicts_with = "from_store")]
        data_dir: Option<PathBuf>,
        /// Re-embed the stored chunks with the current provider
        #[arg(long)]
        from_store: bool,
    },
    /// Drop index entries shadowed by re-added chunks
    Compact,
    /// Show index and store statistics
    Stats,
    /// Check the provider chain, index and store
    #[command(long_about = "Check the provider chain, index and store.\n\n\
        Probes every configured embedding provider in order and reports which one\n\
        was selected, then checks the index and document store. Use --format json\n\
        for machine-readable output.")]
    Doctor,
    /// Create a default .regla.toml configuration file
    #[command(long_about = "Create a default .regla.toml configuration file.\n\n\
        Generates a commented-out template with all available options.\n\
        Fails if .regla.toml already exists.")]
    Init,
    /// Generate shell completion scripts
    #[command(hide = true)]
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, PartialEq, Eq, ValueEnum)]
enum ColorChoice {
    /// Auto-detect based on terminal
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

fn print_welcome(use_color: bool) {
    let version = env!("CARGO_PKG_VERSION");

    if use_color {
        println!("\x1b[1mregla\x1b[0m v{version}: hybrid retrieval for regulation corpora\n");
        println!("Quick start:");
        println!("  \x1b[36mregla init\x1b[0m                       Create a .regla.toml config file");
        println!("  \x1b[36mregla rebuild --data-dir DIR\x1b[0m     Index a corpus");
        println!("  \x1b[36mregla search 'QUERY'\x1b[0m             Run a hybrid query\n");
    } else {
        println!("regla v{version}: hybrid retrieval for regulation corpora\n");
        println!("Quick start:");
        println!("  regla init                       Create a .regla.toml config file");
        println!("  regla rebuild --data-dir DIR     Index a corpus");
        println!("  regla search 'QUERY'             Run a hybrid query\n");
    }

    println!("Run 'regla <command> --help' for details.");
}

fn init_logging(verbose: bool, use_color: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(use_color)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<ReglaConfig> {
    let path = match path {
        Some(path) => path,
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_PATH);
            if !default_path.exists() {
                tracing::debug!("no {DEFAULT_CONFIG_PATH} found, using defaults");
                return Ok(ReglaConfig::default());
            }
            default_path
        }
    };
    tracing::debug!(path = %path.display(), "loading configuration");
    Ok(ReglaConfig::from_file(path)?)
}

fn read_chunks(path: &Path) -> Result<Vec<Chunk>> {
    let file = std::fs::File::open(path)
        .into_diagnostic()
        .wrap_err(format!("reading {}", path.display()))?;
    let mut chunks = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.into_diagnostic()?;
        if line.trim().is_empty() {
            continue;
        }
        let chunk: Chunk = serde_json::from_str(&line)
            .into_diagnostic()
            .wrap_err(format!("{}:{}: invalid chunk", path.display(), line_no + 1))?;
        chunks.push(chunk);
    }
    Ok(chunks)
}

fn print_response(response: &SearchResponse, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(response).into_diagnostic()?
            );
        }
        OutputFormat::Markdown => {
            for (rank, result) in response.results.iter().enumerate() {
                let meta = &result.candidate.meta;
                println!("### {}. {}\n", rank + 1, meta.heading_path);
                println!(
                    "*{}*{} ({} {:.3})\n",
                    meta.doc_id,
                    pages(meta.page_start, meta.page_end),
                    result.candidate.search_type,
                    result.candidate.combined_score
                );
                println!("{}\n", result.text);
            }
            for diagnostic in &response.diagnostics {
                println!("> {diagnostic}");
            }
        }
        OutputFormat::Text => {
            if response.results.is_empty() {
                println!("No results.");
            }
            for (rank, result) in response.results.iter().enumerate() {
                let candidate = &result.candidate;
                let meta = &candidate.meta;
                println!(
                    "{:>2}. [{:.3} {}] {}{}",
                    rank + 1,
                    candidate.combined_score,
                    candidate.search_type,
                    meta.doc_id,
                    pages(meta.page_start, meta.page_end)
                );
                println!("    {}", meta.heading_path);
                let excerpt = candidate
                    .snippet
                    .clone()
                    .unwrap_or_else(|| excerpt(&result.text, 200));
                println!("    {excerpt}");
            }
            for diagnostic in &response.diagnostics {
                eprintln!("note: {diagnostic}");
            }
        }
    }
    Ok(())
}

fn pages(start: Option<u32>, end: Option<u32>) -> String {
    match (start, end) {
        (Some(s), Some(e)) if s != e => format!(" pp. {s}-{e}"),
        (Some(s), _) => format!(" p. {s}"),
        (None, Some(e)) => format!(" p. {e}"),
        (None, None) => String::new(),
    }
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{cut}…")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).into_diagnostic()?);
    Ok(())
}

#[derive(serde::Serialize)]
struct CheckResult {
    name: String,
    status: &'static str,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

impl CheckResult {
    fn pass(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: "pass",
            detail: detail.into(),
            hint: None,
        }
    }

    fn fail(name: impl Into<String>, detail: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: "fail",
            detail: detail.into(),
            hint: Some(hint.into()),
        }
    }

    fn info(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
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

    fn colored_symbol(&self) -> String {
        match self.status {
            "pass" => "\x1b[32m\u{2713}\x1b[0m".into(),
            "fail" => "\x1b[31m\u{2717}\x1b[0m".into(),
            _ => "\x1b[33m~\x1b[0m".into(),
        }
    }
}

async fn run_doctor(
    config: &ReglaConfig,
    config_path: &Path,
    format: OutputFormat,
    use_color: bool,
) -> Result<()> {
    let mut checks: Vec<CheckResult> = Vec::new();

    if config_path.exists() {
        checks.push(CheckResult::pass(
            "config_file",
            format!("{} found", config_path.display()),
        ));
    } else {
        checks.push(CheckResult::info(
            "config_file",
            format!("{} not found; using defaults", config_path.display()),
        ));
    }

    let retriever = Retriever::from_config(config).await?;

    for outcome in retriever.provider_outcomes() {
        if outcome.provider == ProviderKind::Null {
            continue;
        }
        let name = format!("provider_{}", outcome.provider);
        checks.push(match &outcome.status {
            ProbeStatus::Selected { model, dimension } => {
                CheckResult::pass(name, format!("selected ({model}, {dimension} dims)"))
            }
            ProbeStatus::Skipped { reason } => CheckResult::info(name, reason.clone()),
            ProbeStatus::Failed { reason } => CheckResult::fail(
                name,
                reason.clone(),
                "check credentials, endpoint and network access",
            ),
        });
    }
    if retriever.provider().kind() == ProviderKind::Null {
        checks.push(CheckResult::fail(
            "embedding",
            "no embedding provider available; searches are lexical-only",
            "set AZURE_OPENAI_* or OPENAI_API_KEY, or build with --features local-model",
        ));
    }

    let stats = retriever.stats().await?;
    match (&stats.index.unavailable, stats.index.dimension) {
        (None, Some(dimension)) => {
            checks.push(CheckResult::pass(
                "vector_index",
                format!(
                    "{} entries ({} live), {dimension} dims",
                    stats.index.entries, stats.index.live_entries
                ),
            ));
            if stats.dimension > 0 && stats.dimension != dimension {
                checks.push(CheckResult::fail(
                    "index_dimension",
                    format!(
                        "index has {dimension} dims, provider produces {}",
                        stats.dimension
                    ),
                    "run 'regla rebuild --from-store' with the current provider",
                ));
            }
        }
        (reason, _) => checks.push(CheckResult::fail(
            "vector_index",
            reason.clone().unwrap_or_else(|| "not loaded".into()),
            "run 'regla rebuild --data-dir <dir>' to build it",
        )),
    }
    for warning in &stats.index.warnings {
        checks.push(CheckResult::info("index_metadata", warning.clone()));
    }

    if stats.store.chunks > 0 {
        checks.push(CheckResult::pass(
            "document_store",
            format!(
                "{} chunks from {} documents",
                stats.store.chunks, stats.store.documents
            ),
        ));
    } else {
        checks.push(CheckResult::fail(
            "document_store",
            format!("{} is empty", config.store.db_path.display()),
            "run 'regla rebuild --data-dir <dir>' or 'regla add'",
        ));
    }

    match format {
        OutputFormat::Json => {
            let version = env!("CARGO_PKG_VERSION");
            let json = serde_json::json!({
                "version": version,
                "checks": checks,
            });
            println!("{}", serde_json::to_string_pretty(&json).into_diagnostic()?);
        }
        _ => {
            let version = env!("CARGO_PKG_VERSION");
            println!("regla v{version} environment check\n");

            for check in &checks {
                let sym = if use_color {
                    check.colored_symbol()
                } else {
                    check.symbol().to_string()
                };
                let label = check.name.replace('_', " ");
                println!("  {sym} {label:<20} {}", check.detail);
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

const DEFAULT_CONFIG: &str = r#"# regla configuration

[embedding]
# Providers tried in order at startup; the first healthy one is used.
# chain = ["azure", "openai", "local"]
# timeout_secs = 15
# batch_size = 64

[embedding.azure]
# Falls back to AZURE_OPENAI_ENDPOINT, AZURE_OPENAI_KEY,
# AZURE_OPENAI_EMBEDDING_DEPLOYMENT and AZURE_OPENAI_API_VERSION.
# endpoint = "https://example.openai.azure.com"
# deployment = "text-embedding-3-small"
# api_version = "2024-12-01-preview"

[embedding.openai]
# Falls back to OPENAI_API_KEY and MODEL_EMBED.
# base_url = "https://api.openai.com/v1"
# model = "text-embedding-3-small"

[embedding.local]
# Requires a build with --features local-model.
# model = "multilingual-e5-small"
# cache_dir = ".regla/models"

[index]
# dir = ".regla/index"

[store]
# db_path = ".regla/regla.db"

[retrieval]
# k_vec = 12
# k_lex = 12
# final_k = 6
# similarity_threshold = 0.7
# oversample = 3

[fusion]
# doc_diversity_bonus = 0.1
# heading_match_bonus = 0.05
# semantic_bonus = 0.1

[ingest]
# max_chars = 1800
# extensions = ["txt", "md"]
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

    let use_color = match cli.color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => std::io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    };
    init_logging(cli.verbose, use_color);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    match cli.command {
        None => {
            print_welcome(use_color);
        }
        Some(Command::Search {
            ref query,
            k_vec,
            k_lex,
            final_k,
            threshold,
        }) => {
            let config = load_config(cli.config.as_deref())?;
            let retriever = Retriever::from_config(&config).await?;
            let defaults = retriever.default_params();
            let params = HybridParams {
                k_vec: k_vec.unwrap_or(defaults.k_vec),
                k_lex: k_lex.unwrap_or(defaults.k_lex),
                final_k: final_k.unwrap_or(defaults.final_k),
                similarity_threshold: threshold.unwrap_or(defaults.similarity_threshold),
            };
            let response = retriever.hybrid(query, &params).await;
            print_response(&response, cli.format)?;
        }
        Some(Command::Add {
            ref file,
            batch_size,
        }) => {
            let config = load_config(cli.config.as_deref())?;
            let chunks = read_chunks(file)?;
            if chunks.is_empty() {
                miette::bail!("{} contains no chunks", file.display());
            }
            let retriever = Retriever::from_config(&config).await?;
            let batch_size = batch_size.unwrap_or_else(|| retriever.batch_size());
            let (metas, texts): (Vec<_>, Vec<_>) =
                chunks.into_iter().map(|c| (c.meta, c.text)).unzip();
            let report = retriever.add_to_index(&texts, metas, batch_size).await?;

            match cli.format {
                OutputFormat::Json => print_json(&report)?,
                _ => {
                    println!(
                        "Stored {} chunks; indexed {}, skipped {}",
                        report.requested, report.added, report.skipped
                    );
                    if let Some(reason) = &report.rejected {
                        println!("Vector index not updated: {reason}");
                    } else if !report.persisted {
                        println!("Warning: index changes were not written to disk");
                    }
                }
            }
        }
        Some(Command::Rebuild {
            ref data_dir,
            from_store,
        }) => {
            let config = load_config(cli.config.as_deref())?;
            let retriever = Retriever::from_config(&config).await?;

            let spinner = if std::io::stderr().is_terminal() {
                let pb = indicatif::ProgressBar::new_spinner();
                if let Ok(style) =
                    indicatif::ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})")
                {
                    pb.set_style(style);
                }
                pb.set_message(match data_dir {
                    Some(dir) => format!("Rebuilding from {}...", dir.display()),
                    None => "Re-embedding stored chunks...".to_string(),
                });
                pb.enable_steady_tick(std::time::Duration::from_millis(120));
                Some(pb)
            } else {
                None
            };

            let result = match data_dir {
                Some(dir) if !from_store => retriever.rebuild_index(dir).await,
                _ => retriever.reembed_index().await,
            };
            let report = result.inspect_err(|_| {
                if let Some(pb) = &spinner {
                    pb.finish_with_message("Failed");
                }
            })?;
            if let Some(pb) = spinner {
                pb.finish_with_message("Done");
            }

            match cli.format {
                OutputFormat::Json => print_json(&report)?,
                _ => {
                    println!(
                        "Indexed {} chunks from {} documents ({} dims)",
                        report.chunks, report.documents, report.dimension
                    );
                    if let Some(backup) = &report.backup {
                        println!("Previous index saved to {}", backup.display());
                    }
                    if !report.persisted {
                        println!("Warning: new index was not written to disk");
                    }
                }
            }
        }
        Some(Command::Compact) => {
            let config = load_config(cli.config.as_deref())?;
            let retriever = Retriever::from_config(&config).await?;
            let removed = retriever.compact_index().await?;
            match cli.format {
                OutputFormat::Json => print_json(&serde_json::json!({ "removed": removed }))?,
                _ => println!("Removed {removed} shadowed entries"),
            }
        }
        Some(Command::Stats) => {
            let config = load_config(cli.config.as_deref())?;
            let retriever = Retriever::from_config(&config).await?;
            let stats = retriever.stats().await?;
            match cli.format {
                OutputFormat::Json => print_json(&stats)?,
                _ => {
                    println!(
                        "Provider: {} ({}, {} dims)",
                        stats.provider, stats.model, stats.dimension
                    );
                    match (&stats.index.unavailable, stats.index.dimension) {
                        (None, Some(dimension)) => println!(
                            "Index:    {} entries, {} live, {} shadowed, {dimension} dims",
                            stats.index.entries,
                            stats.index.live_entries,
                            stats.index.shadowed_entries
                        ),
                        (reason, _) => println!(
                            "Index:    unavailable ({})",
                            reason.as_deref().unwrap_or("not loaded")
                        ),
                    }
                    println!(
                        "Store:    {} chunks from {} documents",
                        stats.store.chunks, stats.store.documents
                    );
                }
            }
        }
        Some(Command::Doctor) => {
            let config = load_config(cli.config.as_deref())?;
            run_doctor(&config, &config_path, cli.format, use_color).await?;
        }
        Some(Command::Init) => {
            let path = Path::new(DEFAULT_CONFIG_PATH);
            if path.exists() {
                miette::bail!("{DEFAULT_CONFIG_PATH} already exists");
            }
            std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
            println!("Created {DEFAULT_CONFIG_PATH} with default configuration");
        }
        Some(Command::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "regla", &mut std::io::stdout());
        }
    }

    Ok(())
}
