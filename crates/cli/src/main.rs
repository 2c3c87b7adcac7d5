//! Knowledge Engine CLI — operator-facing scan/stats/query shell.
//!
//! Calls `knowledge-engine-core` directly for one-shot operations with no
//! server overhead. `serve` re-execs the long-lived server binary.

use clap::{Parser, Subcommand};
use knowledge_engine_core::config::EngineConfig;
use knowledge_engine_core::scanner::Interrupt;
use knowledge_engine_core::storage::{FileFilters, FileOrder};
use knowledge_engine_core::Engine;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keng", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Corpus root directory (default: current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Data directory for the SQLite store (default: ~/data)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Output as JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the corpus root and ingest new/changed files
    Scan {
        /// Re-chunk and re-embed every discovered file, even if unchanged
        #[arg(long)]
        force: bool,
    },
    /// Print corpus-wide statistics
    Stats,
    /// Full-text search (FTS5 syntax)
    SearchText {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Semantic similarity search
    SearchSemantic {
        query: String,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
    },
    /// Keyword (TF-IDF) search
    SearchKeywords {
        keywords: Vec<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List indexed files under a path prefix
    Files {
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Launch the long-lived server (re-execs the `knowledge-engine` binary)
    Serve {
        /// Extra arguments forwarded verbatim to `knowledge-engine`
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}

fn load_engine(root: Option<PathBuf>, data_dir: Option<PathBuf>) -> anyhow::Result<Engine> {
    let mut config = EngineConfig::default();
    config.root = match root {
        Some(r) => r.canonicalize().unwrap_or(r),
        None => std::env::current_dir()?,
    };
    if let Some(d) = data_dir {
        config.data_dir = d;
    }
    Ok(Engine::open(config)?)
}

fn print_envelope(json: bool, envelope: &knowledge_engine_core::response::Envelope) {
    if json {
        println!("{}", serde_json::to_string_pretty(envelope).unwrap());
        return;
    }
    println!("status: {:?}", envelope.status);
    for item in &envelope.results {
        println!("{}#{}", item.chunk_envelope.file_path, item.chunk_envelope.metadata.chunk_index);
        for (k, v) in &item.search_metadata {
            println!("  {k}: {v}");
        }
    }
    if envelope.results.is_empty() {
        println!("(no results)");
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("keng=warn".parse().unwrap()))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scan { force } => {
            let engine = load_engine(cli.root, cli.data_dir)?;
            let session = engine.scanner().run(&Interrupt::new(), force)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&session)?);
            } else {
                println!(
                    "discovered {} processed {} skipped {} failed {}",
                    session.discovered, session.processed, session.skipped, session.failed
                );
            }
        }
        Commands::Stats => {
            let engine = load_engine(cli.root, cli.data_dir)?;
            print_envelope(cli.json, &engine.query_engine.get_stats());
        }
        Commands::SearchText { query, limit } => {
            let engine = load_engine(cli.root, cli.data_dir)?;
            print_envelope(cli.json, &engine.query_engine.full_text_search(&query, limit, 0));
        }
        Commands::SearchSemantic { query, top_k } => {
            let engine = load_engine(cli.root, cli.data_dir)?;
            print_envelope(cli.json, &engine.query_engine.semantic_search(&query, top_k, 0));
        }
        Commands::SearchKeywords { keywords, limit } => {
            let engine = load_engine(cli.root, cli.data_dir)?;
            print_envelope(cli.json, &engine.query_engine.search_by_keywords(&keywords, limit));
        }
        Commands::Files { prefix, limit } => {
            let engine = load_engine(cli.root, cli.data_dir)?;
            let filters = FileFilters { path_prefix: prefix, ..Default::default() };
            print_envelope(cli.json, &engine.query_engine.search_files(filters, limit, FileOrder::PathAsc));
        }
        Commands::Serve { args } => {
            let exe = std::env::current_exe()?
                .parent()
                .map(|d| d.join("knowledge-engine"))
                .ok_or_else(|| anyhow::anyhow!("could not locate sibling knowledge-engine binary"))?;
            let exe = if exe.exists() { exe } else { PathBuf::from("knowledge-engine") };
            let mut command = std::process::Command::new(exe);
            if let Some(root) = &cli.root {
                command.arg("--root").arg(root);
            }
            if let Some(data_dir) = &cli.data_dir {
                command.arg("--data-dir").arg(data_dir);
            }
            command.args(args);
            let status = command.status()?;
            std::process::exit(status.code().unwrap_or(1));
        }
    }
    Ok(())
}
