//! Knowledge Engine binary — long-lived Server Loop (spec.md §4.9).
//!
//! Owns one Storage connection pool, one Embedder, and a lazily-built ANN
//! Index; dispatches MCP and HTTP requests concurrently against them while
//! supervising a background Scanner.

use axum::response::IntoResponse;
use clap::Parser;
use knowledge_engine_core::config::EngineConfig;
use knowledge_engine_core::scanner::Interrupt;
use knowledge_engine_core::Engine;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "knowledge-engine", version, about, long_about = None)]
struct Cli {
    /// Corpus root directory to index (default: current directory)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Directory for the SQLite store and side files (default: ~/data)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Load engine configuration from a TOML file, overriding built-in defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run the MCP stdio transport instead of serving HTTP
    #[arg(long)]
    mcp: bool,

    /// Disable semantic search even if the binary was built with the feature
    #[arg(long)]
    no_semantic: bool,

    /// Skip the initial foreground scan; only the background rescan loop runs
    #[arg(long)]
    skip_initial_scan: bool,

    /// Seconds between background rescans. 0 disables periodic rescanning.
    #[arg(long, default_value_t = 300)]
    rescan_interval_secs: u64,

    /// Bind to 0.0.0.0 instead of 127.0.0.1 (HTTP mode only)
    #[arg(long)]
    bind_all: bool,

    /// HTTP port (HTTP mode only). Defaults to the first free port in 8742..=8751.
    #[arg(long)]
    port: Option<u16>,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    };

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("received Ctrl+C, shutting down");
    }
}

/// Run one scan to completion on a blocking thread, logging and recording an
/// interrupted session on panic rather than taking the process down — the
/// Server Loop supervises the Scanner (spec.md §4.9).
fn supervised_scan(engine: &Engine, interrupt: &Interrupt, force_rescan: bool) {
    let scanner = engine.scanner();
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| scanner.run(interrupt, force_rescan))) {
        Ok(Ok(session)) => {
            info!(
                session_id = session.session_id.as_str(),
                discovered = session.discovered,
                processed = session.processed,
                failed = session.failed,
                interrupted = session.interrupted,
                "scan complete"
            );
        }
        Ok(Err(e)) => error!(error = %e, "scan failed"),
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(reason = reason.as_str(), "scan task panicked; server continues serving retrieval");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("knowledge_engine=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path),
        None => EngineConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.root = root.canonicalize().unwrap_or_else(|_| root.clone());
    } else {
        config.root = std::env::current_dir()?;
    }
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }

    if cli.no_semantic && cfg!(feature = "semantic") {
        warn!("--no-semantic requested but this binary was built with the semantic feature; embeddings will still load lazily on first use");
    }

    info!(root = %config.root.display(), data_dir = %config.data_dir.display(), "starting knowledge engine");
    let engine = Arc::new(Engine::open(config)?);

    let interrupt = Interrupt::new();
    if !cli.skip_initial_scan {
        let engine_for_scan = engine.clone();
        let interrupt_for_scan = interrupt.clone();
        tokio::task::spawn_blocking(move || supervised_scan(&engine_for_scan, &interrupt_for_scan, false)).await?;
    }

    if cli.rescan_interval_secs > 0 {
        let engine_bg = engine.clone();
        let interrupt_bg = interrupt.clone();
        let interval_secs = cli.rescan_interval_secs;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            ticker.tick().await; // first tick fires immediately; skip it, the foreground scan just ran
            loop {
                ticker.tick().await;
                let engine_for_scan = engine_bg.clone();
                let interrupt_for_scan = interrupt_bg.clone();
                let _ = tokio::task::spawn_blocking(move || supervised_scan(&engine_for_scan, &interrupt_for_scan, false)).await;
            }
        });
    }

    if cli.mcp {
        knowledge_engine_mcp::run_stdio(&engine.query_engine);
        return Ok(());
    }

    let query_engine_handle = engine.query_engine.clone();
    let rest_router = knowledge_engine_http::router(query_engine_handle.clone());
    let mcp_router = axum::Router::new()
        .route(
            "/mcp",
            axum::routing::post({
                let qe = query_engine_handle.clone();
                move |body: axum::extract::Json<serde_json::Value>| {
                    let qe = qe.clone();
                    async move {
                        match knowledge_engine_mcp::dispatch_jsonrpc(&qe, &body.0) {
                            Some(response) => axum::Json(response).into_response(),
                            None => axum::http::StatusCode::NO_CONTENT.into_response(),
                        }
                    }
                }
            }),
        )
        .with_state(());

    let app = rest_router
        .merge(mcp_router)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::compression::CompressionLayer::new())
        .layer(tower_http::cors::CorsLayer::permissive());

    let bind_addr = if cli.bind_all { "0.0.0.0" } else { "127.0.0.1" };
    let listener = if let Some(port) = cli.port {
        tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await?
    } else {
        const BASE: u16 = 8742;
        const RANGE: u16 = 10;
        let mut found = None;
        for port in BASE..BASE + RANGE {
            if let Ok(l) = tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await {
                found = Some(l);
                break;
            }
        }
        found.ok_or_else(|| anyhow::anyhow!("no free port in {BASE}..{}", BASE + RANGE - 1))?
    };
    let port = listener.local_addr()?.port();
    info!(port = port, "http://{bind_addr}:{port}");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}
