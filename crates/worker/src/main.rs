use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fd_broker::{Broker, MemoryBroker, RedisBroker};
use fd_domain::config::{BrokerBackend, Config, ConfigSeverity, DatabaseBackend};
use fd_providers::{LlmProvider, OpenAiCompatProvider};
use fd_store::{Database, MemoryStore, PgStore};
use fd_worker::admin::{self, AdminState};
use fd_worker::dispatcher::Dispatcher;
use fd_worker::lifecycle::WorkerLifecycle;
use fd_worker::recovery::RecoverySweeper;
use fd_worker::state::WorkerState;
use fd_worker::tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "flightdeck", about = "Agent-run coordination worker")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "flightdeck.toml")]
    config: PathBuf,

    /// Override the worker id (defaults to config / WORKER_ID / random).
    #[arg(long)]
    worker_id: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker (default).
    Serve,
    /// Validate the configuration and exit.
    ConfigCheck,
    /// Print the version and exit.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config(&cli)?;
            run_worker(Arc::new(config)).await
        }
        Some(Command::ConfigCheck) => {
            let config = load_config(&cli)?;
            let issues = config.validate();
            for issue in &issues {
                eprintln!("{issue}");
            }
            if issues
                .iter()
                .any(|i| i.severity == ConfigSeverity::Error)
            {
                std::process::exit(1);
            }
            println!("configuration OK");
            Ok(())
        }
        Some(Command::Version) => {
            println!("flightdeck {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing with env-filter overrides.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fd_worker=debug")),
        )
        .json()
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(&cli.config).context("loading config")?;
    if let Some(worker_id) = &cli.worker_id {
        config.worker.worker_id = Some(worker_id.clone());
    }
    Ok(config)
}

async fn run_worker(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("flightdeck worker starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Broker ───────────────────────────────────────────────────────
    let broker: Arc<dyn Broker> = match config.broker.backend {
        BrokerBackend::Memory => {
            tracing::warn!("in-memory broker: single-worker deployment only");
            Arc::new(MemoryBroker::new())
        }
        BrokerBackend::Redis => {
            let broker = RedisBroker::connect(&config.broker.url)
                .await
                .context("connecting to redis broker")?;
            tracing::info!(url = %config.broker.url, "redis broker connected");
            Arc::new(broker)
        }
    };

    // ── Database ─────────────────────────────────────────────────────
    let db: Arc<dyn Database> = match config.database.backend {
        DatabaseBackend::Memory => {
            tracing::warn!("in-memory store: data will not survive restarts");
            Arc::new(MemoryStore::new())
        }
        DatabaseBackend::Postgres => {
            let store = PgStore::connect(&config.database.url)
                .await
                .context("connecting to postgres")?;
            tracing::info!("postgres store connected");
            Arc::new(store)
        }
    };

    // ── LLM provider ─────────────────────────────────────────────────
    let llm: Arc<dyn LlmProvider> = Arc::new(
        OpenAiCompatProvider::from_config(&config.llm).context("initializing LLM provider")?,
    );
    tracing::info!(
        base_url = %config.llm.base_url,
        default_model = %config.llm.default_model,
        "LLM provider ready"
    );

    // ── Tool registry ────────────────────────────────────────────────
    let tools = Arc::new(ToolRegistry::with_builtins());
    tracing::info!(tool_count = tools.len(), "tool registry ready");

    // ── Worker state + components ────────────────────────────────────
    let state = WorkerState::build(config.clone(), broker, db, llm, tools, None);
    let dispatcher = Arc::new(Dispatcher::new(state.clone()));
    let recovery = Arc::new(RecoverySweeper::new(state.clone()));
    let lifecycle = Arc::new(WorkerLifecycle::new(
        state.clone(),
        dispatcher,
        recovery.clone(),
    ));

    lifecycle.initialize().await;

    // ── Admin control plane ──────────────────────────────────────────
    let admin_state = AdminState::new(state.clone(), recovery, lifecycle.clone());
    let app = admin::router(admin_state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(64));

    let addr = format!("{}:{}", config.admin.host, config.admin.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding admin listener to {addr}"))?;
    tracing::info!(addr = %addr, "admin control plane listening");

    let admin_lifecycle = lifecycle.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move { admin_lifecycle.wait_for_shutdown().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %e, "admin server error");
        }
    });

    // ── Main loop: block on the shutdown signal ──────────────────────
    lifecycle.wait_for_shutdown().await;
    lifecycle.shutdown().await;
    let _ = server.await;

    Ok(())
}
