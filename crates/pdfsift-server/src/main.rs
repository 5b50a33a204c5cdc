mod error;
mod pipeline;
mod routes;
mod state;
mod worker;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use pdfsift_core::config::{init_logging, AppConfig};
use pdfsift_core::db::Database;
use pdfsift_core::llm::Summarizer;
use tracing::{info, warn};

use crate::state::AppState;
use crate::worker::CleanupMetrics;

#[derive(Parser)]
#[command(name = "pdfsift", version, about = "PDF extraction and summarization service")]
struct Cli {
    /// Path to a config file (defaults to $PDFSIFT_CONFIG or ~/.pdfsift/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server (default when no subcommand given)
    Run {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },
    /// Delete expired images and uploads once, then exit
    Sweep {
        /// Report what would be deleted without deleting anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Open the database and apply pending migrations
    Migrate,
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run {
        host: None,
        port: None,
    });

    match command {
        Command::Run { host, port } => {
            init_logging("info");
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            run_server(config).await
        }
        Command::Sweep { dry_run } => {
            init_logging("warn");
            run_sweep(load_config(cli.config.as_deref())?, dry_run).await
        }
        Command::Migrate => {
            init_logging("info");
            run_migrate(load_config(cli.config.as_deref())?)
        }
        Command::Config => {
            let config = load_config(cli.config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => {
            let mut config = AppConfig::load_from(path)?;
            config.apply_env_overrides(|key| std::env::var(key).ok())?;
            config
        }
        None => AppConfig::load()?,
    };
    config.validate()?;
    Ok(config)
}

fn run_migrate(config: AppConfig) -> anyhow::Result<()> {
    config.ensure_dirs()?;
    let db_path = config.db_path()?;
    let mut db = Database::open(&db_path)?;
    let applied = db.applied_migrations()?;
    println!("Database at {} is up to date.", db_path.display());
    for name in applied {
        println!("  applied: {name}");
    }

    let count = db.count_documents()?;
    match db.latest_document_at()? {
        Some(at) => println!("{count} documents, newest at {}", at.to_rfc3339()),
        None => println!("{count} documents"),
    }
    Ok(())
}

async fn run_sweep(config: AppConfig, dry_run: bool) -> anyhow::Result<()> {
    let dirs = worker::cleanup_dirs(&config)?;
    let report = worker::sweep_once(dirs, config.retention(), dry_run).await;

    let verb = if dry_run { "Would delete" } else { "Deleted" };
    println!(
        "{verb} {} of {} files ({}), {} errors.",
        report.deleted,
        report.scanned,
        format_bytes(report.bytes_deleted),
        report.errors
    );
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    config.ensure_dirs()?;

    info!(
        host = %config.server.host,
        port = config.server.port,
        retention_minutes = config.storage.retention_minutes,
        llm_provider = config.llm.provider.as_str(),
        "pdfsift starting"
    );

    // Open database and run migrations
    let db_path = config.db_path()?;
    let db = Database::open(&db_path)?;
    info!(path = %db_path.display(), "database opened");
    let db = Arc::new(Mutex::new(db));

    let summarizer = Summarizer::from_config(&config.llm)?;
    if let Some(ref summarizer) = summarizer {
        let provider = summarizer.provider();
        if !provider.health_check().await {
            warn!(
                provider = provider.name(),
                endpoint = provider.endpoint(),
                "LLM provider not reachable, summaries will fail until it is"
            );
        }
    }

    let metrics = Arc::new(CleanupMetrics::new(
        config.retention(),
        config.cleanup_interval(),
    ));
    let cleanup = worker::start_cleanup_worker(&config, db.clone(), metrics.clone())?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::new(config, db, summarizer, metrics)?;
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cleanup.shutdown().await;
    info!("pdfsift stopped");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT, shutting down");
                return;
            }
        };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
    }
}
