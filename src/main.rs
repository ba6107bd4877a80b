//! reachwatch - Network Reachability Monitor

use reachwatch::config::MonitorConfig;
use reachwatch::db::{PersistenceBridge, Store};
use reachwatch::endpoint::EndpointSet;
use reachwatch::probe::Prober;
use reachwatch::scheduler::{PersistenceManager, Scheduler};
use reachwatch::web::Server;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "reachwatch", version, about = "Monitor reachability of ICMP, TCP, UDP and HTTP endpoints")]
struct Cli {
    /// Endpoint definition lines, e.g. `tcp://example.com:22,ssh,infra|10|2`
    lines: Vec<String>,

    /// Read endpoint definitions from a file, one per line
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// SQLite database path (overrides REACHWATCH_DB_PATH)
    #[arg(long)]
    db: Option<String>,

    /// API port (overrides REACHWATCH_HTTP_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Persist reply history as well as endpoint definitions
    #[arg(long)]
    resilient: bool,

    /// Run without the JSON API
    #[arg(long)]
    no_api: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("reachwatch=info".parse()?))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut cfg = MonitorConfig::load();
    if let Some(db) = cli.db {
        cfg.db_path = db;
    }
    if let Some(port) = cli.port {
        cfg.http_port = port;
    }
    if cli.resilient {
        cfg.resilient_history = true;
    }
    tracing::info!("Starting reachwatch...");
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store: Arc<dyn PersistenceBridge> = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let shutdown = CancellationToken::new();
    let endpoints = Arc::new(EndpointSet::new(shutdown.clone()));

    let persistence = Arc::new(PersistenceManager::new(store, Arc::clone(&endpoints), &cfg));
    persistence.restore().await;
    let mut handles = persistence.start(shutdown.clone());

    // Definitions from the command line and file join the restored set
    let mut text = cli.lines.join("\n");
    if let Some(path) = &cli.file {
        text.push('\n');
        text.push_str(&tokio::fs::read_to_string(path).await?);
    }
    let report = endpoints.import_text(&text, &cfg.defaults);
    if !report.added.is_empty() || !report.duplicates.is_empty() {
        tracing::info!(
            "Added {} endpoint(s), {} already present",
            report.added.len(),
            report.duplicates.len()
        );
    }
    for failure in &report.malformed {
        tracing::warn!("Line {} ignored ({}): {}", failure.line_number, failure.error, failure.line);
    }

    // Start scheduler
    let prober = Prober::new(cfg.http_success)?;
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&endpoints), prober, &cfg));
    scheduler.refresh_totals();
    handles.push(scheduler.start(shutdown.clone()));

    // Start web server
    if !cli.no_api {
        let server = Server::new(cfg.clone(), Arc::clone(&scheduler));
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.start(token).await {
                tracing::error!("API server failed: {}", e);
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    shutdown.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::warn!("Task ended abnormally: {}", e);
        }
    }
    persistence.flush_all().await;

    Ok(())
}
