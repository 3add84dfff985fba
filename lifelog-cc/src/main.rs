//! lifelog-cc - Clean Up Crew microservice
//!
//! Condenses each day of recorded conversations into a deduplicated view and
//! serves it over HTTP + SSE, computing on demand or ahead of time from the
//! background scheduler.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use lifelog_cc::config::ServiceConfig;
use lifelog_cc::services::{
    BackgroundScheduler, CleanUpCrew, EmbeddingCache, HttpEmbeddingProvider, ProgressChannel,
};
use lifelog_cc::AppState;
use lifelog_common::events::EventBus;

const MODULE_NAME: &str = "lifelog-cc";
const DEFAULT_PORT: u16 = 5810;

/// Command-line arguments for lifelog-cc
#[derive(Parser, Debug)]
#[command(name = "lifelog-cc")]
#[command(about = "Clean Up Crew: deduplicated daily conversation views")]
#[command(version)]
struct Args {
    /// Port to listen on (TOML `port`, else 5810)
    #[arg(short, long, env = "LIFELOG_CC_PORT")]
    port: Option<u16>,

    /// Root folder holding the database (overrides LIFELOG_ROOT_FOLDER and TOML)
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// TOML config file (default: <config_dir>/lifelog/lifelog-cc.toml)
    #[arg(short, long, env = "LIFELOG_CC_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Config is read before tracing exists; its path is logged below
    let config_path = args
        .config
        .clone()
        .or_else(|| lifelog_common::config::default_config_path(MODULE_NAME));
    let (service_config, config_error) = match &config_path {
        Some(path) => match lifelog_common::config::load_toml_config::<ServiceConfig>(path) {
            Ok(config) => (config, None),
            Err(e) => (ServiceConfig::default(), Some(e)),
        },
        None => (ServiceConfig::default(), None),
    };

    init_tracing(&service_config)?;

    info!("Starting lifelog-cc (Clean Up Crew) microservice");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config_path {
        info!("Config file: {}", path.display());
    }
    if let Some(e) = config_error {
        warn!(error = %e, "Config file unusable, continuing with defaults");
    }

    // Step 1: Resolve and create the root folder
    let root_folder = lifelog_common::config::RootFolderResolver::new(MODULE_NAME)
        .with_cli_arg(args.root_folder.clone())
        .with_toml_value(service_config.root_folder.clone())
        .resolve();
    let initializer = lifelog_common::config::RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;

    // Step 2: Open or create the database
    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());
    let db_pool = lifelog_cc::db::init_database_pool(&db_path).await?;
    info!("Database connection established");

    // Step 3: Runtime parameters (TOML, then settings-table overrides)
    let mut dedup_config = service_config.dedup.clone();
    dedup_config
        .validate()
        .context("Invalid [dedup] configuration")?;
    let overrides = lifelog_cc::db::settings::apply_dedup_overrides(&db_pool, &mut dedup_config)
        .await
        .context("Failed to read settings overrides")?;
    info!(
        overrides,
        threshold = dedup_config.similarity_threshold,
        interval_secs = dedup_config.background_interval_secs,
        max_retries = dedup_config.max_retries,
        "Deduplication parameters loaded"
    );

    // Work interrupted by a previous shutdown goes back to the queue
    let reset = lifelog_cc::db::records::reset_stale_processing(&db_pool)
        .await
        .context("Failed to reset stale processing records")?;
    if reset > 0 {
        info!(records = reset, "Requeued records left in processing");
    }

    // Step 4: Services
    let provider = HttpEmbeddingProvider::new(&service_config.embedding)
        .context("Failed to create embedding provider")?;
    info!(
        endpoint = %service_config.embedding.endpoint,
        model = %service_config.embedding.model,
        "Embedding provider configured"
    );
    let embeddings = Arc::new(EmbeddingCache::new(Arc::new(provider)));

    let event_bus = EventBus::new(100);
    let crew = Arc::new(CleanUpCrew::new(
        db_pool.clone(),
        dedup_config,
        embeddings,
        Arc::new(ProgressChannel::new()),
        event_bus.clone(),
    ));

    let scheduler = BackgroundScheduler::new(Arc::clone(&crew), event_bus.clone());
    let scheduler_handle = scheduler.handle();
    let cancel = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.run(cancel.child_token()));

    // Step 5: HTTP server
    let state = AppState::new(db_pool.clone(), event_bus, crew, scheduler_handle);
    let app = lifelog_cc::build_router(state);

    let port = args.port.or(service_config.port).unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    let shutdown_token = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_token.cancel();
        })
        .await
        .context("Server error")?;

    cancel.cancel();
    if let Err(e) = scheduler_task.await {
        warn!(error = %e, "Scheduler task ended abnormally");
    }
    db_pool.close().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Stderr logging, plus an optional log file from `[logging] file`
///
/// `RUST_LOG` takes precedence over `[logging] level`.
fn init_tracing(config: &ServiceConfig) -> Result<()> {
    let default_filter = format!(
        "lifelog_cc={level},lifelog_common={level},tower_http=info",
        level = config.logging.level
    );
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let file_layer = match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
