//! Crash Report Server binary

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crash_report_server::config::{ArchiveConfig, Config};
use crash_report_server::db;
use crash_report_server::routes;
use crash_report_server::state::AppState;
use crash_report_server::storage::{ArchiveStore, LocalArchiveStore, S3ArchiveStore, S3Client};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "crash_report_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    // No fallback to defaults: they include the public salts
    let config = Config::from_env().context("Invalid configuration")?;

    tracing::info!("Starting Crash Report Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Tool name: {}", config.protocol.tool_name);
    tracing::info!("Upload URL: {}", config.protocol.upload_url);

    // Initialize database
    let db_pool = db::create_pool(&config.database.url)
        .await
        .context("Failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    // Initialize archive storage
    let archives: Arc<dyn ArchiveStore> = match &config.archive {
        ArchiveConfig::Local { path } => {
            tracing::info!("Archives stored under {}", path.display());
            Arc::new(LocalArchiveStore::new(path.clone()))
        }
        ArchiveConfig::S3(s3) => {
            tracing::info!("S3 endpoint: {}", s3.endpoint);
            tracing::info!("S3 bucket: {}", s3.bucket);
            let client = S3Client::new(s3)
                .await
                .context("Failed to initialize S3 client")?;
            Arc::new(S3ArchiveStore::new(client, s3.prefix.clone()))
        }
    };

    // Create application state
    let app_state = AppState::new(config.clone(), db_pool, archives)
        .context("Failed to initialize conversation protocol")?;

    // Clear out anything a previous run left half-done, then keep at it
    if let Err(e) = app_state.protocol().run_maintenance().await {
        tracing::warn!("Startup maintenance failed: {}", e);
    }
    let _maintenance = app_state.protocol().clone().start_maintenance_task();

    let app = routes::app(app_state);

    // Start server with graceful shutdown
    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("Invalid SERVER_HOST '{}'", config.server.host))?;
    let addr = SocketAddr::from((host, config.server.port));
    tracing::info!("Crash Report Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
