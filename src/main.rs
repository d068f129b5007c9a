use anyhow::{Context, Result};
use locale_export::cache::MemoryBackend;
use locale_export::config::Config;
use locale_export::retry::{with_retry_if, RetryConfig};
use locale_export::server::{self, AppState};
use locale_export::store::{MemoryCatalog, PgCatalog};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignored in production)
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("locale_export=info".parse()?),
        )
        .init();

    info!("Starting locale export service");

    let config = Config::from_env()?;
    let backend = Arc::new(MemoryBackend::new());

    let state = match &config.database_url {
        Some(url) => {
            let catalog = with_retry_if(
                &RetryConfig::database_connect(),
                "Connect to database",
                || PgCatalog::connect(url, config.database_max_connections),
                |e: &sqlx::Error| !matches!(e, sqlx::Error::Configuration(_)),
            )
            .await
            .context("Failed to connect to database")?;
            catalog
                .migrate()
                .await
                .context("Failed to run database migrations")?;
            info!("Using PostgreSQL catalog");
            AppState::new(&config, Arc::new(catalog), backend)
        }
        None => {
            warn!("DATABASE_URL not set, using an in-memory catalog (data is lost on restart)");
            AppState::new(&config, Arc::new(MemoryCatalog::with_defaults()), backend)
        }
    };

    if config.api_key.is_none() {
        warn!("API_KEY not set, catalog CRUD endpoints will reject every request");
    }

    let app = server::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        // Without a signal handler, run until killed
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
