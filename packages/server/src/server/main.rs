// Main entry point for the crawl coordinator

use std::sync::Arc;

use anyhow::{Context, Result};
use crawl_core::kernel::cache::{CacheBackend, CacheService, LocalBackend, RedisBackend};
use crawl_core::kernel::{spawn_signal_listener, ServerDeps, ServiceHost};
use crawl_core::{server::build_app, Config};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,crawl_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting crawl coordinator");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Cache, reset index and auto-record queue substrate
    let backend: Arc<dyn CacheBackend> = match &config.redis_url {
        Some(url) => {
            let redis = RedisBackend::from_url(url).context("Failed to create Redis pool")?;
            tracing::info!("Using Redis cache backend");
            Arc::new(redis)
        }
        None => {
            tracing::warn!("REDIS_URL not set, using in-process backend (reset index and queue are not durable)");
            Arc::new(LocalBackend::new())
        }
    };
    let cache = Arc::new(CacheService::new(config.cache.clone(), backend));
    let deps = Arc::new(ServerDeps::postgres(pool, cache, &config));

    // Build application
    let (app, services) = build_app(deps.clone());

    // Background loops share one shutdown token with the HTTP server
    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());
    let host = services.background(deps, ServiceHost::with_token(shutdown.clone()));
    let background = tokio::spawn(host.run());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("Server error")?;

    // The server can also stop on its own; make sure the loops follow.
    shutdown.cancel();
    if let Err(e) = background.await {
        tracing::error!(error = %e, "background services did not stop cleanly");
    }
    tracing::info!("Shutdown complete");

    Ok(())
}
