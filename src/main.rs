//! Pix Wallet Service - Main Application Entry Point
//!
//! A REST API server mediating instant Pix transfers between digital
//! wallets: synchronous initiation that reserves funds, asynchronous
//! confirmation/rejection via webhook events, end-to-end idempotency.
//!
//! # Architecture
//!
//! - **Web Framework**: Axum (async HTTP server)
//! - **Database**: PostgreSQL with sqlx (async queries)
//! - **Format**: JSON requests/responses
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Create database connection pool
//! 3. Run database migrations
//! 4. Wire the shared services and spawn the periodic cleanup task
//! 5. Start server on configured port

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use pix_wallet_service::clock::SystemClock;
use pix_wallet_service::state::AppState;
use pix_wallet_service::{config, db, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with tracing subscriber. Reads RUST_LOG environment
    // variable (defaults to "info" level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Load configuration
    let config = config::Config::from_env()?;
    tracing::info!("Configuration loaded");

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Database pool created");

    // Run migrations
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    // Wire the shared services
    let state = AppState::new(pool, Arc::new(SystemClock));

    // Periodic cleanup of expired in-memory state and idempotency records
    spawn_cleanup_task(state.clone(), Duration::from_secs(config.cleanup_interval_secs));

    let app = router(state);

    // Bind to network address and start server
    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Start serving HTTP requests
    axum::serve(listener, app).await?;

    Ok(())
}

/// Background task pruning expired transfer states, idle wallet leases and
/// expired idempotency records.
fn spawn_cleanup_task(state: AppState, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let (states, leases) = state.transfers.cleanup();
            match state.idempotency.cleanup_expired().await {
                Ok(deleted) => tracing::info!(
                    removed_transfer_states = states,
                    removed_wallet_leases = leases,
                    deleted_idempotency_records = deleted,
                    "periodic cleanup completed"
                ),
                Err(err) => tracing::error!(error = %err, "periodic cleanup failed"),
            }
        }
    });
}
