//! Pix wallet service library.
//!
//! A digital-wallet core that mediates instant Pix transfers between
//! wallets: a balance engine with an immutable ledger, a two-phase transfer
//! state machine driven by out-of-order webhook events, and an idempotency
//! store that makes client retries and redelivered callbacks safe.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod money;
pub mod services;
pub mod state;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the HTTP router over a fully wired application state.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Public health probe
        .route("/health", get(handlers::health::health_check))
        // Wallet management
        .route("/wallets", post(handlers::wallets::create_wallet))
        .route(
            "/wallets/{id}/pix-keys",
            post(handlers::wallets::create_pix_key),
        )
        .route("/wallets/{id}/balance", get(handlers::wallets::get_balance))
        .route("/wallets/{id}/deposit", post(handlers::wallets::deposit))
        .route("/wallets/{id}/withdraw", post(handlers::wallets::withdraw))
        // Pix transfers and the inbound webhook
        .route("/pix/transfers", post(handlers::pix::initiate_transfer))
        .route("/pix/webhook", post(handlers::pix::process_webhook))
        // Operational surface
        .route(
            "/monitoring/atomic-stats",
            get(handlers::monitoring::atomic_stats),
        )
        .route("/monitoring/cleanup", post(handlers::monitoring::cleanup))
        // Distributed tracing middleware for observability
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
