//! Monitoring endpoints: counters, in-memory map sizes, manual cleanup.

use axum::{Json, extract::State};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AppError;
use crate::services::idempotency_service::ProcessingStats;
use crate::services::pix_service::WebhookStats;
use crate::services::transfer_service::TransferStats;
use crate::services::wallet_service::WalletStats;
use crate::state::AppState;

/// Combined snapshot of all service counters.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AtomicStatsResponse {
    pub timestamp: DateTime<Utc>,
    pub wallet_stats: WalletStats,
    pub transfer_stats: TransferStats,
    pub webhook_stats: WebhookStats,
    pub idempotency_stats: ProcessingStats,
}

/// `GET /monitoring/atomic-stats`
pub async fn atomic_stats(State(state): State<AppState>) -> Json<AtomicStatsResponse> {
    Json(AtomicStatsResponse {
        timestamp: state.clock.now(),
        wallet_stats: state.wallets.stats(),
        transfer_stats: state.transfers.stats(),
        webhook_stats: state.pix.stats(),
        idempotency_stats: state.idempotency.stats(),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub timestamp: DateTime<Utc>,
    pub removed_transfer_states: usize,
    pub removed_wallet_leases: usize,
    pub deleted_idempotency_records: u64,
}

/// `POST /monitoring/cleanup` - manual trigger of the periodic cleanup.
pub async fn cleanup(State(state): State<AppState>) -> Result<Json<CleanupResponse>, AppError> {
    let (removed_transfer_states, removed_wallet_leases) = state.transfers.cleanup();
    let deleted_idempotency_records = state.idempotency.cleanup_expired().await?;

    Ok(Json(CleanupResponse {
        timestamp: state.clock.now(),
        removed_transfer_states,
        removed_wallet_leases,
        deleted_idempotency_records,
    }))
}
