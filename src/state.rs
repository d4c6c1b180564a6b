//! Shared application state.
//!
//! The services carry in-memory coordination structures (lease maps, the
//! transfer-state cache, counters), so handlers share single instances via
//! `Arc` rather than constructing per-request.

use std::sync::Arc;

use crate::clock::Clock;
use crate::db::DbPool;
use crate::services::idempotency_service::IdempotencyService;
use crate::services::pix_service::PixService;
use crate::services::transfer_service::TransferService;
use crate::services::wallet_engine::WalletEngine;
use crate::services::wallet_service::WalletService;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub clock: Arc<dyn Clock>,
    pub wallets: Arc<WalletService>,
    pub idempotency: Arc<IdempotencyService>,
    pub transfers: Arc<TransferService>,
    pub pix: Arc<PixService>,
}

impl AppState {
    pub fn new(pool: DbPool, clock: Arc<dyn Clock>) -> Self {
        let engine = Arc::new(WalletEngine::new(pool.clone(), clock.clone()));
        let wallets = Arc::new(WalletService::new(pool.clone(), clock.clone(), engine.clone()));
        let idempotency = Arc::new(IdempotencyService::new(pool.clone(), clock.clone()));
        let transfers = Arc::new(TransferService::new(pool.clone(), clock.clone(), engine));
        let pix = Arc::new(PixService::new(
            pool.clone(),
            clock.clone(),
            transfers.clone(),
            idempotency.clone(),
        ));

        Self {
            pool,
            clock,
            wallets,
            idempotency,
            transfers,
            pix,
        }
    }
}
