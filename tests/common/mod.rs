//! Shared fixtures for the integration tests.
//!
//! Each test gets its own database (provisioned by `#[sqlx::test]` from the
//! `migrations/` directory) and a manually driven clock, so expiry windows
//! and historical balances are deterministic.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use pix_wallet_service::clock::{Clock, ManualClock};
use pix_wallet_service::models::pix_key::PixKeyType;
use pix_wallet_service::money::Money;
use pix_wallet_service::services::idempotency_service::IdempotencyService;
use pix_wallet_service::services::pix_service::PixService;
use pix_wallet_service::services::transfer_service::TransferService;
use pix_wallet_service::services::wallet_engine::WalletEngine;
use pix_wallet_service::services::wallet_service::WalletService;

pub struct TestContext {
    pub clock: Arc<ManualClock>,
    pub engine: Arc<WalletEngine>,
    pub wallets: Arc<WalletService>,
    pub idempotency: Arc<IdempotencyService>,
    pub transfers: Arc<TransferService>,
    pub pix: Arc<PixService>,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

pub fn context(pool: PgPool) -> TestContext {
    let clock = Arc::new(ManualClock::new(start_time()));
    let clock_dyn: Arc<dyn Clock> = clock.clone();

    let engine = Arc::new(WalletEngine::new(pool.clone(), clock_dyn.clone()));
    let wallets = Arc::new(WalletService::new(
        pool.clone(),
        clock_dyn.clone(),
        engine.clone(),
    ));
    let idempotency = Arc::new(IdempotencyService::new(pool.clone(), clock_dyn.clone()));
    let transfers = Arc::new(TransferService::new(
        pool.clone(),
        clock_dyn.clone(),
        engine.clone(),
    ));
    let pix = Arc::new(PixService::new(
        pool,
        clock_dyn,
        transfers.clone(),
        idempotency.clone(),
    ));

    TestContext {
        clock,
        engine,
        wallets,
        idempotency,
        transfers,
        pix,
    }
}

pub fn money(text: &str) -> Money {
    Money::from_decimal_str(text).unwrap()
}

/// Create a wallet and optionally fund it.
pub async fn funded_wallet(ctx: &TestContext, user_id: &str, initial: &str) -> Uuid {
    let wallet = ctx.wallets.create_wallet(user_id).await.unwrap();
    if initial != "0.00" {
        ctx.wallets
            .deposit(wallet.id, money(initial), Some("Initial funding"))
            .await
            .unwrap();
    }
    wallet.id
}

/// Create a wallet with an active email Pix key.
pub async fn wallet_with_key(ctx: &TestContext, user_id: &str, key: &str) -> Uuid {
    let wallet = ctx.wallets.create_wallet(user_id).await.unwrap();
    ctx.wallets
        .register_pix_key(wallet.id, key, PixKeyType::Email)
        .await
        .unwrap();
    wallet.id
}

pub async fn ledger_sum(pool: &PgPool, wallet_id: Uuid) -> i64 {
    sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount_cents), 0)::BIGINT FROM ledger_entries WHERE wallet_id = $1",
    )
    .bind(wallet_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

pub async fn ledger_entry_count(pool: &PgPool, wallet_id: Uuid) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries WHERE wallet_id = $1")
        .bind(wallet_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn transfer_row_count(pool: &PgPool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM pix_transfers")
        .fetch_one(pool)
        .await
        .unwrap()
}
