//! Wallet HTTP handlers.
//!
//! This module implements the wallet-related API endpoints:
//! - POST /wallets - Create a wallet
//! - POST /wallets/{id}/pix-keys - Register a Pix key
//! - GET /wallets/{id}/balance?at=… - Current or historical balance
//! - POST /wallets/{id}/deposit - Add money
//! - POST /wallets/{id}/withdraw - Remove money

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::pix_key::{CreatePixKeyRequest, PixKeyResponse};
use crate::models::wallet::{
    BalanceResponse, CreateWalletRequest, WalletOperationRequest, WalletResponse,
};
use crate::money::Money;
use crate::state::AppState;

/// Create a new wallet.
///
/// # Endpoint
///
/// `POST /wallets`
///
/// # Response
///
/// - **201 Created**: the new wallet
/// - **400**: the user already has a wallet, or the user id is invalid
pub async fn create_wallet(
    State(state): State<AppState>,
    Json(request): Json<CreateWalletRequest>,
) -> Result<(StatusCode, Json<WalletResponse>), AppError> {
    let wallet = state.wallets.create_wallet(&request.user_id).await?;
    Ok((StatusCode::CREATED, Json(wallet.into())))
}

/// Register a Pix key for a wallet.
///
/// # Endpoint
///
/// `POST /wallets/{id}/pix-keys`
///
/// # Response
///
/// - **201 Created**: the new key
/// - **400**: malformed key value or duplicate active key
/// - **404**: unknown wallet
pub async fn create_pix_key(
    State(state): State<AppState>,
    Path(wallet_id): Path<Uuid>,
    Json(request): Json<CreatePixKeyRequest>,
) -> Result<(StatusCode, Json<PixKeyResponse>), AppError> {
    let key = state
        .wallets
        .register_pix_key(wallet_id, &request.key_value, request.key_type)
        .await?;
    Ok((StatusCode::CREATED, Json(key.into())))
}

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    /// Optional ISO-8601 timestamp; when present, the balance is
    /// reconstructed from the ledger as of that instant.
    pub at: Option<DateTime<Utc>>,
}

/// Query the wallet balance, current or historical.
///
/// # Endpoint
///
/// `GET /wallets/{id}/balance?at=2025-06-01T12:00:00Z`
///
/// # Response (200)
///
/// ```json
/// { "walletId": "…", "balance": "120.00", "timestamp": "2025-06-01T12:00:00Z" }
/// ```
pub async fn get_balance(
    State(state): State<AppState>,
    Path(wallet_id): Path<Uuid>,
    Query(query): Query<BalanceQuery>,
) -> Result<Json<BalanceResponse>, AppError> {
    let (balance, timestamp) = match query.at {
        Some(at) => (state.wallets.balance_at(wallet_id, at).await?, at),
        None => (state.wallets.balance(wallet_id).await?, state.clock.now()),
    };

    Ok(Json(BalanceResponse {
        wallet_id,
        balance: balance.to_decimal_string(),
        timestamp,
    }))
}

/// Deposit into a wallet.
///
/// # Endpoint
///
/// `POST /wallets/{id}/deposit` with `{"amount": "100.00", "description": "…"}`
///
/// # Response
///
/// - **200**: new balance
/// - **400**: invalid amount
pub async fn deposit(
    State(state): State<AppState>,
    Path(wallet_id): Path<Uuid>,
    Json(request): Json<WalletOperationRequest>,
) -> Result<Json<BalanceResponse>, AppError> {
    let amount = Money::from_decimal_str(&request.amount)?;
    let balance = state
        .wallets
        .deposit(wallet_id, amount, request.description.as_deref())
        .await?;

    Ok(Json(BalanceResponse {
        wallet_id,
        balance: balance.to_decimal_string(),
        timestamp: state.clock.now(),
    }))
}

/// Withdraw from a wallet.
///
/// # Endpoint
///
/// `POST /wallets/{id}/withdraw`
///
/// # Response
///
/// - **200**: new balance
/// - **400**: invalid amount or insufficient funds
pub async fn withdraw(
    State(state): State<AppState>,
    Path(wallet_id): Path<Uuid>,
    Json(request): Json<WalletOperationRequest>,
) -> Result<Json<BalanceResponse>, AppError> {
    let amount = Money::from_decimal_str(&request.amount)?;
    let balance = state
        .wallets
        .withdraw(wallet_id, amount, request.description.as_deref())
        .await?;

    Ok(Json(BalanceResponse {
        wallet_id,
        balance: balance.to_decimal_string(),
        timestamp: state.clock.now(),
    }))
}
