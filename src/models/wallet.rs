//! Wallet data model and API request/response types.
//!
//! This module defines:
//! - `Wallet`: Database entity representing a wallet
//! - `CreateWalletRequest`: Request body for creating wallets
//! - `WalletResponse` / `BalanceResponse`: Response bodies returned to clients

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::money::Money;

/// Represents a wallet record from the database.
///
/// # Database Table
///
/// Maps to the `wallets` table. Each wallet:
/// - Belongs to exactly one user (`user_id` is unique)
/// - Stores its balance in integer cents (never floats)
/// - Carries an optimistic `version` counter bumped on every balance update
///
/// The balance column is redundant with the ledger: after every committed
/// operation, `balance_cents` equals the sum of the signed ledger amounts
/// for this wallet.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    /// Unique identifier for this wallet
    pub id: Uuid,

    /// Owning user; at most one wallet per user
    pub user_id: String,

    /// Current balance in cents, never negative after a committed operation
    pub balance_cents: i64,

    /// Optimistic-lock version, bumped on every balance update
    pub version: i64,

    /// Timestamp when the wallet was created
    pub created_at: DateTime<Utc>,

    /// Timestamp of the last balance update
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn balance(&self) -> Money {
        Money::from_cents(self.balance_cents)
    }
}

/// Request body for creating a new wallet.
///
/// ```json
/// { "userId": "user-123" }
/// ```
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWalletRequest {
    pub user_id: String,
}

/// Response body for wallet endpoints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletResponse {
    pub id: Uuid,
    pub user_id: String,
    /// Balance as a two-decimal string ("0.00")
    pub balance: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Wallet> for WalletResponse {
    fn from(wallet: Wallet) -> Self {
        let balance = wallet.balance().to_decimal_string();
        Self {
            id: wallet.id,
            user_id: wallet.user_id,
            balance,
            created_at: wallet.created_at,
            updated_at: wallet.updated_at,
        }
    }
}

/// Balance query response: current or historical, depending on whether the
/// client passed an `at` timestamp.
///
/// ```json
/// { "walletId": "…", "balance": "120.00", "timestamp": "2025-06-01T12:00:00Z" }
/// ```
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub wallet_id: Uuid,
    pub balance: String,
    pub timestamp: DateTime<Utc>,
}

/// Request body for deposits and withdrawals.
///
/// ```json
/// { "amount": "100.00", "description": "Salary" }
/// ```
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletOperationRequest {
    /// Amount as a decimal string, parsed without floating point
    pub amount: String,

    /// Optional human-readable description for the ledger entry
    pub description: Option<String>,
}
