//! Wallet use-case service - creation, Pix key registration, deposits,
//! withdrawals and balance queries.
//!
//! Balance mutations delegate to the wallet engine; this layer owns the
//! user-facing validations (duplicate users, key formats) and generates the
//! ledger transaction ids for deposits and withdrawals.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::DbPool;
use crate::error::{AppError, is_unique_violation};
use crate::models::pix_key::{self, PixKey, PixKeyType};
use crate::models::wallet::Wallet;
use crate::money::Money;
use crate::services::wallet_engine::WalletEngine;

const MAX_USER_ID_LEN: usize = 100;
const MAX_DESCRIPTION_LEN: usize = 500;

/// Operation counters, for monitoring.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletStats {
    pub wallets_created: u64,
    pub deposits_processed: u64,
    pub withdrawals_processed: u64,
    pub pix_keys_registered: u64,
    pub active_leases: usize,
}

pub struct WalletService {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    engine: Arc<WalletEngine>,
    wallets_created: AtomicU64,
    deposits_processed: AtomicU64,
    withdrawals_processed: AtomicU64,
    pix_keys_registered: AtomicU64,
}

impl WalletService {
    pub fn new(pool: DbPool, clock: Arc<dyn Clock>, engine: Arc<WalletEngine>) -> Self {
        Self {
            pool,
            clock,
            engine,
            wallets_created: AtomicU64::new(0),
            deposits_processed: AtomicU64::new(0),
            withdrawals_processed: AtomicU64::new(0),
            pix_keys_registered: AtomicU64::new(0),
        }
    }

    /// Create a wallet for `user_id`. Each user owns at most one wallet.
    pub async fn create_wallet(&self, user_id: &str) -> Result<Wallet, AppError> {
        let user_id = user_id.trim();
        if user_id.is_empty() || user_id.len() > MAX_USER_ID_LEN {
            return Err(AppError::InvalidRequest(format!(
                "user id must be between 1 and {MAX_USER_ID_LEN} characters"
            )));
        }

        let now = self.clock.now();
        let wallet = sqlx::query_as::<_, Wallet>(
            r#"
            INSERT INTO wallets (id, user_id, balance_cents, version, created_at, updated_at)
            VALUES ($1, $2, 0, 0, $3, $3)
            RETURNING id, user_id, balance_cents, version, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                AppError::DuplicateUser
            } else {
                AppError::Database(err)
            }
        })?;

        let created = self.wallets_created.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(wallet_id = %wallet.id, user_id, created, "wallet created");
        Ok(wallet)
    }

    /// Register an active Pix key routing to `wallet_id`.
    pub async fn register_pix_key(
        &self,
        wallet_id: Uuid,
        key_value: &str,
        key_type: PixKeyType,
    ) -> Result<PixKey, AppError> {
        let key_value = key_value.trim();
        pix_key::validate_key(key_value, key_type)?;

        let wallet_exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM wallets WHERE id = $1)")
                .bind(wallet_id)
                .fetch_one(&self.pool)
                .await?;
        if !wallet_exists {
            return Err(AppError::WalletNotFound);
        }

        let now = self.clock.now();
        let key = sqlx::query_as::<_, PixKey>(
            r#"
            INSERT INTO pix_keys (id, key_value, key_type, wallet_id, created_at, is_active)
            VALUES ($1, $2, $3, $4, $5, TRUE)
            RETURNING id, key_value, key_type, wallet_id, created_at, is_active
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key_value)
        .bind(key_type.as_str())
        .bind(wallet_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                AppError::InvalidRequest("Pix key already registered and active".into())
            } else {
                AppError::Database(err)
            }
        })?;

        self.pix_keys_registered.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            pix_key_id = %key.id,
            %wallet_id,
            key_type = key_type.as_str(),
            "pix key registered"
        );
        Ok(key)
    }

    /// Deposit into a wallet. Returns the new balance.
    pub async fn deposit(
        &self,
        wallet_id: Uuid,
        amount: Money,
        description: Option<&str>,
    ) -> Result<Money, AppError> {
        let description = normalize_description(description, "Deposit")?;
        let sequence = self.deposits_processed.fetch_add(1, Ordering::Relaxed) + 1;
        let transaction_id = operation_transaction_id("DEP", sequence);

        let balance = self
            .engine
            .credit(wallet_id, amount, &description, &transaction_id)
            .await?;
        tracing::info!(%wallet_id, amount = %amount, balance = %balance, "deposit processed");
        Ok(balance)
    }

    /// Withdraw from a wallet. Returns the new balance.
    pub async fn withdraw(
        &self,
        wallet_id: Uuid,
        amount: Money,
        description: Option<&str>,
    ) -> Result<Money, AppError> {
        let description = normalize_description(description, "Withdrawal")?;
        let sequence = self.withdrawals_processed.fetch_add(1, Ordering::Relaxed) + 1;
        let transaction_id = operation_transaction_id("WDR", sequence);

        let balance = self
            .engine
            .debit(wallet_id, amount, &description, &transaction_id)
            .await?;
        tracing::info!(%wallet_id, amount = %amount, balance = %balance, "withdrawal processed");
        Ok(balance)
    }

    pub async fn balance(&self, wallet_id: Uuid) -> Result<Money, AppError> {
        self.engine.balance(wallet_id).await
    }

    pub async fn balance_at(
        &self,
        wallet_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Money, AppError> {
        self.engine.balance_at(wallet_id, at).await
    }

    pub async fn find_wallet(&self, wallet_id: Uuid) -> Result<Option<Wallet>, AppError> {
        let wallet = sqlx::query_as::<_, Wallet>(
            r#"
            SELECT id, user_id, balance_cents, version, created_at, updated_at
            FROM wallets
            WHERE id = $1
            "#,
        )
        .bind(wallet_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(wallet)
    }

    pub fn stats(&self) -> WalletStats {
        WalletStats {
            wallets_created: self.wallets_created.load(Ordering::Relaxed),
            deposits_processed: self.deposits_processed.load(Ordering::Relaxed),
            withdrawals_processed: self.withdrawals_processed.load(Ordering::Relaxed),
            pix_keys_registered: self.pix_keys_registered.load(Ordering::Relaxed),
            active_leases: self.engine.lease_count(),
        }
    }
}

fn normalize_description(description: Option<&str>, default: &str) -> Result<String, AppError> {
    match description {
        Some(text) if text.len() > MAX_DESCRIPTION_LEN => Err(AppError::InvalidRequest(format!(
            "description cannot exceed {MAX_DESCRIPTION_LEN} characters"
        ))),
        Some(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        _ => Ok(default.to_string()),
    }
}

/// Ledger transaction id for deposits/withdrawals: prefix, sequence number
/// and 8 hex characters of a fresh uuid.
fn operation_transaction_id(prefix: &str, sequence: u64) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{sequence}-{}", &suffix[..8])
}
