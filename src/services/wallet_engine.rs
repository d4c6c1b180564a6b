//! Wallet engine - atomic balance mutations with an append-only ledger.
//!
//! Every credit or debit applies exactly one balance change and appends
//! exactly one ledger entry, under two layers of exclusion:
//!
//! 1. A per-wallet in-process lease keeps the database transaction queue
//!    short and acquisition bounded by a timeout.
//! 2. A SERIALIZABLE transaction with `SELECT … FOR UPDATE` on the wallet
//!    row is the ultimate authority; the optimistic `version` column guards
//!    against writes that slipped past the lease.
//!
//! Serialization aborts and version conflicts are retried up to 3 attempts
//! with 100 ms linear backoff, then surfaced as a transient conflict.
//!
//! Invariant: after every committed operation the wallet balance equals the
//! sum of the signed amounts of all its ledger entries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::DbPool;
use crate::error::{AppError, is_unique_violation, map_tx_error};
use crate::models::ledger::LedgerEntryType;
use crate::models::wallet::Wallet;
use crate::money::Money;

/// Lease acquisition bound for public wallet operations.
pub const WALLET_LEASE_TIMEOUT: Duration = Duration::from_secs(10);
/// Tighter bound for acquisitions made from inside a transfer.
pub const TRANSFER_LEASE_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Soft cap on the lease map; exceeding it triggers emergency eviction.
const MAX_WALLET_LEASES: usize = 1_000;
/// An idle lease entry older than this is dropped after release.
const LEASE_TTL_MINUTES: i64 = 5;

/// One lease slot per wallet, with timestamps for TTL-based pruning.
struct LeaseEntry {
    mutex: Arc<tokio::sync::Mutex<()>>,
    created_at: DateTime<Utc>,
    last_access: Mutex<DateTime<Utc>>,
}

impl LeaseEntry {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            mutex: Arc::new(tokio::sync::Mutex::new(())),
            created_at: now,
            last_access: Mutex::new(now),
        }
    }

    fn touch(&self, now: DateTime<Utc>) {
        *self.last_access.lock().expect("lease mutex poisoned") = now;
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let last = *self.last_access.lock().expect("lease mutex poisoned");
        now >= last + chrono::Duration::minutes(LEASE_TTL_MINUTES)
    }

    fn is_older_than(&self, minutes: i64, now: DateTime<Utc>) -> bool {
        now >= self.created_at + chrono::Duration::minutes(minutes)
    }

    /// Idle means nobody currently holds or waits on the lease.
    fn is_idle(&self) -> bool {
        self.mutex.try_lock().is_ok()
    }
}

#[derive(Debug, Clone, Copy)]
enum MutationKind {
    Credit,
    Debit,
}

/// Applies credits and debits to wallets under per-wallet exclusion.
pub struct WalletEngine {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    leases: Mutex<HashMap<Uuid, Arc<LeaseEntry>>>,
}

impl WalletEngine {
    pub fn new(pool: DbPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Increase the wallet balance and append a CREDIT ledger entry.
    pub async fn credit(
        &self,
        wallet_id: Uuid,
        amount: Money,
        description: &str,
        transaction_id: &str,
    ) -> Result<Money, AppError> {
        self.apply(
            wallet_id,
            amount,
            MutationKind::Credit,
            description,
            transaction_id,
            WALLET_LEASE_TIMEOUT,
        )
        .await
    }

    /// Decrease the wallet balance and append a DEBIT ledger entry.
    ///
    /// Fails with `InsufficientFunds` when the current balance is lower
    /// than `amount`.
    pub async fn debit(
        &self,
        wallet_id: Uuid,
        amount: Money,
        description: &str,
        transaction_id: &str,
    ) -> Result<Money, AppError> {
        self.apply(
            wallet_id,
            amount,
            MutationKind::Debit,
            description,
            transaction_id,
            WALLET_LEASE_TIMEOUT,
        )
        .await
    }

    /// Credit with a caller-chosen lease timeout (transfer-internal path).
    pub async fn credit_with_lease(
        &self,
        wallet_id: Uuid,
        amount: Money,
        description: &str,
        transaction_id: &str,
        lease_timeout: Duration,
    ) -> Result<Money, AppError> {
        self.apply(
            wallet_id,
            amount,
            MutationKind::Credit,
            description,
            transaction_id,
            lease_timeout,
        )
        .await
    }

    /// Debit with a caller-chosen lease timeout (transfer-internal path).
    pub async fn debit_with_lease(
        &self,
        wallet_id: Uuid,
        amount: Money,
        description: &str,
        transaction_id: &str,
        lease_timeout: Duration,
    ) -> Result<Money, AppError> {
        self.apply(
            wallet_id,
            amount,
            MutationKind::Debit,
            description,
            transaction_id,
            lease_timeout,
        )
        .await
    }

    async fn apply(
        &self,
        wallet_id: Uuid,
        amount: Money,
        kind: MutationKind,
        description: &str,
        transaction_id: &str,
        lease_timeout: Duration,
    ) -> Result<Money, AppError> {
        if !amount.is_positive() {
            return Err(AppError::InvalidAmount("amount must be positive".into()));
        }

        let lease = self.acquire_lease(wallet_id, lease_timeout).await?;
        let result = self
            .apply_with_retries(wallet_id, amount, kind, description, transaction_id)
            .await;
        drop(lease);
        self.release_lease(wallet_id);
        result
    }

    async fn apply_with_retries(
        &self,
        wallet_id: Uuid,
        amount: Money,
        kind: MutationKind,
        description: &str,
        transaction_id: &str,
    ) -> Result<Money, AppError> {
        let mut last_conflict = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match self
                .try_apply(wallet_id, amount, kind, description, transaction_id)
                .await
            {
                Ok(balance) => return Ok(balance),
                Err(AppError::TransientConflict(reason)) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(
                        %wallet_id,
                        attempt,
                        reason = %reason,
                        "wallet mutation conflicted, retrying"
                    );
                    last_conflict = reason;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(AppError::TransientConflict(format!(
            "retries exhausted after {MAX_ATTEMPTS} attempts: {last_conflict}"
        )))
    }

    async fn try_apply(
        &self,
        wallet_id: Uuid,
        amount: Money,
        kind: MutationKind,
        description: &str,
        transaction_id: &str,
    ) -> Result<Money, AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        // Pessimistic row lock: no other transaction can touch this wallet
        // until we commit.
        let wallet = sqlx::query_as::<_, Wallet>(
            r#"
            SELECT id, user_id, balance_cents, version, created_at, updated_at
            FROM wallets
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(wallet_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_tx_error)?
        .ok_or(AppError::WalletNotFound)?;

        let balance = wallet.balance();
        let (entry_type, signed_amount) = match kind {
            MutationKind::Credit => (LedgerEntryType::Credit, amount),
            MutationKind::Debit => {
                if balance < amount {
                    return Err(AppError::InsufficientFunds);
                }
                (LedgerEntryType::Debit, amount.negate())
            }
        };
        let new_balance = balance.checked_add(signed_amount)?;

        let now = self.clock.now();
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                id, wallet_id, amount_cents, entry_type,
                description, transaction_id, created_at, balance_after_cents
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(wallet_id)
        .bind(signed_amount.cents())
        .bind(entry_type.as_str())
        .bind(description)
        .bind(transaction_id)
        .bind(now)
        .bind(new_balance.cents())
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                // Same transaction id already applied to this wallet.
                AppError::DataIntegrityViolation
            } else {
                map_tx_error(err)
            }
        })?;

        // Optimistic check on top of the row lock: if another writer bumped
        // the version since our read, back off and retry.
        let updated = sqlx::query(
            r#"
            UPDATE wallets
            SET balance_cents = $1, updated_at = $2, version = version + 1
            WHERE id = $3 AND version = $4
            "#,
        )
        .bind(new_balance.cents())
        .bind(now)
        .bind(wallet_id)
        .bind(wallet.version)
        .execute(&mut *tx)
        .await
        .map_err(map_tx_error)?
        .rows_affected();

        if updated == 0 {
            return Err(AppError::TransientConflict(
                "optimistic version conflict".into(),
            ));
        }

        tx.commit().await.map_err(map_tx_error)?;

        tracing::debug!(
            %wallet_id,
            entry_type = entry_type.as_str(),
            amount = %amount,
            new_balance = %new_balance,
            transaction_id,
            "wallet mutation committed"
        );

        Ok(new_balance)
    }

    /// Current committed balance.
    pub async fn balance(&self, wallet_id: Uuid) -> Result<Money, AppError> {
        let cents: i64 = sqlx::query_scalar("SELECT balance_cents FROM wallets WHERE id = $1")
            .bind(wallet_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::WalletNotFound)?;
        Ok(Money::from_cents(cents))
    }

    /// Historical balance: the deterministic replay of the ledger up to and
    /// including `at`. Entries appended after `at` do not affect it.
    pub async fn balance_at(
        &self,
        wallet_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Money, AppError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM wallets WHERE id = $1)")
            .bind(wallet_id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Err(AppError::WalletNotFound);
        }

        let cents: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount_cents), 0)::BIGINT
            FROM ledger_entries
            WHERE wallet_id = $1 AND created_at <= $2
            "#,
        )
        .bind(wallet_id)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(Money::from_cents(cents))
    }

    async fn acquire_lease(
        &self,
        wallet_id: Uuid,
        lease_timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>, AppError> {
        let now = self.clock.now();
        let mutex = {
            let mut leases = self.leases.lock().expect("lease map poisoned");
            if leases.len() >= MAX_WALLET_LEASES {
                let before = leases.len();
                leases.retain(|_, entry| !entry.is_older_than(LEASE_TTL_MINUTES, now) || !entry.is_idle());
                tracing::warn!(
                    removed = before - leases.len(),
                    "emergency eviction of wallet leases"
                );
            }
            let entry = leases
                .entry(wallet_id)
                .or_insert_with(|| Arc::new(LeaseEntry::new(now)));
            entry.touch(now);
            Arc::clone(&entry.mutex)
        };

        tokio::time::timeout(lease_timeout, mutex.lock_owned())
            .await
            .map_err(|_| {
                AppError::TransientConflict(format!(
                    "timed out waiting for wallet lease {wallet_id}"
                ))
            })
    }

    /// Drop the lease entry after release when it is idle and expired.
    fn release_lease(&self, wallet_id: Uuid) {
        let now = self.clock.now();
        let mut leases = self.leases.lock().expect("lease map poisoned");
        if let Some(entry) = leases.get(&wallet_id) {
            entry.touch(now);
            if entry.is_expired(now) && entry.is_idle() {
                leases.remove(&wallet_id);
            }
        }
    }

    /// Remove idle, expired lease entries. Returns how many were dropped.
    pub fn cleanup_leases(&self) -> usize {
        let now = self.clock.now();
        let mut leases = self.leases.lock().expect("lease map poisoned");
        let before = leases.len();
        leases.retain(|_, entry| !entry.is_expired(now) || !entry.is_idle());
        before - leases.len()
    }

    pub fn lease_count(&self) -> usize {
        self.leases.lock().expect("lease map poisoned").len()
    }
}
