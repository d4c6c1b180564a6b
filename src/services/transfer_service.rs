//! Atomic transfer service - initiation and terminal state transitions.
//!
//! Initiation reserves an in-memory state slot, debits the source wallet,
//! and persists the PENDING transfer row. Losing a unique-constraint race
//! on (endToEndId) or (idempotencyKey) triggers compensation: the debit is
//! refunded under the same lease discipline and the winning row is
//! returned, so no net balance change is ever left behind.
//!
//! Transitions compare-and-set the in-memory status PENDING → terminal,
//! then re-check and persist under a pessimistic row lock, and only after
//! commit apply the financial effect (credit destination on CONFIRMED,
//! refund source on REJECTED). The database row is always authoritative;
//! the in-memory map is a cache rebuilt from storage on miss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::DbPool;
use crate::error::{AppError, is_unique_violation, map_tx_error};
use crate::models::transfer::{PixTransfer, PixTransferStatus};
use crate::money::Money;
use crate::services::wallet_engine::{TRANSFER_LEASE_TIMEOUT, WalletEngine};

/// In-memory transfer states expire after an hour; the row outlives them.
const TRANSFER_STATE_TTL_MINUTES: i64 = 60;
/// Soft cap on the state map; exceeding it evicts entries older than
/// `EMERGENCY_STATE_AGE_MINUTES`.
const MAX_TRANSFER_STATES: usize = 10_000;
const EMERGENCY_STATE_AGE_MINUTES: i64 = 30;

const SELECT_TRANSFER: &str = r#"
    SELECT id, end_to_end_id, idempotency_key, from_wallet_id, to_pix_key,
           amount_cents, status, created_at, updated_at,
           confirmed_at, rejected_at, rejection_reason, version
    FROM pix_transfers
"#;

/// Hot-path status slot for one endToEndId.
struct TransferStateEntry {
    status: Mutex<PixTransferStatus>,
    created_at: DateTime<Utc>,
    last_access: Mutex<DateTime<Utc>>,
}

impl TransferStateEntry {
    fn new(status: PixTransferStatus, now: DateTime<Utc>) -> Self {
        Self {
            status: Mutex::new(status),
            created_at: now,
            last_access: Mutex::new(now),
        }
    }

    fn touch(&self, now: DateTime<Utc>) {
        *self.last_access.lock().expect("state mutex poisoned") = now;
    }

    fn status(&self, now: DateTime<Utc>) -> PixTransferStatus {
        self.touch(now);
        *self.status.lock().expect("state mutex poisoned")
    }

    /// Atomically move `expected → target`, enforcing the transition table.
    fn compare_and_set(
        &self,
        expected: PixTransferStatus,
        target: PixTransferStatus,
        now: DateTime<Utc>,
    ) -> bool {
        self.touch(now);
        let mut status = self.status.lock().expect("state mutex poisoned");
        if *status == expected && PixTransferStatus::is_valid_transition(expected, target) {
            *status = target;
            true
        } else {
            false
        }
    }

    /// Overwrite with the authoritative database status.
    fn force_set(&self, status: PixTransferStatus, now: DateTime<Utc>) {
        self.touch(now);
        *self.status.lock().expect("state mutex poisoned") = status;
    }

    fn is_terminal(&self) -> bool {
        self.status.lock().expect("state mutex poisoned").is_terminal()
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.created_at + chrono::Duration::minutes(TRANSFER_STATE_TTL_MINUTES)
    }

    fn is_older_than(&self, minutes: i64, now: DateTime<Utc>) -> bool {
        now >= self.created_at + chrono::Duration::minutes(minutes)
    }
}

/// Snapshot of the service counters and map sizes, for monitoring.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStats {
    pub total_transfers: u64,
    pub successful_transfers: u64,
    pub failed_transfers: u64,
    pub active_transfers: i64,
    pub states_in_memory: usize,
    pub wallet_leases: usize,
}

/// Orchestrates atomic transfer creation and state transitions.
pub struct TransferService {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    engine: Arc<WalletEngine>,
    states: Mutex<HashMap<String, Arc<TransferStateEntry>>>,
    total_transfers: AtomicU64,
    successful_transfers: AtomicU64,
    failed_transfers: AtomicU64,
    active_transfers: AtomicI64,
}

impl TransferService {
    pub fn new(pool: DbPool, clock: Arc<dyn Clock>, engine: Arc<WalletEngine>) -> Self {
        Self {
            pool,
            clock,
            engine,
            states: Mutex::new(HashMap::new()),
            total_transfers: AtomicU64::new(0),
            successful_transfers: AtomicU64::new(0),
            failed_transfers: AtomicU64::new(0),
            active_transfers: AtomicI64::new(0),
        }
    }

    /// Initiate a transfer: debit the source wallet and persist a PENDING
    /// row, at most once per idempotency key.
    pub async fn create_transfer(
        &self,
        end_to_end_id: &str,
        idempotency_key: &str,
        from_wallet_id: Uuid,
        to_pix_key: &str,
        amount: Money,
    ) -> Result<PixTransfer, AppError> {
        amount.validate_for_pix()?;

        self.total_transfers.fetch_add(1, Ordering::Relaxed);
        self.active_transfers.fetch_add(1, Ordering::Relaxed);
        let result = self
            .create_transfer_inner(end_to_end_id, idempotency_key, from_wallet_id, to_pix_key, amount)
            .await;
        self.active_transfers.fetch_sub(1, Ordering::Relaxed);

        if result.is_err() {
            self.failed_transfers.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn create_transfer_inner(
        &self,
        end_to_end_id: &str,
        idempotency_key: &str,
        from_wallet_id: Uuid,
        to_pix_key: &str,
        amount: Money,
    ) -> Result<PixTransfer, AppError> {
        // An existing row for this idempotency key wins outright.
        if let Some(existing) = self.find_by_idempotency_key(idempotency_key).await? {
            tracing::info!(idempotency_key, "transfer already exists for idempotency key");
            return Ok(existing);
        }

        // Reserve the endToEndId in memory before touching any balance.
        let now = self.clock.now();
        let reserved = {
            let mut states = self.states.lock().expect("state map poisoned");
            let live = states
                .get(end_to_end_id)
                .map(|entry| !entry.is_expired(now));
            match live {
                Some(true) => false,
                expired_or_absent => {
                    if expired_or_absent.is_some() {
                        states.remove(end_to_end_id);
                    }
                    if states.len() >= MAX_TRANSFER_STATES {
                        Self::emergency_evict(&mut states, now);
                    }
                    states.insert(
                        end_to_end_id.to_string(),
                        Arc::new(TransferStateEntry::new(PixTransferStatus::Pending, now)),
                    );
                    true
                }
            }
        };
        if !reserved {
            tracing::info!(end_to_end_id, "concurrent transfer creation detected");
            return self.reread_existing(end_to_end_id, idempotency_key).await;
        }

        // Debit first; the PENDING row is only persisted for money that has
        // actually been reserved.
        let debit = self
            .engine
            .debit_with_lease(
                from_wallet_id,
                amount,
                &format!("Pix transfer - {end_to_end_id}"),
                end_to_end_id,
                TRANSFER_LEASE_TIMEOUT,
            )
            .await;
        if let Err(err) = debit {
            self.remove_state(end_to_end_id);
            return Err(err);
        }

        match self
            .insert_row_with_retries(end_to_end_id, idempotency_key, from_wallet_id, to_pix_key, amount)
            .await
        {
            Ok(transfer) => {
                self.successful_transfers.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    end_to_end_id,
                    transfer_id = %transfer.id,
                    "transfer created"
                );
                Ok(transfer)
            }
            Err(AppError::DataIntegrityViolation) => {
                // Another actor committed first: refund the debit under the
                // same lease discipline and hand back the winning row.
                tracing::warn!(
                    end_to_end_id,
                    "constraint race during transfer creation, refunding debit"
                );
                self.refund_debit(from_wallet_id, amount, end_to_end_id).await?;
                self.remove_state(end_to_end_id);
                self.reread_existing(end_to_end_id, idempotency_key).await
            }
            Err(err) => {
                // The debit committed but the row did not. Compensate so no
                // net balance change is left behind.
                tracing::error!(
                    end_to_end_id,
                    error = %err,
                    "transfer row insert failed after debit, refunding"
                );
                if let Err(refund_err) =
                    self.refund_debit(from_wallet_id, amount, end_to_end_id).await
                {
                    tracing::error!(
                        end_to_end_id,
                        error = %refund_err,
                        "refund after failed insert also failed, ledger needs reconciliation"
                    );
                }
                self.remove_state(end_to_end_id);
                Err(err)
            }
        }
    }

    async fn refund_debit(
        &self,
        wallet_id: Uuid,
        amount: Money,
        end_to_end_id: &str,
    ) -> Result<Money, AppError> {
        self.engine
            .credit_with_lease(
                wallet_id,
                amount,
                &format!("Pix refund - {end_to_end_id}"),
                &format!("{end_to_end_id}-REFUND"),
                TRANSFER_LEASE_TIMEOUT,
            )
            .await
    }

    async fn insert_row_with_retries(
        &self,
        end_to_end_id: &str,
        idempotency_key: &str,
        from_wallet_id: Uuid,
        to_pix_key: &str,
        amount: Money,
    ) -> Result<PixTransfer, AppError> {
        let mut attempt = 1;
        loop {
            match self
                .insert_transfer_row(end_to_end_id, idempotency_key, from_wallet_id, to_pix_key, amount)
                .await
            {
                Err(AppError::TransientConflict(reason)) if attempt < 3 => {
                    tracing::warn!(end_to_end_id, attempt, reason = %reason, "transfer insert conflicted, retrying");
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                result => return result,
            }
        }
    }

    async fn insert_transfer_row(
        &self,
        end_to_end_id: &str,
        idempotency_key: &str,
        from_wallet_id: Uuid,
        to_pix_key: &str,
        amount: Money,
    ) -> Result<PixTransfer, AppError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let transfer = sqlx::query_as::<_, PixTransfer>(
            r#"
            INSERT INTO pix_transfers (
                id, end_to_end_id, idempotency_key, from_wallet_id, to_pix_key,
                amount_cents, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING id, end_to_end_id, idempotency_key, from_wallet_id, to_pix_key,
                      amount_cents, status, created_at, updated_at,
                      confirmed_at, rejected_at, rejection_reason, version
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(end_to_end_id)
        .bind(idempotency_key)
        .bind(from_wallet_id)
        .bind(to_pix_key)
        .bind(amount.cents())
        .bind(PixTransferStatus::Pending.as_str())
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                AppError::DataIntegrityViolation
            } else {
                map_tx_error(err)
            }
        })?;

        tx.commit().await.map_err(map_tx_error)?;
        Ok(transfer)
    }

    async fn reread_existing(
        &self,
        end_to_end_id: &str,
        idempotency_key: &str,
    ) -> Result<PixTransfer, AppError> {
        if let Some(transfer) = self.find_by_end_to_end_id(end_to_end_id).await? {
            return Ok(transfer);
        }
        if let Some(transfer) = self.find_by_idempotency_key(idempotency_key).await? {
            return Ok(transfer);
        }
        Err(AppError::Internal(
            "transfer should exist after constraint violation".into(),
        ))
    }

    /// Drive the transfer to a terminal state and apply its financial
    /// effect. Returns `false` when the transfer is unknown, already
    /// terminal, or lost a concurrent transition; `true` when this call
    /// performed the transition.
    pub async fn transition_to(
        &self,
        end_to_end_id: &str,
        target: PixTransferStatus,
        reason: Option<&str>,
    ) -> Result<bool, AppError> {
        if !target.is_terminal() {
            tracing::warn!(end_to_end_id, target = target.as_str(), "unsupported target status");
            return Ok(false);
        }

        let now = self.clock.now();
        let Some(entry) = self.state_entry_or_reload(end_to_end_id, now).await? else {
            tracing::warn!(end_to_end_id, "transfer not found for transition");
            return Ok(false);
        };

        // The CAS is the fast gate; the row check below is the authority.
        if !entry.compare_and_set(PixTransferStatus::Pending, target, now) {
            tracing::info!(
                end_to_end_id,
                current = entry.status(now).as_str(),
                target = target.as_str(),
                "transition refused by in-memory state"
            );
            return Ok(false);
        }

        let transfer = match self.apply_transition(end_to_end_id, target, reason).await {
            Ok(Some(transfer)) => transfer,
            Ok(None) => return Ok(false),
            Err(err) => {
                // Undo the CAS so a later attempt can drive the row again.
                entry.force_set(PixTransferStatus::Pending, self.clock.now());
                return Err(err);
            }
        };

        // Post-commit financial effect.
        match target {
            PixTransferStatus::Confirmed => {
                let destination = self.resolve_destination_wallet(&transfer.to_pix_key).await?;
                self.engine
                    .credit_with_lease(
                        destination,
                        transfer.amount(),
                        &format!("Pix credit - {end_to_end_id}"),
                        end_to_end_id,
                        TRANSFER_LEASE_TIMEOUT,
                    )
                    .await?;
                tracing::info!(
                    end_to_end_id,
                    destination_wallet = %destination,
                    "transfer confirmed and destination credited"
                );
            }
            PixTransferStatus::Rejected => {
                self.engine
                    .credit_with_lease(
                        transfer.from_wallet_id,
                        transfer.amount(),
                        &format!("Pix refund - {end_to_end_id}"),
                        &format!("{end_to_end_id}-REFUND"),
                        TRANSFER_LEASE_TIMEOUT,
                    )
                    .await?;
                tracing::info!(
                    end_to_end_id,
                    source_wallet = %transfer.from_wallet_id,
                    "transfer rejected and source refunded"
                );
            }
            PixTransferStatus::Pending => unreachable!("target is terminal"),
        }

        Ok(true)
    }

    /// Re-read the row under a pessimistic lock, enforce PENDING, persist
    /// the terminal state. `Ok(None)` means the row was already terminal
    /// (the in-memory entry is corrected to match).
    async fn apply_transition(
        &self,
        end_to_end_id: &str,
        target: PixTransferStatus,
        reason: Option<&str>,
    ) -> Result<Option<PixTransfer>, AppError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let mut transfer = sqlx::query_as::<_, PixTransfer>(
            &format!("{SELECT_TRANSFER} WHERE end_to_end_id = $1 FOR UPDATE"),
        )
        .bind(end_to_end_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_tx_error)?
        .ok_or_else(|| AppError::Internal(format!("transfer vanished: {end_to_end_id}")))?;

        let applied = match target {
            PixTransferStatus::Confirmed => transfer.confirm(now),
            PixTransferStatus::Rejected => {
                transfer.reject(reason.unwrap_or("Transfer rejected"), now)
            }
            PixTransferStatus::Pending => unreachable!("target is terminal"),
        };
        if applied.is_err() {
            // The row is already terminal: somebody else won. Align the
            // in-memory cache with the authoritative status.
            if let Some(status) = transfer.status() {
                if let Some(entry) = self.state_entry(end_to_end_id) {
                    entry.force_set(status, now);
                }
            }
            tracing::info!(
                end_to_end_id,
                status = %transfer.status,
                "transition refused by database state"
            );
            return Ok(None);
        }

        sqlx::query(
            r#"
            UPDATE pix_transfers
            SET status = $1, updated_at = $2, confirmed_at = $3,
                rejected_at = $4, rejection_reason = $5, version = version + 1
            WHERE end_to_end_id = $6
            "#,
        )
        .bind(&transfer.status)
        .bind(transfer.updated_at)
        .bind(transfer.confirmed_at)
        .bind(transfer.rejected_at)
        .bind(&transfer.rejection_reason)
        .bind(end_to_end_id)
        .execute(&mut *tx)
        .await
        .map_err(map_tx_error)?;

        tx.commit().await.map_err(map_tx_error)?;
        Ok(Some(transfer))
    }

    async fn resolve_destination_wallet(&self, to_pix_key: &str) -> Result<Uuid, AppError> {
        sqlx::query_scalar(
            "SELECT wallet_id FROM pix_keys WHERE key_value = $1 AND is_active = TRUE",
        )
        .bind(to_pix_key)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::DestinationNotFound)
    }

    fn state_entry(&self, end_to_end_id: &str) -> Option<Arc<TransferStateEntry>> {
        self.states
            .lock()
            .expect("state map poisoned")
            .get(end_to_end_id)
            .cloned()
    }

    /// Fetch the in-memory entry, rebuilding it from storage when missing
    /// or expired. `Ok(None)` means the transfer does not exist at all.
    async fn state_entry_or_reload(
        &self,
        end_to_end_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Arc<TransferStateEntry>>, AppError> {
        if let Some(entry) = self.state_entry(end_to_end_id) {
            if !entry.is_expired(now) {
                return Ok(Some(entry));
            }
            self.remove_state(end_to_end_id);
        }

        let Some(transfer) = self.find_by_end_to_end_id(end_to_end_id).await? else {
            return Ok(None);
        };
        let status = transfer
            .status()
            .ok_or_else(|| AppError::Internal(format!("unknown status: {}", transfer.status)))?;

        let mut states = self.states.lock().expect("state map poisoned");
        if states.len() >= MAX_TRANSFER_STATES {
            Self::emergency_evict(&mut states, now);
        }
        let entry = states
            .entry(end_to_end_id.to_string())
            .or_insert_with(|| Arc::new(TransferStateEntry::new(status, now)));
        Ok(Some(Arc::clone(entry)))
    }

    fn remove_state(&self, end_to_end_id: &str) {
        self.states
            .lock()
            .expect("state map poisoned")
            .remove(end_to_end_id);
    }

    fn emergency_evict(states: &mut HashMap<String, Arc<TransferStateEntry>>, now: DateTime<Utc>) {
        let before = states.len();
        states.retain(|_, entry| !entry.is_older_than(EMERGENCY_STATE_AGE_MINUTES, now));
        tracing::warn!(
            removed = before - states.len(),
            "emergency eviction of transfer states"
        );
    }

    pub async fn find_by_end_to_end_id(
        &self,
        end_to_end_id: &str,
    ) -> Result<Option<PixTransfer>, AppError> {
        let transfer =
            sqlx::query_as::<_, PixTransfer>(&format!("{SELECT_TRANSFER} WHERE end_to_end_id = $1"))
                .bind(end_to_end_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(transfer)
    }

    pub async fn find_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<PixTransfer>, AppError> {
        let transfer = sqlx::query_as::<_, PixTransfer>(&format!(
            "{SELECT_TRANSFER} WHERE idempotency_key = $1"
        ))
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(transfer)
    }

    /// Drop expired and terminal state entries plus idle wallet leases.
    /// Returns (removed states, removed leases).
    pub fn cleanup(&self) -> (usize, usize) {
        let now = self.clock.now();
        let removed_states = {
            let mut states = self.states.lock().expect("state map poisoned");
            let before = states.len();
            states.retain(|_, entry| !entry.is_expired(now) && !entry.is_terminal());
            before - states.len()
        };
        let removed_leases = self.engine.cleanup_leases();
        tracing::info!(
            removed_states,
            removed_leases,
            "transfer state cleanup completed"
        );
        (removed_states, removed_leases)
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            total_transfers: self.total_transfers.load(Ordering::Relaxed),
            successful_transfers: self.successful_transfers.load(Ordering::Relaxed),
            failed_transfers: self.failed_transfers.load(Ordering::Relaxed),
            active_transfers: self.active_transfers.load(Ordering::Relaxed),
            states_in_memory: self.states.lock().expect("state map poisoned").len(),
            wallet_leases: self.engine.lease_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn cas_allows_exactly_one_terminal_transition() {
        let entry = TransferStateEntry::new(PixTransferStatus::Pending, now());

        assert!(entry.compare_and_set(
            PixTransferStatus::Pending,
            PixTransferStatus::Confirmed,
            now()
        ));
        // Second terminal attempt loses, in either direction.
        assert!(!entry.compare_and_set(
            PixTransferStatus::Pending,
            PixTransferStatus::Rejected,
            now()
        ));
        assert!(!entry.compare_and_set(
            PixTransferStatus::Confirmed,
            PixTransferStatus::Rejected,
            now()
        ));
        assert_eq!(entry.status(now()), PixTransferStatus::Confirmed);
        assert!(entry.is_terminal());
    }

    #[test]
    fn cas_refuses_non_pending_expectations() {
        let entry = TransferStateEntry::new(PixTransferStatus::Pending, now());
        // Wrong expected value.
        assert!(!entry.compare_and_set(
            PixTransferStatus::Confirmed,
            PixTransferStatus::Rejected,
            now()
        ));
        assert_eq!(entry.status(now()), PixTransferStatus::Pending);
    }

    #[test]
    fn state_entries_expire_by_creation_time() {
        let created = now();
        let entry = TransferStateEntry::new(PixTransferStatus::Pending, created);

        assert!(!entry.is_expired(created + chrono::Duration::minutes(59)));
        assert!(entry.is_expired(created + chrono::Duration::minutes(60)));
        assert!(entry.is_older_than(30, created + chrono::Duration::minutes(31)));
        assert!(!entry.is_older_than(30, created + chrono::Duration::minutes(29)));
    }

    #[test]
    fn force_set_overwrites_stale_status() {
        let entry = TransferStateEntry::new(PixTransferStatus::Pending, now());
        entry.force_set(PixTransferStatus::Rejected, now());
        assert_eq!(entry.status(now()), PixTransferStatus::Rejected);
        assert!(!entry.compare_and_set(
            PixTransferStatus::Pending,
            PixTransferStatus::Confirmed,
            now()
        ));
    }
}
