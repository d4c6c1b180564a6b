//! Pix orchestrator - glues inbound requests and webhook events to the
//! atomic transfer service.
//!
//! Initiation resolves the destination key, generates the end-to-end id and
//! delegates to the transfer service, retrying transient failures at this
//! boundary. Webhook processing is intentionally forgiving: duplicate
//! events, unknown event types, missing transfers and terminal-state
//! rejections are all absorbed with success so the external system stops
//! redelivering.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::DbPool;
use crate::error::AppError;
use crate::models::transfer::{PixTransfer, PixTransferStatus};
use crate::money::Money;
use crate::services::idempotency_service::IdempotencyService;
use crate::services::transfer_service::TransferService;

/// Idempotency scope for transfer initiations.
const TRANSFER_SCOPE: &str = "transfer";
/// Idempotency scope for webhook events.
const WEBHOOK_SCOPE: &str = "webhook";

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Webhook counters, for monitoring.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookStats {
    pub events_processed: u64,
    pub duplicate_events: u64,
}

pub struct PixService {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    transfers: Arc<TransferService>,
    idempotency: Arc<IdempotencyService>,
    webhook_events: AtomicU64,
    duplicate_webhooks: AtomicU64,
}

impl PixService {
    pub fn new(
        pool: DbPool,
        clock: Arc<dyn Clock>,
        transfers: Arc<TransferService>,
        idempotency: Arc<IdempotencyService>,
    ) -> Self {
        Self {
            pool,
            clock,
            transfers,
            idempotency,
            webhook_events: AtomicU64::new(0),
            duplicate_webhooks: AtomicU64::new(0),
        }
    }

    /// Initiate a transfer under the client's idempotency key. Retries up
    /// to 3 times with 100 ms backoff on retriable coordination failures.
    pub async fn initiate_transfer(
        &self,
        idempotency_key: &str,
        from_wallet_id: Uuid,
        to_pix_key: &str,
        amount: Money,
    ) -> Result<PixTransfer, AppError> {
        let idempotency_key = idempotency_key.trim();
        if idempotency_key.is_empty() || idempotency_key.len() > 500 {
            return Err(AppError::InvalidRequest(
                "Idempotency-Key header must be between 1 and 500 characters".into(),
            ));
        }

        let mut attempt = 1;
        loop {
            match self
                .try_initiate(idempotency_key, from_wallet_id, to_pix_key, amount)
                .await
            {
                Err(err @ (AppError::DataIntegrityViolation | AppError::TransientConflict(_)))
                    if attempt < MAX_ATTEMPTS =>
                {
                    tracing::warn!(attempt, error = %err, "transfer initiation conflicted, retrying");
                    attempt += 1;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                result => return result,
            }
        }
    }

    async fn try_initiate(
        &self,
        idempotency_key: &str,
        from_wallet_id: Uuid,
        to_pix_key: &str,
        amount: Money,
    ) -> Result<PixTransfer, AppError> {
        // Short-circuit: a transfer row is the durable answer for this key.
        if let Some(existing) = self.transfers.find_by_idempotency_key(idempotency_key).await? {
            return Ok(existing);
        }

        self.resolve_active_key(to_pix_key).await?;

        let end_to_end_id = generate_end_to_end_id(self.clock.now());
        let transfer = self
            .transfers
            .create_transfer(
                &end_to_end_id,
                idempotency_key,
                from_wallet_id,
                to_pix_key,
                amount,
            )
            .await?;

        // Response memo in the transfer scope; the row's unique key already
        // guarantees correctness, so failures here are only logged.
        let request_body = format!(
            "{from_wallet_id}|{to_pix_key}|{}",
            amount.to_decimal_string()
        );
        if let Err(err) = self
            .idempotency
            .save_first(
                TRANSFER_SCOPE,
                idempotency_key,
                &request_body,
                Some(&transfer.end_to_end_id),
                201,
            )
            .await
        {
            tracing::warn!(error = %err, "failed to record transfer idempotency memo");
        }

        tracing::info!(
            end_to_end_id = %transfer.end_to_end_id,
            transfer_id = %transfer.id,
            "pix transfer initiated"
        );
        Ok(transfer)
    }

    /// Process one webhook event. Always succeeds once the event has been
    /// absorbed, whether or not it changed anything.
    pub async fn process_webhook_event(
        &self,
        end_to_end_id: &str,
        event_id: &str,
        event_type: &str,
        occurred_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        self.webhook_events.fetch_add(1, Ordering::Relaxed);
        tracing::info!(end_to_end_id, event_id, event_type, ?occurred_at, "processing webhook event");

        if self.idempotency.find(WEBHOOK_SCOPE, event_id).await?.is_some() {
            self.duplicate_webhooks.fetch_add(1, Ordering::Relaxed);
            tracing::info!(event_id, "webhook event already processed");
            return Ok(());
        }

        let Some(target) = parse_event_type(event_type) else {
            tracing::warn!(event_id, event_type, "unknown webhook event type, dropping");
            return Ok(());
        };

        let reason = format!("Processed via webhook event: {event_id}");
        let transitioned = self
            .transition_with_retries(end_to_end_id, target, &reason)
            .await?;
        if !transitioned {
            // Terminal transfer or unknown endToEndId: the event is
            // absorbed, not an error.
            tracing::info!(
                end_to_end_id,
                event_id,
                target = target.as_str(),
                "webhook event absorbed without effect"
            );
        }

        self.idempotency
            .save_first(WEBHOOK_SCOPE, event_id, end_to_end_id, Some("processed"), 200)
            .await?;
        Ok(())
    }

    async fn transition_with_retries(
        &self,
        end_to_end_id: &str,
        target: PixTransferStatus,
        reason: &str,
    ) -> Result<bool, AppError> {
        let mut attempt = 1;
        loop {
            match self
                .transfers
                .transition_to(end_to_end_id, target, Some(reason))
                .await
            {
                Err(err @ (AppError::DataIntegrityViolation | AppError::TransientConflict(_)))
                    if attempt < MAX_ATTEMPTS =>
                {
                    tracing::warn!(attempt, error = %err, "webhook transition conflicted, retrying");
                    attempt += 1;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                result => return result,
            }
        }
    }

    async fn resolve_active_key(&self, to_pix_key: &str) -> Result<Uuid, AppError> {
        sqlx::query_scalar(
            "SELECT wallet_id FROM pix_keys WHERE key_value = $1 AND is_active = TRUE",
        )
        .bind(to_pix_key)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::DestinationNotFound)
    }

    pub async fn find_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<PixTransfer>, AppError> {
        self.transfers.find_by_idempotency_key(idempotency_key).await
    }

    pub fn stats(&self) -> WebhookStats {
        WebhookStats {
            events_processed: self.webhook_events.load(Ordering::Relaxed),
            duplicate_events: self.duplicate_webhooks.load(Ordering::Relaxed),
        }
    }
}

/// Parse a webhook event type. Only CONFIRMED and REJECTED are meaningful;
/// anything else is dropped by the caller.
fn parse_event_type(event_type: &str) -> Option<PixTransferStatus> {
    match event_type.to_ascii_uppercase().as_str() {
        "CONFIRMED" => Some(PixTransferStatus::Confirmed),
        "REJECTED" => Some(PixTransferStatus::Rejected),
        _ => None,
    }
}

/// End-to-end id: "E", 13-digit epoch millis, 18 hex characters of a fresh
/// uuid. 32 characters total; the unique constraint on the column turns the
/// (astronomically unlikely) collision into a compensated retry.
fn generate_end_to_end_id(now: DateTime<Utc>) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("E{}{}", now.timestamp_millis(), &hex[..18])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn end_to_end_id_has_documented_shape() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let id = generate_end_to_end_id(now);

        assert_eq!(id.len(), 32);
        assert!(id.starts_with('E'));
        let millis = &id[1..14];
        assert_eq!(millis, now.timestamp_millis().to_string());
        let suffix = &id[14..];
        assert_eq!(suffix.len(), 18);
        assert!(suffix.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn end_to_end_ids_differ_even_at_the_same_instant() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert_ne!(generate_end_to_end_id(now), generate_end_to_end_id(now));
    }

    #[test]
    fn event_type_parsing_is_case_insensitive_and_strict() {
        assert_eq!(parse_event_type("CONFIRMED"), Some(PixTransferStatus::Confirmed));
        assert_eq!(parse_event_type("rejected"), Some(PixTransferStatus::Rejected));
        assert_eq!(parse_event_type("SETTLED"), None);
        assert_eq!(parse_event_type(""), None);
    }
}
