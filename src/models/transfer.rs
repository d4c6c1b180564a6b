//! Pix transfer data model and state machine.
//!
//! A transfer is PENDING from initiation until a webhook event drives it to
//! one of the terminal states:
//!
//! ```text
//! PENDING ──confirm──▶ CONFIRMED   (terminal)
//! PENDING ──reject───▶ REJECTED    (terminal)
//! ```
//!
//! The first terminal transition wins; `confirm` and `reject` refuse any
//! other starting state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::money::Money;

/// Transfer lifecycle states. Stored as plain text in the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixTransferStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl PixTransferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PixTransferStatus::Pending => "PENDING",
            PixTransferStatus::Confirmed => "CONFIRMED",
            PixTransferStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(PixTransferStatus::Pending),
            "CONFIRMED" => Some(PixTransferStatus::Confirmed),
            "REJECTED" => Some(PixTransferStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PixTransferStatus::Confirmed | PixTransferStatus::Rejected
        )
    }

    /// Whether `from → to` is a legal transition: only PENDING may move,
    /// and only to a terminal state.
    pub fn is_valid_transition(from: Self, to: Self) -> bool {
        from == PixTransferStatus::Pending && to.is_terminal()
    }
}

/// Represents a Pix transfer record from the database.
///
/// # Database Table
///
/// Maps to `pix_transfers`. `end_to_end_id` and `idempotency_key` are both
/// unique; the row references wallets by id only and is never deleted.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PixTransfer {
    pub id: Uuid,
    pub end_to_end_id: String,
    pub idempotency_key: String,
    pub from_wallet_id: Uuid,
    pub to_pix_key: String,
    pub amount_cents: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub version: i64,
}

impl PixTransfer {
    pub fn amount(&self) -> Money {
        Money::from_cents(self.amount_cents)
    }

    pub fn status(&self) -> Option<PixTransferStatus> {
        PixTransferStatus::parse(&self.status)
    }

    pub fn is_pending(&self) -> bool {
        self.status == "PENDING"
    }

    /// Move PENDING → CONFIRMED, stamping `confirmed_at`.
    pub fn confirm(&mut self, now: DateTime<Utc>) -> Result<(), AppError> {
        if !self.is_pending() {
            return Err(AppError::IllegalState(format!(
                "transfer can only be confirmed from PENDING, current status: {}",
                self.status
            )));
        }
        self.status = PixTransferStatus::Confirmed.as_str().to_string();
        self.confirmed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Move PENDING → REJECTED, stamping `rejected_at` and the reason.
    pub fn reject(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), AppError> {
        if !self.is_pending() {
            return Err(AppError::IllegalState(format!(
                "transfer can only be rejected from PENDING, current status: {}",
                self.status
            )));
        }
        self.status = PixTransferStatus::Rejected.as_str().to_string();
        self.rejection_reason = Some(reason.to_string());
        self.rejected_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}

/// Request body for initiating a transfer.
///
/// ```json
/// { "fromWalletId": "…", "toPixKey": "b@x.com", "amount": "100.00" }
/// ```
///
/// The idempotency key travels in the `Idempotency-Key` header, not the body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PixTransferRequest {
    pub from_wallet_id: Uuid,
    pub to_pix_key: String,
    pub amount: String,
}

/// Response body for transfer endpoints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PixTransferResponse {
    pub id: Uuid,
    pub end_to_end_id: String,
    pub from_wallet_id: Uuid,
    pub to_pix_key: String,
    /// Amount as a two-decimal string
    pub amount: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl From<PixTransfer> for PixTransferResponse {
    fn from(transfer: PixTransfer) -> Self {
        let amount = transfer.amount().to_decimal_string();
        Self {
            id: transfer.id,
            end_to_end_id: transfer.end_to_end_id,
            from_wallet_id: transfer.from_wallet_id,
            to_pix_key: transfer.to_pix_key,
            amount,
            status: transfer.status,
            created_at: transfer.created_at,
        }
    }
}

/// Inbound webhook event body.
///
/// ```json
/// {
///   "endToEndId": "E17123…",
///   "eventId": "evt-001",
///   "eventType": "CONFIRMED",
///   "occurredAt": "2025-06-01T12:00:00Z"
/// }
/// ```
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PixWebhookRequest {
    pub end_to_end_id: String,
    pub event_id: String,
    pub event_type: String,
    pub occurred_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pending_transfer() -> PixTransfer {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        PixTransfer {
            id: Uuid::new_v4(),
            end_to_end_id: "E1748779200000abcdef0123456789ab".to_string(),
            idempotency_key: "idem-1".to_string(),
            from_wallet_id: Uuid::new_v4(),
            to_pix_key: "b@x.com".to_string(),
            amount_cents: 10_000,
            status: "PENDING".to_string(),
            created_at: now,
            updated_at: now,
            confirmed_at: None,
            rejected_at: None,
            rejection_reason: None,
            version: 0,
        }
    }

    #[test]
    fn confirm_moves_pending_to_terminal() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 5, 0).unwrap();
        let mut transfer = pending_transfer();

        transfer.confirm(now).unwrap();
        assert_eq!(transfer.status(), Some(PixTransferStatus::Confirmed));
        assert_eq!(transfer.confirmed_at, Some(now));
        assert_eq!(transfer.updated_at, now);
    }

    #[test]
    fn reject_records_reason() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 5, 0).unwrap();
        let mut transfer = pending_transfer();

        transfer.reject("account closed", now).unwrap();
        assert_eq!(transfer.status(), Some(PixTransferStatus::Rejected));
        assert_eq!(transfer.rejected_at, Some(now));
        assert_eq!(transfer.rejection_reason.as_deref(), Some("account closed"));
    }

    #[test]
    fn terminal_states_refuse_further_transitions() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 5, 0).unwrap();

        let mut confirmed = pending_transfer();
        confirmed.confirm(now).unwrap();
        assert!(matches!(
            confirmed.reject("late", now),
            Err(AppError::IllegalState(_))
        ));
        assert!(matches!(confirmed.confirm(now), Err(AppError::IllegalState(_))));

        let mut rejected = pending_transfer();
        rejected.reject("no", now).unwrap();
        assert!(matches!(rejected.confirm(now), Err(AppError::IllegalState(_))));
    }

    #[test]
    fn transition_table() {
        use PixTransferStatus::*;
        assert!(PixTransferStatus::is_valid_transition(Pending, Confirmed));
        assert!(PixTransferStatus::is_valid_transition(Pending, Rejected));
        assert!(!PixTransferStatus::is_valid_transition(Pending, Pending));
        assert!(!PixTransferStatus::is_valid_transition(Confirmed, Rejected));
        assert!(!PixTransferStatus::is_valid_transition(Rejected, Confirmed));
        assert!(!PixTransferStatus::is_valid_transition(Confirmed, Pending));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            PixTransferStatus::Pending,
            PixTransferStatus::Confirmed,
            PixTransferStatus::Rejected,
        ] {
            assert_eq!(PixTransferStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PixTransferStatus::parse("SETTLED"), None);
    }
}
