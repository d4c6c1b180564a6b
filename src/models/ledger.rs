//! Ledger entry data model.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::money::Money;

/// Ledger entry types. Stored as plain text in the `entry_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEntryType {
    Credit,
    Debit,
}

impl LedgerEntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerEntryType::Credit => "CREDIT",
            LedgerEntryType::Debit => "DEBIT",
        }
    }
}

/// Immutable record of one balance change on one wallet.
///
/// # Database Table
///
/// Maps to `ledger_entries`. Entries are appended under the wallet lock and
/// never mutated or deleted; `(wallet_id, transaction_id)` is unique so the
/// same financial effect can never be recorded twice.
///
/// `amount_cents` is signed: positive for CREDIT, negative for DEBIT.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub amount_cents: i64,
    pub entry_type: String,
    pub description: String,
    pub transaction_id: String,
    pub created_at: DateTime<Utc>,
    /// Wallet balance immediately after this entry was applied
    pub balance_after_cents: i64,
}

impl LedgerEntry {
    pub fn amount(&self) -> Money {
        Money::from_cents(self.amount_cents)
    }
}
