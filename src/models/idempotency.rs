//! Idempotency record data model.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Persistent memo of a completed first processing, keyed by
/// `(scope, idempotency_key)`.
///
/// # Database Table
///
/// Maps to `idempotency_records`. The unique constraint on the key pair is
/// the ultimate arbiter: whoever commits the row first is the winner, and
/// every later attempt reads that row back. Records expire 24 hours after
/// creation and are then garbage-collected.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub id: Uuid,
    pub scope: String,
    pub idempotency_key: String,
    /// SHA-256 hex of the request body this record answered
    pub request_hash: String,
    pub response_body: Option<String>,
    pub response_status: i32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Expired records are ignored by lookups and count as "not found" for
    /// write purposes.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
