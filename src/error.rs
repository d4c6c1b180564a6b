//! Error types and HTTP error response handling.
//!
//! One application-wide error enum; each variant carries a stable error
//! code and maps to an HTTP status. Handlers return `Result<T, AppError>`
//! and axum converts failures into `{"error": {"code", "message"}}` JSON
//! bodies.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Application-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Database operation failed (connection error, unexpected query error).
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Amount is missing, non-positive, or malformed.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Amount is above the Pix ceiling.
    #[error("Amount out of range: {0}")]
    AmountOutOfRange(String),

    /// Request body or parameters are invalid.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Referenced wallet does not exist.
    #[error("Wallet not found")]
    WalletNotFound,

    /// Destination Pix key does not resolve to an active wallet.
    #[error("Destination Pix key not found or inactive")]
    DestinationNotFound,

    /// Wallet balance is lower than the requested debit.
    #[error("Insufficient funds")]
    InsufficientFunds,

    /// User already owns a wallet.
    #[error("Wallet already exists for this user")]
    DuplicateUser,

    /// Attempt to confirm or reject a transfer that is not PENDING.
    #[error("Illegal transfer state: {0}")]
    IllegalState(String),

    /// Retriable coordination failure: lease timeout, serialization abort,
    /// optimistic-version mismatch. Retried at the use-case boundary before
    /// being surfaced.
    #[error("Transient conflict: {0}")]
    TransientConflict(String),

    /// Unique-constraint conflict; the idempotent paths absorb this by
    /// re-reading the winning row.
    #[error("Data integrity violation")]
    DataIntegrityViolation,

    /// Unexpected failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable, language-neutral error code for the response body.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "internal_error",
            AppError::InvalidAmount(_) => "invalid_amount",
            AppError::AmountOutOfRange(_) => "amount_out_of_range",
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::WalletNotFound => "wallet_not_found",
            AppError::DestinationNotFound => "destination_not_found",
            AppError::InsufficientFunds => "insufficient_funds",
            AppError::DuplicateUser => "duplicate_user",
            AppError::IllegalState(_) => "illegal_state",
            AppError::TransientConflict(_) => "transient_conflict",
            AppError::DataIntegrityViolation => "data_integrity_violation",
            AppError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidAmount(_)
            | AppError::AmountOutOfRange(_)
            | AppError::InvalidRequest(_)
            | AppError::DestinationNotFound
            | AppError::InsufficientFunds
            | AppError::DuplicateUser => StatusCode::BAD_REQUEST,
            AppError::WalletNotFound => StatusCode::NOT_FOUND,
            AppError::IllegalState(_)
            | AppError::TransientConflict(_)
            | AppError::DataIntegrityViolation => StatusCode::CONFLICT,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// True when the error is a unique-constraint violation (SQLSTATE 23505).
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// True when the error is a serialization abort or deadlock the caller
/// should retry (SQLSTATE 40001 / 40P01).
pub fn is_serialization_failure(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db)
            if matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
    )
}

/// Convert a transactional sqlx error: serialization aborts become
/// retriable conflicts, everything else stays a database error.
pub fn map_tx_error(err: sqlx::Error) -> AppError {
    if is_serialization_failure(&err) {
        AppError::TransientConflict(format!("serialization failure: {err}"))
    } else {
        AppError::Database(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Hide database details from clients.
        let message = match &self {
            AppError::Database(err) => {
                tracing::error!(error = %err, "database error");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_contract() {
        assert_eq!(
            AppError::InvalidAmount("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::InsufficientFunds.status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::DuplicateUser.status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::WalletNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::TransientConflict("x".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(AppError::InsufficientFunds.code(), "insufficient_funds");
        assert_eq!(
            AppError::AmountOutOfRange("x".into()).code(),
            "amount_out_of_range"
        );
        assert_eq!(
            AppError::DataIntegrityViolation.code(),
            "data_integrity_violation"
        );
    }
}
