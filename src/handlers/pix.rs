//! Pix HTTP handlers: transfer initiation and the inbound webhook.
//!
//! - POST /pix/transfers - initiate a transfer (requires `Idempotency-Key`)
//! - POST /pix/webhook - asynchronous confirmation/rejection events

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
};

use crate::error::AppError;
use crate::models::transfer::{PixTransferRequest, PixTransferResponse, PixWebhookRequest};
use crate::money::Money;
use crate::state::AppState;

const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Initiate a Pix transfer.
///
/// # Endpoint
///
/// `POST /pix/transfers` with header `Idempotency-Key: <key>` and body
///
/// ```json
/// { "fromWalletId": "…", "toPixKey": "b@x.com", "amount": "100.00" }
/// ```
///
/// # Response
///
/// - **201 Created**: the transfer (PENDING). Retries with the same key
///   return the same transfer.
/// - **400**: validation failure (amount, destination, insufficient funds)
pub async fn initiate_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PixTransferRequest>,
) -> Result<(StatusCode, Json<PixTransferResponse>), AppError> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            AppError::InvalidRequest("Idempotency-Key header is required".into())
        })?;

    let amount = Money::from_decimal_str(&request.amount)?;
    let transfer = state
        .pix
        .initiate_transfer(
            idempotency_key,
            request.from_wallet_id,
            &request.to_pix_key,
            amount,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(transfer.into())))
}

/// Process an inbound Pix webhook event.
///
/// # Endpoint
///
/// `POST /pix/webhook` with body
///
/// ```json
/// { "endToEndId": "E…", "eventId": "evt-1", "eventType": "CONFIRMED" }
/// ```
///
/// # Response
///
/// - **200**: event processed or absorbed. Duplicates, unknown event types,
///   unknown transfers and events for already-terminal transfers all return
///   200 so the sender stops redelivering.
/// - **400**: malformed body (empty or oversized identifiers)
pub async fn process_webhook(
    State(state): State<AppState>,
    Json(request): Json<PixWebhookRequest>,
) -> Result<StatusCode, AppError> {
    if request.end_to_end_id.is_empty() || request.end_to_end_id.len() > 32 {
        return Err(AppError::InvalidRequest(
            "endToEndId must be between 1 and 32 characters".into(),
        ));
    }
    if request.event_id.is_empty() || request.event_id.len() > 100 {
        return Err(AppError::InvalidRequest(
            "eventId must be between 1 and 100 characters".into(),
        ));
    }
    if request.event_type.is_empty() {
        return Err(AppError::InvalidRequest("eventType is required".into()));
    }

    state
        .pix
        .process_webhook_event(
            &request.end_to_end_id,
            &request.event_id,
            &request.event_type,
            request.occurred_at,
        )
        .await?;

    Ok(StatusCode::OK)
}
