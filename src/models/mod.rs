//! Data models representing database entities and their API shapes.

/// Idempotency record model
pub mod idempotency;
/// Append-only ledger entry model
pub mod ledger;
/// Pix key model and format validation
pub mod pix_key;
/// Pix transfer model and state machine
pub mod transfer;
/// Wallet model
pub mod wallet;
