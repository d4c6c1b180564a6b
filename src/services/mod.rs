//! Business logic services.
//!
//! Services contain the core financial logic separated from HTTP handlers:
//! balance mutations, transfer orchestration, idempotency and the
//! coordination discipline (leases, isolation, retries) that ties them
//! together.

pub mod idempotency_service;
pub mod pix_service;
pub mod transfer_service;
pub mod wallet_engine;
pub mod wallet_service;
