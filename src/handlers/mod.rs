//! HTTP request handlers (route handlers).
//!
//! Handlers receive HTTP requests, validate input, call the service layer,
//! and return HTTP responses.

/// Health check handler for monitoring
pub mod health;

/// Operational counters and manual cleanup
pub mod monitoring;

/// Transfer initiation and inbound webhook handlers
pub mod pix;

/// Wallet, Pix key and balance handlers
pub mod wallets;
