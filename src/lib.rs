//! Realtime notification channel for the splitkit expense-splitting client.
//!
//! The crate is organized by concern:
//! - `realtime`: websocket-backed notification channel with reconnects and
//!   listener fan-out.
//! - `backoff`: reconnect pacing and timeout utilities.

/// Reconnect policy and timeout helpers.
pub mod backoff;
/// Realtime channel, protocol types, and transport seam.
pub mod realtime;
