//! Realtime notification modules.
//!
//! - `channel`: connection state machine, reconnect scheduling, and fan-out.
//! - `listeners`: listener registry and subscription handles.
//! - `proto`: inbound frame shapes and notification decoding.
//! - `transport`: transport seam and the websocket implementation.

/// Realtime channel and its options.
pub mod channel;
/// Listener registry and subscription handles.
pub mod listeners;
/// Realtime frame types.
pub mod proto;
/// Transport abstraction and websocket transport.
pub mod transport;

pub use channel::{ChannelError, ChannelOptions, ConnectionState, RealtimeChannel};
pub use listeners::Subscription;
pub use proto::NotificationEvent;
