//! Transport seam between the channel state machine and the network.
//!
//! A [`Transport`] starts one physical connection per call to
//! [`Transport::open`] and reports its lifecycle as [`TransportEvent`]s.
//! [`WsTransport`] is the websocket implementation used in production.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use crate::backoff::with_timeout;
use crate::realtime::channel::ChannelError;

/// Default upper bound for the websocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle notifications produced by one physical connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// The connection is established and authenticated.
    Open,
    /// One inbound text frame.
    Message(String),
    /// Transport-level failure. Always followed by `Close` from [`WsTransport`].
    Error(ChannelError),
    /// The connection is gone. This is the last event for a connection.
    Close,
}

/// Request handle for tearing down one physical connection.
#[derive(Debug)]
pub struct TransportHandle {
    close_tx: Option<oneshot::Sender<()>>,
}

impl TransportHandle {
    /// Wraps the sending half of a close signal.
    pub fn new(close_tx: oneshot::Sender<()>) -> Self {
        Self {
            close_tx: Some(close_tx),
        }
    }

    /// Asks the transport to close. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Connection factory used by [`RealtimeChannel`](crate::realtime::channel::RealtimeChannel).
///
/// Implementations must not block: establishment happens in the background
/// and is reported through `events`.
///
/// `open` runs while the channel holds its state lock. It must not call back
/// into the channel (including read-only queries such as `state()`), or it
/// will deadlock. Report progress through `events` instead.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, url: Url, events: mpsc::UnboundedSender<TransportEvent>) -> TransportHandle;
}

/// Websocket transport built on `tokio-tungstenite`.
#[derive(Clone, Debug)]
pub struct WsTransport {
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl Transport for WsTransport {
    fn open(&self, url: Url, events: mpsc::UnboundedSender<TransportEvent>) -> TransportHandle {
        let (close_tx, close_rx) = oneshot::channel();
        let connect_timeout = self.connect_timeout;
        tokio::spawn(async move {
            run_socket(url, connect_timeout, &events, close_rx).await;
            let _ = events.send(TransportEvent::Close);
        });
        TransportHandle::new(close_tx)
    }
}

async fn run_socket(
    url: Url,
    connect_timeout: Duration,
    events: &mpsc::UnboundedSender<TransportEvent>,
    mut close_rx: oneshot::Receiver<()>,
) {
    let handshake = with_timeout(connect_timeout, connect_async(url.as_str()));

    let mut socket = tokio::select! {
        _ = &mut close_rx => return,
        result = handshake => match result {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(err)) => {
                let _ = events.send(TransportEvent::Error(ChannelError::WebSocket(err)));
                return;
            }
            Err(_) => {
                let _ = events.send(TransportEvent::Error(ChannelError::ConnectTimeout(
                    connect_timeout,
                )));
                return;
            }
        },
    };

    if events.send(TransportEvent::Open).is_err() {
        let _ = socket.close(None).await;
        return;
    }

    loop {
        tokio::select! {
            _ = &mut close_rx => {
                let _ = socket.close(None).await;
                return;
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(TransportEvent::Message(text.as_str().to_owned())).is_err() {
                            let _ = socket.close(None).await;
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            let _ = events.send(TransportEvent::Error(ChannelError::WebSocket(err)));
                            return;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(payload))) => {
                        debug!(event = "binary_frame_ignored", bytes = payload.len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(
                            event = "close_frame_received",
                            code = frame.as_ref().map(|frame| u16::from(frame.code))
                        );
                        return;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(err)) => {
                        let _ = events.send(TransportEvent::Error(ChannelError::WebSocket(err)));
                        return;
                    }
                    None => return,
                }
            }
        }
    }
}
