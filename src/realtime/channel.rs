//! Realtime notification channel with automatic reconnect.
//!
//! [`RealtimeChannel`] keeps at most one physical connection alive, fans
//! decoded notifications out to registered listeners, and retries unexpected
//! disconnects with linear backoff until the attempt budget is spent.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::backoff::ReconnectPolicy;
use crate::realtime::listeners::{ListenerSet, Subscription};
use crate::realtime::proto::{decode_frame, FrameOutcome, NotificationEvent};
use crate::realtime::transport::{
    Transport, TransportEvent, TransportHandle, WsTransport, DEFAULT_CONNECT_TIMEOUT,
};

/// Production websocket endpoint for the realtime service.
pub const REALTIME_ENDPOINT: &str = "wss://realtime.splitkit.app/v1/ws";
/// Local development websocket endpoint for the realtime service.
pub const LOCAL_REALTIME_ENDPOINT: &str = "ws://localhost:8080/v1/ws";
/// Query parameter that carries the bearer credential.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Errors produced by channel setup and the websocket transport.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Credential was empty or whitespace.
    #[error("credential must not be empty")]
    EmptyCredential,

    /// `connect` was called outside a tokio runtime.
    #[error("no tokio runtime is available to drive the connection")]
    NoRuntime,

    /// Endpoint could not be parsed as a URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    /// Endpoint scheme is not `ws` or `wss`.
    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Handshake did not finish in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Realtime protocol contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Connection lifecycle of a channel.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    ReconnectPending,
    Closed,
}

/// Channel construction options.
#[derive(Clone, Debug)]
pub struct ChannelOptions {
    pub endpoint: String,
    pub reconnect: ReconnectPolicy,
    /// Handshake bound used by the default websocket transport.
    pub connect_timeout: Duration,
}

impl ChannelOptions {
    /// Switches between the production and local endpoints.
    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.endpoint = if local {
            LOCAL_REALTIME_ENDPOINT
        } else {
            REALTIME_ENDPOINT
        }
        .to_string();
        self
    }

    /// Sets an explicit endpoint, taking precedence over local mode.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end().to_string();
        self
    }

    pub fn with_reconnect_policy(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            endpoint: REALTIME_ENDPOINT.to_string(),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Handle to a realtime notification channel.
///
/// Clones share one connection and one listener set.
#[derive(Clone)]
pub struct RealtimeChannel {
    shared: Arc<ChannelShared>,
}

impl RealtimeChannel {
    /// Creates a channel backed by the websocket transport.
    pub fn new(options: ChannelOptions) -> Result<Self, ChannelError> {
        let transport = WsTransport::new(options.connect_timeout);
        Self::with_transport(options, transport)
    }

    /// Creates a channel over a caller-supplied transport.
    pub fn with_transport<T>(options: ChannelOptions, transport: T) -> Result<Self, ChannelError>
    where
        T: Transport,
    {
        let endpoint = parse_endpoint(&options.endpoint)?;
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Ok(Self {
            shared: Arc::new(ChannelShared {
                transport: Box::new(transport),
                endpoint,
                policy: options.reconnect,
                listeners: Arc::new(ListenerSet::default()),
                state_tx,
                inner: Mutex::new(ChannelInner::default()),
            }),
        })
    }

    /// Starts maintaining a connection authenticated with `credential`.
    ///
    /// Returns immediately; establishment is observed through
    /// [`state`](Self::state) and listener delivery. A no-op while open.
    pub fn connect(&self, credential: SecretString) -> Result<(), ChannelError> {
        if credential.expose_secret().trim().is_empty() {
            return Err(ChannelError::EmptyCredential);
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ChannelError::NoRuntime);
        }
        self.shared.connect(credential);
        Ok(())
    }

    /// Closes the connection and suppresses any reconnect. Idempotent.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Registers `listener` for every delivered notification.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&NotificationEvent) + Send + Sync + 'static,
    {
        let id = self.shared.listeners.insert(Arc::new(listener));
        Subscription::new(id, &self.shared.listeners)
    }

    /// Delivers `event` to every current listener and returns how many
    /// completed without panicking.
    pub fn notify_subscribers(&self, event: &NotificationEvent) -> usize {
        self.shared.listeners.notify(event)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Returns a receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    /// Reconnect attempts used in the current cycle.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().attempts
    }
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("endpoint", &self.shared.endpoint.as_str())
            .field("state", &self.state())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, ChannelError> {
    let url = Url::parse(endpoint)?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ChannelError::UnsupportedScheme(other.to_string())),
    }
}

fn authenticated_url(endpoint: &Url, credential: &SecretString) -> Url {
    let mut url = endpoint.clone();
    url.query_pairs_mut()
        .append_pair(TOKEN_QUERY_PARAM, credential.expose_secret());
    url
}

struct ActiveConnection {
    generation: u64,
    handle: TransportHandle,
}

struct PendingReconnect {
    id: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ChannelInner {
    state: ConnectionState,
    credential: Option<SecretString>,
    intentionally_closed: bool,
    attempts: u32,
    connection: Option<ActiveConnection>,
    reconnect: Option<PendingReconnect>,
    next_generation: u64,
    next_timer_id: u64,
}

impl ChannelInner {
    fn cancel_reconnect(&mut self) {
        if let Some(pending) = self.reconnect.take() {
            pending.task.abort();
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| connection.generation == generation)
    }
}

struct ChannelShared {
    transport: Box<dyn Transport>,
    endpoint: Url,
    policy: ReconnectPolicy,
    listeners: Arc<ListenerSet>,
    state_tx: watch::Sender<ConnectionState>,
    inner: Mutex<ChannelInner>,
}

impl ChannelShared {
    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut ChannelInner, state: ConnectionState) {
        if inner.state != state {
            debug!(event = "state_changed", from = ?inner.state, to = ?state);
            inner.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn connect(self: &Arc<Self>, credential: SecretString) {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            ConnectionState::Open => {
                info!(event = "connect_ignored", reason = "already_open");
                return;
            }
            ConnectionState::Connecting if inner.connection.is_some() => {
                info!(event = "connect_ignored", reason = "already_connecting");
                inner.credential = Some(credential);
                return;
            }
            _ => {}
        }

        inner.credential = Some(credential);
        inner.intentionally_closed = false;
        inner.attempts = 0;
        inner.cancel_reconnect();
        self.establish(&mut inner);
    }

    fn establish(self: &Arc<Self>, inner: &mut ChannelInner) {
        let Some(url) = inner
            .credential
            .as_ref()
            .map(|credential| authenticated_url(&self.endpoint, credential))
        else {
            self.set_state(inner, ConnectionState::Closed);
            return;
        };
        if let Some(mut stale) = inner.connection.take() {
            stale.handle.close();
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        self.set_state(inner, ConnectionState::Connecting);
        info!(
            event = "connecting",
            generation,
            endpoint = self.endpoint.as_str(),
            attempt = inner.attempts
        );
        let handle = self.transport.open(url, events_tx);
        inner.connection = Some(ActiveConnection { generation, handle });

        tokio::spawn(pump_transport_events(
            Arc::downgrade(self),
            generation,
            events_rx,
        ));
    }

    fn disconnect(&self) {
        let mut inner = self.lock();
        inner.intentionally_closed = true;
        inner.cancel_reconnect();
        if let Some(mut connection) = inner.connection.take() {
            connection.handle.close();
        }
        inner.credential = None;
        inner.attempts = 0;
        if inner.state != ConnectionState::Idle {
            self.set_state(&mut inner, ConnectionState::Closed);
            info!(event = "disconnected");
        }
    }

    fn handle_open(&self, generation: u64) {
        let mut inner = self.lock();
        if !inner.is_current(generation) {
            debug!(event = "stale_transport_event", generation, kind = "open");
            return;
        }
        inner.attempts = 0;
        inner.cancel_reconnect();
        self.set_state(&mut inner, ConnectionState::Open);
        info!(event = "connected", generation);
    }

    fn handle_message(&self, generation: u64, text: &str) {
        if !self.lock().is_current(generation) {
            debug!(event = "stale_transport_event", generation, kind = "message");
            return;
        }

        match decode_frame(text) {
            FrameOutcome::Notification(event) => {
                self.listeners.notify(&event);
            }
            FrameOutcome::Ignored { kind } => {
                debug!(event = "frame_ignored", kind = kind.as_str());
            }
            FrameOutcome::Malformed { reason } => {
                warn!(event = "frame_malformed", reason = reason.as_str());
            }
        }
    }

    fn handle_connection_lost(self: &Arc<Self>, generation: u64, cause: Option<ChannelError>) {
        let mut inner = self.lock();
        if !inner.is_current(generation) {
            debug!(event = "stale_transport_event", generation, kind = "close");
            return;
        }
        if let Some(mut connection) = inner.connection.take() {
            connection.handle.close();
        }

        if inner.intentionally_closed {
            self.set_state(&mut inner, ConnectionState::Closed);
            return;
        }

        match &cause {
            Some(err) => warn!(event = "connection_lost", generation, error = %err),
            None => warn!(event = "connection_lost", generation),
        }
        self.schedule_reconnect(&mut inner);
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut ChannelInner) {
        if inner.reconnect.is_some() {
            return;
        }
        if self.policy.is_exhausted(inner.attempts) {
            error!(
                event = "reconnect_exhausted",
                attempts = inner.attempts,
                max_attempts = self.policy.max_attempts
            );
            inner.credential = None;
            self.set_state(inner, ConnectionState::Closed);
            return;
        }

        inner.attempts += 1;
        let attempt = inner.attempts;
        let delay = self.policy.delay_for_attempt(attempt);
        inner.next_timer_id += 1;
        let id = inner.next_timer_id;

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.fire_reconnect(id);
            }
        });
        inner.reconnect = Some(PendingReconnect { id, task });
        self.set_state(inner, ConnectionState::ReconnectPending);
        info!(
            event = "reconnect_scheduled",
            attempt,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64
        );
    }

    fn fire_reconnect(self: &Arc<Self>, id: u64) {
        let mut inner = self.lock();
        if inner.reconnect.as_ref().map(|pending| pending.id) != Some(id) {
            return;
        }
        inner.reconnect = None;
        if inner.intentionally_closed || inner.connection.is_some() {
            return;
        }
        self.establish(&mut inner);
    }
}

impl Drop for ChannelShared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        inner.intentionally_closed = true;
        inner.cancel_reconnect();
        if let Some(mut connection) = inner.connection.take() {
            connection.handle.close();
        }
    }
}

async fn pump_transport_events(
    shared: Weak<ChannelShared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(channel) = shared.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Open => channel.handle_open(generation),
            TransportEvent::Message(text) => channel.handle_message(generation, &text),
            // The close that may trail an error is not waited for.
            TransportEvent::Error(err) => {
                channel.handle_connection_lost(generation, Some(err));
                return;
            }
            TransportEvent::Close => {
                channel.handle_connection_lost(generation, None);
                return;
            }
        }
    }

    // Event sender dropped without a close.
    if let Some(channel) = shared.upgrade() {
        channel.handle_connection_lost(generation, None);
    }
}
