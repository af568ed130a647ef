//! Duplex channel to the agent backend.
//!
//! A [`ConnectionManager`] owns at most one WebSocket at a time. It tracks the
//! [`ConnectionState`] machine, writes outbound frames, hands inbound frames to
//! a single registered handler in arrival order, and re-opens the channel with
//! linear backoff when the server drops it.
//!
//! All mutable state sits behind one mutex that is never held across an
//! `.await`. Each open channel and each reconnect loop is tagged with a
//! generation number; `connect()` and `disconnect()` bump it, so a retry that
//! wakes up after a teardown cannot install a connection.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use agentchat_core::{BearerToken, ConnectionState, InboundEvent, OutboundMessage, ReconnectPolicy};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::ClientConfig;
use crate::error::ConnectionError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handler = Arc<dyn Fn(InboundEvent) + Send + Sync>;

/// Frames held while no handler is registered.
const BACKLOG_LIMIT: usize = 256;
const EVENT_CAPACITY: usize = 64;

/// Where and how to open the channel.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub url: String,
    /// Sent as `Authorization: Bearer` on the handshake.
    pub token: Option<BearerToken>,
    pub policy: ReconnectPolicy,
    /// Ping period while connected; `None` disables heartbeats.
    pub heartbeat: Option<Duration>,
    pub connect_timeout: Duration,
    /// When the first open fails, report the error and keep retrying in the
    /// background under `policy`.
    pub retry_initial_connect: bool,
}

impl ConnectionOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            policy: ReconnectPolicy::default(),
            heartbeat: None,
            connect_timeout: Duration::from_secs(10),
            retry_initial_connect: false,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            url: config.ws_url.clone(),
            token: None,
            policy: config.reconnect_policy(),
            heartbeat: config.heartbeat_interval(),
            connect_timeout: config.connect_timeout(),
            retry_initial_connect: config.retry_initial_connect,
        }
    }

    pub fn with_token(mut self, token: BearerToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Option<Duration>) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_initial_retry(mut self, enabled: bool) -> Self {
        self.retry_initial_connect = enabled;
        self
    }
}

/// Lifecycle notifications published to [`ConnectionManager::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A retry was scheduled to run after `delay`.
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// A retry ran and failed to open the channel.
    ReconnectFailed { attempt: u32, error: String },
}

enum Outgoing {
    Frame(String),
    Close,
}

struct Shared {
    state: ConnectionState,
    attempts: u32,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Outgoing>>,
    reconnect_task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Dispatcher {
    handler: Option<Handler>,
    backlog: VecDeque<InboundEvent>,
}

struct Inner {
    options: ConnectionOptions,
    shared: Mutex<Shared>,
    // Reentrant so a handler may replace itself from inside a callback.
    dispatch: ReentrantMutex<RefCell<Dispatcher>>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Handle to one managed channel. Clones share the same channel.
///
/// Teardown is explicit: call [`disconnect`](Self::disconnect) when done. The
/// channel task keeps the connection alive even after every handle is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(options: ConnectionOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                options,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    attempts: 0,
                    generation: 0,
                    outbound: None,
                    reconnect_task: None,
                }),
                dispatch: ReentrantMutex::new(RefCell::new(Dispatcher::default())),
                events,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Retries made since the channel was last open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.shared.lock().attempts
    }

    pub fn url(&self) -> &str {
        &self.inner.options.url
    }

    /// Receive state transitions and reconnect scheduling.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Open the channel.
    ///
    /// Succeeds immediately when already connected. Cancels any pending
    /// automatic retry. Errors are reported only to this caller. On failure
    /// the state settles in `Disconnected`, or moves to `Reconnecting` when
    /// [`ConnectionOptions::retry_initial_connect`] is set; later retries
    /// are visible through [`subscribe`](Self::subscribe) only.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let generation = {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => return Err(ConnectionError::ConnectInProgress),
                ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
            }
            shared.generation += 1;
            if let Some(task) = shared.reconnect_task.take() {
                task.abort();
            }
            self.inner.transition(&mut shared, ConnectionState::Connecting);
            shared.generation
        };

        let pending = PendingConnect {
            inner: &self.inner,
            generation,
        };
        let result = self.inner.open().await;
        std::mem::forget(pending);

        let mut shared = self.inner.shared.lock();
        if shared.generation != generation {
            return Err(ConnectionError::Aborted);
        }
        match result {
            Ok(ws) => {
                self.inner.install(&mut shared, ws, generation);
                tracing::info!(url = %self.inner.options.url, "connected");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(url = %self.inner.options.url, "connect failed: {e}");
                let retry = self.inner.options.retry_initial_connect
                    && self.inner.options.policy.allows(0)
                    && !matches!(e, ConnectionError::InvalidEndpoint(_));
                if retry {
                    shared.attempts = 0;
                    self.inner.schedule_reconnect(&mut shared, generation);
                } else {
                    self.inner.transition(&mut shared, ConnectionState::Disconnected);
                }
                Err(e)
            }
        }
    }

    /// Close the channel and cancel pending retries. Idempotent.
    pub fn disconnect(&self) {
        let mut shared = self.inner.shared.lock();
        shared.generation += 1;
        shared.attempts = 0;
        if let Some(task) = shared.reconnect_task.take() {
            task.abort();
        }
        if let Some(tx) = shared.outbound.take() {
            let _ = tx.send(Outgoing::Close);
        }
        self.inner.transition(&mut shared, ConnectionState::Disconnected);
    }

    /// Queue a chat message. Fails with `NotConnected` unless connected.
    pub fn send(&self, message: &OutboundMessage) -> Result<(), ConnectionError> {
        self.send_json(message)
    }

    /// Queue any serializable value as a JSON text frame.
    pub fn send_json<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), ConnectionError> {
        let shared = self.inner.shared.lock();
        if !shared.state.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let Some(tx) = shared.outbound.as_ref() else {
            return Err(ConnectionError::NotConnected);
        };
        let text = serde_json::to_string(message)?;
        let len = text.len();
        tx.send(Outgoing::Frame(text))
            .map_err(|_| ConnectionError::NotConnected)?;
        tracing::debug!(bytes = len, "frame queued");
        Ok(())
    }

    /// Register the handler for inbound frames, replacing any previous one.
    ///
    /// `agent_log` frames never reach it. Frames that arrived while no
    /// handler was registered are delivered first, in order.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(InboundEvent) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let guard = self.inner.dispatch.lock();
        let backlog = {
            let mut dispatch = guard.borrow_mut();
            dispatch.handler = Some(Arc::clone(&handler));
            std::mem::take(&mut dispatch.backlog)
        };
        for event in backlog {
            call_handler(&handler, event);
        }
    }

    /// Remove the handler; later frames are held in the backlog.
    pub fn clear_handler(&self) {
        let guard = self.inner.dispatch.lock();
        guard.borrow_mut().handler = None;
    }
}

impl Inner {
    fn transition(&self, shared: &mut Shared, next: ConnectionState) {
        let from = shared.state;
        if from == next {
            return;
        }
        debug_assert!(from.can_transition_to(next), "illegal transition {from} -> {next}");
        shared.state = next;
        tracing::debug!(%from, to = %next, "connection state changed");
        let _ = self
            .events
            .send(ConnectionEvent::StateChanged { from, to: next });
    }

    async fn open(&self) -> Result<WsStream, ConnectionError> {
        let mut request = self
            .options
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidEndpoint(e.to_string()))?;
        if let Some(token) = &self.options.token {
            let value = HeaderValue::from_str(&token.header_value())
                .map_err(|e| ConnectionError::InvalidEndpoint(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let timeout = self.options.connect_timeout;
        let (ws, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout))??;
        Ok(ws)
    }

    /// Adopt a freshly opened channel. Caller holds the lock and has checked
    /// the generation.
    fn install(self: &Arc<Self>, shared: &mut Shared, ws: WsStream, generation: u64) {
        let (tx, rx) = mpsc::unbounded_channel();
        shared.outbound = Some(tx);
        shared.attempts = 0;
        shared.reconnect_task = None;
        self.transition(shared, ConnectionState::Connected);
        tokio::spawn(run_channel(Arc::clone(self), ws, rx, generation));
    }

    /// The channel task ended without being asked to.
    fn channel_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        let mut shared = self.shared.lock();
        if shared.generation != generation || !shared.state.is_connected() {
            return;
        }
        shared.outbound = None;
        tracing::warn!("channel closed unexpectedly: {reason}");
        self.schedule_reconnect(&mut shared, generation);
    }

    /// Enter `Reconnecting` and start the retry loop for `generation`.
    fn schedule_reconnect(self: &Arc<Self>, shared: &mut Shared, generation: u64) {
        self.transition(shared, ConnectionState::Reconnecting);
        let task = tokio::spawn(reconnect_loop(Arc::clone(self), generation));
        shared.reconnect_task = Some(task);
    }

    fn deliver(&self, parsed: Result<InboundEvent, serde_json::Error>) {
        let event = match parsed {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("dropping malformed frame: {e}");
                return;
            }
        };
        if event.is_log() {
            tracing::trace!(frame = %event.frame(), "agent log");
            return;
        }

        let guard = self.dispatch.lock();
        let handler = {
            let mut dispatch = guard.borrow_mut();
            match dispatch.handler.clone() {
                Some(handler) => handler,
                None => {
                    if dispatch.backlog.len() == BACKLOG_LIMIT {
                        tracing::warn!("no handler registered, dropping oldest buffered frame");
                        dispatch.backlog.pop_front();
                    }
                    dispatch.backlog.push_back(event);
                    return;
                }
            }
        };
        call_handler(&handler, event);
    }
}

/// Run the handler, containing any panic so the channel task survives it.
fn call_handler(handler: &Handler, event: InboundEvent) {
    if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::warn!("message handler panicked: {reason}");
    }
}

/// Resets `Connecting` if a `connect()` future is dropped mid-open.
struct PendingConnect<'a> {
    inner: &'a Arc<Inner>,
    generation: u64,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        let mut shared = self.inner.shared.lock();
        if shared.generation == self.generation && shared.state == ConnectionState::Connecting {
            self.inner
                .transition(&mut shared, ConnectionState::Disconnected);
        }
    }
}

async fn run_channel(
    inner: Arc<Inner>,
    ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Outgoing>,
    generation: u64,
) {
    let (mut sink, mut stream) = ws.split();
    let mut heartbeat = inner.options.heartbeat.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    let reason = loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outgoing::Frame(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        break format!("write failed: {e}");
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    tracing::debug!("channel closed by client");
                    return;
                }
            },

            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => inner.deliver(InboundEvent::parse(text.as_str())),
                Some(Ok(Message::Binary(bytes))) => inner.deliver(InboundEvent::parse_slice(&bytes)),
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(f) => format!("server closed ({}): {}", u16::from(f.code), f.reason.as_str()),
                        None => "server closed".to_string(),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("read failed: {e}"),
                None => break "stream ended".to_string(),
            },

            () = next_tick(&mut heartbeat) => {
                if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                    break format!("heartbeat failed: {e}");
                }
            }
        }
    };

    inner.channel_lost(generation, &reason);
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn reconnect_loop(inner: Arc<Inner>, generation: u64) {
    loop {
        let (attempt, delay) = {
            let mut shared = inner.shared.lock();
            if shared.generation != generation {
                return;
            }
            if !inner.options.policy.allows(shared.attempts) {
                tracing::warn!(attempts = shared.attempts, "giving up on reconnecting");
                shared.reconnect_task = None;
                inner.transition(&mut shared, ConnectionState::Disconnected);
                return;
            }
            shared.attempts += 1;
            let attempt = shared.attempts;
            let delay = inner.options.policy.delay(attempt);
            let _ = inner
                .events
                .send(ConnectionEvent::ReconnectScheduled { attempt, delay });
            (attempt, delay)
        };

        tracing::debug!(attempt, ?delay, "reconnect scheduled");
        tokio::time::sleep(delay).await;
        if inner.shared.lock().generation != generation {
            return;
        }

        match inner.open().await {
            Ok(ws) => {
                let mut shared = inner.shared.lock();
                if shared.generation != generation {
                    return;
                }
                inner.install(&mut shared, ws, generation);
                tracing::info!(attempt, "reconnected");
                return;
            }
            Err(e) => {
                tracing::warn!(attempt, "reconnect attempt failed: {e}");
                let _ = inner.events.send(ConnectionEvent::ReconnectFailed {
                    attempt,
                    error: e.to_string(),
                });
            }
        }
    }
}
