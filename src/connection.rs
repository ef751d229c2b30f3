//! Persistent, auto-reconnecting RPC connection to one server endpoint.
//!
//! [`ConnectionHandle`] is a cheap, cloneable handle that talks to a background
//! connection loop task over an unbounded MPSC channel. Lifecycle and pushed
//! server events are emitted on a bounded channel that a
//! [`ListenerRegistry`](crate::listeners::ListenerRegistry) takes over with
//! [`ConnectionHandle::take_events`].
//!
//! # Reconnect policy
//!
//! When the transport fails after a successful initial connect, the loop emits
//! [`ConnectionEvent::Reconnecting`] and retries with a linearly growing delay
//! (`base * (attempt + 1)`, capped at `max_delay`) until it succeeds, the retry
//! budget is exhausted, or [`ConnectionHandle::close`] is called. After every
//! successful reconnect the stored [`Membership`] is replayed on the new
//! transport before [`ConnectionEvent::Reconnected`] is emitted, so the server
//! sees the same join identity again.
//!
//! A server close frame carrying an error (or an exhausted retry budget) gets
//! exactly one more connect + rejoin cycle when a membership is stored. A clean
//! close, or anything after an explicit `close()`, is never retried.
//!
//! # Example
//!
//! ```rust,ignore
//! let handle = ConnectionHandle::connect(
//!     EndpointKind::Host,
//!     "wss://host.example/sihost",
//!     Arc::new(WebSocketConnector::new()),
//!     ConnectionConfig::new(),
//! )
//! .await?;
//!
//! let info: Option<GameInfo> = handle.invoke("TryGetGameInfo", vec![json!(42)]).await?;
//! handle.close().await;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, TriviaError};
use crate::protocol::{ClientFrame, GameCreationResult, JoinDescriptor, JoinGameResponse, ServerFrame};
use crate::transport::{Connector, Transport};

/// Connection identity token.
pub type ConnectionId = Uuid;

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default timeout for an awaited invocation.
const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for replaying the membership after a reconnect.
const DEFAULT_REJOIN_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

// ── Configuration ───────────────────────────────────────────────────

/// Which server a connection talks to. At most one handle of each kind is
/// kept by the [`SessionManager`](crate::session::SessionManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// Lobby / matchmaking server.
    Lobby,
    /// Host of one joined game.
    Host,
}

/// Linear reconnect backoff.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use trivia_session::connection::ReconnectPolicy;
///
/// let policy = ReconnectPolicy::new();
/// assert_eq!(policy.delay_for(0), Duration::from_secs(1));
/// assert_eq!(policy.delay_for(2), Duration::from_secs(3));
/// assert_eq!(policy.delay_for(100), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt; attempt `n` waits `base_delay * (n + 1)`.
    pub base_delay: Duration,
    /// Upper bound of a single delay.
    pub max_delay: Duration,
    /// Number of attempts before giving up. `None` retries until closed.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Base 1 s, cap 30 s, unlimited attempts.
    pub fn new() -> Self {
        Self {
            base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            max_delay: DEFAULT_RECONNECT_MAX_DELAY,
            max_attempts: None,
        }
    }

    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay to wait before attempt number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.saturating_add(1))
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration of a [`ConnectionHandle`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
    /// Capacity of the bounded event channel. Defaults to **256**; values
    /// below 1 are clamped to 1. Events are dropped with a warning when the
    /// consumer falls behind; `Closed` is always delivered.
    pub event_channel_capacity: usize,
    /// Time given to the connection loop to close the transport on
    /// [`ConnectionHandle::close`]. Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Deadline of an awaited invocation. Defaults to **30 seconds**.
    pub invoke_timeout: Duration,
    /// Deadline of the membership replay after a reconnect. Defaults to
    /// **30 seconds**.
    pub rejoin_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self {
            reconnect: ReconnectPolicy::new(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
            rejoin_timeout: DEFAULT_REJOIN_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_rejoin_timeout(mut self, timeout: Duration) -> Self {
        self.rejoin_timeout = timeout;
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ── State ───────────────────────────────────────────────────────────

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            _ => Self::Disconnected,
        }
    }
}

/// Events emitted by a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The initial connect succeeded. Always the first event.
    Connected,
    /// A server-pushed hub invocation.
    Message { target: String, arguments: Vec<Value> },
    /// The transport dropped; reconnect attempts are running.
    Reconnecting { reason: Option<String> },
    /// The transport is back and the membership was replayed.
    Reconnected,
    /// The transport is back but the server refused the membership replay.
    RejoinFailed { reason: String },
    /// The connection is gone for good. Always the last event.
    Closed { reason: Option<String> },
}

/// What the server must be told again after a reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Membership {
    #[default]
    None,
    /// The lobby connection had joined the lobby with this culture.
    Lobby { culture: String },
    /// The connection had joined a game.
    Game(JoinDescriptor),
}

impl Membership {
    /// The join descriptor, if a game was joined.
    pub fn join_descriptor(&self) -> Option<&JoinDescriptor> {
        match self {
            Self::Game(descriptor) => Some(descriptor),
            _ => None,
        }
    }

    /// Hub call that restores this membership on an endpoint of `kind`.
    fn replay_call(&self, kind: EndpointKind) -> Result<Option<(&'static str, Vec<Value>)>> {
        let call = match (kind, self) {
            (_, Self::None) | (EndpointKind::Host, Self::Lobby { .. }) => None,
            (EndpointKind::Lobby, Self::Lobby { culture }) => {
                Some(("JoinLobby2", vec![Value::from(culture.as_str())]))
            }
            (EndpointKind::Lobby, Self::Game(d)) => Some((
                "JoinGameNew",
                vec![
                    Value::from(d.game_id),
                    serde_json::to_value(d.role)?,
                    Value::from(d.sex.is_male()),
                    Value::from(d.password.clone().unwrap_or_default()),
                ],
            )),
            (EndpointKind::Host, Self::Game(d)) => {
                Some(("JoinGame", vec![serde_json::to_value(d.to_request())?]))
            }
        };
        Ok(call)
    }

    /// Interprets the completion of [`replay_call`](Self::replay_call).
    fn check_replay_result(
        &self,
        kind: EndpointKind,
        result: Option<Value>,
    ) -> std::result::Result<(), String> {
        let value = result.unwrap_or(Value::Null);
        match (kind, self) {
            (EndpointKind::Host, Self::Game(_)) => {
                let response: JoinGameResponse =
                    serde_json::from_value(value).map_err(|e| e.to_string())?;
                if response.is_success {
                    Ok(())
                } else {
                    Err(format!(
                        "{} {}",
                        response.error_type.unwrap_or_default(),
                        response.message.unwrap_or_default()
                    ))
                }
            }
            (EndpointKind::Lobby, Self::Game(_)) => {
                let result: GameCreationResult =
                    serde_json::from_value(value).map_err(|e| e.to_string())?;
                match result.error_message {
                    Some(message) if !message.is_empty() => Err(message),
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }
}

/// State shared between the handles and the connection loop.
///
/// Deliberately holds no command sender, so the command channel closes once
/// every handle is gone.
struct Shared {
    id: ConnectionId,
    kind: EndpointKind,
    uri: String,
    state: AtomicU8,
    membership: Mutex<Membership>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn membership(&self) -> Membership {
        lock(&self.membership).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Command {
    Invoke {
        target: String,
        arguments: Vec<Value>,
        reply: oneshot::Sender<Result<Value>>,
    },
    Send {
        target: String,
        arguments: Vec<Value>,
    },
}

// ── Handle ──────────────────────────────────────────────────────────

struct HandleInner {
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    invoke_timeout: Duration,
    shutdown_timeout: Duration,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        // No executor is available to drive a graceful close here.
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

/// Handle to one persistent connection. Clones share the same connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    /// Open a connection to `uri` and start its background loop.
    ///
    /// Only one connect attempt is made here; the reconnect policy applies to
    /// failures after this call succeeded.
    ///
    /// # Errors
    ///
    /// Returns the connector's error, e.g. [`TriviaError::AuthenticationRequired`].
    pub async fn connect(
        kind: EndpointKind,
        uri: impl Into<String>,
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let uri = uri.into();
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            kind,
            uri,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            membership: Mutex::new(Membership::None),
        });

        debug!(connection = %shared.id, ?kind, uri = %shared.uri, "connecting");
        let transport = match connector.connect(&shared.uri).await {
            Ok(transport) => transport,
            Err(e) => {
                shared.set_state(ConnectionState::Disconnected);
                warn!(connection = %shared.id, uri = %shared.uri, error = %e, "connect failed");
                return Err(e);
            }
        };
        shared.set_state(ConnectionState::Connected);
        info!(connection = %shared.id, ?kind, uri = %shared.uri, "connected");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let invoke_timeout = config.invoke_timeout;
        let shutdown_timeout = config.shutdown_timeout;
        let ctx = LoopContext {
            shared: Arc::clone(&shared),
            connector,
            config,
            event_tx,
            next_invocation: AtomicU64::new(1),
        };
        let task = tokio::spawn(connection_loop(ctx, transport, cmd_rx, shutdown_rx));

        Ok(Self {
            inner: Arc::new(HandleInner {
                shared,
                cmd_tx,
                events: Mutex::new(Some(event_rx)),
                task: Mutex::new(Some(task)),
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                invoke_timeout,
                shutdown_timeout,
            }),
        })
    }

    /// Invoke a hub method and deserialize its result.
    ///
    /// # Errors
    ///
    /// [`TriviaError::NotConnected`] unless the connection is up,
    /// [`TriviaError::Rpc`] when the server completes with an error,
    /// [`TriviaError::TransportClosed`] when the transport drops first and
    /// [`TriviaError::Timeout`] after the invoke timeout.
    pub async fn invoke<T: DeserializeOwned>(&self, target: &str, arguments: Vec<Value>) -> Result<T> {
        let value = self.invoke_raw(target, arguments).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Invoke a hub method and return its raw JSON result.
    ///
    /// # Errors
    ///
    /// See [`invoke`](Self::invoke).
    pub async fn invoke_raw(&self, target: &str, arguments: Vec<Value>) -> Result<Value> {
        self.ensure_connected()?;
        let (reply, reply_rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(Command::Invoke {
                target: target.to_string(),
                arguments,
                reply,
            })
            .map_err(|_| TriviaError::NotConnected)?;

        match tokio::time::timeout(self.inner.invoke_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TriviaError::TransportClosed),
            Err(_) => {
                warn!(connection = %self.id(), target, "invocation timed out");
                Err(TriviaError::Timeout)
            }
        }
    }

    /// Queue a hub invocation without waiting for a completion.
    ///
    /// # Errors
    ///
    /// Returns [`TriviaError::NotConnected`] unless the connection is up.
    pub fn send(&self, target: &str, arguments: Vec<Value>) -> Result<()> {
        self.ensure_connected()?;
        self.inner
            .cmd_tx
            .send(Command::Send {
                target: target.to_string(),
                arguments,
            })
            .map_err(|_| TriviaError::NotConnected)
    }

    /// Close the connection. Cancels any pending reconnect; events the
    /// transport produces afterwards are discarded. Safe to call repeatedly.
    pub async fn close(&self) {
        debug!(connection = %self.id(), "close requested");

        if let Some(tx) = lock(&self.inner.shutdown_tx).take() {
            let _ = tx.send(());
        }

        let task = lock(&self.inner.task).take();
        if let Some(mut task) = task {
            match tokio::time::timeout(self.inner.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("connection loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("connection loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("connection loop aborted: {join_err}");
                    }
                }
            }
        }

        self.inner.shared.set_state(ConnectionState::Disconnected);
    }

    /// Take the event receiver. Returns `None` once it has been taken.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        lock(&self.inner.events).take()
    }

    /// Replace the stored membership (replayed after reconnects).
    pub fn set_membership(&self, membership: Membership) {
        *lock(&self.inner.shared.membership) = membership;
    }

    /// Forget the stored membership.
    pub fn clear_membership(&self) {
        self.set_membership(Membership::None);
    }

    /// The stored membership.
    pub fn membership(&self) -> Membership {
        self.inner.shared.membership()
    }

    /// The stored join descriptor, if a game was joined.
    pub fn join_descriptor(&self) -> Option<JoinDescriptor> {
        self.membership().join_descriptor().cloned()
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.shared.id
    }

    pub fn kind(&self) -> EndpointKind {
        self.inner.shared.kind
    }

    pub fn uri(&self) -> &str {
        &self.inner.shared.uri
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state()
    }

    /// Returns `true` while the transport is believed to be up.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TriviaError::NotConnected)
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("uri", &self.uri())
            .field("state", &self.state())
            .finish()
    }
}

// ── Connection loop ─────────────────────────────────────────────────

struct LoopContext {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    event_tx: mpsc::Sender<ConnectionEvent>,
    next_invocation: AtomicU64,
}

impl LoopContext {
    fn next_invocation_id(&self) -> String {
        self.next_invocation.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

struct PendingCall {
    target: String,
    reply: oneshot::Sender<Result<Value>>,
}

/// Why [`drive`] stopped.
enum SessionEnd {
    Shutdown,
    ServerClosed { error: Option<String> },
    Lost(String),
}

enum ReconnectOutcome {
    Restored(Box<dyn Transport>),
    Cancelled,
    Exhausted(String),
    Refused(String),
}

async fn connection_loop(
    ctx: LoopContext,
    mut transport: Box<dyn Transport>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let id = ctx.shared.id;
    debug!(connection = %id, "connection loop started");
    emit_event(&ctx.event_tx, ConnectionEvent::Connected).await;

    let mut pending: HashMap<String, PendingCall> = HashMap::new();

    loop {
        let end = drive(&ctx, &mut transport, &mut cmd_rx, &mut shutdown_rx, &mut pending).await;
        fail_pending(&mut pending);

        let closed_reason = match end {
            SessionEnd::Shutdown => {
                let _ = transport.close().await;
                None
            }
            SessionEnd::ServerClosed { error: None } => None,
            SessionEnd::ServerClosed { error: Some(reason) } => {
                warn!(connection = %id, %reason, "server closed the connection with an error");
                match last_chance(&ctx, &mut shutdown_rx).await {
                    Some(restored) => {
                        transport = restored;
                        continue;
                    }
                    None => Some(reason),
                }
            }
            SessionEnd::Lost(reason) => {
                warn!(connection = %id, %reason, "connection lost, reconnecting");
                ctx.shared.set_state(ConnectionState::Reconnecting);
                emit_event(
                    &ctx.event_tx,
                    ConnectionEvent::Reconnecting {
                        reason: Some(reason),
                    },
                )
                .await;

                match reconnect(&ctx, &mut shutdown_rx).await {
                    ReconnectOutcome::Restored(restored) => {
                        transport = restored;
                        continue;
                    }
                    ReconnectOutcome::Cancelled => None,
                    ReconnectOutcome::Refused(reason) => Some(reason),
                    ReconnectOutcome::Exhausted(reason) => {
                        match last_chance(&ctx, &mut shutdown_rx).await {
                            Some(restored) => {
                                transport = restored;
                                continue;
                            }
                            None => Some(reason),
                        }
                    }
                }
            }
        };

        ctx.shared.set_state(ConnectionState::Disconnected);
        emit_closed(&ctx.event_tx, closed_reason).await;
        break;
    }

    debug!(connection = %id, "connection loop exited");
}

/// Multiplexes commands, shutdown and incoming frames until the session ends.
async fn drive(
    ctx: &LoopContext,
    transport: &mut Box<dyn Transport>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    shutdown_rx: &mut oneshot::Receiver<()>,
    pending: &mut HashMap<String, PendingCall>,
) -> SessionEnd {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    debug!("command channel closed, shutting down connection loop");
                    return SessionEnd::Shutdown;
                };
                let (invocation_id, target, arguments, reply) = match cmd {
                    Command::Invoke { target, arguments, reply } => {
                        (Some(ctx.next_invocation_id()), target, arguments, Some(reply))
                    }
                    Command::Send { target, arguments } => (None, target, arguments, None),
                };
                let frame = ClientFrame::Invocation {
                    invocation_id: invocation_id.clone(),
                    target: target.clone(),
                    arguments,
                };
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("failed to serialize invocation {target}: {e}");
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(e.into()));
                        }
                        continue;
                    }
                };
                if let Err(e) = transport.send(json).await {
                    error!("transport send error: {e}");
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(TriviaError::TransportSend(e.to_string())));
                    }
                    return SessionEnd::Lost(format!("transport send error: {e}"));
                }
                if let (Some(id), Some(reply)) = (invocation_id, reply) {
                    pending.insert(id, PendingCall { target, reply });
                }
            }

            _ = &mut *shutdown_rx => {
                debug!("shutdown signal received");
                return SessionEnd::Shutdown;
            }

            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(ServerFrame::Completion { invocation_id, result, error }) => {
                            let Some(call) = pending.remove(&invocation_id) else {
                                debug!(%invocation_id, "completion for unknown invocation");
                                continue;
                            };
                            let outcome = match error {
                                Some(message) => Err(TriviaError::Rpc { target: call.target, message }),
                                None => Ok(result.unwrap_or(Value::Null)),
                            };
                            let _ = call.reply.send(outcome);
                        }
                        Ok(ServerFrame::Invocation { target, arguments }) => {
                            emit_event(&ctx.event_tx, ConnectionEvent::Message { target, arguments }).await;
                        }
                        Ok(ServerFrame::Ping) => {}
                        Ok(ServerFrame::Close { error }) => return SessionEnd::ServerClosed { error },
                        Err(e) => {
                            warn!("failed to deserialize server frame: {e}, raw: {text}");
                        }
                    },
                    Some(Err(e)) => {
                        error!("transport receive error: {e}");
                        return SessionEnd::Lost(format!("transport receive error: {e}"));
                    }
                    None => {
                        debug!("transport closed by server");
                        return SessionEnd::ServerClosed { error: None };
                    }
                }
            }
        }
    }
}

/// Retries the connector with linear backoff until success, refusal,
/// exhaustion or shutdown.
async fn reconnect(ctx: &LoopContext, shutdown_rx: &mut oneshot::Receiver<()>) -> ReconnectOutcome {
    let policy = &ctx.config.reconnect;
    let mut attempt: u32 = 0;
    let mut last_error = String::from("connection lost");

    loop {
        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            warn!(connection = %ctx.shared.id, attempt, "reconnect attempts exhausted");
            return ReconnectOutcome::Exhausted(last_error);
        }

        let delay = policy.delay_for(attempt);
        debug!(connection = %ctx.shared.id, attempt, ?delay, "scheduling reconnect attempt");
        tokio::select! {
            biased;
            _ = &mut *shutdown_rx => return ReconnectOutcome::Cancelled,
            () = tokio::time::sleep(delay) => {}
        }

        let connected = tokio::select! {
            biased;
            _ = &mut *shutdown_rx => return ReconnectOutcome::Cancelled,
            result = ctx.connector.connect(&ctx.shared.uri) => result,
        };

        match connected {
            Ok(mut transport) => {
                restore(ctx, &mut transport).await;
                return ReconnectOutcome::Restored(transport);
            }
            Err(TriviaError::AuthenticationRequired) => {
                warn!(connection = %ctx.shared.id, "reconnect refused: authentication required");
                return ReconnectOutcome::Refused(TriviaError::AuthenticationRequired.to_string());
            }
            Err(e) => {
                debug!(connection = %ctx.shared.id, attempt, error = %e, "reconnect attempt failed");
                last_error = e.to_string();
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// One connect + rejoin cycle, only when a membership is stored.
async fn last_chance(
    ctx: &LoopContext,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> Option<Box<dyn Transport>> {
    if ctx.shared.membership() == Membership::None {
        return None;
    }

    ctx.shared.set_state(ConnectionState::Reconnecting);
    let connected = tokio::select! {
        biased;
        _ = &mut *shutdown_rx => return None,
        result = ctx.connector.connect(&ctx.shared.uri) => result,
    };

    let mut transport = match connected {
        Ok(transport) => transport,
        Err(e) => {
            warn!(connection = %ctx.shared.id, error = %e, "final reconnect attempt failed");
            return None;
        }
    };

    match rejoin(ctx, &mut transport).await {
        Ok(()) => {
            info!(connection = %ctx.shared.id, "connection restored after close");
            ctx.shared.set_state(ConnectionState::Connected);
            emit_event(&ctx.event_tx, ConnectionEvent::Reconnected).await;
            Some(transport)
        }
        Err(reason) => {
            warn!(connection = %ctx.shared.id, %reason, "rejoin after close failed");
            let _ = transport.close().await;
            None
        }
    }
}

/// Replays the membership on a fresh transport and reports the outcome.
async fn restore(ctx: &LoopContext, transport: &mut Box<dyn Transport>) {
    let outcome = rejoin(ctx, transport).await;
    ctx.shared.set_state(ConnectionState::Connected);
    match outcome {
        Ok(()) => {
            info!(connection = %ctx.shared.id, "reconnected");
            emit_event(&ctx.event_tx, ConnectionEvent::Reconnected).await;
        }
        Err(reason) => {
            warn!(connection = %ctx.shared.id, %reason, "reconnected but rejoin failed");
            emit_event(&ctx.event_tx, ConnectionEvent::RejoinFailed { reason }).await;
        }
    }
}

/// Sends the membership replay call and waits for its completion, forwarding
/// pushed events that arrive in the meantime.
async fn rejoin(ctx: &LoopContext, transport: &mut Box<dyn Transport>) -> std::result::Result<(), String> {
    let membership = ctx.shared.membership();
    let Some((target, arguments)) = membership
        .replay_call(ctx.shared.kind)
        .map_err(|e| e.to_string())?
    else {
        return Ok(());
    };

    let invocation_id = ctx.next_invocation_id();
    let frame = ClientFrame::Invocation {
        invocation_id: Some(invocation_id.clone()),
        target: target.to_string(),
        arguments,
    };
    let json = serde_json::to_string(&frame).map_err(|e| e.to_string())?;
    debug!(connection = %ctx.shared.id, target, "replaying membership");
    transport.send(json).await.map_err(|e| e.to_string())?;

    let deadline = tokio::time::sleep(ctx.config.rejoin_timeout);
    tokio::pin!(deadline);

    loop {
        let incoming = tokio::select! {
            () = &mut deadline => return Err(format!("{target} timed out")),
            incoming = transport.recv() => incoming,
        };
        let text = match incoming {
            Some(Ok(text)) => text,
            Some(Err(e)) => return Err(e.to_string()),
            None => return Err("connection closed during rejoin".to_string()),
        };
        match serde_json::from_str::<ServerFrame>(&text) {
            Ok(ServerFrame::Completion {
                invocation_id: completed,
                result,
                error,
            }) if completed == invocation_id => {
                if let Some(message) = error {
                    return Err(message);
                }
                return membership.check_replay_result(ctx.shared.kind, result);
            }
            Ok(ServerFrame::Invocation { target, arguments }) => {
                emit_event(&ctx.event_tx, ConnectionEvent::Message { target, arguments }).await;
            }
            Ok(ServerFrame::Close { error }) => {
                return Err(error.unwrap_or_else(|| "server closed during rejoin".to_string()));
            }
            Ok(_) => {}
            Err(e) => warn!("failed to deserialize server frame: {e}, raw: {text}"),
        }
    }
}

fn fail_pending(pending: &mut HashMap<String, PendingCall>) {
    for (_, call) in pending.drain() {
        let _ = call.reply.send(Err(TriviaError::TransportClosed));
    }
}

/// Emit an event. If the channel is full, log a warning and drop the event
/// to avoid blocking the connection loop.
async fn emit_event(event_tx: &mpsc::Sender<ConnectionEvent>, event: ConnectionEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!("event channel full, dropping event: {:?}", std::mem::discriminant(&dropped));
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

/// `Closed` is the last event on the channel and must never be dropped.
async fn emit_closed(event_tx: &mpsc::Sender<ConnectionEvent>, reason: Option<String>) {
    if event_tx.send(ConnectionEvent::Closed { reason }).await.is_err() {
        debug!("event channel closed, receiver dropped");
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::{Role, Sex};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Scripted transport: each sent frame releases the next reply, `recv`
    /// hangs once nothing is queued.
    struct ScriptedTransport {
        incoming: VecDeque<Option<Result<String>>>,
        replies: VecDeque<String>,
        sent: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&mut self, message: String) -> Result<()> {
            self.sent.lock().unwrap().push(message);
            if let Some(reply) = self.replies.pop_front() {
                self.incoming.push_back(Some(Ok(reply)));
            }
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            match self.incoming.pop_front() {
                Some(item) => item,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct OneShotConnector {
        transport: StdMutex<Option<ScriptedTransport>>,
    }

    #[async_trait]
    impl Connector for OneShotConnector {
        async fn connect(&self, _uri: &str) -> Result<Box<dyn Transport>> {
            match self.transport.lock().unwrap().take() {
                Some(t) => Ok(Box::new(t)),
                None => Err(TriviaError::Io(std::io::Error::other("refused"))),
            }
        }
    }

    fn connector(
        incoming: Vec<Option<Result<String>>>,
        replies: Vec<&str>,
    ) -> (Arc<OneShotConnector>, Arc<StdMutex<Vec<String>>>) {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let transport = ScriptedTransport {
            incoming: VecDeque::from(incoming),
            replies: replies.into_iter().map(str::to_string).collect(),
            sent: Arc::clone(&sent),
        };
        (
            Arc::new(OneShotConnector {
                transport: StdMutex::new(Some(transport)),
            }),
            sent,
        )
    }

    #[test]
    fn reconnect_delay_grows_linearly_and_is_capped() {
        let policy = ReconnectPolicy::new();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(29), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn config_defaults_and_clamping() {
        let config = ConnectionConfig::new().with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
        assert_eq!(config.invoke_timeout, Duration::from_secs(30));
        assert_eq!(config.reconnect.max_attempts, None);
    }

    #[test]
    fn host_membership_replays_join_game_request() {
        let descriptor = JoinDescriptor::new(7, "Alice", Role::Player, Sex::Female).with_pin(1234);
        let membership = Membership::Game(descriptor.clone());
        let (target, args) = membership.replay_call(EndpointKind::Host).unwrap().unwrap();
        assert_eq!(target, "JoinGame");
        assert_eq!(args[0], serde_json::to_value(descriptor.to_request()).unwrap());
    }

    #[test]
    fn lobby_membership_replays_lobby_join() {
        let membership = Membership::Lobby {
            culture: "en-US".into(),
        };
        let (target, args) = membership.replay_call(EndpointKind::Lobby).unwrap().unwrap();
        assert_eq!(target, "JoinLobby2");
        assert_eq!(args, vec![Value::from("en-US")]);
        assert!(membership.replay_call(EndpointKind::Host).unwrap().is_none());
    }

    #[test]
    fn failed_join_response_is_reported() {
        let membership = Membership::Game(JoinDescriptor::new(1, "Bob", Role::Player, Sex::Male));
        let result = membership.check_replay_result(
            EndpointKind::Host,
            Some(serde_json::json!({"IsSuccess": false, "ErrorType": "Forbidden"})),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn invoke_resolves_with_completion_result() {
        let (connector, sent) = connector(
            vec![],
            vec![r#"{"type":"completion","invocation_id":"1","result":["Bot A","Bot B"]}"#],
        );
        let handle = ConnectionHandle::connect(
            EndpointKind::Lobby,
            "ws://lobby",
            connector,
            ConnectionConfig::new(),
        )
        .await
        .unwrap();

        let accounts: Vec<String> = handle
            .invoke("GetComputerAccountsNew", vec![Value::from("en-US")])
            .await
            .unwrap();
        assert_eq!(accounts, vec!["Bot A", "Bot B"]);

        let frame: ClientFrame = serde_json::from_str(&sent.lock().unwrap()[0]).unwrap();
        assert!(matches!(
            frame,
            ClientFrame::Invocation { ref target, .. } if target == "GetComputerAccountsNew"
        ));

        handle.close().await;
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn server_error_completion_maps_to_rpc_error() {
        let (connector, _sent) = connector(
            vec![],
            vec![r#"{"type":"completion","invocation_id":"1","error":"boom"}"#],
        );
        let handle =
            ConnectionHandle::connect(EndpointKind::Lobby, "ws://lobby", connector, ConnectionConfig::new())
                .await
                .unwrap();

        let err = handle.invoke_raw("GetNews", vec![]).await.unwrap_err();
        assert!(matches!(err, TriviaError::Rpc { ref message, .. } if message == "boom"));
        handle.close().await;
    }

    #[tokio::test]
    async fn clean_server_close_is_not_retried() {
        let (connector, _sent) = connector(vec![None], vec![]);
        let handle =
            ConnectionHandle::connect(EndpointKind::Host, "ws://host", connector, ConnectionConfig::new())
                .await
                .unwrap();
        let mut events = handle.take_events().unwrap();

        assert_eq!(events.recv().await, Some(ConnectionEvent::Connected));
        assert_eq!(events.recv().await, Some(ConnectionEvent::Closed { reason: None }));
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(handle.take_events().is_none());
    }

    #[tokio::test]
    async fn initial_connect_failure_is_returned() {
        let connector = Arc::new(OneShotConnector {
            transport: StdMutex::new(None),
        });
        let err = ConnectionHandle::connect(EndpointKind::Lobby, "ws://lobby", connector, ConnectionConfig::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TriviaError::Io(_)));
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let (connector, _sent) = connector(vec![], vec![]);
        let handle =
            ConnectionHandle::connect(EndpointKind::Host, "ws://host", connector, ConnectionConfig::new())
                .await
                .unwrap();
        handle.close().await;
        handle.close().await;
        assert!(matches!(handle.send("SendMessage", vec![]), Err(TriviaError::NotConnected)));
    }
}
