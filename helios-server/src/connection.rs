//! Per-connection state and operations.
//!
//! A [`Connection`] is the unit of client identity. Its id is assigned
//! once and never changes; the transport underneath it may be swapped by
//! a session-recovery reconnect, which resets the health counters but
//! preserves user data, subscriptions, and pending requests.
//!
//! All mutation goes through interior mutability so the coordinator, the
//! room broker, and handlers can share one `Arc<Connection>`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use helios_protocol::Message;

use crate::dispatch::{HandlerContext, MethodRegistry, TopicRouter};
use crate::error::{RequestError, SendError};
use crate::health::HealthState;
use crate::transport::{Frame, TransportHandle, TransportId};

/// Stable, process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle state. Monotonic within one transport generation;
/// a successful reconnect resets it to `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Closing => 1,
            Self::Closed => 2,
        }
    }
}

pub(crate) struct PendingRequest {
    pub settle: oneshot::Sender<Result<Option<Value>, RequestError>>,
}

/// One client, across transport generations.
pub struct Connection {
    id: ConnectionId,
    state: AtomicU8,
    session_id: Mutex<Option<String>>,
    session_metadata: Mutex<Value>,
    transport: Mutex<TransportHandle>,
    user_data: Mutex<HashMap<String, Value>>,
    subscriptions: Mutex<HashSet<String>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    pub(crate) health: Mutex<HealthState>,
    last_token_refresh: Mutex<Option<Instant>>,
    request_timeout: Duration,
}

impl Connection {
    pub(crate) fn new(transport: TransportHandle, request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            state: AtomicU8::new(ConnectionState::Open.as_u8()),
            session_id: Mutex::new(None),
            session_metadata: Mutex::new(Value::Null),
            transport: Mutex::new(transport),
            user_data: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            health: Mutex::new(HealthState::new()),
            last_token_refresh: Mutex::new(None),
            request_timeout,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// The session id, if recovery is enabled and a token has been minted
    /// for this connection.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap().clone()
    }

    /// Assigns the session id. Set at most once per connection lifetime.
    pub(crate) fn assign_session_id(&self, session_id: String) {
        let mut slot = self.session_id.lock().unwrap();
        if slot.is_some() {
            warn!(connection = %self.id, "session id already assigned, ignoring");
            return;
        }
        *slot = Some(session_id);
    }

    /// Metadata carried by the session token, preserved across refreshes.
    pub fn session_metadata(&self) -> Value {
        self.session_metadata.lock().unwrap().clone()
    }

    pub(crate) fn set_session_metadata(&self, metadata: Value) {
        *self.session_metadata.lock().unwrap() = metadata;
    }

    pub(crate) fn transport_id(&self) -> TransportId {
        self.transport.lock().unwrap().id()
    }

    // ────────────────────────────────────────────────────────────────
    // Sending
    // ────────────────────────────────────────────────────────────────

    /// Writes a raw frame. Fails fast when the connection is not open or
    /// the transport is not writable; never blocks on back-pressure.
    pub fn send_frame(&self, frame: Frame) -> Result<(), SendError> {
        if self.state() != ConnectionState::Open {
            return Err(SendError::ConnectionClosed);
        }
        let transport = self.transport.lock().unwrap().clone();
        if transport.try_send(frame) {
            Ok(())
        } else {
            Err(SendError::NotWritable)
        }
    }

    /// Serializes and writes a protocol message.
    pub fn send_message(&self, message: &Message) -> Result<(), SendError> {
        let text = serde_json::to_string(message)
            .map_err(|err| SendError::Serialization(err.to_string()))?;
        self.send_frame(Frame::Text(text))
    }

    /// Sends a wire `event` message to the peer. This is distinct from
    /// the in-process [`ServerEvents`](crate::events::ServerEvents) bus.
    pub fn emit(&self, topic: impl Into<String>, payload: Option<Value>) -> Result<(), SendError> {
        self.send_message(&Message::event(topic, payload))
    }

    /// Queues a close frame on the current transport, regardless of
    /// state. The adapter completes the handshake and reports the close
    /// back through the coordinator.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.transport.lock().unwrap().close(code, reason)
    }

    // ────────────────────────────────────────────────────────────────
    // Request / response
    // ────────────────────────────────────────────────────────────────

    /// Issues an RPC request to the peer and awaits its response.
    ///
    /// Settles exactly once, with the response payload, `Timeout`, or
    /// `ConnectionClosed`. The pending-map entry is the arbiter: the
    /// path that removes it (response, teardown, or the timeout below)
    /// is the one that settles the waiter.
    pub async fn request(
        &self,
        method: &str,
        payload: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Option<Value>, RequestError> {
        if self.state() != ConnectionState::Open {
            return Err(RequestError::ConnectionClosed);
        }

        let message = Message::request(method, payload);
        let request_id = message.id().to_string();
        let (settle, mut settled) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(request_id.clone(), PendingRequest { settle });

        if let Err(err) = self.send_message(&message) {
            self.pending.lock().unwrap().remove(&request_id);
            return Err(err.into());
        }

        let deadline = timeout.unwrap_or(self.request_timeout);
        tokio::select! {
            outcome = &mut settled => outcome.unwrap_or(Err(RequestError::ConnectionClosed)),
            _ = tokio::time::sleep(deadline) => {
                if self.pending.lock().unwrap().remove(&request_id).is_some() {
                    // Entry still present: the connection is live or in
                    // its recovery window, so this is a plain timeout.
                    Err(RequestError::Timeout)
                } else {
                    // A response or teardown won the race; take its outcome.
                    settled.await.unwrap_or(Err(RequestError::ConnectionClosed))
                }
            }
        }
    }

    /// Resolves the pending request with the given id. Returns whether a
    /// waiter was found; duplicate resolutions are no-ops.
    pub(crate) fn settle_response(&self, request_id: &str, payload: Option<Value>) -> bool {
        let waiter = self.pending.lock().unwrap().remove(request_id);
        match waiter {
            Some(pending) => {
                let _ = pending.settle.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Rejects every outstanding request with `CONNECTION_CLOSED` and
    /// clears the map. Idempotent.
    pub(crate) fn reject_all_pending(&self) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, waiter)| waiter).collect()
        };
        for waiter in drained {
            let _ = waiter.settle.send(Err(RequestError::ConnectionClosed));
        }
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    // ────────────────────────────────────────────────────────────────
    // Incoming dispatch
    // ────────────────────────────────────────────────────────────────

    /// Routes a parsed message by genre: requests through the method
    /// registry (the resulting response is written back), responses into
    /// the pending-request map, events through the topic router.
    pub(crate) async fn handle_incoming(
        self: &Arc<Self>,
        message: Message,
        methods: &MethodRegistry,
        topics: &TopicRouter,
    ) {
        match message {
            Message::Request {
                id,
                method,
                payload,
            } => {
                let ctx = HandlerContext {
                    connection: self.clone(),
                };
                let result = methods.dispatch(&ctx, &method, payload).await;
                let response = Message::response(id, Some(result));
                if let Err(err) = self.send_message(&response) {
                    warn!(connection = %self.id, method = %method, "failed to send response: {err}");
                }
            }
            Message::Response {
                request_id,
                payload,
                ..
            } => match self.state() {
                ConnectionState::Open => {
                    if !self.settle_response(&request_id, payload) {
                        debug!(connection = %self.id, %request_id, "response without pending request");
                    }
                }
                _ => {
                    debug!(connection = %self.id, %request_id, "dropping response on non-open connection");
                }
            },
            Message::Event { topic, payload, .. } => {
                let ctx = HandlerContext {
                    connection: self.clone(),
                };
                topics.route(&ctx, &topic, payload).await;
            }
        }
    }

    // ────────────────────────────────────────────────────────────────
    // Reconnection
    // ────────────────────────────────────────────────────────────────

    /// Swaps in a new transport after session recovery: state returns to
    /// open and health counters reset. User data, subscriptions, and
    /// pending requests are untouched. The coordinator restarts the
    /// health-check loop afterwards.
    pub(crate) fn rebind_transport(&self, new_transport: TransportHandle) {
        *self.transport.lock().unwrap() = new_transport;
        self.set_state(ConnectionState::Open);
        self.health.lock().unwrap().reset_for_reconnect();
    }

    // ────────────────────────────────────────────────────────────────
    // User data
    // ────────────────────────────────────────────────────────────────

    pub fn set_user_data(&self, key: impl Into<String>, value: Value) {
        self.user_data.lock().unwrap().insert(key.into(), value);
    }

    pub fn user_data(&self, key: &str) -> Option<Value> {
        self.user_data.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn clear_user_data(&self) {
        self.user_data.lock().unwrap().clear();
    }

    // ────────────────────────────────────────────────────────────────
    // Subscription mirror (maintained by the room broker)
    // ────────────────────────────────────────────────────────────────

    pub(crate) fn add_subscription(&self, topic: &str) {
        self.subscriptions.lock().unwrap().insert(topic.to_string());
    }

    pub(crate) fn remove_subscription(&self, topic: &str) {
        self.subscriptions.lock().unwrap().remove(topic);
    }

    pub(crate) fn clear_subscriptions(&self) {
        self.subscriptions.lock().unwrap().clear();
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().iter().cloned().collect()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.lock().unwrap().contains(topic)
    }

    // ────────────────────────────────────────────────────────────────
    // Token refresh rate limit
    // ────────────────────────────────────────────────────────────────

    pub(crate) fn mark_token_refreshed(&self) {
        *self.last_token_refresh.lock().unwrap() = Some(Instant::now());
    }

    /// True iff a session exists and at least half the token TTL has
    /// elapsed since the last mint.
    pub fn can_refresh_token(&self, ttl: Duration) -> bool {
        if self.session_id().is_none() {
            return false;
        }
        match *self.last_token_refresh.lock().unwrap() {
            Some(last) => last.elapsed() >= ttl / 2,
            None => true,
        }
    }

    /// Time remaining until a refresh is allowed; zero when allowed now.
    pub fn time_until_refresh_allowed(&self, ttl: Duration) -> Duration {
        match *self.last_token_refresh.lock().unwrap() {
            Some(last) => (ttl / 2).saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("session_id", &self.session_id())
            .finish()
    }
}
