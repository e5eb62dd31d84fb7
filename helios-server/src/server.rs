//! Server coordinator and Axum transport adapter.
//!
//! [`HeliosServer`] wires transport events into the registry, the room
//! broker, and per-connection state, and exposes the outward API. The
//! Axum adapter at the bottom of this file is deliberately thin: it
//! accepts the WebSocket upgrade, pumps frames both ways, and reports
//! open / message / close / pong back into the coordinator. Everything
//! else lives behind those four entry points, which the integration
//! tests drive directly over in-memory channels.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use helios_protocol::Message;

use crate::config::{ParseMode, ServerConfig};
use crate::connection::{Connection, ConnectionState};
use crate::dispatch::{method_fn, HandlerContext, MethodRegistry, TopicRouter};
use crate::error::{ConfigError, HandlerError, ProtocolError, RequestError};
use crate::events::{RawPayload, ServerEvent, ServerEvents};
use crate::health;
use crate::registry::ConnectionRegistry;
use crate::rooms::{BroadcastOutcome, RoomBroker};
use crate::token::{self, TokenCodec};
use crate::transport::{Frame, TransportHandle, TransportId};

/// Query parameter carrying a recovery token on the upgrade URL.
pub const SESSION_TOKEN_PARAM: &str = "session_token";

const EVENT_BUS_CAPACITY: usize = 256;

/// Decides whether a parsed inbound message proceeds to dispatch.
/// Returning `false` cancels it.
pub type InboundFilter = Arc<dyn Fn(&Arc<Connection>, &Message) -> bool + Send + Sync>;

/// A raw inbound frame as delivered by the transport adapter.
#[derive(Debug, Clone)]
pub enum RawMessage {
    Text(String),
    Binary(Vec<u8>),
}

pub(crate) struct ServerInner {
    config: ServerConfig,
    registry: ConnectionRegistry,
    broker: RoomBroker,
    methods: MethodRegistry,
    topics: TopicRouter,
    events: ServerEvents,
    token_codec: Option<TokenCodec>,
    inbound_filter: Mutex<Option<InboundFilter>>,
    channel_capacity: usize,
    started_at: Instant,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if let Some(task) = self.sweep_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// The coordinator. Cheap to clone; all clones share one server.
#[derive(Clone)]
pub struct HeliosServer {
    inner: Arc<ServerInner>,
}

impl HeliosServer {
    pub(crate) fn from_config(
        config: ServerConfig,
        channel_capacity: usize,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let token_codec = match &config.session_recovery {
            Some(recovery) => Some(TokenCodec::new(recovery.secret.clone())?),
            None => None,
        };

        let events = ServerEvents::new(EVENT_BUS_CAPACITY);
        let server = Self {
            inner: Arc::new(ServerInner {
                broker: RoomBroker::new(events.clone()),
                registry: ConnectionRegistry::new(),
                methods: MethodRegistry::new(),
                topics: TopicRouter::new(),
                events,
                token_codec,
                inbound_filter: Mutex::new(None),
                channel_capacity,
                started_at: Instant::now(),
                sweep_task: Mutex::new(None),
                config,
            }),
        };

        server.register_builtin_methods();
        if server.inner.config.session_recovery.is_some() {
            server.spawn_sweep();
        }
        Ok(server)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &ServerEvents {
        &self.inner.events
    }

    pub fn rooms(&self) -> &RoomBroker {
        &self.inner.broker
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn methods(&self) -> &MethodRegistry {
        &self.inner.methods
    }

    pub fn topics(&self) -> &TopicRouter {
        &self.inner.topics
    }

    /// Installs the pre-dispatch filter. At most one is active.
    pub fn set_inbound_filter(&self, filter: InboundFilter) {
        *self.inner.inbound_filter.lock().unwrap() = Some(filter);
    }

    /// Fans an event out to every subscriber of the topic or pattern.
    pub fn broadcast(&self, topic_or_pattern: &str, data: Option<Value>) -> BroadcastOutcome {
        self.inner.broker.broadcast(topic_or_pattern, data)
    }

    /// Measures one round trip to the peer; rejects with `Timeout` after
    /// ten seconds.
    pub async fn ping(&self, conn: &Arc<Connection>) -> Result<std::time::Duration, RequestError> {
        health::manual_ping(conn).await
    }

    // ────────────────────────────────────────────────────────────────
    // Transport events
    // ────────────────────────────────────────────────────────────────

    /// A transport finished its upgrade. Recovers a prior connection when
    /// the query string bears a valid session token, otherwise creates a
    /// fresh one (minting a session if recovery is enabled), and starts
    /// the health-check loop.
    pub fn handle_open(
        &self,
        transport: TransportHandle,
        query: &HashMap<String, String>,
    ) -> Arc<Connection> {
        let inner = &self.inner;
        let mut recovery_failure: Option<String> = None;

        if let (Some(_), Some(codec)) = (&inner.config.session_recovery, &inner.token_codec) {
            if let Some(token) = query.get(SESSION_TOKEN_PARAM) {
                match codec.verify(token) {
                    Ok(session) => {
                        if let Some(conn) = inner
                            .registry
                            .reconnect(&session.session_id, transport.clone())
                        {
                            info!(connection = %conn.id(), session = %session.session_id, "session recovered");
                            conn.set_session_metadata(session.metadata.clone());
                            let _ = conn.emit(
                                "session:recovered",
                                Some(json!({
                                    "sessionId": session.session_id,
                                    "metadata": session.metadata,
                                })),
                            );
                            inner.events.publish(ServerEvent::SessionRecovered {
                                connection: conn.clone(),
                                session,
                            });
                            health::start(&conn, &inner.config.health_check, &inner.events);
                            return conn;
                        }
                        recovery_failure = Some("No recoverable session".to_string());
                    }
                    Err(err) => recovery_failure = Some(err.to_string()),
                }
            }
        }

        let conn = Connection::new(transport, inner.config.request_timeout);
        inner.registry.register(conn.clone());
        debug!(connection = %conn.id(), "connection established");
        inner.events.publish(ServerEvent::Connection {
            connection: conn.clone(),
        });

        if let Some(reason) = recovery_failure {
            warn!(connection = %conn.id(), %reason, "session recovery failed, created fresh session");
            let _ = conn.emit("session:recovery-failed", Some(json!({ "reason": reason })));
            inner
                .events
                .publish(ServerEvent::SessionRecoveryFailed { reason });
        }
        if inner.config.session_recovery.is_some() {
            self.create_session(&conn);
        }

        health::start(&conn, &inner.config.health_check, &inner.events);
        conn
    }

    /// A raw frame arrived. Parses it per the configured parse mode and
    /// dispatches by genre; unknown transports are dropped (a race with
    /// close).
    pub async fn handle_message(
        &self,
        transport: TransportId,
        raw: RawMessage,
    ) -> Result<(), ProtocolError> {
        let inner = &self.inner;
        let Some(conn) = inner.registry.get(transport) else {
            debug!(%transport, "message for unknown transport, dropping");
            return Ok(());
        };

        let parsed: Result<Message, serde_json::Error> = match &raw {
            RawMessage::Text(text) => serde_json::from_str(text),
            RawMessage::Binary(bytes) => serde_json::from_slice(bytes),
        };

        let message = match parsed {
            Ok(message) => message,
            Err(err) => {
                return match inner.config.parse_mode {
                    ParseMode::Strict => Err(ProtocolError::Parse(err.to_string())),
                    ParseMode::Permissive => {
                        let payload = match raw {
                            RawMessage::Text(text) => match serde_json::from_str::<Value>(&text) {
                                Ok(value) => RawPayload::Json(value),
                                Err(_) => RawPayload::Text(text),
                            },
                            RawMessage::Binary(bytes) => RawPayload::Binary(bytes),
                        };
                        inner.events.publish(ServerEvent::RawMessage {
                            connection: conn,
                            payload,
                        });
                        Ok(())
                    }
                    ParseMode::Passthrough => {
                        let payload = match raw {
                            RawMessage::Text(text) => RawPayload::Text(text),
                            RawMessage::Binary(bytes) => RawPayload::Binary(bytes),
                        };
                        inner.events.publish(ServerEvent::RawMessage {
                            connection: conn,
                            payload,
                        });
                        Ok(())
                    }
                };
            }
        };

        let cancelled = {
            let filter = inner.inbound_filter.lock().unwrap().clone();
            filter.is_some_and(|filter| !filter(&conn, &message))
        };
        if cancelled {
            debug!(connection = %conn.id(), kind = message.kind(), "inbound message cancelled");
            return Ok(());
        }

        conn.handle_incoming(message, &inner.methods, &inner.topics)
            .await;
        Ok(())
    }

    /// The transport closed. Session-bearing connections are parked in
    /// the recoverable set; everything else is fully torn down.
    pub fn handle_close(&self, transport: TransportId, code: u16, reason: &str) {
        let inner = &self.inner;
        let Some(conn) = inner.registry.get(transport) else {
            return;
        };

        conn.set_state(ConnectionState::Closing);
        health::stop(&conn);

        let recoverable =
            inner.config.session_recovery.is_some() && conn.session_id().is_some();
        if recoverable {
            let ttl = inner
                .config
                .session_recovery
                .as_ref()
                .map(|recovery| recovery.ttl)
                .unwrap_or_default();
            inner.registry.mark_disconnected(&conn, ttl);
            conn.set_state(ConnectionState::Closed);
            debug!(connection = %conn.id(), code, "disconnected, session recoverable");
        } else {
            self.teardown(&conn);
            conn.set_state(ConnectionState::Closed);
            inner.registry.remove(&conn);
            debug!(connection = %conn.id(), code, "disconnected, torn down");
        }

        inner.events.publish(ServerEvent::Disconnection {
            connection: conn,
            code,
            reason: reason.to_string(),
        });
    }

    /// A pong frame arrived.
    pub fn handle_pong(&self, transport: TransportId) {
        if let Some(conn) = self.inner.registry.get(transport) {
            health::on_pong(&conn, &self.inner.events);
        }
    }

    // ────────────────────────────────────────────────────────────────
    // Sessions
    // ────────────────────────────────────────────────────────────────

    fn create_session(&self, conn: &Arc<Connection>) {
        let inner = &self.inner;
        let (Some(recovery), Some(codec)) = (&inner.config.session_recovery, &inner.token_codec)
        else {
            return;
        };

        let session_id = token::generate_session_id(conn.id().as_u64());
        let token = codec.mint(&session_id, conn.id().as_u64(), Value::Null, recovery.ttl);
        conn.assign_session_id(session_id.clone());
        conn.mark_token_refreshed();
        inner.registry.index_session(&session_id, conn.clone());

        let _ = conn.emit(
            "session:created",
            Some(json!({
                "token": token,
                "ttl": recovery.ttl.as_millis() as u64,
            })),
        );
        inner.events.publish(ServerEvent::SessionCreated {
            connection: conn.clone(),
            token,
        });
    }

    /// Final cleanup: every pending waiter rejected exactly once, room
    /// indexes cleared, user data dropped.
    fn teardown(&self, conn: &Arc<Connection>) {
        conn.reject_all_pending();
        self.inner.broker.cleanup(conn);
        conn.clear_user_data();
    }

    fn spawn_sweep(&self) {
        let Some(recovery) = &self.inner.config.session_recovery else {
            return;
        };
        let interval = recovery.sweep_interval;
        let weak = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.tick().await; // the immediate first tick
            loop {
                ticks.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                for conn in inner.registry.take_expired() {
                    debug!(connection = %conn.id(), "session expired, final cleanup");
                    health::stop(&conn);
                    conn.reject_all_pending();
                    inner.broker.cleanup(&conn);
                    conn.clear_user_data();
                    conn.set_state(ConnectionState::Closed);
                }
            }
        });
        *self.inner.sweep_task.lock().unwrap() = Some(task);
    }

    fn register_builtin_methods(&self) {
        let methods = &self.inner.methods;

        let weak = Arc::downgrade(&self.inner);
        methods.register(
            "helios.subscribe",
            method_fn(move |ctx: HandlerContext, payload| {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return Err(HandlerError::new("server shutting down"));
                    };
                    let payload = payload.unwrap_or(Value::Null);
                    let Some(topic) = payload["topic"].as_str() else {
                        return Ok(json!({ "ok": false, "error": "Missing topic" }));
                    };
                    let data = payload.get("data").cloned();
                    match inner
                        .broker
                        .subscribe(&ctx.connection, topic, data.as_ref())
                        .await
                    {
                        Ok(()) => Ok(json!({ "ok": true, "topic": topic })),
                        Err(err) => Ok(json!({ "ok": false, "error": err.to_string() })),
                    }
                }
            }),
        );

        let weak = Arc::downgrade(&self.inner);
        methods.register(
            "helios.unsubscribe",
            method_fn(move |ctx: HandlerContext, payload| {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return Err(HandlerError::new("server shutting down"));
                    };
                    let payload = payload.unwrap_or(Value::Null);
                    let Some(topic) = payload["topic"].as_str() else {
                        return Ok(json!({ "ok": false, "error": "Missing topic" }));
                    };
                    let removed = inner.broker.unsubscribe(&ctx.connection, topic);
                    Ok(json!({ "ok": removed, "topic": topic }))
                }
            }),
        );

        let weak = Arc::downgrade(&self.inner);
        methods.register(
            "session.refresh",
            method_fn(move |ctx: HandlerContext, _payload| {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return Err(HandlerError::new("server shutting down"));
                    };
                    let (Some(recovery), Some(codec)) =
                        (&inner.config.session_recovery, &inner.token_codec)
                    else {
                        return Ok(json!({ "error": "No active session" }));
                    };

                    let conn = &ctx.connection;
                    let Some(session_id) = conn.session_id() else {
                        return Ok(json!({ "error": "No active session" }));
                    };
                    if !conn.can_refresh_token(recovery.ttl) {
                        let wait = conn.time_until_refresh_allowed(recovery.ttl);
                        return Ok(json!({
                            "error": "Rate limit exceeded",
                            "waitMs": wait.as_millis() as u64,
                        }));
                    }

                    let token = codec.mint(
                        &session_id,
                        conn.id().as_u64(),
                        conn.session_metadata(),
                        recovery.ttl,
                    );
                    conn.mark_token_refreshed();

                    let _ = conn.emit(
                        "session:refreshed",
                        Some(json!({ "token": token, "sessionId": session_id })),
                    );
                    inner.events.publish(ServerEvent::SessionRefreshed {
                        connection: conn.clone(),
                        token: token.clone(),
                    });
                    Ok(json!({
                        "success": true,
                        "token": token,
                        "sessionId": session_id,
                    }))
                }
            }),
        );
    }

    // ────────────────────────────────────────────────────────────────
    // Axum adapter
    // ────────────────────────────────────────────────────────────────

    /// Builds the Axum application: the WebSocket endpoint plus a JSON
    /// `/health` report.
    pub fn axum_router(&self, ws_path: &str) -> Router {
        Router::new()
            .route(ws_path, get(ws_upgrade_handler))
            .route("/health", get(health_handler))
            .with_state(self.clone())
            .layer(CorsLayer::permissive())
    }

    /// Binds and serves until the listener fails. Most callers go through
    /// [`HeliosServerBuilder::start`](crate::builder::HeliosServerBuilder::start),
    /// which runs this in a background task.
    pub async fn serve(
        self,
        bind_addr: SocketAddr,
        ws_path: String,
        additional_routes: Option<Router>,
    ) -> std::io::Result<()> {
        let app = match additional_routes {
            Some(extra) => self.axum_router(&ws_path).merge(extra),
            None => self.axum_router(&ws_path),
        };
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        info!("helios server listening on {bind_addr}");
        axum::serve(listener, app).await
    }
}

async fn health_handler(State(server): State<HeliosServer>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": server.inner.registry.connection_count(),
        "recoverable": server.inner.registry.disconnected_count(),
        "uptime_secs": server.inner.started_at.elapsed().as_secs(),
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(server): State<HeliosServer>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_transport(server, socket, query))
}

/// Pumps one WebSocket: outbound frames from the coordinator's channel,
/// inbound frames into the coordinator's event entry points.
async fn run_transport(server: HeliosServer, socket: WebSocket, query: HashMap<String, String>) {
    let (handle, mut outbound) = TransportHandle::channel(server.inner.channel_capacity);
    let transport = handle.id();
    let conn = server.handle_open(handle, &query);
    debug!(connection = %conn.id(), %transport, "transport attached");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut close_info: Option<(u16, String)> = None;

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(Frame::Close { code, reason }) => {
                    let _ = ws_tx
                        .send(WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: reason.clone().into(),
                        })))
                        .await;
                    close_info = Some((code, reason));
                    break;
                }
                Some(frame) => {
                    if ws_tx.send(to_ws_message(frame)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = ws_rx.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Err(err) = server
                        .handle_message(transport, RawMessage::Text(text.to_string()))
                        .await
                    {
                        warn!(%transport, "protocol error, closing: {err}");
                        let _ = ws_tx
                            .send(WsMessage::Close(Some(CloseFrame {
                                code: 1002,
                                reason: "Protocol error".into(),
                            })))
                            .await;
                        close_info = Some((1002, "Protocol error".to_string()));
                        break;
                    }
                }
                Some(Ok(WsMessage::Binary(bytes))) => {
                    if let Err(err) = server
                        .handle_message(transport, RawMessage::Binary(bytes.to_vec()))
                        .await
                    {
                        warn!(%transport, "protocol error, closing: {err}");
                        let _ = ws_tx
                            .send(WsMessage::Close(Some(CloseFrame {
                                code: 1002,
                                reason: "Protocol error".into(),
                            })))
                            .await;
                        close_info = Some((1002, "Protocol error".to_string()));
                        break;
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => server.handle_pong(transport),
                // Axum answers pings transparently.
                Some(Ok(WsMessage::Ping(_))) => {}
                Some(Ok(WsMessage::Close(frame))) => {
                    close_info = frame.map(|f| (f.code, f.reason.to_string()));
                    break;
                }
                Some(Err(err)) => {
                    debug!(%transport, "transport error: {err}");
                    break;
                }
                None => break,
            },
        }
    }

    let (code, reason) = close_info.unwrap_or((1006, String::new()));
    server.handle_close(transport, code, &reason);
    debug!(connection = %conn.id(), %transport, "transport detached");
}

fn to_ws_message(frame: Frame) -> WsMessage {
    match frame {
        Frame::Text(text) => WsMessage::Text(text.into()),
        Frame::Binary(bytes) => WsMessage::Binary(bytes.into()),
        Frame::Ping => WsMessage::Ping(Vec::new().into()),
        Frame::Pong => WsMessage::Pong(Vec::new().into()),
        Frame::Close { code, reason } => WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })),
    }
}
