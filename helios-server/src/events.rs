//! Server-side event bus.
//!
//! Internal signals (connections arriving, sessions recovering, pongs
//! landing) are published here for application code to observe. This bus
//! is distinct from wire events: [`Connection::emit`] writes an `event`
//! message to the peer, while [`ServerEvents::publish`] fans a
//! [`ServerEvent`] out to in-process subscribers.
//!
//! [`Connection::emit`]: crate::connection::Connection::emit

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::connection::Connection;
use crate::token::Session;

/// A raw inbound frame surfaced in permissive / passthrough parse modes.
#[derive(Debug, Clone)]
pub enum RawPayload {
    Json(serde_json::Value),
    Text(String),
    Binary(Vec<u8>),
}

/// Signals observable on the server-side bus.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Connection {
        connection: Arc<Connection>,
    },
    Disconnection {
        connection: Arc<Connection>,
        code: u16,
        reason: String,
    },
    SessionCreated {
        connection: Arc<Connection>,
        token: String,
    },
    SessionRecovered {
        connection: Arc<Connection>,
        session: Session,
    },
    SessionRecoveryFailed {
        reason: String,
    },
    SessionRefreshed {
        connection: Arc<Connection>,
        token: String,
    },
    RoomSubscribed {
        connection: Arc<Connection>,
        topic: String,
    },
    RoomUnsubscribed {
        connection: Arc<Connection>,
        topic: String,
    },
    PingMissed {
        connection: Arc<Connection>,
        missed_pongs: u32,
    },
    PongReceived {
        connection: Arc<Connection>,
        latency: Duration,
    },
    PingTimeout {
        connection: Arc<Connection>,
    },
    /// Unparseable inbound frame, surfaced instead of dropped when the
    /// parse mode allows it.
    RawMessage {
        connection: Arc<Connection>,
        payload: RawPayload,
    },
}

/// Cheap-to-clone handle to the bus. Publishing never blocks; events are
/// dropped when no subscriber is listening.
#[derive(Debug, Clone)]
pub struct ServerEvents {
    tx: broadcast::Sender<ServerEvent>,
}

impl ServerEvents {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribes to every subsequent event.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn publish(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }
}
