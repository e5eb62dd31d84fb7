//! Connection registry: transport and session indexes.
//!
//! The transport index is the hot data-plane path (one lookup per inbound
//! frame) and lives in a `DashMap`. Session state, meaning the active
//! session index and the disconnected-but-recoverable set, is coupled and
//! guarded by a single mutex so the two can never be observed out of step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::connection::Connection;
use crate::transport::{TransportHandle, TransportId};

struct DisconnectedEntry {
    connection: Arc<Connection>,
    expires_at: Instant,
}

#[derive(Default)]
struct SessionIndex {
    active: HashMap<String, Arc<Connection>>,
    disconnected: HashMap<String, DisconnectedEntry>,
}

/// Owns the mapping from live transports and active session ids to
/// connections, and retains closed-but-recoverable connections until
/// their session TTL elapses.
#[derive(Default)]
pub struct ConnectionRegistry {
    by_transport: DashMap<TransportId, Arc<Connection>>,
    sessions: Mutex<SessionIndex>,
}

impl ConnectionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, conn: Arc<Connection>) {
        self.by_transport.insert(conn.transport_id(), conn);
    }

    /// O(1) transport lookup.
    pub fn get(&self, transport: TransportId) -> Option<Arc<Connection>> {
        self.by_transport
            .get(&transport)
            .map(|entry| entry.value().clone())
    }

    pub(crate) fn index_session(&self, session_id: &str, conn: Arc<Connection>) {
        self.sessions
            .lock()
            .unwrap()
            .active
            .insert(session_id.to_string(), conn);
    }

    /// Resolves a session id to its connection: an actively indexed one,
    /// or a disconnected one whose recovery window is still open.
    pub fn find_by_session(&self, session_id: &str) -> Option<Arc<Connection>> {
        let sessions = self.sessions.lock().unwrap();
        if let Some(conn) = sessions.active.get(session_id) {
            return Some(conn.clone());
        }
        sessions
            .disconnected
            .get(session_id)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.connection.clone())
    }

    /// Rebinds a recoverable session onto a new transport. Returns the
    /// recovered connection, or `None` when no recoverable session
    /// exists. The caller restarts the health-check loop.
    pub(crate) fn reconnect(
        &self,
        session_id: &str,
        new_transport: TransportHandle,
    ) -> Option<Arc<Connection>> {
        let conn = {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(conn) = sessions.active.get(session_id) {
                conn.clone()
            } else {
                let entry = sessions.disconnected.remove(session_id)?;
                if entry.expires_at <= Instant::now() {
                    // Expired while we held it; hand it back to the sweep.
                    sessions.disconnected.insert(session_id.to_string(), entry);
                    return None;
                }
                let conn = entry.connection;
                sessions
                    .active
                    .insert(session_id.to_string(), conn.clone());
                conn
            }
        };

        self.by_transport.remove(&conn.transport_id());
        conn.rebind_transport(new_transport);
        self.by_transport.insert(conn.transport_id(), conn.clone());
        debug!(connection = %conn.id(), %session_id, "session rebound to new transport");
        Some(conn)
    }

    /// Moves a session-bearing connection into the recoverable set. The
    /// transport index entry is dropped first, so a disconnected entry is
    /// never also reachable by transport.
    pub(crate) fn mark_disconnected(&self, conn: &Arc<Connection>, ttl: Duration) {
        self.by_transport.remove(&conn.transport_id());
        if let Some(session_id) = conn.session_id() {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.active.remove(&session_id);
            sessions.disconnected.insert(
                session_id,
                DisconnectedEntry {
                    connection: conn.clone(),
                    expires_at: Instant::now() + ttl,
                },
            );
        }
    }

    /// Removes a connection from every index.
    pub(crate) fn remove(&self, conn: &Arc<Connection>) {
        self.by_transport.remove(&conn.transport_id());
        if let Some(session_id) = conn.session_id() {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.active.remove(&session_id);
            sessions.disconnected.remove(&session_id);
        }
    }

    /// Drains every disconnected entry whose recovery window has closed.
    /// The caller runs final cleanup on each.
    pub(crate) fn take_expired(&self) -> Vec<Arc<Connection>> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().unwrap();
        let expired: Vec<String> = sessions
            .disconnected
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(session_id, _)| session_id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|session_id| {
                sessions.active.remove(&session_id);
                sessions
                    .disconnected
                    .remove(&session_id)
                    .map(|entry| entry.connection)
            })
            .collect()
    }

    /// Number of live (transport-reachable) connections.
    pub fn connection_count(&self) -> usize {
        self.by_transport.len()
    }

    /// Number of connections waiting out their recovery window.
    pub fn disconnected_count(&self) -> usize {
        self.sessions.lock().unwrap().disconnected.len()
    }
}
