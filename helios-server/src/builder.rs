//! Builder for the Helios server.
//!
//! Collects configuration, room declarations, and handler registrations,
//! then validates everything at [`build`](HeliosServerBuilder::build).
//! [`start`](HeliosServerBuilder::start) additionally binds the Axum
//! server in a background task and returns the coordinator handle.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use axum::Router as AxumRouter;
use tracing::error;

use crate::config::{HealthCheckConfig, ParseMode, ServerConfig, SessionRecoveryConfig};
use crate::dispatch::{MethodHandler, TopicHandler};
use crate::error::ConfigError;
use crate::rooms::{RoomKind, RoomValidator};
use crate::server::{HeliosServer, InboundFilter};

pub struct HeliosServerBuilder {
    bind_addr: SocketAddr,
    ws_path: String,
    config: ServerConfig,
    channel_capacity: usize,
    rooms: Vec<(String, RoomKind, Option<Arc<dyn RoomValidator>>)>,
    methods: Vec<(String, Arc<dyn MethodHandler>)>,
    topics: Vec<(String, Arc<dyn TopicHandler>)>,
    inbound_filter: Option<InboundFilter>,
    additional_routes: Option<AxumRouter>,
}

impl Default for HeliosServerBuilder {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().unwrap(),
            ws_path: "/ws".to_string(),
            config: ServerConfig::default(),
            channel_capacity: 256,
            rooms: Vec::new(),
            methods: Vec::new(),
            topics: Vec::new(),
            inbound_filter: None,
            additional_routes: None,
        }
    }
}

impl HeliosServerBuilder {
    /// Create a new builder with sensible defaults.
    ///
    /// Defaults:
    /// - bind address: `0.0.0.0:8080`
    /// - WebSocket path: `/ws`
    /// - request timeout: 5 s, strict parsing
    /// - health check enabled (30 s interval, 10 s timeout, 2 missed)
    /// - session recovery disabled
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TCP address to bind to.
    pub fn bind(mut self, addr: impl ToSocketAddrs) -> Self {
        if let Some(resolved) = addr.to_socket_addrs().ok().and_then(|mut iter| iter.next()) {
            self.bind_addr = resolved;
        }
        self
    }

    /// Set the URL path of the WebSocket endpoint (default: `"/ws"`).
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = path.into();
        self
    }

    /// Default per-request deadline (default: 5 s).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// How unparseable frames are handled (default: strict).
    pub fn parse_mode(mut self, mode: ParseMode) -> Self {
        self.config.parse_mode = mode;
        self
    }

    /// Enable session recovery. The secret must be at least 32 bytes.
    pub fn with_session_recovery(mut self, recovery: SessionRecoveryConfig) -> Self {
        self.config.session_recovery = Some(recovery);
        self
    }

    /// Replace the health-check configuration.
    pub fn with_health_check(mut self, health: HealthCheckConfig) -> Self {
        self.config.health_check = health;
        self
    }

    /// Disable liveness probing entirely.
    pub fn without_health_check(mut self) -> Self {
        self.config.health_check.enabled = false;
        self
    }

    /// Per-connection outbound frame buffer, in frames (default: 256).
    /// A full buffer makes sends report not-writable.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Declare an exact public room.
    pub fn public_room(mut self, pattern: impl Into<String>) -> Self {
        self.rooms.push((pattern.into(), RoomKind::Public, None));
        self
    }

    /// Declare a validator-gated room over a pattern.
    pub fn protected_room(
        mut self,
        pattern: impl Into<String>,
        validator: Arc<dyn RoomValidator>,
    ) -> Self {
        self.rooms
            .push((pattern.into(), RoomKind::Protected, Some(validator)));
        self
    }

    /// Register an RPC method.
    pub fn method(mut self, name: impl Into<String>, handler: Arc<dyn MethodHandler>) -> Self {
        self.methods.push((name.into(), handler));
        self
    }

    /// Register a handler for inbound events on matching topics.
    pub fn topic(mut self, pattern: impl Into<String>, handler: Arc<dyn TopicHandler>) -> Self {
        self.topics.push((pattern.into(), handler));
        self
    }

    /// Install a pre-dispatch filter; returning `false` cancels the
    /// inbound message.
    pub fn with_inbound_filter(mut self, filter: InboundFilter) -> Self {
        self.inbound_filter = Some(filter);
        self
    }

    /// Mount additional Axum routes (e.g. REST endpoints) on the same
    /// server.
    pub fn with_additional_routes(mut self, router: AxumRouter) -> Self {
        self.additional_routes = Some(router);
        self
    }

    /// Validate and assemble the coordinator without binding a listener.
    pub fn build(self) -> Result<HeliosServer, ConfigError> {
        let server = HeliosServer::from_config(self.config, self.channel_capacity)?;

        for (pattern, kind, validator) in self.rooms {
            server.rooms().declare(&pattern, kind, validator)?;
        }
        for (name, handler) in self.methods {
            server.methods().register(name, handler);
        }
        for (pattern, handler) in self.topics {
            server.topics().register(pattern, handler);
        }
        if let Some(filter) = self.inbound_filter {
            server.set_inbound_filter(filter);
        }
        Ok(server)
    }

    /// Build, bind, and serve in a background task. Returns the
    /// coordinator handle immediately.
    pub fn start(self) -> Result<HeliosServer, ConfigError> {
        let bind_addr = self.bind_addr;
        let ws_path = self.ws_path.clone();
        let additional = self.additional_routes.clone();
        let server = self.build()?;

        let serving = server.clone();
        tokio::spawn(async move {
            if let Err(err) = serving.serve(bind_addr, ws_path, additional).await {
                error!("helios server terminated: {err}");
            }
        });
        Ok(server)
    }
}
