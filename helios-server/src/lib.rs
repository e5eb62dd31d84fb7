//! # helios-server
//!
//! Structured real-time messaging over a single WebSocket transport.
//!
//! Three message genres are multiplexed over one connection (correlated
//! request/response RPC, fire-and-forget events, and topic-addressed
//! pub/sub through declared rooms) on top of a connection lifecycle that
//! survives transport drops: signed session tokens let a client rebind
//! its prior [`Connection`] (user data, subscriptions, and pending
//! requests intact) within the recovery TTL, and a per-connection
//! ping/pong loop terminates dead peers deterministically.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use helios_server::{HeliosServerBuilder, SessionRecoveryConfig};
//! use helios_server::dispatch::method_fn;
//! use helios_server::rooms::validator_fn;
//! use serde_json::json;
//!
//! let server = HeliosServerBuilder::new()
//!     .bind("0.0.0.0:8080")
//!     .path("/ws")
//!     .with_session_recovery(SessionRecoveryConfig::new(secret_bytes))
//!     .public_room("chat:general")
//!     .protected_room(
//!         "user:*",
//!         validator_fn(|ctx, captures, _data| async move {
//!             Ok(ctx.connection.user_data("userId")
//!                 == captures.first().map(|c| json!(c)))
//!         }),
//!     )
//!     .method("math.add", method_fn(|_ctx, payload| async move {
//!         let p = payload.unwrap_or_default();
//!         Ok(json!(p["a"].as_i64().unwrap_or(0) + p["b"].as_i64().unwrap_or(0)))
//!     }))
//!     .start()?;
//!
//! server.broadcast("chat:general", Some(json!({"text": "hello"})));
//! ```
//!
//! ## Built-in RPC methods
//!
//! - `helios.subscribe` / `helios.unsubscribe` — room membership
//! - `session.refresh` — re-mint the session token (rate limited to once
//!   per half TTL)
//!
//! ## Wire protocol
//!
//! See [`helios_protocol`] for the message format and topic pattern
//! semantics.

pub mod builder;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod health;
pub mod registry;
pub mod rooms;
pub mod server;
pub mod token;
pub mod transport;

// ════════════════════════════════════════════════════════════════════
// Public re-exports
// ════════════════════════════════════════════════════════════════════

pub use builder::HeliosServerBuilder;
pub use config::{
    HealthCheckConfig, ParseMode, ServerConfig, SessionRecoveryConfig, MIN_SECRET_LEN,
};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use dispatch::{method_fn, topic_fn, HandlerContext, MethodHandler, TopicHandler};
pub use error::{
    ConfigError, DeclareError, HandlerError, ProtocolError, RequestError, SendError,
    SubscribeError, TokenError,
};
pub use events::{RawPayload, ServerEvent, ServerEvents};
pub use registry::ConnectionRegistry;
pub use rooms::{validator_fn, BroadcastOutcome, RoomBroker, RoomKind, RoomValidator};
pub use server::{HeliosServer, InboundFilter, RawMessage, SESSION_TOKEN_PARAM};
pub use token::{Session, TokenCodec};
pub use transport::{Frame, TransportHandle, TransportId};

pub use helios_protocol::{match_topic, specificity, topic_matches, Message};
