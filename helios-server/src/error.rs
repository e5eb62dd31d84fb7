//! Error types for the server crate.
//!
//! Synchronous validation failures raise [`DeclareError`] / [`ConfigError`]
//! at the call site. Per-operation outcomes (send, subscribe, refresh) are
//! structured results. Request/response settlement uses [`RequestError`]
//! through the pending-request waiter.

use thiserror::Error;

/// Failure to write a message to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The connection is not in the OPEN state.
    #[error("connection closed")]
    ConnectionClosed,

    /// The transport reported it cannot accept the frame right now.
    /// The message was not queued; the caller decides whether to retry.
    #[error("transport not writable")]
    NotWritable,

    /// The message could not be serialized to the wire format.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// How an outstanding request failed to produce a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The deadline elapsed while the connection was still live.
    #[error("request timed out")]
    Timeout,

    /// The connection closed (or was closing) before a response arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// The request could not be written in the first place.
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Invalid room declaration, raised synchronously by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeclareError {
    #[error("room pattern must be a non-empty string")]
    EmptyPattern,

    /// Public rooms are exact topics; `*` and `+` are reserved for
    /// protected patterns.
    #[error("public room '{0}' must not contain '*' or '+'")]
    WildcardInPublicRoom(String),

    #[error("protected room '{0}' requires a validator")]
    MissingValidator(String),
}

/// Why a subscription attempt was denied. Returned as a structured result,
/// never raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error("Room not declared (deny by default)")]
    RoomUndeclared,

    #[error("Permission denied")]
    PermissionDenied,

    /// The validator itself failed; details are logged server-side.
    #[error("Validator error")]
    ValidatorError,
}

/// Session token verification failure. During recovery these downgrade to
/// a fresh session rather than rejecting the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,

    #[error("token signature mismatch")]
    InvalidSignature,

    #[error("session token expired")]
    Expired,
}

/// Wire-parse failure, handled according to the configured
/// [`ParseMode`](crate::config::ParseMode).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid message: {0}")]
    Parse(String),
}

/// Invalid server configuration, raised when building the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("session recovery secret must be at least {min} bytes, got {len}")]
    SecretTooShort { len: usize, min: usize },

    #[error(transparent)]
    Declare(#[from] DeclareError),
}

/// Failure reported by a method handler or validator. Captured and encoded
/// into an error-shaped response payload; never propagated past the
/// coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}
