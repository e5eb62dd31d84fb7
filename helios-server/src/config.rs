//! Server configuration.
//!
//! All knobs carry the defaults documented on their fields; a
//! default-constructed [`ServerConfig`] runs with strict parsing, health
//! checking enabled, and session recovery disabled.

use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;

/// Minimum entropy required of the session-recovery signing secret.
pub const MIN_SECRET_LEN: usize = 32;

/// How the coordinator reacts to frames that fail to parse as protocol
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Propagate the parse error to the transport adapter.
    #[default]
    Strict,
    /// Route unparseable text frames as JSON when they parse as JSON,
    /// else as text; binary frames as binary.
    Permissive,
    /// Like permissive, without the JSON attempt.
    Passthrough,
}

/// Session recovery: signed tokens let a client rebind its prior
/// [`Connection`](crate::connection::Connection) after a transport drop.
#[derive(Clone)]
pub struct SessionRecoveryConfig {
    /// HMAC signing key. Must be at least [`MIN_SECRET_LEN`] bytes.
    pub secret: Vec<u8>,
    /// How long a disconnected session stays recoverable. Default 300 s.
    pub ttl: Duration,
    /// Cadence of the expired-session sweep. Default 60 s.
    pub sweep_interval: Duration,
}

impl SessionRecoveryConfig {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::SecretTooShort {
                len: self.secret.len(),
                min: MIN_SECRET_LEN,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for SessionRecoveryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecoveryConfig")
            .field("secret", &"[redacted]")
            .field("ttl", &self.ttl)
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

/// Per-connection ping/pong liveness probing.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Default `true`.
    pub enabled: bool,
    /// Ping cadence. Default 30 s.
    pub interval: Duration,
    /// How long to wait for a pong before counting it missed. Default 10 s.
    pub timeout: Duration,
    /// Missed pongs tolerated before the transport is closed. Default 2.
    pub max_missed: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            max_missed: 2,
        }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Default per-request deadline. Default 5 s.
    pub request_timeout: Duration,
    /// See [`ParseMode`]. Default strict.
    pub parse_mode: ParseMode,
    /// `None` disables session recovery entirely.
    pub session_recovery: Option<SessionRecoveryConfig>,
    pub health_check: HealthCheckConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(5000),
            parse_mode: ParseMode::default(),
            session_recovery: None,
            health_check: HealthCheckConfig::default(),
        }
    }
}

impl ServerConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if let Some(recovery) = &self.session_recovery {
            recovery.validate()?;
        }
        Ok(())
    }
}
