//! Signed, expiring session tokens.
//!
//! A token is `base64url(payload) "." base64url(hmac_sha256(payload))`
//! where the payload is the JSON-encoded [`Session`]. The codec is
//! stateless and deterministic in its inputs; nothing about a session is
//! stored server-side beyond the `Connection` it names.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::MIN_SECRET_LEN;
use crate::error::{ConfigError, TokenError};

type HmacSha256 = Hmac<Sha256>;

/// The recoverable identity carried inside a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub connection_id: u64,
    #[serde(default)]
    pub metadata: Value,
    /// Milliseconds since the Unix epoch.
    pub issued_at: u64,
    pub expires_at: u64,
}

/// Mints and verifies session tokens.
#[derive(Clone)]
pub struct TokenCodec {
    secret: Vec<u8>,
}

impl TokenCodec {
    /// Requires at least [`MIN_SECRET_LEN`] bytes of key material.
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, ConfigError> {
        let secret = secret.into();
        if secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::SecretTooShort {
                len: secret.len(),
                min: MIN_SECRET_LEN,
            });
        }
        Ok(Self { secret })
    }

    /// Mints a token for a new session.
    pub fn mint(
        &self,
        session_id: impl Into<String>,
        connection_id: u64,
        metadata: Value,
        ttl: Duration,
    ) -> String {
        let now = now_ms();
        self.encode(&Session {
            session_id: session_id.into(),
            connection_id,
            metadata,
            issued_at: now,
            expires_at: now + ttl.as_millis() as u64,
        })
    }

    /// Re-mints a token with fresh issuance and expiry. The session id,
    /// connection id, and metadata are preserved.
    pub fn refresh(&self, session: &Session, ttl: Duration) -> String {
        let now = now_ms();
        self.encode(&Session {
            issued_at: now,
            expires_at: now + ttl.as_millis() as u64,
            ..session.clone()
        })
    }

    /// Verifies signature and expiry, returning the session on success.
    pub fn verify(&self, token: &str) -> Result<Session, TokenError> {
        let (payload_b64, sig_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;

        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = self.mac();
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&sig)
            .map_err(|_| TokenError::InvalidSignature)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let session: Session =
            serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;

        if now_ms() >= session.expires_at {
            return Err(TokenError::Expired);
        }
        Ok(session)
    }

    fn encode(&self, session: &Session) -> String {
        let payload = serde_json::to_vec(session).expect("session serializes to JSON");
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
        let mut mac = self.mac();
        mac.update(payload_b64.as_bytes());
        let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{payload_b64}.{sig_b64}")
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length")
    }
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("secret", &"[redacted]")
            .finish()
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Derives a fresh, hard-to-guess session id.
pub(crate) fn generate_session_id(connection_id: u64) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let mut hasher = Sha256::new();
    hasher.update(connection_id.to_le_bytes());
    hasher.update(now_ms().to_le_bytes());
    hasher.update(COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    let digest = hasher.finalize();
    URL_SAFE_NO_PAD.encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new(vec![7u8; 32]).unwrap()
    }

    #[test]
    fn rejects_short_secret() {
        assert!(TokenCodec::new(b"short".to_vec()).is_err());
    }

    #[test]
    fn mint_verify_roundtrip() {
        let codec = codec();
        let token = codec.mint(
            "sess-1",
            42,
            serde_json::json!({"role": "admin"}),
            Duration::from_secs(60),
        );
        let session = codec.verify(&token).unwrap();
        assert_eq!(session.session_id, "sess-1");
        assert_eq!(session.connection_id, 42);
        assert_eq!(session.metadata["role"], "admin");
        assert!(session.expires_at > session.issued_at);
    }

    #[test]
    fn verify_fails_with_wrong_secret() {
        let token = codec().mint("sess-1", 1, Value::Null, Duration::from_secs(60));
        let other = TokenCodec::new(vec![9u8; 32]).unwrap();
        assert_eq!(other.verify(&token), Err(TokenError::InvalidSignature));
    }

    #[test]
    fn verify_fails_on_tampered_payload() {
        let codec = codec();
        let token = codec.mint("sess-1", 1, Value::Null, Duration::from_secs(60));
        let (payload, sig) = token.split_once('.').unwrap();
        let forged_session = Session {
            session_id: "sess-other".into(),
            connection_id: 1,
            metadata: Value::Null,
            issued_at: now_ms(),
            expires_at: now_ms() + 60_000,
        };
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_session).unwrap());
        assert_ne!(payload, forged_payload);
        let forged = format!("{forged_payload}.{sig}");
        assert_eq!(codec.verify(&forged), Err(TokenError::InvalidSignature));
    }

    #[test]
    fn verify_fails_on_garbage() {
        assert_eq!(codec().verify("not-a-token"), Err(TokenError::Malformed));
        assert_eq!(codec().verify("a.b"), Err(TokenError::Malformed));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let codec = codec();
        let token = codec.mint("sess-1", 1, Value::Null, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(codec.verify(&token), Err(TokenError::Expired));
    }

    #[test]
    fn refresh_preserves_identity() {
        let codec = codec();
        let token = codec.mint(
            "sess-1",
            7,
            serde_json::json!({"k": "v"}),
            Duration::from_secs(60),
        );
        let session = codec.verify(&token).unwrap();
        let refreshed = codec.refresh(&session, Duration::from_secs(60));
        let session2 = codec.verify(&refreshed).unwrap();
        assert_eq!(session2.session_id, session.session_id);
        assert_eq!(session2.connection_id, session.connection_id);
        assert_eq!(session2.metadata, session.metadata);
        assert!(session2.issued_at >= session.issued_at);
    }

    #[test]
    fn session_ids_are_unique() {
        let a = generate_session_id(1);
        let b = generate_session_id(1);
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }
}
