//! # helios-protocol
//!
//! Shared wire protocol types for the Helios WebSocket server ecosystem.
//!
//! This crate is `no_std + alloc` compatible so it can be used by:
//!
//! - **`helios-server`** — the server side (Axum/Tokio)
//! - **Future native/browser clients** — anything that speaks the wire format
//!
//! # Wire Protocol
//!
//! All messages are JSON-encoded with a `"type"` discriminant tag. Three
//! genres are multiplexed over one connection:
//!
//! - `request` — correlated RPC call, expects a `response` with a matching
//!   `request_id`
//! - `response` — the reply to a `request`
//! - `event` — fire-and-forget, topic-addressed push (either direction)
//!
//! Every outgoing message carries a non-empty, process-unique `id`; the
//! constructors on [`Message`] mint them.
//!
//! # Topic Patterns
//!
//! Topics are `:`-delimited. [`match_topic`] matches a concrete topic
//! against a pattern, producing one capture per wildcard token:
//!
//! | Token | Semantics                        |
//! |-------|----------------------------------|
//! | `*`   | exactly one segment              |
//! | `**`  | zero or more segments            |
//! | `++`  | one or more segments             |
//! | other | matches itself                   |
//!
//! [`specificity`] orders patterns from most to least specific so a broker
//! can select the best-matching declaration first.

#![no_std]

extern crate alloc;

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Separator between topic segments.
pub const TOPIC_DELIMITER: char = ':';

// ════════════════════════════════════════════════════════════════════
// Messages
// ════════════════════════════════════════════════════════════════════

/// A message travelling over the transport, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Correlated RPC call. The peer answers with a `response` whose
    /// `request_id` equals this message's `id`.
    Request {
        id: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },

    /// Reply to a `request`.
    Response {
        id: String,
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },

    /// Fire-and-forget, topic-addressed push.
    Event {
        id: String,
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Mints a process-unique, non-empty message id.
pub fn next_message_id() -> String {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed).to_string()
}

impl Message {
    /// Builds an outgoing request with a freshly minted id.
    pub fn request(method: impl Into<String>, payload: Option<Value>) -> Self {
        Message::Request {
            id: next_message_id(),
            method: method.into(),
            payload,
        }
    }

    /// Builds the response to the request with the given id.
    pub fn response(request_id: impl Into<String>, payload: Option<Value>) -> Self {
        Message::Response {
            id: next_message_id(),
            request_id: request_id.into(),
            payload,
        }
    }

    /// Builds an outgoing event addressed to `topic`.
    pub fn event(topic: impl Into<String>, payload: Option<Value>) -> Self {
        Message::Event {
            id: next_message_id(),
            topic: topic.into(),
            payload,
        }
    }

    /// The message's own id.
    pub fn id(&self) -> &str {
        match self {
            Message::Request { id, .. }
            | Message::Response { id, .. }
            | Message::Event { id, .. } => id,
        }
    }

    /// Short genre name, used for pre-dispatch signal naming and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request { .. } => "request",
            Message::Response { .. } => "response",
            Message::Event { .. } => "event",
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// Topic matching
// ════════════════════════════════════════════════════════════════════

/// Matches `topic` against `pattern`, returning the ordered captures when
/// it matches.
///
/// Captures are produced left to right, one per wildcard token. `*`
/// captures its single segment; `**` and `++` capture the consumed
/// segments joined with `:` (the `**` capture is empty when it matches
/// zero segments).
///
/// ```
/// use helios_protocol::match_topic;
///
/// assert_eq!(match_topic("user:123", "user:*"), Some(vec!["123".into()]));
/// assert_eq!(match_topic("a:b:c", "a:**"), Some(vec!["b:c".into()]));
/// assert_eq!(match_topic("a:b", "x:*"), None);
/// ```
pub fn match_topic(topic: &str, pattern: &str) -> Option<Vec<String>> {
    // Fast path: exact match, no captures
    if topic == pattern && !has_wildcard_token(pattern) {
        return Some(Vec::new());
    }

    let topic_segs: Vec<&str> = topic.split(TOPIC_DELIMITER).collect();
    let pattern_segs: Vec<&str> = pattern.split(TOPIC_DELIMITER).collect();

    let mut captures = Vec::new();
    if match_segments(&topic_segs, &pattern_segs, &mut captures) {
        Some(captures)
    } else {
        None
    }
}

/// Returns `true` if `topic` matches `pattern`, discarding captures.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    match_topic(topic, pattern).is_some()
}

fn match_segments(topic: &[&str], pattern: &[&str], captures: &mut Vec<String>) -> bool {
    let Some((&head, rest)) = pattern.split_first() else {
        return topic.is_empty();
    };

    match head {
        "*" => {
            let Some((&seg, topic_rest)) = topic.split_first() else {
                return false;
            };
            captures.push(seg.to_string());
            if match_segments(topic_rest, rest, captures) {
                return true;
            }
            captures.pop();
            false
        }
        "**" | "++" => {
            let min = if head == "++" { 1 } else { 0 };
            // Shortest consumption first; backtrack until the tail matches.
            for take in min..=topic.len() {
                captures.push(topic[..take].join(":"));
                if match_segments(&topic[take..], rest, captures) {
                    return true;
                }
                captures.pop();
            }
            false
        }
        literal => {
            let Some((&seg, topic_rest)) = topic.split_first() else {
                return false;
            };
            seg == literal && match_segments(topic_rest, rest, captures)
        }
    }
}

/// Returns `true` if any token of `pattern` is a wildcard.
pub fn has_wildcard_token(pattern: &str) -> bool {
    pattern
        .split(TOPIC_DELIMITER)
        .any(|t| matches!(t, "*" | "**" | "++"))
}

/// Scores `pattern` so declarations can be ordered most-specific first.
///
/// Each token contributes: literal 10, `*` 5, `++` 3, `**` 1. Exact
/// patterns always outrank single-segment wildcards, which outrank
/// multi-segment wildcards of the same length. Ties between equal scores
/// are broken by declaration order at the broker.
pub fn specificity(pattern: &str) -> u32 {
    pattern
        .split(TOPIC_DELIMITER)
        .map(|t| match t {
            "**" => 1,
            "++" => 3,
            "*" => 5,
            _ => 10,
        })
        .sum()
}

// ════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec;

    #[test]
    fn exact_match() {
        assert_eq!(match_topic("a:b:c", "a:b:c"), Some(vec![]));
        assert_eq!(match_topic("a:b:c", "a:b:d"), None);
        assert_eq!(match_topic("a:b", "a:b:c"), None);
    }

    #[test]
    fn star_matches_one_segment() {
        assert_eq!(match_topic("user:123", "user:*"), Some(vec!["123".to_string()]));
        assert_eq!(match_topic("user:123:posts", "user:*:posts"), Some(vec!["123".to_string()]));
        assert_eq!(match_topic("user", "user:*"), None);
        assert_eq!(match_topic("user:1:2", "user:*"), None);
    }

    #[test]
    fn double_star_matches_zero_or_more_trailing() {
        assert_eq!(match_topic("a", "a:**"), Some(vec!["".to_string()]));
        assert_eq!(match_topic("a:b", "a:**"), Some(vec!["b".to_string()]));
        assert_eq!(match_topic("a:b:c:d", "a:**"), Some(vec!["b:c:d".to_string()]));
        assert_eq!(match_topic("x:b", "a:**"), None);
    }

    #[test]
    fn plus_plus_requires_at_least_one_segment() {
        assert_eq!(match_topic("a", "a:++"), None);
        assert_eq!(match_topic("a:b", "a:++"), Some(vec!["b".to_string()]));
        assert_eq!(match_topic("a:b:c", "a:++"), Some(vec!["b:c".to_string()]));
    }

    #[test]
    fn multi_wildcard_backtracks_mid_pattern() {
        assert_eq!(
            match_topic("a:x:y:z:c", "a:++:c"),
            Some(vec!["x:y:z".to_string()])
        );
        assert_eq!(match_topic("a:c", "a:**:c"), Some(vec!["".to_string()]));
        assert_eq!(match_topic("a:b:c", "a:**:c"), Some(vec!["b".to_string()]));
    }

    #[test]
    fn captures_are_left_to_right() {
        assert_eq!(
            match_topic("org:42:team:7", "org:*:team:*"),
            Some(vec!["42".to_string(), "7".to_string()])
        );
    }

    #[test]
    fn specificity_orders_exact_over_wildcards() {
        assert!(specificity("a:b:c") > specificity("a:b:*"));
        assert!(specificity("a:b:*") > specificity("a:b:++"));
        assert!(specificity("a:b:++") > specificity("a:b:**"));
        assert!(specificity("a:*:c") > specificity("a:**"));
    }

    #[test]
    fn wildcard_detection() {
        assert!(has_wildcard_token("user:*"));
        assert!(has_wildcard_token("a:**"));
        assert!(has_wildcard_token("a:++:b"));
        assert!(!has_wildcard_token("chat:general"));
        // '*' embedded in a literal segment is not a wildcard token
        assert!(!has_wildcard_token("a*b:c"));
    }

    #[test]
    fn message_ids_are_unique_and_non_empty() {
        let a = Message::request("echo", None);
        let b = Message::request("echo", None);
        assert!(!a.id().is_empty());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn serde_request_roundtrip() {
        let msg = Message::request("math.add", Some(serde_json::json!({"a": 1, "b": 2})));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"request\""));
        let parsed: Message = serde_json::from_str(&json).unwrap();
        match parsed {
            Message::Request { method, payload, .. } => {
                assert_eq!(method, "math.add");
                assert_eq!(payload.unwrap()["a"], 1);
            }
            _ => panic!("expected Request variant"),
        }
    }

    #[test]
    fn serde_response_correlates_by_request_id() {
        let req = Message::request("ping", None);
        let resp = Message::response(req.id(), Some(serde_json::json!("pong")));
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: Message = serde_json::from_str(&json).unwrap();
        match parsed {
            Message::Response { request_id, .. } => assert_eq!(request_id, req.id()),
            _ => panic!("expected Response variant"),
        }
    }

    #[test]
    fn serde_event_roundtrip() {
        let msg = Message::event("chat:general", Some(serde_json::json!({"text": "hi"})));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"event\""));
        let parsed: Message = serde_json::from_str(&json).unwrap();
        match parsed {
            Message::Event { topic, .. } => assert_eq!(topic, "chat:general"),
            _ => panic!("expected Event variant"),
        }
    }
}
