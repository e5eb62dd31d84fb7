//! End-to-end session recovery: token issuance, rebinding after a
//! transport drop, expiry, and the refresh rate limit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use helios_protocol::Message;
use helios_server::{
    Connection, Frame, HeliosServer, HeliosServerBuilder, RawMessage, ServerEvent,
    SessionRecoveryConfig, TransportHandle, TransportId, SESSION_TOKEN_PARAM,
};

fn server_with_recovery(ttl: Duration) -> HeliosServer {
    HeliosServerBuilder::new()
        .without_health_check()
        .with_session_recovery(SessionRecoveryConfig::new(vec![42u8; 32]).with_ttl(ttl))
        .build()
        .unwrap()
}

fn connect(
    server: &HeliosServer,
    query: &HashMap<String, String>,
) -> (Arc<Connection>, TransportId, mpsc::Receiver<Frame>) {
    let (handle, rx) = TransportHandle::channel(64);
    let transport = handle.id();
    let conn = server.handle_open(handle, query);
    (conn, transport, rx)
}

fn token_query(token: &str) -> HashMap<String, String> {
    let mut query = HashMap::new();
    query.insert(SESSION_TOKEN_PARAM.to_string(), token.to_string());
    query
}

/// Reads frames until a wire event arrives, returning its topic/payload.
async fn next_event(rx: &mut mpsc::Receiver<Frame>) -> (String, Option<Value>) {
    loop {
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("transport closed");
        if let Frame::Text(text) = frame {
            if let Ok(Message::Event { topic, payload, .. }) = serde_json::from_str(&text) {
                return (topic, payload);
            }
        }
    }
}

/// Reads frames until a response arrives, returning its payload.
async fn next_response(rx: &mut mpsc::Receiver<Frame>) -> Option<Value> {
    loop {
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("transport closed");
        if let Frame::Text(text) = frame {
            if let Ok(Message::Response { payload, .. }) = serde_json::from_str(&text) {
                return payload;
            }
        }
    }
}

#[tokio::test]
async fn fresh_connection_receives_session_created() {
    let server = server_with_recovery(Duration::from_secs(10));
    let (conn, _transport, mut rx) = connect(&server, &HashMap::new());

    let (topic, payload) = next_event(&mut rx).await;
    assert_eq!(topic, "session:created");
    let payload = payload.unwrap();
    assert!(!payload["token"].as_str().unwrap().is_empty());
    assert_eq!(payload["ttl"], 10_000);
    assert!(conn.session_id().is_some());
}

#[tokio::test]
async fn session_recovers_within_ttl_with_state_intact() {
    let server = server_with_recovery(Duration::from_secs(10));
    let (conn, transport, mut rx) = connect(&server, &HashMap::new());

    let (_, payload) = next_event(&mut rx).await;
    let token = payload.unwrap()["token"].as_str().unwrap().to_string();
    let session_id = conn.session_id().unwrap();

    // A handler stashes some state, then the transport drops.
    conn.set_user_data("k", json!("v"));
    server.handle_close(transport, 1001, "going away");
    assert_eq!(server.registry().connection_count(), 0);
    assert_eq!(server.registry().disconnected_count(), 1);

    // Reconnect with the token on the upgrade URL.
    let mut bus = server.events().subscribe();
    let (recovered, _transport2, mut rx2) = connect(&server, &token_query(&token));

    assert_eq!(recovered.id(), conn.id());
    assert_eq!(recovered.user_data("k"), Some(json!("v")));
    assert_eq!(recovered.session_id(), Some(session_id.clone()));
    assert_eq!(server.registry().disconnected_count(), 0);

    let (topic, payload) = next_event(&mut rx2).await;
    assert_eq!(topic, "session:recovered");
    assert_eq!(payload.unwrap()["sessionId"], json!(session_id));

    let mut saw_recovered = false;
    while let Ok(event) = bus.try_recv() {
        if matches!(event, ServerEvent::SessionRecovered { .. }) {
            saw_recovered = true;
        }
    }
    assert!(saw_recovered);
}

#[tokio::test]
async fn pending_request_survives_reconnect_and_resolves() {
    let server = server_with_recovery(Duration::from_secs(10));
    let (conn, transport, mut rx) = connect(&server, &HashMap::new());
    let (_, payload) = next_event(&mut rx).await;
    let token = payload.unwrap()["token"].as_str().unwrap().to_string();

    let requester = conn.clone();
    let waiter = tokio::spawn(async move {
        requester
            .request("peer.fetch", None, Some(Duration::from_secs(5)))
            .await
    });

    // Learn the request id from the outgoing frame, then drop the
    // transport before any response arrives.
    let request_id = loop {
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if let Frame::Text(text) = frame {
            if let Ok(Message::Request { id, .. }) = serde_json::from_str(&text) {
                break id;
            }
        }
    };
    server.handle_close(transport, 1006, "");
    assert_eq!(conn.pending_request_count(), 1);

    // Reconnect and answer on the new transport.
    let (recovered, transport2, _rx2) = connect(&server, &token_query(&token));
    assert_eq!(recovered.id(), conn.id());

    let response =
        serde_json::to_string(&Message::response(request_id, Some(json!("late")))).unwrap();
    server
        .handle_message(transport2, RawMessage::Text(response))
        .await
        .unwrap();

    assert_eq!(waiter.await.unwrap(), Ok(Some(json!("late"))));
}

#[tokio::test]
async fn expired_token_downgrades_to_fresh_session() {
    let server = server_with_recovery(Duration::from_millis(100));
    let (conn, transport, mut rx) = connect(&server, &HashMap::new());

    let (_, payload) = next_event(&mut rx).await;
    let token = payload.unwrap()["token"].as_str().unwrap().to_string();
    server.handle_close(transport, 1001, "going away");

    tokio::time::sleep(Duration::from_millis(200)).await;

    let (fresh, _transport2, mut rx2) = connect(&server, &token_query(&token));
    assert_ne!(fresh.id(), conn.id());

    let (topic, payload) = next_event(&mut rx2).await;
    assert_eq!(topic, "session:recovery-failed");
    assert!(payload.unwrap()["reason"]
        .as_str()
        .unwrap()
        .contains("expired"));

    let (topic, _) = next_event(&mut rx2).await;
    assert_eq!(topic, "session:created");
}

#[tokio::test]
async fn garbage_token_downgrades_to_fresh_session() {
    let server = server_with_recovery(Duration::from_secs(10));
    let (conn, _transport, mut rx) = connect(&server, &token_query("not.a.token"));

    let (topic, _) = next_event(&mut rx).await;
    assert_eq!(topic, "session:recovery-failed");
    let (topic, _) = next_event(&mut rx).await;
    assert_eq!(topic, "session:created");
    assert!(conn.session_id().is_some());
}

#[tokio::test]
async fn refresh_is_rate_limited_then_succeeds() {
    let server = server_with_recovery(Duration::from_millis(100));
    let (conn, transport, mut rx) = connect(&server, &HashMap::new());
    let (_, payload) = next_event(&mut rx).await;
    let first_token = payload.unwrap()["token"].as_str().unwrap().to_string();

    let refresh = serde_json::to_string(&Message::request("session.refresh", None)).unwrap();

    // Immediately after creation: rate limited with a wait hint.
    server
        .handle_message(transport, RawMessage::Text(refresh.clone()))
        .await
        .unwrap();
    let payload = next_response(&mut rx).await.unwrap();
    assert_eq!(payload["error"], "Rate limit exceeded");
    assert!(payload["waitMs"].as_u64().unwrap() > 0);

    // After half the TTL the refresh goes through, same session id.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let refresh = serde_json::to_string(&Message::request("session.refresh", None)).unwrap();
    server
        .handle_message(transport, RawMessage::Text(refresh))
        .await
        .unwrap();

    // session:refreshed wire event precedes the response.
    let (topic, refreshed) = next_event(&mut rx).await;
    assert_eq!(topic, "session:refreshed");
    let refreshed = refreshed.unwrap();
    assert_eq!(refreshed["sessionId"], json!(conn.session_id().unwrap()));

    let payload = next_response(&mut rx).await.unwrap();
    assert_eq!(payload["success"], true);
    assert_eq!(payload["sessionId"], json!(conn.session_id().unwrap()));
    assert_ne!(payload["token"].as_str().unwrap(), first_token);
}

#[tokio::test]
async fn sweep_runs_final_cleanup_on_expired_sessions() {
    let server = HeliosServerBuilder::new()
        .without_health_check()
        .public_room("chat:general")
        .with_session_recovery(
            SessionRecoveryConfig::new(vec![9u8; 32])
                .with_ttl(Duration::from_millis(50))
                .with_sweep_interval(Duration::from_millis(40)),
        )
        .build()
        .unwrap();
    let (conn, transport, mut rx) = connect(&server, &HashMap::new());
    let _ = next_event(&mut rx).await; // session:created

    server
        .rooms()
        .subscribe(&conn, "chat:general", None)
        .await
        .unwrap();
    conn.set_user_data("k", json!("v"));
    let requester = conn.clone();
    let waiter = tokio::spawn(async move {
        requester
            .request("never", None, Some(Duration::from_secs(5)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(conn.pending_request_count(), 1);

    // Disconnect and let the recovery window lapse past a sweep tick.
    server.handle_close(transport, 1001, "going away");
    assert_eq!(server.registry().disconnected_count(), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(server.registry().disconnected_count(), 0);
    assert_eq!(conn.pending_request_count(), 0);
    assert!(conn.subscriptions().is_empty());
    assert_eq!(conn.user_data("k"), None);
    assert_eq!(
        waiter.await.unwrap(),
        Err(helios_server::RequestError::ConnectionClosed)
    );
}

#[tokio::test]
async fn refresh_without_session_reports_no_active_session() {
    // Recovery disabled: session.refresh exists but has nothing to mint.
    let server = HeliosServerBuilder::new().without_health_check().build().unwrap();
    let (_conn, transport, mut rx) = connect(&server, &HashMap::new());

    let refresh = serde_json::to_string(&Message::request("session.refresh", None)).unwrap();
    server
        .handle_message(transport, RawMessage::Text(refresh))
        .await
        .unwrap();
    let payload = next_response(&mut rx).await.unwrap();
    assert_eq!(payload["error"], "No active session");
}
