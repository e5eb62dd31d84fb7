//! Rooms end to end: validator-gated subscription over the built-in RPC
//! methods, and pattern broadcast reaching only admitted subscribers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use helios_protocol::Message;
use helios_server::{
    validator_fn, BroadcastOutcome, Connection, Frame, HeliosServer, HeliosServerBuilder,
    RawMessage, TransportHandle, TransportId,
};

fn room_server() -> HeliosServer {
    HeliosServerBuilder::new()
        .without_health_check()
        .public_room("chat:general")
        .protected_room(
            "user:*",
            validator_fn(|ctx, captures, _data| async move {
                let owner = ctx
                    .connection
                    .user_data("userId")
                    .and_then(|v| v.as_str().map(String::from));
                Ok(owner == captures.first().cloned())
            }),
        )
        .build()
        .unwrap()
}

fn connect(server: &HeliosServer) -> (Arc<Connection>, TransportId, mpsc::Receiver<Frame>) {
    let (handle, rx) = TransportHandle::channel(64);
    let transport = handle.id();
    let conn = server.handle_open(handle, &HashMap::new());
    (conn, transport, rx)
}

async fn rpc(
    server: &HeliosServer,
    transport: TransportId,
    rx: &mut mpsc::Receiver<Frame>,
    method: &str,
    payload: Value,
) -> Value {
    let request = serde_json::to_string(&Message::request(method, Some(payload))).unwrap();
    server
        .handle_message(transport, RawMessage::Text(request))
        .await
        .unwrap();
    loop {
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for response")
            .expect("transport closed");
        if let Frame::Text(text) = frame {
            if let Ok(Message::Response { payload, .. }) = serde_json::from_str(&text) {
                return payload.unwrap_or(Value::Null);
            }
        }
    }
}

#[tokio::test]
async fn owner_subscribes_stranger_is_denied_broadcast_reaches_owner() {
    let server = room_server();

    let (x, transport_x, mut rx_x) = connect(&server);
    x.set_user_data("userId", json!("123"));
    let (y, transport_y, mut rx_y) = connect(&server);
    y.set_user_data("userId", json!("456"));

    let ok = rpc(
        &server,
        transport_x,
        &mut rx_x,
        "helios.subscribe",
        json!({"topic": "user:123"}),
    )
    .await;
    assert_eq!(ok["ok"], true);

    let denied = rpc(
        &server,
        transport_y,
        &mut rx_y,
        "helios.subscribe",
        json!({"topic": "user:123"}),
    )
    .await;
    assert_eq!(denied["ok"], false);
    assert_eq!(denied["error"], "Permission denied");

    let outcome = server.broadcast("user:*", Some(json!({"hi": 1})));
    assert_eq!(outcome, BroadcastOutcome { targets: 1, sent: 1 });

    // X receives the event with the pattern as its topic, verbatim.
    let frame = timeout(Duration::from_secs(1), rx_x.recv())
        .await
        .unwrap()
        .unwrap();
    let Frame::Text(text) = frame else {
        panic!("expected event frame");
    };
    let Message::Event { topic, payload, .. } = serde_json::from_str(&text).unwrap() else {
        panic!("expected event message");
    };
    assert_eq!(topic, "user:*");
    assert_eq!(payload.unwrap()["hi"], 1);

    // Y got nothing beyond its denied response.
    assert!(rx_y.try_recv().is_err());
}

#[tokio::test]
async fn undeclared_room_is_denied_over_rpc() {
    let server = room_server();
    let (_conn, transport, mut rx) = connect(&server);

    let result = rpc(
        &server,
        transport,
        &mut rx,
        "helios.subscribe",
        json!({"topic": "nope:topic"}),
    )
    .await;
    assert_eq!(result["ok"], false);
    assert_eq!(result["error"], "Room not declared (deny by default)");
}

#[tokio::test]
async fn unsubscribe_over_rpc_stops_delivery() {
    let server = room_server();
    let (_conn, transport, mut rx) = connect(&server);

    let ok = rpc(
        &server,
        transport,
        &mut rx,
        "helios.subscribe",
        json!({"topic": "chat:general"}),
    )
    .await;
    assert_eq!(ok["ok"], true);

    let removed = rpc(
        &server,
        transport,
        &mut rx,
        "helios.unsubscribe",
        json!({"topic": "chat:general"}),
    )
    .await;
    assert_eq!(removed["ok"], true);

    let outcome = server.broadcast("chat:general", Some(json!({"text": "hello"})));
    assert_eq!(outcome, BroadcastOutcome { targets: 0, sent: 0 });
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn broadcast_counts_closed_subscribers_as_targets_only() {
    use helios_server::SessionRecoveryConfig;

    // With recovery enabled, a dropped subscriber keeps its subscriptions
    // while disconnected: still a target, no longer sendable.
    let server = HeliosServerBuilder::new()
        .without_health_check()
        .with_session_recovery(SessionRecoveryConfig::new(vec![3u8; 32]))
        .public_room("chat:general")
        .build()
        .unwrap();
    let (_a, transport_a, mut rx_a) = connect(&server);
    let (_b, transport_b, mut rx_b) = connect(&server);

    let ok = rpc(
        &server,
        transport_a,
        &mut rx_a,
        "helios.subscribe",
        json!({"topic": "chat:general"}),
    )
    .await;
    assert_eq!(ok["ok"], true);
    let ok = rpc(
        &server,
        transport_b,
        &mut rx_b,
        "helios.subscribe",
        json!({"topic": "chat:general"}),
    )
    .await;
    assert_eq!(ok["ok"], true);

    server.handle_close(transport_a, 1001, "going away");

    let outcome = server.broadcast("chat:general", Some(json!({"n": 1})));
    assert_eq!(outcome, BroadcastOutcome { targets: 2, sent: 1 });
}

#[tokio::test]
async fn subscribe_data_reaches_validator() {
    let server = HeliosServerBuilder::new()
        .without_health_check()
        .protected_room(
            "vault:*",
            validator_fn(|_ctx, _captures, data| async move {
                Ok(data.and_then(|d| d["passphrase"].as_str().map(String::from))
                    == Some("sesame".to_string()))
            }),
        )
        .build()
        .unwrap();
    let (_conn, transport, mut rx) = connect(&server);

    let denied = rpc(
        &server,
        transport,
        &mut rx,
        "helios.subscribe",
        json!({"topic": "vault:1"}),
    )
    .await;
    assert_eq!(denied["ok"], false);

    let ok = rpc(
        &server,
        transport,
        &mut rx,
        "helios.subscribe",
        json!({"topic": "vault:1", "data": {"passphrase": "sesame"}}),
    )
    .await;
    assert_eq!(ok["ok"], true);
}
