// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket integration tests for the relay.
//!
//! These tests spin up a real TCP listener, connect via WebSocket, and exercise
//! the full flow end-to-end. Each test binds to port 0 for isolation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::connect_async;
use tower::ServiceExt;

use common::{
    connect, expect_closed, recv_text, send_text, start_relay, try_recv_text, wait_for_active,
    wait_until, FailingRecordStore, RelayOptions, WsClient,
};
use stroke_relay::connection_registry::ConnectionRegistry;
use stroke_relay::fanout::FanoutOptions;
use stroke_relay::http::{create_router, HttpState};
use stroke_relay::metrics::RelayMetrics;
use stroke_relay::server::STATUS_TEXT;
use stroke_relay::storage::{MemoryRecordStore, RecordStore};

fn handshake_options() -> RelayOptions {
    RelayOptions {
        require_handshake: true,
        ack_registration: true,
        ..RelayOptions::default()
    }
}

/// Connects and completes the identity handshake.
async fn connect_as(url: &str, mac: &str) -> WsClient {
    let mut ws = connect(url).await;
    send_text(&mut ws, &json!({ "mac": mac }).to_string()).await;
    let ack: Value = serde_json::from_str(&recv_text(&mut ws).await).unwrap();
    assert_eq!(ack, json!({"status": "registered", "mac": mac}));
    ws
}

// ============================================================================
// Tests: Fan-out
// ============================================================================

#[tokio::test]
async fn test_message_relayed_to_others_not_sender() {
    let store = Arc::new(MemoryRecordStore::new());
    let relay = start_relay(store, RelayOptions::default()).await;

    let mut a = connect(&relay.url).await;
    let mut b = connect(&relay.url).await;
    let mut c = connect(&relay.url).await;
    wait_for_active(&relay.registry, 3).await;

    // Unusual spacing proves the bytes are relayed, not re-serialized
    let frame = r#"{ "x":1,  "y":2 ,"pressure":0.5}"#;
    send_text(&mut a, frame).await;

    assert_eq!(recv_text(&mut b).await, frame);
    assert_eq!(recv_text(&mut c).await, frame);
    assert!(try_recv_text(&mut a).await.is_none());
}

#[tokio::test]
async fn test_messages_from_one_sender_keep_order() {
    let store = Arc::new(MemoryRecordStore::new());
    let relay = start_relay(store, RelayOptions::default()).await;

    let mut a = connect(&relay.url).await;
    let mut b = connect(&relay.url).await;
    wait_for_active(&relay.registry, 2).await;

    for i in 0..10 {
        send_text(&mut a, &json!({"x": i, "y": 0}).to_string()).await;
    }
    for i in 0..10 {
        let received: Value = serde_json::from_str(&recv_text(&mut b).await).unwrap();
        assert_eq!(received["x"], json!(i));
    }
}

#[tokio::test]
async fn test_end_to_end_flat_sample_stored_and_queryable() {
    let store = Arc::new(MemoryRecordStore::new());
    let relay = start_relay(store.clone(), RelayOptions::default()).await;

    let mut a = connect(&relay.url).await;
    let mut b = connect(&relay.url).await;
    wait_for_active(&relay.registry, 2).await;

    let frame = r#"{"x":1,"y":2,"pressure":0.5}"#;
    send_text(&mut a, frame).await;

    assert_eq!(recv_text(&mut b).await, frame);
    assert!(try_recv_text(&mut b).await.is_none());

    wait_until(|| store.record_count().unwrap() == 1).await;

    let app = create_router(HttpState {
        store: store.clone(),
        registry: Arc::new(ConnectionRegistry::new()),
        metrics: RelayMetrics::new(),
        metrics_token: None,
    });

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/records").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let recent: Vec<Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(recent.len(), 1);
    let timestamp = recent[0]["timestamp"].as_u64().unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/records/{}", timestamp))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let mut doc: Value = serde_json::from_slice(&body).unwrap();
    let fields = doc.as_object_mut().unwrap();
    assert!(fields.remove("id").is_some());
    assert_eq!(fields.remove("timestamp"), Some(json!(timestamp)));
    assert_eq!(doc, json!({"x": 1, "y": 2, "pressure": 0.5}));
}

#[tokio::test]
async fn test_stroke_collection_without_attribution_roundtrips() {
    let store = Arc::new(MemoryRecordStore::new());
    let relay = start_relay(store.clone(), RelayOptions::default()).await;

    let mut a = connect(&relay.url).await;
    let mut b = connect(&relay.url).await;
    wait_for_active(&relay.registry, 2).await;

    let frame = r#"{"strokes":[{"stroke":0,"points":[{"x":0,"y":0},{"x":1,"y":1}]}]}"#;
    send_text(&mut a, frame).await;
    assert_eq!(recv_text(&mut b).await, frame);

    wait_until(|| store.record_count().unwrap() == 1).await;
    let record = &store.all()[0];
    let doc = record.to_document();
    assert_eq!(
        doc["strokes"],
        json!([{"stroke": 0, "points": [{"x": 0, "y": 0}, {"x": 1, "y": 1}]}])
    );
    assert!(doc.get("name").is_none());
    assert!(doc.get("personal_color").is_none());

    let recent = store.list_recent(10).unwrap();
    assert_eq!(recent[0].name, None);
}

#[tokio::test]
async fn test_attributed_strokes_are_stored_with_name() {
    let store = Arc::new(MemoryRecordStore::new());
    let relay = start_relay(store.clone(), RelayOptions::default()).await;

    let mut a = connect(&relay.url).await;
    wait_for_active(&relay.registry, 1).await;

    let frame = json!({
        "strokes": [{"stroke": 3, "points": [{"x": 5, "y": 6}]}],
        "name": "Ada",
        "personal_color": "#00ff00",
        "timestamp": 1_700_000_000_000u64
    })
    .to_string();
    send_text(&mut a, &frame).await;

    wait_until(|| store.record_count().unwrap() == 1).await;
    let record = store.get_by_timestamp(1_700_000_000_000).unwrap().unwrap();
    assert_eq!(record.payload.name(), Some("Ada"));
    assert_eq!(record.to_document()["personal_color"], json!("#00ff00"));
}

// ============================================================================
// Tests: Malformed input
// ============================================================================

#[tokio::test]
async fn test_malformed_message_not_relayed_or_stored() {
    let store = Arc::new(MemoryRecordStore::new());
    let relay = start_relay(store.clone(), RelayOptions::default()).await;

    let mut a = connect(&relay.url).await;
    let mut b = connect(&relay.url).await;
    wait_for_active(&relay.registry, 2).await;

    for bad in [
        "not json",
        r#"{"x":1,"#,
        "[1,2,3]",
        r#"{"x":"one","y":2}"#,
        r#"{"hello":"world"}"#,
    ] {
        send_text(&mut a, bad).await;
    }
    assert!(try_recv_text(&mut b).await.is_none());

    // Sender is still active
    let good = r#"{"x":1,"y":1}"#;
    send_text(&mut a, good).await;
    assert_eq!(recv_text(&mut b).await, good);

    wait_until(|| store.record_count().unwrap() == 1).await;
    assert_eq!(relay.metrics.messages_rejected.get(), 5);
}

#[tokio::test]
async fn test_odd_auxiliary_fields_do_not_block_valid_payload() {
    let store = Arc::new(MemoryRecordStore::new());
    let relay = start_relay(store.clone(), RelayOptions::default()).await;

    let mut a = connect(&relay.url).await;
    let mut b = connect(&relay.url).await;
    wait_for_active(&relay.registry, 2).await;

    let frames = [
        r#"{"x":1,"y":2,"timestamp":"2024-01-01T00:00:00Z"}"#,
        r#"{"x":1,"y":2,"timestamp":1.7e12}"#,
        r#"{"x":1,"y":2,"mac":42}"#,
    ];
    for frame in frames {
        send_text(&mut a, frame).await;
        assert_eq!(recv_text(&mut b).await, frame);
    }

    wait_until(|| store.record_count().unwrap() == 3).await;
    assert_eq!(relay.metrics.messages_rejected.get(), 0);
    for record in store.all() {
        // Server clock, not the unusable client value
        assert!(record.timestamp > 1_600_000_000_000);
        assert!(record.identity.is_none());
    }
}

// ============================================================================
// Tests: Identity handshake
// ============================================================================

#[tokio::test]
async fn test_duplicate_identity_rejected_first_unaffected() {
    let store = Arc::new(MemoryRecordStore::new());
    let relay = start_relay(store.clone(), handshake_options()).await;

    let mut first = connect_as(&relay.url, "AA:BB").await;

    let mut second = connect(&relay.url).await;
    send_text(
        &mut second,
        &json!({"mac": "AA:BB", "x": 9, "y": 9}).to_string(),
    )
    .await;
    let rejection: Value = serde_json::from_str(&recv_text(&mut second).await).unwrap();
    assert_eq!(rejection, json!({"error": "Device already connected"}));
    expect_closed(&mut second).await;

    // No side effects from the rejected connection
    assert!(try_recv_text(&mut first).await.is_none());
    assert_eq!(store.record_count().unwrap(), 0);

    // First connection still relays normally
    let mut other = connect_as(&relay.url, "CC:DD").await;
    send_text(&mut other, r#"{"x":1,"y":2}"#).await;
    assert_eq!(recv_text(&mut first).await, r#"{"x":1,"y":2}"#);
    assert_eq!(relay.registry.lookup("AA:BB").unwrap().identity.as_deref(), Some("AA:BB"));
}

#[tokio::test]
async fn test_identity_can_reregister_after_close() {
    let store = Arc::new(MemoryRecordStore::new());
    let relay = start_relay(store, handshake_options()).await;

    let mut first = connect_as(&relay.url, "AA:BB").await;
    first.close(None).await.unwrap();
    wait_until(|| relay.registry.lookup("AA:BB").is_none()).await;

    let _second = connect_as(&relay.url, "AA:BB").await;
    assert_eq!(relay.registry.registered_count(), 1);
}

#[tokio::test]
async fn test_handshake_without_identity_closes_with_error() {
    let store = Arc::new(MemoryRecordStore::new());
    let relay = start_relay(store.clone(), handshake_options()).await;

    let mut ws = connect(&relay.url).await;
    send_text(&mut ws, r#"{"x":1,"y":2}"#).await;

    let error: Value = serde_json::from_str(&recv_text(&mut ws).await).unwrap();
    assert_eq!(error, json!({"error": "Missing device identity"}));
    expect_closed(&mut ws).await;
    assert_eq!(relay.metrics.handshakes_rejected.get(), 1);
    assert_eq!(store.record_count().unwrap(), 0);
}

#[tokio::test]
async fn test_undecodable_handshake_closes_with_error() {
    let store = Arc::new(MemoryRecordStore::new());
    let relay = start_relay(store, handshake_options()).await;

    let mut ws = connect(&relay.url).await;
    send_text(&mut ws, "hello").await;

    let error: Value = serde_json::from_str(&recv_text(&mut ws).await).unwrap();
    assert_eq!(error, json!({"error": "Invalid handshake"}));
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn test_registration_is_silent_without_ack() {
    let store = Arc::new(MemoryRecordStore::new());
    let options = RelayOptions {
        require_handshake: true,
        ..RelayOptions::default()
    };
    let relay = start_relay(store, options).await;

    let mut viewer = connect(&relay.url).await;
    send_text(&mut viewer, r#"{"mac":"AA:BB"}"#).await;
    wait_until(|| relay.registry.lookup("AA:BB").is_some()).await;

    let mut sender = connect(&relay.url).await;
    send_text(&mut sender, r#"{"mac":"CC:DD"}"#).await;
    wait_until(|| relay.registry.lookup("CC:DD").is_some()).await;
    assert!(try_recv_text(&mut sender).await.is_none());

    send_text(&mut sender, r#"{"x":1,"y":2}"#).await;
    // The relayed frame is the first thing the viewer ever sees
    assert_eq!(recv_text(&mut viewer).await, r#"{"x":1,"y":2}"#);
}

#[tokio::test]
async fn test_unregistered_connection_receives_nothing() {
    let store = Arc::new(MemoryRecordStore::new());
    let relay = start_relay(store, handshake_options()).await;

    let mut waiting = connect(&relay.url).await;
    let mut a = connect_as(&relay.url, "AA:BB").await;
    send_text(&mut a, r#"{"x":1,"y":2}"#).await;

    assert!(try_recv_text(&mut waiting).await.is_none());
}

#[tokio::test]
async fn test_handshake_payload_is_relayed_and_attributed() {
    let store = Arc::new(MemoryRecordStore::new());
    let relay = start_relay(store.clone(), handshake_options()).await;

    let mut listener = connect_as(&relay.url, "11:22").await;

    let mut sender = connect(&relay.url).await;
    let frame = r#"{"mac":"AA:BB","x":4,"y":5}"#;
    send_text(&mut sender, frame).await;
    let ack: Value = serde_json::from_str(&recv_text(&mut sender).await).unwrap();
    assert_eq!(ack["status"], "registered");

    assert_eq!(recv_text(&mut listener).await, frame);
    wait_until(|| store.record_count().unwrap() == 1).await;
    assert_eq!(store.all()[0].identity.as_deref(), Some("AA:BB"));
}

#[tokio::test]
async fn test_registered_identity_overrides_client_field() {
    let store = Arc::new(MemoryRecordStore::new());
    let relay = start_relay(store.clone(), handshake_options()).await;

    let mut a = connect_as(&relay.url, "AA:BB").await;
    let mut b = connect_as(&relay.url, "CC:DD").await;

    let frame = r#"{"x":1,"y":2,"mac":"FORGED"}"#;
    send_text(&mut a, frame).await;

    // Relay fidelity: the raw bytes go out unchanged
    assert_eq!(recv_text(&mut b).await, frame);

    wait_until(|| store.record_count().unwrap() == 1).await;
    assert_eq!(store.all()[0].identity.as_deref(), Some("AA:BB"));
}

// ============================================================================
// Tests: Persistence isolation
// ============================================================================

#[tokio::test]
async fn test_store_outage_does_not_block_fanout() {
    let relay = start_relay(Arc::new(FailingRecordStore), RelayOptions::default()).await;

    let mut a = connect(&relay.url).await;
    let mut b = connect(&relay.url).await;
    wait_for_active(&relay.registry, 2).await;

    for i in 0..3 {
        let frame = json!({"x": i, "y": i}).to_string();
        send_text(&mut a, &frame).await;
        assert_eq!(recv_text(&mut b).await, frame);
    }

    wait_until(|| relay.metrics.persist_failures.get() == 3).await;

    // Connection survives store failures
    send_text(&mut b, r#"{"x":0,"y":0}"#).await;
    assert_eq!(recv_text(&mut a).await, r#"{"x":0,"y":0}"#);
}

// ============================================================================
// Tests: Relay modes
// ============================================================================

#[tokio::test]
async fn test_raw_relay_forwards_any_frame_without_storing() {
    let store = Arc::new(MemoryRecordStore::new());
    let options = RelayOptions {
        persist: false,
        ..RelayOptions::default()
    };
    let relay = start_relay(store.clone(), options).await;

    let mut a = connect(&relay.url).await;
    let mut b = connect(&relay.url).await;
    wait_for_active(&relay.registry, 2).await;

    send_text(&mut a, "plain text").await;
    assert_eq!(recv_text(&mut b).await, "plain text");

    send_text(&mut a, r#"{"x":1,"y":2}"#).await;
    assert_eq!(recv_text(&mut b).await, r#"{"x":1,"y":2}"#);
    assert!(try_recv_text(&mut a).await.is_none());
    assert_eq!(store.record_count().unwrap(), 0);
}

#[tokio::test]
async fn test_echo_mode_decorates_and_includes_sender() {
    let store = Arc::new(MemoryRecordStore::new());
    let options = RelayOptions {
        persist: false,
        fanout: FanoutOptions {
            echo_prefix: Some("Server echo: ".to_string()),
            echo_to_sender: true,
        },
        ..RelayOptions::default()
    };
    let relay = start_relay(store, options).await;

    let mut a = connect(&relay.url).await;
    let mut b = connect(&relay.url).await;
    wait_for_active(&relay.registry, 2).await;

    send_text(&mut a, "hello").await;
    assert_eq!(recv_text(&mut a).await, "Server echo: hello");
    assert_eq!(recv_text(&mut b).await, "Server echo: hello");
}

// ============================================================================
// Tests: Listener
// ============================================================================

#[tokio::test]
async fn test_plain_http_get_returns_status_text() {
    let store = Arc::new(MemoryRecordStore::new());
    let relay = start_relay(store, RelayOptions::default()).await;

    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with(STATUS_TEXT));
}

#[tokio::test]
async fn test_connections_over_limit_are_refused() {
    let store = Arc::new(MemoryRecordStore::new());
    let options = RelayOptions {
        max_connections: 1,
        ..RelayOptions::default()
    };
    let relay = start_relay(store, options).await;

    let _first = connect(&relay.url).await;
    wait_for_active(&relay.registry, 1).await;

    assert!(connect_async(&relay.url).await.is_err());
    wait_until(|| relay.metrics.connection_errors.get() == 1).await;
}

#[tokio::test]
async fn test_quiet_listener_still_receives_after_idle_period() {
    let store = Arc::new(MemoryRecordStore::new());
    let options = RelayOptions {
        idle_timeout: Duration::from_secs(1),
        ..RelayOptions::default()
    };
    let relay = start_relay(store, options).await;

    let mut viewer = connect(&relay.url).await;
    wait_for_active(&relay.registry, 1).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let mut sender = connect(&relay.url).await;
    wait_for_active(&relay.registry, 2).await;
    send_text(&mut sender, r#"{"x":1,"y":2}"#).await;

    assert_eq!(recv_text(&mut viewer).await, r#"{"x":1,"y":2}"#);
}

#[tokio::test]
async fn test_listener_answering_heartbeats_stays_connected() {
    let store = Arc::new(MemoryRecordStore::new());
    let options = RelayOptions {
        idle_timeout: Duration::from_secs(1),
        ..RelayOptions::default()
    };
    let relay = start_relay(store, options).await;

    let mut viewer = connect(&relay.url).await;
    wait_for_active(&relay.registry, 1).await;

    // Reading lets the client answer pings; nothing is ever sent
    let quiet_until = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < quiet_until {
        assert!(try_recv_text(&mut viewer).await.is_none());
    }
    assert_eq!(relay.registry.connected_count(), 1);
}

#[tokio::test]
async fn test_unresponsive_peer_closed_after_missed_heartbeats() {
    let store = Arc::new(MemoryRecordStore::new());
    let options = RelayOptions {
        idle_timeout: Duration::from_secs(1),
        ..RelayOptions::default()
    };
    let relay = start_relay(store, options).await;

    // Never read, so pings go unanswered
    let _stalled = connect(&relay.url).await;
    wait_for_active(&relay.registry, 1).await;

    tokio::time::sleep(Duration::from_millis(4500)).await;
    wait_until(|| relay.registry.connected_count() == 0).await;
}

#[tokio::test]
async fn test_closed_connection_is_removed_from_registry() {
    let store = Arc::new(MemoryRecordStore::new());
    let relay = start_relay(store, RelayOptions::default()).await;

    let mut a = connect(&relay.url).await;
    let _b = connect(&relay.url).await;
    wait_for_active(&relay.registry, 2).await;

    a.close(None).await.unwrap();
    wait_until(|| relay.registry.connected_count() == 1).await;
}
