// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for relay integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use stroke_relay::connection_registry::ConnectionRegistry;
use stroke_relay::fanout::FanoutOptions;
use stroke_relay::handler::ConnectionDeps;
use stroke_relay::metrics::RelayMetrics;
use stroke_relay::persistence::spawn_persistence_worker;
use stroke_relay::server;
use stroke_relay::storage::{Record, RecordStore, RecordSummary, StoreError};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A record store whose every operation fails, simulating an outage.
#[allow(dead_code)]
pub struct FailingRecordStore;

impl RecordStore for FailingRecordStore {
    fn insert(&self, _record: &Record) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("simulated outage".to_string()))
    }

    fn list_recent(&self, _limit: usize) -> Result<Vec<RecordSummary>, StoreError> {
        Err(StoreError::Unavailable("simulated outage".to_string()))
    }

    fn get_by_timestamp(&self, _timestamp: u64) -> Result<Option<Record>, StoreError> {
        Err(StoreError::Unavailable("simulated outage".to_string()))
    }

    fn record_count(&self) -> Result<usize, StoreError> {
        Err(StoreError::Unavailable("simulated outage".to_string()))
    }
}

/// How a test relay behaves.
#[derive(Clone)]
pub struct RelayOptions {
    pub require_handshake: bool,
    pub ack_registration: bool,
    pub persist: bool,
    pub fanout: FanoutOptions,
    pub max_connections: usize,
    pub idle_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        RelayOptions {
            require_handshake: false,
            ack_registration: false,
            persist: true,
            fanout: FanoutOptions::default(),
            max_connections: 100,
            idle_timeout: Duration::from_secs(5),
        }
    }
}

/// A running relay bound to an ephemeral port.
#[allow(dead_code)]
pub struct TestRelay {
    pub url: String,
    pub addr: SocketAddr,
    pub registry: Arc<ConnectionRegistry>,
    pub metrics: RelayMetrics,
}

/// Starts a full relay (listener, handler, persistence worker) for one test.
pub async fn start_relay(store: Arc<dyn RecordStore>, options: RelayOptions) -> TestRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://127.0.0.1:{}", addr.port());

    let registry = Arc::new(ConnectionRegistry::new());
    let metrics = RelayMetrics::new();
    let sink = if options.persist {
        let (sink, _worker) = spawn_persistence_worker(store, metrics.clone(), 64);
        Some(sink)
    } else {
        None
    };

    let deps = ConnectionDeps {
        registry: registry.clone(),
        sink,
        metrics: metrics.clone(),
        fanout: options.fanout,
        require_handshake: options.require_handshake,
        ack_registration: options.ack_registration,
        max_message_size: 64 * 1024,
        idle_timeout: options.idle_timeout,
    };
    tokio::spawn(server::serve(listener, deps, options.max_connections));

    TestRelay {
        url,
        addr,
        registry,
        metrics,
    }
}

/// Polls `cond` every 10ms for up to 3 seconds.
#[allow(dead_code)]
pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    let waited = timeout(Duration::from_secs(3), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached within 3s");
}

/// Waits until `n` connections are Active in the registry.
#[allow(dead_code)]
pub async fn wait_for_active(registry: &ConnectionRegistry, n: usize) {
    wait_until(|| registry.recipients(None).len() == n).await;
}

pub async fn connect(url: &str) -> WsClient {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

pub async fn send_text(ws: &mut WsClient, text: &str) {
    ws.send(Message::Text(text.to_string())).await.unwrap();
}

/// Next frame that is not a heartbeat Ping/Pong. Pongs are queued by the client.
async fn next_frame(ws: &mut WsClient) -> Option<Result<Message, WsError>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => return other,
        }
    }
}

/// Receives the next text message, failing after 3 seconds.
#[allow(dead_code)]
pub async fn recv_text(ws: &mut WsClient) -> String {
    let msg = timeout(Duration::from_secs(3), next_frame(ws))
        .await
        .expect("Timeout waiting for message")
        .expect("Stream ended")
        .expect("WebSocket error");

    match msg {
        Message::Text(text) => text,
        other => panic!("Expected Text message, got {:?}", other),
    }
}

/// Returns the next text message if one arrives within 200ms.
#[allow(dead_code)]
pub async fn try_recv_text(ws: &mut WsClient) -> Option<String> {
    match timeout(Duration::from_millis(200), next_frame(ws)).await {
        Ok(Some(Ok(Message::Text(text)))) => Some(text),
        _ => None,
    }
}

/// Asserts the server ends the connection without sending more data.
#[allow(dead_code)]
pub async fn expect_closed(ws: &mut WsClient) {
    let msg = timeout(Duration::from_secs(2), next_frame(ws)).await;
    match msg {
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => {}
        other => panic!("Expected close/disconnect, got {:?}", other),
    }
}
