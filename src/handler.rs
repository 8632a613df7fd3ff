// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Connection Handler
//!
//! Drives one connection through its lifecycle:
//! Connecting → (AwaitingHandshake) → Active → Closing.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::connection_registry::{
    ConnectionRegistry, ConnectionSlot, ConnectionState, RegistryError, RegistryMessage,
};
use crate::fanout::{self, FanoutOptions};
use crate::metrics::RelayMetrics;
use crate::persistence::PersistenceSink;
use crate::protocol::{self, DecodeError};
use crate::storage::Record;

/// Shared dependencies for handling a WebSocket connection.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub registry: Arc<ConnectionRegistry>,
    /// Where accepted payloads go. `None` turns the relay into a raw
    /// forwarder that neither decodes nor stores frames.
    pub sink: Option<PersistenceSink>,
    pub metrics: RelayMetrics,
    pub fanout: FanoutOptions,
    /// Require an identity-bearing first message.
    pub require_handshake: bool,
    /// Confirm a successful handshake with a `registered` control frame.
    pub ack_registration: bool,
    pub max_message_size: usize,
    /// Bounds the handshake. Once Active it is the heartbeat interval.
    pub idle_timeout: Duration,
}

/// Heartbeat intervals without any inbound frame before a peer is considered dead.
pub const MISSED_HEARTBEATS_BEFORE_CLOSE: u32 = 3;

/// Result of reading the next frame.
enum Inbound {
    Data(Vec<u8>),
    /// Ping, Pong or a raw frame: proof of life, nothing to relay.
    Control,
    Closed,
    Failed(WsError),
}

/// Reads exactly one frame.
async fn next_inbound<S>(read: &mut S) -> Inbound
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    match read.next().await {
        Some(Ok(Message::Text(text))) => Inbound::Data(text.into_bytes()),
        Some(Ok(Message::Binary(data))) => Inbound::Data(data),
        Some(Ok(Message::Close(_))) | None => Inbound::Closed,
        Some(Ok(_)) => Inbound::Control,
        Some(Err(e)) => Inbound::Failed(e),
    }
}

/// Reads until a Text or Binary message, skipping control frames.
async fn next_data<S>(read: &mut S) -> Inbound
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match next_inbound(read).await {
            Inbound::Control => continue,
            other => return other,
        }
    }
}

/// Wraps outbound bytes as Text when they are UTF-8 so relayed JSON keeps
/// the frame type the sender used.
fn outbound_message(data: Vec<u8>) -> Message {
    match String::from_utf8(data) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}

/// Sends a control frame and closes the socket.
async fn reject<W>(write: &mut W, reason: &str)
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    let _ = write.send(Message::Text(protocol::error_frame(reason))).await;
    let _ = write.close().await;
}

/// Per-connection state shared by the message handling steps.
struct Session<'a> {
    label: &'a str,
    deps: &'a ConnectionDeps,
    slot: &'a ConnectionSlot,
    /// Identity bound in the registry by the handshake.
    identity: Option<String>,
}

impl Session<'_> {
    /// Decode → fan-out → persist for one inbound message.
    fn handle_message(&self, raw: &[u8]) {
        let metrics = &self.deps.metrics;
        metrics.messages_received.inc();
        let _timer = metrics.message_duration.start_timer();

        if let Err(e) = protocol::check_size(raw, self.deps.max_message_size) {
            warn!("[{}] {}", self.label, e);
            metrics.messages_rejected.inc();
            return;
        }

        let Some(sink) = &self.deps.sink else {
            self.fan_out(raw);
            return;
        };

        match protocol::decode(raw) {
            Ok(frame) => {
                self.fan_out(raw);
                self.persist(sink, Record::from_frame(frame, self.identity.as_deref()));
            }
            Err(e) => {
                warn!("[{}] Discarding message: {}", self.label, e);
                metrics.messages_rejected.inc();
            }
        }
    }

    fn fan_out(&self, raw: &[u8]) {
        let report = fanout::broadcast(
            &self.deps.registry,
            self.slot.id(),
            raw,
            &self.deps.fanout,
        );
        self.deps.metrics.frames_delivered.inc_by(report.delivered as u64);
        self.deps.metrics.frames_dropped.inc_by(report.failed() as u64);
        debug!(
            "[{}] Relayed to {} recipients ({} failed)",
            self.label,
            report.delivered,
            report.failed()
        );
    }

    fn persist(&self, sink: &PersistenceSink, record: Record) {
        if let Err(e) = sink.persist(record) {
            warn!("[{}] Record not queued: {}", self.label, e);
            self.deps.metrics.persist_failures.inc();
        }
    }
}

/// Handles a WebSocket connection until it closes.
pub async fn handle_connection(ws_stream: WebSocketStream<TcpStream>, deps: ConnectionDeps) {
    // Short random label so log lines of one connection can be correlated
    let session_id = uuid::Uuid::new_v4().to_string();
    let label = &session_id[..8];

    let (mut write, mut read) = ws_stream.split();

    // Dropping the slot unregisters the connection on every exit path
    let (slot, mut outbound) = deps.registry.open();
    debug!("[{}] Opened {}", label, slot.id());

    let mut session = Session {
        label,
        deps: &deps,
        slot: &slot,
        identity: None,
    };

    if deps.require_handshake {
        slot.set_state(ConnectionState::AwaitingHandshake);

        let first = match timeout(deps.idle_timeout, next_data(&mut read)).await {
            Ok(Inbound::Data(data)) => data,
            Ok(Inbound::Control) | Ok(Inbound::Closed) => {
                debug!("[{}] Connection closed before handshake", label);
                return;
            }
            Ok(Inbound::Failed(e)) => {
                warn!("[{}] Error reading handshake: {}", label, e);
                return;
            }
            Err(_) => {
                warn!("[{}] Handshake timeout", label);
                deps.metrics.handshakes_rejected.inc();
                return;
            }
        };

        let handshake = match protocol::check_size(&first, deps.max_message_size)
            .and_then(|()| protocol::decode_handshake(&first))
        {
            Ok(handshake) => handshake,
            Err(DecodeError::MissingIdentity) => {
                warn!("[{}] Handshake without identity", label);
                deps.metrics.handshakes_rejected.inc();
                reject(&mut write, protocol::ERR_MISSING_IDENTITY).await;
                return;
            }
            Err(e) => {
                warn!("[{}] Failed to decode handshake: {}", label, e);
                deps.metrics.handshakes_rejected.inc();
                reject(&mut write, protocol::ERR_INVALID_HANDSHAKE).await;
                return;
            }
        };

        match slot.register(&handshake.identity) {
            Ok(()) => {}
            Err(RegistryError::AlreadyConnected) => {
                info!("[{}] Rejected duplicate identity", label);
                deps.metrics.handshakes_rejected.inc();
                reject(&mut write, protocol::ERR_ALREADY_CONNECTED).await;
                return;
            }
            Err(RegistryError::UnknownConnection) => {
                warn!("[{}] Connection vanished during handshake", label);
                return;
            }
        }

        if deps.ack_registration {
            let ack = protocol::registered_frame(&handshake.identity);
            if write.send(Message::Text(ack)).await.is_err() {
                warn!("[{}] Failed to confirm registration", label);
                return;
            }
        }
        debug!("[{}] Registered identity", label);
        session.identity = Some(handshake.identity);

        // The handshake may also carry the first payload
        if handshake.frame.is_some() {
            session.handle_message(&first);
        }
    } else {
        slot.set_state(ConnectionState::Active);
    }

    // A quiet client stays Active as long as it answers pings
    let beat = deps.idle_timeout.max(Duration::from_millis(100));
    let mut heartbeat = interval(beat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let dead_after = beat * MISSED_HEARTBEATS_BEFORE_CLOSE;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            inbound = next_inbound(&mut read) => {
                match inbound {
                    Inbound::Data(data) => {
                        last_seen = Instant::now();
                        session.handle_message(&data);
                    }
                    Inbound::Control => last_seen = Instant::now(),
                    Inbound::Closed => {
                        debug!("[{}] Disconnected", label);
                        break;
                    }
                    Inbound::Failed(e) => {
                        warn!("[{}] Transport error: {}", label, e);
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() >= dead_after {
                    warn!("[{}] No response to heartbeat, closing", label);
                    break;
                }
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    debug!("[{}] Failed to send heartbeat", label);
                    break;
                }
            }
            Some(RegistryMessage { data }) = outbound.recv() => {
                if write.send(outbound_message(data)).await.is_err() {
                    debug!("[{}] Failed to write relayed frame", label);
                    break;
                }
            }
        }
    }

    slot.set_state(ConnectionState::Closing);
    let _ = write.close().await;
}
