// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Stroke Relay Server
//!
//! Relays drawing strokes and sensor samples between WebSocket clients.
//! Provides:
//! - WebSocket endpoint that fans each message out to every other client
//! - Background persistence of accepted payloads
//! - HTTP endpoints for recent records, health checks and Prometheus metrics

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use stroke_relay::config::RelayConfig;
use stroke_relay::connection_registry::ConnectionRegistry;
use stroke_relay::handler::ConnectionDeps;
use stroke_relay::http::{create_router, HttpState};
use stroke_relay::metrics::RelayMetrics;
use stroke_relay::persistence::spawn_persistence_worker;
use stroke_relay::server;
use stroke_relay::storage::{create_record_store, RecordStore};

#[tokio::main]
async fn main() {
    // Initialize logging
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "stroke_relay=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Load configuration
    let config = RelayConfig::from_env();

    info!("Starting Stroke Relay Server v{}", env!("CARGO_PKG_VERSION"));
    info!("WebSocket: {}", config.listen_addr);
    info!("HTTP queries and metrics: {}", config.http_addr);
    info!(
        "Mode: handshake={}, persist={}, echo_to_sender={}",
        config.require_handshake, config.persist, config.echo_to_sender
    );
    info!("Idle timeout / heartbeat: {}s", config.idle_timeout_secs);

    let location = match config.store_location() {
        Ok(location) => location,
        Err(e) => {
            error!("Invalid RELAY_DATABASE_URL: {}", e);
            std::process::exit(1);
        }
    };
    info!("Record store: {:?}", location);

    let store: Arc<dyn RecordStore> = match create_record_store(&location) {
        Ok(store) => Arc::from(store),
        Err(e) => {
            error!("Failed to open record store: {}", e);
            std::process::exit(1);
        }
    };

    let metrics = RelayMetrics::new();
    let registry = Arc::new(ConnectionRegistry::with_outbound_capacity(
        config.outbound_queue_capacity,
    ));

    let sink = if config.persist {
        let (sink, _worker) =
            spawn_persistence_worker(store.clone(), metrics.clone(), config.persist_queue_capacity);
        Some(sink)
    } else {
        info!("Persistence disabled: relaying raw frames");
        None
    };

    if config.metrics_token.is_some() {
        info!("Metrics endpoint protected with bearer token");
    }

    // Start HTTP server for queries, health and metrics
    let http_router = create_router(HttpState {
        store: store.clone(),
        registry: registry.clone(),
        metrics: metrics.clone(),
        metrics_token: config.metrics_token.clone(),
    });
    let http_listener = match TcpListener::bind(config.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind HTTP listener on {}: {}", config.http_addr, e);
            std::process::exit(1);
        }
    };
    let http_addr = config.http_addr;
    tokio::spawn(async move {
        info!("HTTP server listening on {}", http_addr);
        if let Err(e) = axum::serve(http_listener, http_router).await {
            error!("HTTP server stopped: {}", e);
        }
    });

    // Start TCP listener for WebSocket
    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind WebSocket listener on {}: {}", config.listen_addr, e);
            std::process::exit(1);
        }
    };
    info!("Server running on port {}", config.listen_addr.port());

    let deps = ConnectionDeps {
        registry,
        sink,
        metrics,
        fanout: config.fanout_options(),
        require_handshake: config.require_handshake,
        ack_registration: config.handshake_ack,
        max_message_size: config.max_message_size,
        idle_timeout: config.idle_timeout(),
    };
    server::serve(listener, deps, config.max_connections).await;
}
