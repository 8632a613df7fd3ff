// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Listener
//!
//! Accepts TCP connections, answers plain HTTP GETs with a short status text
//! and hands WebSocket upgrades to the connection handler.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

use crate::handler::{self, ConnectionDeps};

/// Body returned to plain HTTP requests on the WebSocket port.
pub const STATUS_TEXT: &str = "WebSocket Server is Running! JSON data is stored.";

/// Peeks at the request head and answers it if it is not a WebSocket upgrade.
/// Returns the stream back when the caller should proceed with the upgrade.
async fn answer_plain_http(stream: TcpStream) -> Option<TcpStream> {
    let mut peek_buf = [0u8; 512];
    let n = match stream.peek(&mut peek_buf).await {
        Ok(n) if n > 0 => n,
        _ => return Some(stream),
    };

    let head = String::from_utf8_lossy(&peek_buf[..n]).to_ascii_lowercase();
    let is_websocket_upgrade = head.contains("upgrade: websocket");
    if is_websocket_upgrade || !head.starts_with("get ") {
        return Some(stream);
    }

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        STATUS_TEXT.len(),
        STATUS_TEXT
    );
    let mut stream = stream;
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
    debug!("Answered plain HTTP request");
    None
}

/// Accepts connections forever.
pub async fn serve(listener: TcpListener, deps: ConnectionDeps, max_connections: usize) {
    let slots = Arc::new(Semaphore::new(max_connections));

    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept failed: {}", e);
                continue;
            }
        };

        let permit = match slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Connection rejected: at max capacity ({})", max_connections);
                deps.metrics.connection_errors.inc();
                drop(stream);
                continue;
            }
        };

        let deps = deps.clone();
        tokio::spawn(async move {
            // Held for the lifetime of the connection
            let _permit = permit;

            let Some(stream) = answer_plain_http(stream).await else {
                return;
            };

            // Bound the upgrade so a client cannot hold a slot without completing it
            match timeout(deps.idle_timeout, accept_async(stream)).await {
                Ok(Ok(ws_stream)) => {
                    deps.metrics.connections_total.inc();
                    deps.metrics.connections_active.inc();
                    info!("New WebSocket connection");

                    let metrics = deps.metrics.clone();
                    handler::handle_connection(ws_stream, deps).await;

                    metrics.connections_active.dec();
                    info!("WebSocket connection closed");
                }
                Ok(Err(e)) => {
                    warn!("WebSocket handshake failed: {}", e);
                    deps.metrics.connection_errors.inc();
                }
                Err(_) => {
                    warn!("WebSocket upgrade timeout");
                    deps.metrics.connection_errors.inc();
                }
            }
        });
    }
}
