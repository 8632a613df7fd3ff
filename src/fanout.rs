// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Broadcast Fan-out
//!
//! Delivers one inbound frame to every other Active connection. Delivery is
//! a non-blocking enqueue on each recipient's outbound queue: a full queue
//! drops the frame for that recipient only, a closed queue counts as a failed
//! send, and neither stops delivery to the rest.

use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::connection_registry::{ConnectionId, ConnectionRegistry, RegistryMessage};

/// How a frame is relayed.
#[derive(Debug, Clone, Default)]
pub struct FanoutOptions {
    /// Text prepended to every relayed frame (e.g. `"Server echo: "`).
    pub echo_prefix: Option<String>,
    /// Deliver the frame back to its origin as well.
    pub echo_to_sender: bool,
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Recipients whose queue accepted the frame.
    pub delivered: usize,
    /// Recipients skipped because their queue was full.
    pub dropped: usize,
    /// Recipients whose connection had already gone away.
    pub closed: usize,
}

impl FanoutReport {
    pub fn failed(&self) -> usize {
        self.dropped + self.closed
    }
}

/// Builds the outbound bytes for a relayed frame.
pub fn relay_bytes(raw: &[u8], options: &FanoutOptions) -> Vec<u8> {
    match &options.echo_prefix {
        Some(prefix) => {
            let mut out = Vec::with_capacity(prefix.len() + raw.len());
            out.extend_from_slice(prefix.as_bytes());
            out.extend_from_slice(raw);
            out
        }
        None => raw.to_vec(),
    }
}

/// Delivers `raw` to every Active connection except `origin`.
pub fn broadcast(
    registry: &ConnectionRegistry,
    origin: ConnectionId,
    raw: &[u8],
    options: &FanoutOptions,
) -> FanoutReport {
    let exclude = if options.echo_to_sender {
        None
    } else {
        Some(origin)
    };
    let data = relay_bytes(raw, options);
    let mut report = FanoutReport::default();

    for (id, sender) in registry.recipients(exclude) {
        match sender.try_send(RegistryMessage { data: data.clone() }) {
            Ok(()) => report.delivered += 1,
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue full for {}, dropping frame", id);
                report.dropped += 1;
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Recipient {} already closed", id);
                report.closed += 1;
            }
        }
    }

    report
}
