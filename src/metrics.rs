//! Prometheus Metrics for the Stroke Relay
//!
//! Provides observability metrics for monitoring the relay server.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Relay server metrics.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Connection metrics
    /// Total WebSocket connections accepted.
    pub connections_total: IntCounter,
    /// Current active WebSocket connections.
    pub connections_active: IntGauge,
    /// Connection errors (upgrade failures, capacity rejections).
    pub connection_errors: IntCounter,
    /// Handshakes refused (missing or duplicate identity, undecodable).
    pub handshakes_rejected: IntCounter,

    // Message metrics
    /// Total messages received.
    pub messages_received: IntCounter,
    /// Messages discarded because they failed to decode.
    pub messages_rejected: IntCounter,
    /// Frames queued to recipients by fan-out.
    pub frames_delivered: IntCounter,
    /// Frames fan-out could not deliver (full or closed queue).
    pub frames_dropped: IntCounter,
    /// Message processing duration in seconds.
    pub message_duration: Histogram,

    // Persistence metrics
    /// Records written to the store.
    pub records_persisted: IntCounter,
    /// Records the store failed to write or that could not be queued.
    pub persist_failures: IntCounter,
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).expect("valid counter options")
}

impl RelayMetrics {
    /// Creates a new metrics instance with all metrics registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = counter(
            "relay_connections_total",
            "Total WebSocket connections accepted",
        );
        let connections_active = IntGauge::with_opts(Opts::new(
            "relay_connections_active",
            "Current active WebSocket connections",
        ))
        .expect("valid gauge options");
        let connection_errors = counter("relay_connection_errors_total", "Total connection errors");
        let handshakes_rejected = counter(
            "relay_handshakes_rejected_total",
            "Total identity handshakes rejected",
        );

        let messages_received = counter("relay_messages_received_total", "Total messages received");
        let messages_rejected = counter(
            "relay_messages_rejected_total",
            "Total messages discarded as malformed",
        );
        let frames_delivered = counter(
            "relay_frames_delivered_total",
            "Total frames queued to recipients",
        );
        let frames_dropped = counter(
            "relay_frames_dropped_total",
            "Total frames not delivered to a recipient",
        );
        let message_duration = Histogram::with_opts(HistogramOpts::new(
            "relay_message_duration_seconds",
            "Message processing duration in seconds",
        ))
        .expect("valid histogram options");

        let records_persisted = counter("relay_records_persisted_total", "Total records stored");
        let persist_failures = counter(
            "relay_persist_failures_total",
            "Total records that failed to persist",
        );

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(connections_total.clone()),
            Box::new(connections_active.clone()),
            Box::new(connection_errors.clone()),
            Box::new(handshakes_rejected.clone()),
            Box::new(messages_received.clone()),
            Box::new(messages_rejected.clone()),
            Box::new(frames_delivered.clone()),
            Box::new(frames_dropped.clone()),
            Box::new(message_duration.clone()),
            Box::new(records_persisted.clone()),
            Box::new(persist_failures.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .expect("metric names are unique");
        }

        RelayMetrics {
            registry: Arc::new(registry),
            connections_total,
            connections_active,
            connection_errors,
            handshakes_rejected,
            messages_received,
            messages_rejected,
            frames_delivered,
            frames_dropped,
            message_duration,
            records_persisted,
            persist_failures,
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
