//! Relay Server Configuration
//!
//! Configuration loaded from environment variables. Values that fail to
//! parse are ignored and the default is kept.

use std::net::SocketAddr;
use std::time::Duration;

use crate::connection_registry::DEFAULT_OUTBOUND_CAPACITY;
use crate::fanout::FanoutOptions;
use crate::persistence::DEFAULT_QUEUE_CAPACITY;
use crate::storage::{StoreError, StoreLocation};

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the WebSocket listener binds to.
    pub listen_addr: SocketAddr,
    /// Address of the HTTP query and metrics server.
    pub http_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum message size in bytes.
    pub max_message_size: usize,
    /// Bounds the upgrade and the handshake, and is the heartbeat interval
    /// for Active connections.
    pub idle_timeout_secs: u64,
    /// Frames a connection may have queued before fan-out drops for it.
    pub outbound_queue_capacity: usize,
    /// Records that may wait for the persistence worker.
    pub persist_queue_capacity: usize,
    /// Require the first message to declare an identity.
    pub require_handshake: bool,
    /// Send `{"status":"registered"}` after a successful handshake.
    pub handshake_ack: bool,
    /// Decode and store messages. When false the relay forwards raw frames.
    pub persist: bool,
    /// Text prepended to relayed frames.
    pub echo_prefix: Option<String>,
    /// Relay frames back to the sender as well.
    pub echo_to_sender: bool,
    /// Record store location (`memory://`, `sqlite://<path>`, `json://<path>`).
    pub database_url: String,
    /// Bearer token protecting `/metrics`.
    pub metrics_token: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            http_addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
            max_connections: 1000,
            max_message_size: 1_048_576, // 1 MB
            idle_timeout_secs: 300,
            outbound_queue_capacity: DEFAULT_OUTBOUND_CAPACITY,
            persist_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            require_handshake: false,
            handshake_ack: false,
            persist: true,
            echo_prefix: None,
            echo_to_sender: false,
            database_url: "sqlite://./data/records.db".to_string(),
            metrics_token: None,
        }
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl RelayConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from any key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("RELAY_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.listen_addr = parsed;
            }
        }

        // Hosting platforms hand out the port alone
        if let Some(port) = lookup("PORT") {
            if let Ok(parsed) = port.trim().parse::<u16>() {
                config.listen_addr.set_port(parsed);
            }
        }

        if let Some(addr) = lookup("RELAY_HTTP_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.http_addr = parsed;
            }
        }

        if let Some(val) = lookup("RELAY_MAX_CONNECTIONS") {
            if let Ok(parsed) = val.parse() {
                config.max_connections = parsed;
            }
        }

        if let Some(val) = lookup("RELAY_MAX_MESSAGE_SIZE") {
            if let Ok(parsed) = val.parse() {
                config.max_message_size = parsed;
            }
        }

        if let Some(val) = lookup("RELAY_IDLE_TIMEOUT") {
            if let Ok(parsed) = val.parse() {
                config.idle_timeout_secs = parsed;
            }
        }

        if let Some(val) = lookup("RELAY_OUTBOUND_QUEUE") {
            if let Ok(parsed) = val.parse() {
                config.outbound_queue_capacity = parsed;
            }
        }

        if let Some(val) = lookup("RELAY_PERSIST_QUEUE") {
            if let Ok(parsed) = val.parse() {
                config.persist_queue_capacity = parsed;
            }
        }

        if let Some(val) = lookup("RELAY_REQUIRE_HANDSHAKE").and_then(|v| parse_bool(&v)) {
            config.require_handshake = val;
        }

        if let Some(val) = lookup("RELAY_HANDSHAKE_ACK").and_then(|v| parse_bool(&v)) {
            config.handshake_ack = val;
        }

        if let Some(val) = lookup("RELAY_PERSIST").and_then(|v| parse_bool(&v)) {
            config.persist = val;
        }

        if let Some(val) = lookup("RELAY_ECHO_PREFIX") {
            config.echo_prefix = Some(val).filter(|v| !v.is_empty());
        }

        if let Some(val) = lookup("RELAY_ECHO_TO_SENDER").and_then(|v| parse_bool(&v)) {
            config.echo_to_sender = val;
        }

        if let Some(val) = lookup("RELAY_DATABASE_URL") {
            if !val.is_empty() {
                config.database_url = val;
            }
        }

        config.metrics_token = lookup("RELAY_METRICS_TOKEN").filter(|v| !v.is_empty());

        config
    }

    /// Returns the idle timeout as a Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Parses the database URL.
    pub fn store_location(&self) -> Result<StoreLocation, StoreError> {
        StoreLocation::parse(&self.database_url)
    }

    /// Relay options for fan-out.
    pub fn fanout_options(&self) -> FanoutOptions {
        FanoutOptions {
            echo_prefix: self.echo_prefix.clone(),
            echo_to_sender: self.echo_to_sender,
        }
    }
}
