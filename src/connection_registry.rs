// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection Registry
//!
//! Tracks every open connection and binds client identities (hardware
//! addresses) to at most one active connection.
//!
//! Each connection owns the receiving end of a bounded channel; the registry
//! keeps the sending end. Fan-out and control messages are queued on that
//! channel and the connection's own task writes them to the socket, so no
//! caller ever blocks on another client's transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use tracing::debug;

/// Default capacity of a connection's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Opaque identifier assigned by the registry to each connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    AwaitingHandshake,
    Active,
    Closing,
}

/// A frame queued for delivery to a connected client.
#[derive(Debug, Clone)]
pub struct RegistryMessage {
    /// The frame bytes, relayed unmodified.
    pub data: Vec<u8>,
}

/// Errors returned by [`ConnectionRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("identity is already held by an active connection")]
    AlreadyConnected,
    #[error("connection is not open")]
    UnknownConnection,
}

/// Snapshot of a connection as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub identity: Option<String>,
    pub state: ConnectionState,
}

struct ConnectionEntry {
    identity: Option<String>,
    state: ConnectionState,
    sender: mpsc::Sender<RegistryMessage>,
}

impl ConnectionEntry {
    fn is_live(&self) -> bool {
        self.state == ConnectionState::Active && !self.sender.is_closed()
    }
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    identities: HashMap<String, ConnectionId>,
}

impl RegistryInner {
    /// Removes the identity binding only if it still points at `id`.
    fn unbind(&mut self, identity: &str, id: ConnectionId) -> bool {
        if self.identities.get(identity) == Some(&id) {
            self.identities.remove(identity);
            true
        } else {
            false
        }
    }
}

/// Thread-safe registry of open connections and registered identities.
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
    next_id: AtomicU64,
    outbound_capacity: usize,
}

impl ConnectionRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::with_outbound_capacity(DEFAULT_OUTBOUND_CAPACITY)
    }

    /// Creates a registry whose per-connection queues hold `capacity` frames.
    pub fn with_outbound_capacity(capacity: usize) -> Self {
        ConnectionRegistry {
            inner: RwLock::new(RegistryInner::default()),
            next_id: AtomicU64::new(1),
            outbound_capacity: capacity.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Opens a new connection in the `Connecting` state.
    ///
    /// Returns a slot that closes the connection when dropped, and the
    /// receiving end of the connection's outbound queue.
    pub fn open(self: &Arc<Self>) -> (ConnectionSlot, mpsc::Receiver<RegistryMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.outbound_capacity);
        self.write().connections.insert(
            id,
            ConnectionEntry {
                identity: None,
                state: ConnectionState::Connecting,
                sender: tx,
            },
        );
        let slot = ConnectionSlot {
            id,
            registry: self.clone(),
        };
        (slot, rx)
    }

    /// Moves a connection to `state`. Returns false if it is not open.
    pub fn set_state(&self, id: ConnectionId, state: ConnectionState) -> bool {
        match self.write().connections.get_mut(&id) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    /// Binds `identity` to connection `id` and marks it Active.
    ///
    /// Fails with [`RegistryError::AlreadyConnected`] if another connection
    /// holding the identity is still Active with an open queue. A binding to a
    /// closed or inactive connection is stale and gets replaced.
    pub fn register(&self, identity: &str, id: ConnectionId) -> Result<(), RegistryError> {
        let mut inner = self.write();
        if !inner.connections.contains_key(&id) {
            return Err(RegistryError::UnknownConnection);
        }

        if let Some(&existing) = inner.identities.get(identity) {
            if existing != id {
                let live = inner
                    .connections
                    .get(&existing)
                    .is_some_and(ConnectionEntry::is_live);
                if live {
                    return Err(RegistryError::AlreadyConnected);
                }
                debug!("Reclaiming stale registration held by {}", existing);
                if let Some(stale) = inner.connections.get_mut(&existing) {
                    stale.identity = None;
                }
            }
        }

        inner.identities.insert(identity.to_string(), id);
        if let Some(entry) = inner.connections.get_mut(&id) {
            entry.identity = Some(identity.to_string());
            entry.state = ConnectionState::Active;
        }
        Ok(())
    }

    /// Removes the binding for `identity` if it belongs to connection `id`.
    ///
    /// A close racing with a newer registration of the same identity is a
    /// no-op, so calling this more than once is harmless.
    pub fn unregister(&self, identity: &str, id: ConnectionId) {
        let mut inner = self.write();
        if inner.unbind(identity, id) {
            if let Some(entry) = inner.connections.get_mut(&id) {
                entry.identity = None;
            }
        }
    }

    /// Returns the connection currently bound to `identity`.
    pub fn lookup(&self, identity: &str) -> Option<ConnectionInfo> {
        let inner = self.read();
        let id = *inner.identities.get(identity)?;
        inner.connections.get(&id).map(|entry| ConnectionInfo {
            id,
            identity: entry.identity.clone(),
            state: entry.state,
        })
    }

    /// Returns the connection with the given id, if open.
    pub fn info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.read().connections.get(&id).map(|entry| ConnectionInfo {
            id,
            identity: entry.identity.clone(),
            state: entry.state,
        })
    }

    /// Removes a connection and any identity bound to it. Idempotent.
    pub fn close(&self, id: ConnectionId) {
        let mut inner = self.write();
        if let Some(entry) = inner.connections.remove(&id) {
            if let Some(identity) = entry.identity {
                inner.unbind(&identity, id);
            }
        }
    }

    /// Snapshot of Active connections other than `exclude`, for fan-out.
    ///
    /// Taken under the read lock and returned by value so senders can be
    /// used while connections come and go.
    pub fn recipients(
        &self,
        exclude: Option<ConnectionId>,
    ) -> Vec<(ConnectionId, mpsc::Sender<RegistryMessage>)> {
        let inner = self.read();
        let mut recipients: Vec<_> = inner
            .connections
            .iter()
            .filter(|(id, entry)| {
                Some(**id) != exclude && entry.state == ConnectionState::Active
            })
            .map(|(id, entry)| (*id, entry.sender.clone()))
            .collect();
        recipients.sort_by_key(|(id, _)| *id);
        recipients
    }

    /// Queues a frame for one connection without waiting.
    /// Returns false if the connection is gone or its queue is full.
    pub fn try_send(&self, id: ConnectionId, msg: RegistryMessage) -> bool {
        let inner = self.read();
        match inner.connections.get(&id) {
            Some(entry) => entry.sender.try_send(msg).is_ok(),
            None => false,
        }
    }

    /// Returns the number of open connections.
    pub fn connected_count(&self) -> usize {
        self.read().connections.len()
    }

    /// Returns the number of identities currently registered.
    pub fn registered_count(&self) -> usize {
        self.read().identities.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle for an open connection. Dropping it closes the connection
/// and releases its identity.
pub struct ConnectionSlot {
    id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionSlot {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.registry.set_state(self.id, state);
    }

    pub fn register(&self, identity: &str) -> Result<(), RegistryError> {
        self.registry.register(identity, self.id)
    }

    pub fn identity(&self) -> Option<String> {
        self.registry.info(self.id).and_then(|info| info.identity)
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.registry.set_state(self.id, ConnectionState::Closing);
        self.registry.close(self.id);
    }
}
