// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Persistence Sink
//!
//! Connection handlers hand accepted records to a bounded queue and move on.
//! A single background worker drains the queue and writes each record to the
//! store on the blocking pool. Store failures end at the worker: they are
//! logged and counted, never reported back to a connection.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::metrics::RelayMetrics;
use crate::storage::{Record, RecordStore};

/// Default number of records that may wait for the worker.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Errors returned when a record cannot be queued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistError {
    #[error("persistence queue is full")]
    QueueFull,
    #[error("persistence worker has stopped")]
    WorkerStopped,
}

/// Cloneable handle for queuing records.
#[derive(Clone)]
pub struct PersistenceSink {
    tx: mpsc::Sender<Record>,
}

impl PersistenceSink {
    /// Queues a record for storage without waiting.
    pub fn persist(&self, record: Record) -> Result<(), PersistError> {
        match self.tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(record)) => {
                warn!("Persistence queue full, dropping record {}", record.id);
                Err(PersistError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                error!("Persistence worker stopped, record not stored");
                Err(PersistError::WorkerStopped)
            }
        }
    }
}

/// Starts the worker and returns the sink feeding it.
///
/// The worker exits once every sink clone has been dropped and the queue is
/// drained, so awaiting the handle flushes pending records.
pub fn spawn_persistence_worker(
    store: Arc<dyn RecordStore>,
    metrics: RelayMetrics,
    capacity: usize,
) -> (PersistenceSink, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Record>(capacity.max(1));

    let handle = tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            let store = store.clone();
            let id = record.id.clone();
            let result = tokio::task::spawn_blocking(move || store.insert(&record)).await;
            match result {
                Ok(Ok(())) => {
                    metrics.records_persisted.inc();
                    debug!("Stored record {}", id);
                }
                Ok(Err(e)) => {
                    metrics.persist_failures.inc();
                    error!("Failed to store record {}: {}", id, e);
                }
                Err(e) => {
                    metrics.persist_failures.inc();
                    error!("Store task for record {} panicked: {}", id, e);
                }
            }
        }
        debug!("Persistence worker stopped");
    });

    (PersistenceSink { tx }, handle)
}
