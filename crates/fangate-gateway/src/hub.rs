//! Per-client outbound queues.
//!
//! Every connected client owns a bounded write queue drained by its
//! writer task. Fan-out never awaits a slow socket: a full queue (or a
//! gone client) drops the client from the hub, which ends its writer
//! task and closes the connection. Lagging consumers are disconnected
//! rather than allowed to grow unbounded memory.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::warn;

use fangate_telemetry::metrics;

use crate::registry::ClientId;

/// Default per-client outbound queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Registry of connected clients' outbound queues.
#[derive(Default)]
pub struct ClientHub {
    clients: DashMap<ClientId, mpsc::Sender<String>>,
}

impl ClientHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client's outbound queue.
    pub fn insert(&self, client: ClientId, tx: mpsc::Sender<String>) {
        self.clients.insert(client, tx);
        metrics::CLIENTS_CONNECTED.set(self.clients.len() as i64);
    }

    /// Remove a client; its writer task ends once the queue drains.
    pub fn remove(&self, client: ClientId) {
        self.clients.remove(&client);
        metrics::CLIENTS_CONNECTED.set(self.clients.len() as i64);
    }

    pub fn contains(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Queue a message for one client. Overflow or a closed queue
    /// disconnects the client; returns false in that case.
    pub fn send_to(&self, client: ClientId, text: &str) -> bool {
        let Some(tx) = self.clients.get(&client).map(|t| t.value().clone()) else {
            return false;
        };
        match tx.try_send(text.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%client, "Write queue full, disconnecting slow client");
                metrics::SLOW_CLIENTS_DROPPED
                    .with_label_values(&["queue_full"])
                    .inc();
                self.remove(client);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.remove(client);
                false
            }
        }
    }

    /// Queue a message for every connected client.
    pub fn broadcast(&self, text: &str) {
        let ids: Vec<ClientId> = self.clients.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.send_to(id, text);
        }
    }
}
