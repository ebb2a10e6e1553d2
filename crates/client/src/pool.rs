//! Relay connection pool: the active set and its reconciliation.

use futures::future::join_all;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

use crate::transport::Transport;

/// Lifecycle of a set of relay connections.
///
/// The pool tracks which relays it considers active and reconciles that view
/// against the transport's at every entry point: a relay the transport
/// reports disconnected is evicted, a relay the transport reports connected
/// but the pool does not know about is adopted. This converges the two views
/// even under spontaneous disconnects.
pub struct RelayPool {
    transport: Arc<dyn Transport>,
    default_relays: Vec<String>,
    active: Arc<Mutex<Vec<String>>>,
}

impl RelayPool {
    pub fn new(transport: Arc<dyn Transport>, default_relays: Vec<String>) -> Self {
        Self {
            transport,
            default_relays,
            active: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The relays this pool connects to when no explicit set is given.
    pub fn default_relays(&self) -> &[String] {
        &self.default_relays
    }

    /// The relays currently considered active.
    pub fn active(&self) -> Vec<String> {
        self.active.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Whether the pool considers the given relay connected.
    pub fn is_connected(&self, uri: &str) -> bool {
        self.active
            .lock()
            .map(|a| a.iter().any(|r| r == uri))
            .unwrap_or(false)
    }

    /// Open connections in parallel to every given relay that is not already
    /// active. Repeated calls are idempotent. A failed connect leaves the
    /// relay disconnected and is not retried. Returns the active set.
    pub async fn open(&self, relays: &[String]) -> Vec<String> {
        let targets = self.unconnected_relays(relays).await;
        let target_count = relays.len();

        let tasks: Vec<_> = targets
            .into_iter()
            .map(|uri| {
                let transport = Arc::clone(&self.transport);
                let active = Arc::clone(&self.active);
                tokio::spawn(async move {
                    debug!("connecting to relay {uri}");
                    transport.open(&uri).await;
                    if transport.is_connected(&uri).await {
                        push_unique(&active, &uri);
                    } else {
                        error!("failed to connect to relay {uri}");
                    }
                })
            })
            .collect();
        join_all(tasks).await;

        let active = self.active();
        info!(
            "connected to {}/{} target relays",
            active.iter().filter(|uri| relays.iter().any(|r| r == *uri)).count(),
            target_count
        );
        active
    }

    /// Close connections in parallel to every given relay that is currently
    /// active. Returns the relays that were closed.
    pub async fn close(&self, relays: &[String]) -> Vec<String> {
        let targets = self.connected_relays(relays).await;

        let tasks: Vec<_> = targets
            .iter()
            .cloned()
            .map(|uri| {
                let transport = Arc::clone(&self.transport);
                let active = Arc::clone(&self.active);
                tokio::spawn(async move {
                    debug!("disconnecting from relay {uri}");
                    transport.close(&uri).await;
                    remove(&active, &uri);
                })
            })
            .collect();
        join_all(tasks).await;

        targets
    }

    /// The given relays that are connected, after reconciling the active set
    /// against the transport.
    async fn connected_relays(&self, relays: &[String]) -> Vec<String> {
        let mut connected = Vec::new();
        for uri in relays {
            let is_active = self.is_connected(uri);
            let is_connected = self.transport.is_connected(uri).await;
            debug!("relay {uri}: active={is_active} connected={is_connected}");

            match (is_active, is_connected) {
                (true, true) => connected.push(uri.clone()),
                (true, false) => remove(&self.active, uri),
                (false, true) => {
                    push_unique(&self.active, uri);
                    connected.push(uri.clone());
                }
                (false, false) => {}
            }
        }
        connected
    }

    /// The given relays that need a connection attempt, after reconciling
    /// the active set against the transport.
    async fn unconnected_relays(&self, relays: &[String]) -> Vec<String> {
        let mut unconnected = Vec::new();
        for uri in relays {
            let is_active = self.is_connected(uri);
            let is_connected = self.transport.is_connected(uri).await;
            debug!("relay {uri}: active={is_active} connected={is_connected}");

            match (is_active, is_connected) {
                (false, false) => unconnected.push(uri.clone()),
                (true, false) => {
                    remove(&self.active, uri);
                    unconnected.push(uri.clone());
                }
                (false, true) => push_unique(&self.active, uri),
                (true, true) => {}
            }
        }
        unconnected
    }
}

fn push_unique(active: &Mutex<Vec<String>>, uri: &str) {
    if let Ok(mut active) = active.lock() {
        if !active.iter().any(|r| r == uri) {
            active.push(uri.to_string());
        }
    }
}

fn remove(active: &Mutex<Vec<String>>, uri: &str) {
    if let Ok(mut active) = active.lock() {
        active.retain(|r| r != uri);
    }
}
