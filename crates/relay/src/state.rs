// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::auth::TokenAuthority;
use crate::config::RelayConfig;
use crate::directory::NodeDirectory;
use crate::session::NodeConn;

/// Shared relay state.
pub struct RelayState {
    /// Registered node sessions, keyed by node id.
    pub nodes: RwLock<HashMap<String, Arc<NodeConn>>>,
    pub config: RelayConfig,
    pub shutdown: CancellationToken,
    pub authority: Arc<dyn TokenAuthority>,
    pub directory: Arc<dyn NodeDirectory>,
    /// Node lifecycle events for relay-side consumers.
    pub events: broadcast::Sender<NodeEvent>,
}

/// Lifecycle notifications surfaced to bridge consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeEvent {
    /// The node finished enrollment and can carry bridges.
    NodeReady { node_id: String },
    /// The node's session ended; all its bridges are gone.
    NodeOffline { node_id: String },
}

impl RelayState {
    pub fn new(
        config: RelayConfig,
        shutdown: CancellationToken,
        authority: Arc<dyn TokenAuthority>,
        directory: Arc<dyn NodeDirectory>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { nodes: RwLock::new(HashMap::new()), config, shutdown, authority, directory, events }
    }

    /// Subscribe to node lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Look up the live session for a node.
    pub async fn lookup(&self, node_id: &str) -> Option<Arc<NodeConn>> {
        self.nodes.read().await.get(node_id).map(Arc::clone)
    }

    /// Install a freshly registered session. A stale session under the same
    /// node id is closed and replaced.
    pub async fn install(&self, node_id: &str, conn: Arc<NodeConn>) {
        let stale = {
            let mut nodes = self.nodes.write().await;
            nodes.insert(node_id.to_owned(), conn)
        };
        if let Some(stale) = stale {
            tracing::info!(node_id, "closing stale session for re-registering node");
            stale.close().await;
        }
    }

    /// Remove `conn` from the node table if it is still the installed
    /// session. Returns true when an entry was removed.
    pub async fn remove_if_current(&self, node_id: &str, conn: &Arc<NodeConn>) -> bool {
        let mut nodes = self.nodes.write().await;
        match nodes.get(node_id) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                nodes.remove(node_id);
                true
            }
            _ => false,
        }
    }

    pub async fn node_count(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub fn emit(&self, event: NodeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
