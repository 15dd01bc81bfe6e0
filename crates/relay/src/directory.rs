// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Node directory: registration bookkeeping and dashboard-mediated linking.
//!
//! A node that has never been linked to an operator account gets a dashboard
//! URL in its RegisterResponse; an out-of-band visit completes the binding
//! (via the operational HTTP API here), after which re-registration returns
//! no URL.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Metadata recorded for a registered node.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub hostname: String,
    pub mac_addresses: Vec<String>,
    pub linked: bool,
}

/// Registration and linking state for enrolled nodes.
pub trait NodeDirectory: Send + Sync {
    /// Record a successful registration. Returns a dashboard URL when the
    /// node still needs operator linking.
    fn register(&self, node_id: &str, hostname: &str, macs: &[String]) -> Option<String>;

    /// Drop registration bookkeeping for a departed node.
    fn unregister(&self, node_id: &str);

    /// Complete the operator-side binding for a node.
    fn mark_linked(&self, node_id: &str) -> bool;

    /// Snapshot of all known nodes.
    fn records(&self) -> Vec<NodeRecord>;
}

/// In-memory directory. Linking survives node reconnects but not relay
/// restarts; durable storage is a collaborator concern.
pub struct MemoryDirectory {
    link_base: String,
    nodes: RwLock<HashMap<String, NodeRecord>>,
    linked: RwLock<HashSet<String>>,
}

impl MemoryDirectory {
    pub fn new(link_base: impl Into<String>) -> Self {
        Self {
            link_base: link_base.into(),
            nodes: RwLock::new(HashMap::new()),
            linked: RwLock::new(HashSet::new()),
        }
    }

    fn is_linked(&self, node_id: &str) -> bool {
        self.linked.read().map(|set| set.contains(node_id)).unwrap_or(false)
    }
}

impl NodeDirectory for MemoryDirectory {
    fn register(&self, node_id: &str, hostname: &str, macs: &[String]) -> Option<String> {
        let linked = self.is_linked(node_id);
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.insert(
                node_id.to_owned(),
                NodeRecord {
                    node_id: node_id.to_owned(),
                    hostname: hostname.to_owned(),
                    mac_addresses: macs.to_vec(),
                    linked,
                },
            );
        }
        (!linked).then(|| format!("{}/link/{node_id}", self.link_base))
    }

    fn unregister(&self, node_id: &str) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.remove(node_id);
        }
    }

    fn mark_linked(&self, node_id: &str) -> bool {
        let inserted = self.linked.write().map(|mut set| set.insert(node_id.to_owned()));
        if let Ok(mut nodes) = self.nodes.write() {
            if let Some(rec) = nodes.get_mut(node_id) {
                rec.linked = true;
            }
        }
        inserted.unwrap_or(false)
    }

    fn records(&self) -> Vec<NodeRecord> {
        self.nodes.read().map(|nodes| nodes.values().cloned().collect()).unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "directory_tests.rs"]
mod tests;
