// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persisted node configuration.
//!
//! The config file is JSON with `//` comments tolerated, so operators can
//! annotate hand-edited files. The node rewrites it (atomically, comments
//! not preserved) when it learns its identity or a fresh token.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Command-line surface of the node agent.
#[derive(Debug, clap::Parser)]
#[command(name = "unblink-node", version, about = "Unblink node agent")]
pub struct Cli {
    /// Path to the persisted node config.
    #[arg(long, default_value = "unblink-node.json", env = "UNBLINK_NODE_CONFIG")]
    pub config: PathBuf,

    /// Override the relay address from the config file.
    #[arg(long, env = "UNBLINK_NODE_RELAY")]
    pub relay: Option<String>,
}

/// A service this node knows how to reach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub id: String,
    pub addr: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

/// Reconnect policy for the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { enabled: true, max_attempts: 5 }
    }
}

/// Persisted node state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub relay_address: String,
    /// Stable identifier, generated on first run if absent.
    #[serde(default)]
    pub node_id: String,
    /// Bearer token; empty until the relay issues one.
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            relay_address: "ws://127.0.0.1:9700".to_owned(),
            node_id: String::new(),
            token: String::new(),
            services: Vec::new(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl NodeConfig {
    /// Load the config, creating a default (with a fresh node id) when the
    /// file does not exist yet.
    pub fn load_or_init(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&strip_comments(&raw))
                .map_err(|e| anyhow::anyhow!("bad config {}: {e}", path.display()))?
        } else {
            tracing::info!(path = %path.display(), "no config found, creating one");
            Self::default()
        };

        if config.node_id.is_empty() {
            config.node_id = uuid::Uuid::new_v4().to_string();
            tracing::info!(node_id = %config.node_id, "generated node id");
            config.save(path)?;
        }
        Ok(config)
    }

    /// Persist atomically: write a sibling temp file, then rename over.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let rendered = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, rendered)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Strip `//` line comments outside of string literals.
fn strip_comments(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                // Drop the rest of the line, keep the newline.
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
