// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

/// Configuration for the unblink relay.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "unblink-relay", version, about = "Reverse-tunnel relay for unblink nodes")]
pub struct RelayConfig {
    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "UNBLINK_RELAY_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9700, env = "UNBLINK_RELAY_PORT")]
    pub port: u16,

    /// Token-signing secret (base64). A random secret is generated if unset;
    /// tokens then stop verifying across restarts.
    #[arg(long, env = "UNBLINK_RELAY_SECRET")]
    pub secret: Option<String>,

    /// Public base URL used when building dashboard link URLs.
    #[arg(long, env = "UNBLINK_RELAY_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Bearer token for the operational HTTP API. If unset, auth is disabled.
    #[arg(long, env = "UNBLINK_RELAY_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// OpenBridge response timeout in seconds.
    #[arg(long, default_value_t = 30, env = "UNBLINK_RELAY_OPEN_TIMEOUT_SECS")]
    pub open_timeout_secs: u64,

    /// CloseBridge response timeout in seconds.
    #[arg(long, default_value_t = 10, env = "UNBLINK_RELAY_CLOSE_TIMEOUT_SECS")]
    pub close_timeout_secs: u64,

    /// Capacity of each bridge's inbound queue, in frames.
    #[arg(long, default_value_t = 2000, env = "UNBLINK_RELAY_BRIDGE_QUEUE")]
    pub bridge_queue: usize,

    /// Close bridges with no data activity for this many seconds (0 = never).
    #[arg(long, default_value_t = 0, env = "UNBLINK_RELAY_BRIDGE_IDLE_SECS")]
    pub bridge_idle_secs: u64,

    /// Idle scanner interval in seconds.
    #[arg(long, default_value_t = 5, env = "UNBLINK_RELAY_IDLE_CHECK_SECS")]
    pub idle_check_secs: u64,

    /// Extra OpenBridge attempts when a node rejects an open.
    #[arg(long, default_value_t = 0, env = "UNBLINK_RELAY_BRIDGE_OPEN_RETRIES")]
    pub bridge_open_retries: u32,
}

impl RelayConfig {
    pub fn open_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.open_timeout_secs)
    }

    pub fn close_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.close_timeout_secs)
    }

    pub fn bridge_idle_timeout(&self) -> Option<std::time::Duration> {
        (self.bridge_idle_secs > 0)
            .then(|| std::time::Duration::from_secs(self.bridge_idle_secs))
    }

    pub fn idle_check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.idle_check_secs)
    }

    /// Base URL for dashboard links, falling back to the bind address.
    pub fn link_base(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_owned(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
