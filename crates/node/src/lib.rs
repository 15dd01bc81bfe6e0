// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unblink node agent: dials the relay from inside a private network and
//! proxies bridges to local services.

pub mod bridge;
pub mod config;
pub mod conn;
pub mod identity;
pub mod machine;
pub mod supervisor;

use crate::config::{Cli, NodeConfig};

/// Run the node agent until its reconnect budget is exhausted.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = NodeConfig::load_or_init(&cli.config)?;
    if let Some(relay) = cli.relay {
        config.relay_address = relay;
    }

    tracing::info!(
        node_id = %config.node_id,
        relay = %config.relay_address,
        "starting node agent"
    );
    supervisor::run(config, &cli.config).await
}
