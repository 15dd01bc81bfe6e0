// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background idle-bridge scanner.

use std::sync::Arc;

use crate::state::RelayState;

/// Spawn a single background task that periodically closes bridges with no
/// data activity for longer than the configured idle timeout. Not spawned
/// when the timeout is disabled.
pub fn spawn_idle_scanner(state: Arc<RelayState>) {
    let Some(idle_timeout) = state.config.bridge_idle_timeout() else {
        return;
    };
    let interval = state.config.idle_check_interval();
    let idle_ms = idle_timeout.as_millis() as u64;

    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }

            // Snapshot current sessions, then their bridges.
            let conns: Vec<_> = {
                let nodes = state.nodes.read().await;
                nodes.values().map(Arc::clone).collect()
            };

            for conn in &conns {
                for bridge in conn.bridges_snapshot().await {
                    if bridge.idle_ms() >= idle_ms {
                        tracing::info!(
                            node_id = %conn.node_id().unwrap_or_default(),
                            bridge_id = %bridge.bridge_id,
                            idle_ms = bridge.idle_ms(),
                            "closing idle bridge"
                        );
                        conn.close_bridge(&bridge.bridge_id).await;
                    }
                }
            }
        }
    });
}
