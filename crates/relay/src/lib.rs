// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unblink relay: accepts reverse tunnels from node agents and multiplexes
//! bridges to services behind their NATs.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod directory;
pub mod idle;
pub mod session;
pub mod state;
pub mod transport;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::auth::HmacTokenAuthority;
use crate::config::RelayConfig;
use crate::directory::MemoryDirectory;
use crate::idle::spawn_idle_scanner;
use crate::state::RelayState;
use crate::transport::build_router;

/// Run the relay until shutdown.
pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    let authority = Arc::new(HmacTokenAuthority::from_config(config.secret.as_deref())?);
    let directory = Arc::new(MemoryDirectory::new(config.link_base()));
    let state = Arc::new(RelayState::new(config, shutdown.clone(), authority, directory));

    tracing::info!("unblink-relay listening on {addr}");
    spawn_idle_scanner(Arc::clone(&state));
    let router = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}
