// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tunnel accept path: WebSocket upgrade into a node session.

use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;

use crate::session::NodeConn;
use crate::state::RelayState;

/// `GET /tunnel` — WebSocket upgrade for a node agent.
///
/// The session starts unauthenticated; only enrollment messages are accepted
/// until the node registers with a valid token.
pub async fn tunnel_handler(
    State(state): State<Arc<RelayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    tracing::debug!("tunnel connection accepted");
    ws.on_upgrade(move |socket| async move {
        let (conn, read) = NodeConn::accept(socket, &state.config, &state.shutdown);
        conn.run(state, read).await;
    })
}
