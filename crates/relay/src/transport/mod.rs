// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the relay.
//!
//! `/tunnel` is the node-facing substrate; the `/api/v1` routes are the
//! operational surface (health, node inventory, dashboard-link completion).

pub mod ws;

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use crate::state::RelayState;

/// Build the axum `Router` with all relay routes.
pub fn build_router(state: Arc<RelayState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/api/v1/health", get(health))
        // Node inventory and linking
        .route("/api/v1/nodes", get(list_nodes))
        .route("/api/v1/nodes/{id}/link", post(link_node))
        // Tunnel substrate
        .route("/tunnel", get(ws::tunnel_handler))
        // Middleware
        .layer(middleware::from_fn_with_state(state.clone(), auth_layer))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// `GET /api/v1/health`
async fn health(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "running",
        "node_count": state.node_count().await,
    }))
}

/// `GET /api/v1/nodes` — connected nodes with bridge counts.
async fn list_nodes(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    let conns: Vec<_> = {
        let nodes = state.nodes.read().await;
        nodes.values().map(Arc::clone).collect()
    };

    let mut out = Vec::with_capacity(conns.len());
    for conn in conns {
        out.push(serde_json::json!({
            "node_id": conn.node_id(),
            "ready": conn.is_ready(),
            "bridges": conn.bridge_count().await,
            "connected_secs": conn.connected_secs(),
        }));
    }
    Json(serde_json::Value::Array(out))
}

/// `POST /api/v1/nodes/{id}/link` — complete operator-side binding.
async fn link_node(
    State(state): State<Arc<RelayState>>,
    Path(node_id): Path<String>,
) -> Json<serde_json::Value> {
    let newly_linked = state.directory.mark_linked(&node_id);
    tracing::info!(%node_id, newly_linked, "node linked by operator");
    Json(serde_json::json!({ "node_id": node_id, "linked": true }))
}

/// Compare bearer tokens without short-circuiting on the first mismatching
/// byte, so the comparison leaks no timing information about the prefix.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

/// Validate a Bearer token from HTTP headers.
fn validate_bearer(headers: &HeaderMap, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    let Some(header) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    match header.strip_prefix("Bearer ") {
        Some(token) => constant_time_eq(token, expected),
        None => false,
    }
}

/// Axum middleware enforcing bearer auth on the operational API.
///
/// Exempt: `/api/v1/health` and the tunnel upgrade (nodes authenticate via
/// the enrollment protocol, not HTTP bearer tokens).
async fn auth_layer(
    state: State<Arc<RelayState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path == "/api/v1/health" || path == "/tunnel" {
        return next.run(req).await;
    }

    if !validate_bearer(req.headers(), state.config.auth_token.as_deref()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "unauthorized" })),
        )
            .into_response();
    }

    next.run(req).await
}
