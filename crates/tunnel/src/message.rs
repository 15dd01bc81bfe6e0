// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The closed set of tunnel messages.
//!
//! Serialized as an internally-tagged union: the `type` field carries the
//! snake_case discriminator, every variant carries the sender-assigned `id`.
//! Responses echo the `id` of the request they answer; `BridgeData` carries a
//! fresh id and is never awaited.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A tunnel protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Node asks whether its persisted token is still valid.
    TokenCheckRequest { id: u64, node_id: String, token: String },
    TokenCheckResponse { id: u64, valid: bool },

    /// Node requests a fresh token. Hostname and MACs are weak identity
    /// hints for the operator, not trusted input.
    NewTokenRequest { id: u64, node_id: String, hostname: String, mac_addresses: Vec<String> },
    NewTokenResponse {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    RegisterRequest {
        id: u64,
        node_id: String,
        token: String,
        hostname: String,
        mac_addresses: Vec<String>,
    },
    RegisterResponse {
        id: u64,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        dashboard_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Node signals the session is ready to carry bridges.
    NodeReady { id: u64 },

    OpenBridgeRequest { id: u64, bridge_id: String, service_id: String, service_url: String },
    OpenBridgeResponse {
        id: u64,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    CloseBridgeRequest { id: u64, bridge_id: String },
    CloseBridgeResponse {
        id: u64,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// One-way data frame for an open bridge.
    BridgeData { id: u64, bridge_id: String, data: Bytes },
}

impl Message {
    /// The sender-assigned sequence id of this message.
    pub fn id(&self) -> u64 {
        match self {
            Message::TokenCheckRequest { id, .. }
            | Message::TokenCheckResponse { id, .. }
            | Message::NewTokenRequest { id, .. }
            | Message::NewTokenResponse { id, .. }
            | Message::RegisterRequest { id, .. }
            | Message::RegisterResponse { id, .. }
            | Message::NodeReady { id }
            | Message::OpenBridgeRequest { id, .. }
            | Message::OpenBridgeResponse { id, .. }
            | Message::CloseBridgeRequest { id, .. }
            | Message::CloseBridgeResponse { id, .. }
            | Message::BridgeData { id, .. } => *id,
        }
    }

    /// Overwrite the sequence id. Messages are built with a placeholder id
    /// and stamped with the session counter at the send point.
    pub fn set_id(&mut self, new_id: u64) {
        match self {
            Message::TokenCheckRequest { id, .. }
            | Message::TokenCheckResponse { id, .. }
            | Message::NewTokenRequest { id, .. }
            | Message::NewTokenResponse { id, .. }
            | Message::RegisterRequest { id, .. }
            | Message::RegisterResponse { id, .. }
            | Message::NodeReady { id }
            | Message::OpenBridgeRequest { id, .. }
            | Message::OpenBridgeResponse { id, .. }
            | Message::CloseBridgeRequest { id, .. }
            | Message::CloseBridgeResponse { id, .. }
            | Message::BridgeData { id, .. } => *id = new_id,
        }
    }

    /// True for the response variants that complete a pending request.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Message::TokenCheckResponse { .. }
                | Message::NewTokenResponse { .. }
                | Message::RegisterResponse { .. }
                | Message::OpenBridgeResponse { .. }
                | Message::CloseBridgeResponse { .. }
        )
    }

    /// Stable discriminator string, as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::TokenCheckRequest { .. } => "token_check_request",
            Message::TokenCheckResponse { .. } => "token_check_response",
            Message::NewTokenRequest { .. } => "new_token_request",
            Message::NewTokenResponse { .. } => "new_token_response",
            Message::RegisterRequest { .. } => "register_request",
            Message::RegisterResponse { .. } => "register_response",
            Message::NodeReady { .. } => "node_ready",
            Message::OpenBridgeRequest { .. } => "open_bridge_request",
            Message::OpenBridgeResponse { .. } => "open_bridge_response",
            Message::CloseBridgeRequest { .. } => "close_bridge_request",
            Message::CloseBridgeResponse { .. } => "close_bridge_response",
            Message::BridgeData { .. } => "bridge_data",
        }
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
