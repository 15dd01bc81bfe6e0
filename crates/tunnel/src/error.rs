// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Structural error kinds for the tunnel protocol.

use std::fmt;

/// Errors surfaced by the tunnel core.
///
/// Fatal kinds terminate the whole session; the rest are scoped to one
/// request or one bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// Bad length prefix, short read/write, or encode failure. Fatal.
    Framing(String),
    /// CBOR payload did not decode into a known message. Fatal.
    Decode(String),
    /// Unexpected message for the current state, or unknown kind. Fatal.
    Protocol(String),
    /// Token verification or issuance failed.
    Auth(String),
    /// A request waiter exceeded its deadline. The pending entry is removed.
    Timeout,
    /// The node could not dial the requested service.
    Dial(String),
    /// The peer closed the transport or the read side hit EOF. Fatal.
    PeerClosed,
    /// Relay inbound sink full; the frame was dropped.
    QueueFull,
    /// Bridge operations attempted before the session reported ready.
    NotReady,
    /// The node rejected an open request.
    NodeRejected(String),
    /// The session (or a pending waiter) was closed underneath the caller.
    Closed,
}

impl TunnelError {
    /// True for kinds that terminate the session rather than a single
    /// request or bridge.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::Framing(_)
                | TunnelError::Decode(_)
                | TunnelError::Protocol(_)
                | TunnelError::PeerClosed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelError::Framing(_) => "FRAMING",
            TunnelError::Decode(_) => "DECODE",
            TunnelError::Protocol(_) => "PROTOCOL",
            TunnelError::Auth(_) => "AUTH",
            TunnelError::Timeout => "TIMEOUT",
            TunnelError::Dial(_) => "DIAL",
            TunnelError::PeerClosed => "PEER_CLOSED",
            TunnelError::QueueFull => "QUEUE_FULL",
            TunnelError::NotReady => "NOT_READY",
            TunnelError::NodeRejected(_) => "NODE_REJECTED",
            TunnelError::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelError::Framing(msg) => write!(f, "framing error: {msg}"),
            TunnelError::Decode(msg) => write!(f, "decode error: {msg}"),
            TunnelError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            TunnelError::Auth(msg) => write!(f, "auth error: {msg}"),
            TunnelError::Timeout => f.write_str("request timed out"),
            TunnelError::Dial(msg) => write!(f, "service dial failed: {msg}"),
            TunnelError::PeerClosed => f.write_str("peer closed the transport"),
            TunnelError::QueueFull => f.write_str("inbound queue full"),
            TunnelError::NotReady => f.write_str("session not ready for bridge traffic"),
            TunnelError::NodeRejected(msg) => write!(f, "node rejected open: {msg}"),
            TunnelError::Closed => f.write_str("session closed"),
        }
    }
}

impl std::error::Error for TunnelError {}
