// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One relay session: dial, enroll, then carry bridge traffic.
//!
//! The driver feeds inbound messages through the enrollment machine and
//! executes the resulting actions. Every sender (driver and bridge
//! forwarders) funnels through [`Outbound`], the single write-serialization
//! point of the session.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use unblink_tunnel::{decode_frame, encode_frame, Message, TunnelError};

use crate::bridge::NodeBridges;
use crate::config::NodeConfig;
use crate::identity::Identity;
use crate::machine::{self, Action, Ctx, State};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Shared write path: serializes frames onto the transport and stamps
/// outgoing message ids from the session counter.
pub struct Outbound {
    sink: Mutex<WsSink>,
    next_id: AtomicU64,
}

impl Outbound {
    fn new(sink: WsSink) -> Self {
        Self { sink: Mutex::new(sink), next_id: AtomicU64::new(1) }
    }

    /// Stamp a fresh id and write one frame.
    pub async fn send(&self, mut msg: Message) -> Result<(), TunnelError> {
        msg.set_id(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write(&msg).await
    }

    /// Write a response as-is; responses echo the request id.
    pub async fn reply(&self, msg: &Message) -> Result<(), TunnelError> {
        self.write(msg).await
    }

    async fn write(&self, msg: &Message) -> Result<(), TunnelError> {
        let frame = encode_frame(msg)?;
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Binary(frame.into())).await.map_err(|_| TunnelError::PeerClosed)
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(WsMessage::Close(None)).await;
    }
}

/// What the supervisor learns from a finished session.
pub struct SessionOutcome {
    /// The session reached Registered at least once.
    pub registered: bool,
}

/// Derive the tunnel URL from the configured relay address.
///
/// Accepts `host:port`, `ws://host:port`, `wss://…`, or `http(s)://…` (which
/// map to their ws equivalents); appends the `/tunnel` path when the address
/// has none.
pub fn tunnel_url(relay_address: &str) -> String {
    let base = if relay_address.contains("://") {
        relay_address
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1)
    } else {
        format!("ws://{relay_address}")
    };

    let after_scheme = base.split_once("://").map(|(_, rest)| rest).unwrap_or(&base);
    if after_scheme.contains('/') {
        base
    } else {
        format!("{base}/tunnel")
    }
}

/// Run one session to completion. `Err` means the dial itself failed; a
/// session that enrolled and later fell over returns `Ok` with its outcome.
pub async fn run_session(
    config: &mut NodeConfig,
    config_path: &Path,
) -> anyhow::Result<SessionOutcome> {
    let url = tunnel_url(&config.relay_address);
    let (ws, _) = tokio_tungstenite::connect_async(&url).await?;
    tracing::info!(%url, node_id = %config.node_id, "connected to relay");

    let (sink, mut read) = ws.split();
    let outbound = Arc::new(Outbound::new(sink));
    let cancel = CancellationToken::new();
    let bridges =
        NodeBridges::new(Arc::clone(&outbound), cancel.child_token(), config.services.clone());

    let mut ctx = Ctx {
        identity: Identity::collect(config.node_id.clone()),
        token: (!config.token.is_empty()).then(|| config.token.clone()),
    };
    let mut registered = false;

    let step = machine::start(&ctx);
    let mut state = step.next;
    let mut pending_actions = step.actions;

    loop {
        for action in pending_actions.drain(..) {
            if let Err(e) =
                exec(action, &outbound, &bridges, &mut ctx, config, config_path, &mut registered)
                    .await
            {
                tracing::warn!(err = %e, "session write failed");
                state = State::Closed;
            }
        }
        if state == State::Closed {
            break;
        }

        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read.next() => frame,
        };

        let msg = match frame {
            Some(Ok(WsMessage::Binary(buf))) => match decode_frame(&buf) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!(err = %e, "bad frame from relay, closing session");
                    break;
                }
            },
            Some(Ok(WsMessage::Close(_))) | None => {
                tracing::info!("relay closed the transport");
                break;
            }
            Some(Ok(WsMessage::Text(_))) => {
                tracing::warn!("unexpected text frame from relay, closing session");
                break;
            }
            Some(Ok(_)) => continue, // ping/pong
            Some(Err(e)) => {
                tracing::info!(err = %e, "transport read error");
                break;
            }
        };

        let step = machine::handle(state, &ctx, msg);
        state = step.next;
        pending_actions = step.actions;
    }

    cancel.cancel();
    bridges.close_all().await;
    outbound.close().await;
    tracing::info!(node_id = %config.node_id, registered, "session ended");

    Ok(SessionOutcome { registered })
}

async fn exec(
    action: Action,
    outbound: &Arc<Outbound>,
    bridges: &NodeBridges,
    ctx: &mut Ctx,
    config: &mut NodeConfig,
    config_path: &Path,
    registered: &mut bool,
) -> Result<(), TunnelError> {
    match action {
        Action::Send(msg) => outbound.send(msg).await,

        Action::PersistToken(token) => {
            config.token = token.clone();
            ctx.token = Some(token);
            if let Err(e) = config.save(config_path) {
                // Keep running with the in-memory token; next issuance heals it.
                tracing::warn!(err = %e, "failed to persist token");
            }
            Ok(())
        }

        Action::AnnounceDashboard(url) => {
            tracing::warn!(%url, "visit the dashboard to authorize this node");
            Ok(())
        }

        Action::Ready => {
            *registered = true;
            outbound.send(Message::NodeReady { id: 0 }).await
        }

        Action::Bridge(msg) => bridges.dispatch(msg).await,

        Action::Fatal(reason) => {
            tracing::error!(%reason, "session terminated");
            Ok(())
        }
    }
}

#[cfg(test)]
#[path = "conn_tests.rs"]
mod tests;
