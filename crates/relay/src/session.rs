// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-node session handler.
//!
//! One `NodeConn` owns an accepted tunnel transport: the enrollment exchange,
//! the bridge registry for that node, and request/response correlation. The
//! write half sits behind a mutex shared by every sender; a single read task
//! drives [`NodeConn::run`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use unblink_tunnel::{decode_frame, encode_frame, Message, PendingRequests, TunnelError};

use crate::bridge::Bridge;
use crate::state::{NodeEvent, RelayState};

/// The authenticated session bound to one node transport.
pub struct NodeConn {
    writer: Mutex<SplitSink<WebSocket, WsMessage>>,
    pending: PendingRequests,
    bridges: RwLock<HashMap<String, Arc<Bridge>>>,
    next_id: AtomicU64,
    registered: AtomicBool,
    ready: AtomicBool,
    node_id: StdMutex<Option<String>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    connected_at: Instant,
    open_timeout: Duration,
    close_timeout: Duration,
    bridge_queue: usize,
    open_retries: u32,
}

impl NodeConn {
    /// Split an accepted WebSocket into a session handle and the read half
    /// for [`NodeConn::run`].
    pub fn accept(
        socket: WebSocket,
        config: &crate::config::RelayConfig,
        shutdown: &CancellationToken,
    ) -> (Arc<Self>, SplitStream<WebSocket>) {
        let (sink, stream) = socket.split();
        let conn = Arc::new(Self {
            writer: Mutex::new(sink),
            pending: PendingRequests::new(),
            bridges: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            registered: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            node_id: StdMutex::new(None),
            cancel: shutdown.child_token(),
            closed: AtomicBool::new(false),
            connected_at: Instant::now(),
            open_timeout: config.open_timeout(),
            close_timeout: config.close_timeout(),
            bridge_queue: config.bridge_queue,
            open_retries: config.bridge_open_retries,
        });
        (conn, stream)
    }

    pub fn node_id(&self) -> Option<String> {
        self.node_id.lock().ok().and_then(|guard| guard.clone())
    }

    /// True once the node has sent NodeReady.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn connected_secs(&self) -> u64 {
        self.connected_at.elapsed().as_secs()
    }

    pub async fn bridge_count(&self) -> usize {
        self.bridges.read().await.len()
    }

    fn next_message_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Serialize and write one frame. All writers funnel through the sink
    /// mutex; a substrate write failure is fatal to the session.
    async fn write_message(&self, msg: &Message) -> Result<(), TunnelError> {
        let frame = encode_frame(msg)?;
        let mut writer = self.writer.lock().await;
        writer
            .send(WsMessage::Binary(frame.into()))
            .await
            .map_err(|_| TunnelError::PeerClosed)
    }

    /// Stamp a fresh id on `msg`, send it, and await the correlated response.
    /// The pending entry is registered before the write so a response racing
    /// the send is deliverable; the waiter removes its own entry on timeout.
    async fn request(&self, mut msg: Message, timeout: Duration) -> Result<Message, TunnelError> {
        let id = self.next_message_id();
        msg.set_id(id);
        let waiter = self.pending.register(id);

        if let Err(e) = self.write_message(&msg).await {
            self.pending.cancel(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, waiter).await {
            Err(_) => {
                self.pending.cancel(id);
                Err(TunnelError::Timeout)
            }
            Ok(Err(_)) => Err(TunnelError::Closed),
            Ok(Ok(result)) => result,
        }
    }

    // -- bridge operations ----------------------------------------------------

    /// Open a bridge to `service_url` through this node.
    ///
    /// On success the caller receives the bridge id and the inbound sink.
    /// Failed opens leave no state on either side.
    pub async fn open_bridge(
        &self,
        service_id: &str,
        service_url: &str,
    ) -> Result<(String, mpsc::Receiver<Bytes>), TunnelError> {
        if !self.is_ready() {
            return Err(TunnelError::NotReady);
        }

        let bridge_id = Uuid::new_v4().to_string();
        let (bridge, rx) = Bridge::new(
            bridge_id.clone(),
            service_id.to_owned(),
            service_url.to_owned(),
            self.bridge_queue,
        );
        // Register before writing the request so inbound frames racing ahead
        // of the response are deliverable.
        self.bridges.write().await.insert(bridge_id.clone(), Arc::new(bridge));

        let request = Message::OpenBridgeRequest {
            id: 0,
            bridge_id: bridge_id.clone(),
            service_id: service_id.to_owned(),
            service_url: service_url.to_owned(),
        };

        let result = self.request(request, self.open_timeout).await;
        match result {
            Ok(Message::OpenBridgeResponse { success: true, .. }) => {
                tracing::info!(
                    node_id = %self.node_id().unwrap_or_default(),
                    %bridge_id,
                    service_id,
                    "bridge opened"
                );
                Ok((bridge_id, rx))
            }
            Ok(Message::OpenBridgeResponse { success: false, error, .. }) => {
                self.bridges.write().await.remove(&bridge_id);
                Err(TunnelError::NodeRejected(error.unwrap_or_else(|| "open rejected".to_owned())))
            }
            Ok(other) => {
                self.bridges.write().await.remove(&bridge_id);
                Err(TunnelError::Protocol(format!("unexpected {} to open_bridge", other.kind())))
            }
            Err(e) => {
                self.bridges.write().await.remove(&bridge_id);
                Err(e)
            }
        }
    }

    /// [`NodeConn::open_bridge`] with bounded retries on node rejection
    /// (upstream service may still be coming up).
    pub async fn open_bridge_with_retry(
        &self,
        service_id: &str,
        service_url: &str,
    ) -> Result<(String, mpsc::Receiver<Bytes>), TunnelError> {
        let mut last = TunnelError::NotReady;
        for attempt in 0..=self.open_retries {
            match self.open_bridge(service_id, service_url).await {
                Ok(opened) => return Ok(opened),
                Err(e @ TunnelError::NodeRejected(_)) => {
                    tracing::info!(service_id, attempt, err = %e, "open rejected, retrying");
                    last = e;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Close a bridge. Idempotent: the local entry is removed first, the
    /// peer is told best-effort, and an error response cannot resurrect
    /// state.
    pub async fn close_bridge(&self, bridge_id: &str) {
        let removed = self.bridges.write().await.remove(bridge_id);
        if removed.is_none() {
            return;
        }

        let request = Message::CloseBridgeRequest { id: 0, bridge_id: bridge_id.to_owned() };
        match self.request(request, self.close_timeout).await {
            Ok(Message::CloseBridgeResponse { success: true, .. }) => {
                tracing::info!(bridge_id, "bridge closed");
            }
            Ok(Message::CloseBridgeResponse { success: false, error, .. }) => {
                tracing::warn!(bridge_id, error = error.as_deref().unwrap_or(""), "close refused by node");
            }
            Ok(other) => {
                tracing::warn!(bridge_id, kind = other.kind(), "unexpected response to close_bridge");
            }
            Err(e) => {
                tracing::debug!(bridge_id, err = %e, "close_bridge request failed");
            }
        }
    }

    /// Emit a data frame toward the node-side service.
    pub async fn send(&self, bridge_id: &str, data: Bytes) -> Result<(), TunnelError> {
        if !self.is_ready() {
            return Err(TunnelError::NotReady);
        }
        let bridge = self.bridges.read().await.get(bridge_id).map(Arc::clone);
        let bridge = bridge.ok_or(TunnelError::Closed)?;

        let msg = Message::BridgeData {
            id: self.next_message_id(),
            bridge_id: bridge_id.to_owned(),
            data,
        };
        self.write_message(&msg).await?;
        bridge.touch();
        Ok(())
    }

    /// Snapshot of open bridges (for the idle scanner and the API).
    pub async fn bridges_snapshot(&self) -> Vec<Arc<Bridge>> {
        self.bridges.read().await.values().map(Arc::clone).collect()
    }

    // -- inbound --------------------------------------------------------------

    /// Drive the session: read frames until the peer closes, an error turns
    /// fatal, or the session is cancelled; then tear everything down.
    pub async fn run(self: Arc<Self>, state: Arc<RelayState>, mut read: SplitStream<WebSocket>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = read.next() => {
                    match frame {
                        Some(Ok(WsMessage::Binary(buf))) => match decode_frame(&buf) {
                            Ok(msg) => {
                                if let Err(e) = self.dispatch(&state, msg).await {
                                    tracing::warn!(err = %e, "session error, closing");
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(err = %e, "bad frame, closing session");
                                break;
                            }
                        },
                        Some(Ok(WsMessage::Text(_))) => {
                            tracing::warn!("unexpected text frame on tunnel, closing session");
                            break;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            tracing::debug!("node closed the transport");
                            break;
                        }
                        Some(Ok(_)) => {} // ping/pong
                        Some(Err(e)) => {
                            tracing::debug!(err = %e, "transport read error");
                            break;
                        }
                    }
                }
            }
        }

        let node_id = self.node_id();
        let was_ready = self.is_ready();
        self.close().await;

        if let Some(node_id) = node_id {
            if state.remove_if_current(&node_id, &self).await {
                state.directory.unregister(&node_id);
                tracing::info!(%node_id, "node offline");
                if was_ready {
                    state.emit(NodeEvent::NodeOffline { node_id });
                }
            }
        }
    }

    /// Handle one inbound message. `Err` terminates the session.
    async fn dispatch(self: &Arc<Self>, state: &Arc<RelayState>, msg: Message) -> Result<(), TunnelError> {
        match msg {
            // Enrollment: permitted only before registration.
            Message::TokenCheckRequest { id, node_id, token } => {
                self.require_enrolling("token_check_request")?;
                let valid = state.authority.verify(&token, &node_id);
                tracing::debug!(%node_id, valid, "token check");
                self.write_message(&Message::TokenCheckResponse { id, valid }).await
            }

            Message::NewTokenRequest { id, node_id, hostname, mac_addresses } => {
                self.require_enrolling("new_token_request")?;
                match state.authority.issue(&node_id) {
                    Ok(token) => {
                        tracing::info!(%node_id, %hostname, macs = ?mac_addresses, "issued node token");
                        self.write_message(&Message::NewTokenResponse {
                            id,
                            token: Some(token),
                            error: None,
                        })
                        .await
                    }
                    Err(e) => {
                        // Report once, then the session terminates.
                        let _ = self
                            .write_message(&Message::NewTokenResponse {
                                id,
                                token: None,
                                error: Some("token issuance failed".to_owned()),
                            })
                            .await;
                        Err(e)
                    }
                }
            }

            Message::RegisterRequest { id, node_id, token, hostname, mac_addresses } => {
                self.require_enrolling("register_request")?;
                if !state.authority.verify(&token, &node_id) {
                    let _ = self
                        .write_message(&Message::RegisterResponse {
                            id,
                            success: false,
                            dashboard_url: None,
                            error: Some("registration rejected".to_owned()),
                        })
                        .await;
                    return Err(TunnelError::Auth(format!("registration rejected for {node_id}")));
                }

                if let Ok(mut guard) = self.node_id.lock() {
                    *guard = Some(node_id.clone());
                }
                self.registered.store(true, Ordering::Release);
                let dashboard_url = state.directory.register(&node_id, &hostname, &mac_addresses);
                state.install(&node_id, Arc::clone(self)).await;

                if let Some(url) = dashboard_url.as_deref() {
                    tracing::info!(%node_id, url, "node awaiting operator linking");
                } else {
                    tracing::info!(%node_id, %hostname, "node registered");
                }
                self.write_message(&Message::RegisterResponse {
                    id,
                    success: true,
                    dashboard_url,
                    error: None,
                })
                .await
            }

            Message::NodeReady { .. } => {
                if !self.is_registered() {
                    return Err(TunnelError::Protocol("node_ready before registration".to_owned()));
                }
                if !self.ready.swap(true, Ordering::AcqRel) {
                    if let Some(node_id) = self.node_id() {
                        tracing::info!(%node_id, "node ready");
                        state.emit(NodeEvent::NodeReady { node_id });
                    }
                }
                Ok(())
            }

            Message::BridgeData { bridge_id, data, .. } => {
                if !self.is_ready() {
                    return Err(TunnelError::Protocol("bridge_data before ready".to_owned()));
                }
                let bridge = self.bridges.read().await.get(&bridge_id).map(Arc::clone);
                match bridge {
                    // QueueFull is logged inside push and invisible to the peer.
                    Some(bridge) => {
                        let _ = bridge.push(data);
                    }
                    // The close may have raced this frame.
                    None => tracing::debug!(%bridge_id, "data for unknown bridge, discarding"),
                }
                Ok(())
            }

            Message::CloseBridgeRequest { id, bridge_id } => {
                if !self.is_registered() {
                    return Err(TunnelError::Protocol("close_bridge_request before registration".to_owned()));
                }
                let removed = self.bridges.write().await.remove(&bridge_id);
                if removed.is_some() {
                    tracing::info!(%bridge_id, "bridge closed by node");
                }
                self.write_message(&Message::CloseBridgeResponse { id, success: true, error: None })
                    .await
            }

            // Bridges are always opened from the relay side.
            Message::OpenBridgeRequest { .. } => {
                Err(TunnelError::Protocol("node may not open bridges".to_owned()))
            }

            // Correlated responses to our own requests.
            response @ (Message::OpenBridgeResponse { .. } | Message::CloseBridgeResponse { .. }) => {
                let id = response.id();
                if !self.pending.complete(id, response) {
                    // Late response after a timeout; the waiter already left.
                    tracing::warn!(id, "dropping response with no pending waiter");
                }
                Ok(())
            }

            // These flow relay → node only.
            unexpected @ (Message::TokenCheckResponse { .. }
            | Message::NewTokenResponse { .. }
            | Message::RegisterResponse { .. }) => {
                Err(TunnelError::Protocol(format!("unexpected {} from node", unexpected.kind())))
            }
        }
    }

    fn require_enrolling(&self, kind: &str) -> Result<(), TunnelError> {
        if self.is_registered() {
            return Err(TunnelError::Protocol(format!("{kind} after registration")));
        }
        Ok(())
    }

    /// One-shot, idempotent teardown: cancels pending waiters, drops every
    /// bridge sink (consumers observe end-of-stream), and closes the
    /// transport gracefully.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.pending.cancel_all();
        self.bridges.write().await.clear();

        let mut writer = self.writer.lock().await;
        let _ = writer.send(WsMessage::Close(None)).await;
    }
}
