// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Node-side bridge handling: TCP fan-out to local services.
//!
//! Each open bridge owns a TCP connection. A forwarder task streams service
//! output back to the relay as BridgeData frames; inbound BridgeData is
//! written to the service socket. Local TCP failures close only the affected
//! bridge and notify the relay best-effort.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use unblink_tunnel::{Message, TunnelError};

use crate::config::ServiceEntry;
use crate::conn::Outbound;

/// TCP dial timeout for service connections.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Read buffer size for the service → relay path.
const READ_BUF: usize = 4 * 1024;

/// Parsed service address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTarget {
    pub host: String,
    pub port: u16,
    pub path: Option<String>,
}

/// Parse a service URL into host, port, and optional path.
///
/// Accepts `tcp://host:port`, `http://host[:port]/path`, and bare
/// `host:port`. The scheme is otherwise opaque; only well-known schemes get
/// a default port.
pub fn parse_service_url(url: &str) -> Result<ServiceTarget, String> {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) if !scheme.is_empty() => (Some(scheme), rest),
        Some(_) => return Err(format!("malformed service url: {url}")),
        None => (None, url),
    };

    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, Some(format!("/{path}"))),
        None => (rest, None),
    };
    if authority.is_empty() {
        return Err(format!("missing host in service url: {url}"));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 =
                port.parse().map_err(|_| format!("bad port in service url: {url}"))?;
            (host, Some(port))
        }
        None => (authority, None),
    };
    if host.is_empty() {
        return Err(format!("missing host in service url: {url}"));
    }

    let port = match (port, scheme) {
        (Some(port), _) => port,
        (None, Some("http")) => 80,
        (None, Some("https")) => 443,
        (None, Some("rtsp")) => 554,
        _ => return Err(format!("missing port in service url: {url}")),
    };

    Ok(ServiceTarget { host: host.to_owned(), port, path })
}

struct BridgeHandle {
    cancel: CancellationToken,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

/// Bridge table for one node session.
pub struct NodeBridges {
    outbound: Arc<Outbound>,
    cancel: CancellationToken,
    /// Configured service allowlist; empty means any service is dialable.
    services: Vec<ServiceEntry>,
    inner: Arc<RwLock<HashMap<String, BridgeHandle>>>,
}

/// An empty allowlist permits everything; a populated one is exhaustive.
fn service_allowed(services: &[ServiceEntry], service_id: &str) -> bool {
    services.is_empty() || services.iter().any(|s| s.id == service_id)
}

impl NodeBridges {
    pub fn new(
        outbound: Arc<Outbound>,
        cancel: CancellationToken,
        services: Vec<ServiceEntry>,
    ) -> Self {
        Self { outbound, cancel, services, inner: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Handle one bridge message from the relay. `Err` means the transport
    /// write path failed and the session must close.
    pub async fn dispatch(&self, msg: Message) -> Result<(), TunnelError> {
        match msg {
            Message::OpenBridgeRequest { id, bridge_id, service_id, service_url } => {
                self.open(id, bridge_id, service_id, service_url).await
            }

            Message::BridgeData { bridge_id, data, .. } => {
                let writer = self.inner.read().await.get(&bridge_id).map(|h| Arc::clone(&h.writer));
                match writer {
                    Some(writer) => {
                        let write = { writer.lock().await.write_all(&data).await };
                        if let Err(e) = write {
                            tracing::warn!(%bridge_id, err = %e, "service write failed, closing bridge");
                            self.close_local(&bridge_id).await;
                            self.outbound
                                .send(Message::CloseBridgeRequest { id: 0, bridge_id })
                                .await?;
                        }
                    }
                    // The close may have raced this frame.
                    None => tracing::debug!(%bridge_id, "data for unknown bridge, discarding"),
                }
                Ok(())
            }

            Message::CloseBridgeRequest { id, bridge_id } => {
                let removed = self.close_local(&bridge_id).await;
                if removed {
                    tracing::info!(%bridge_id, "bridge closed by relay");
                }
                self.outbound
                    .reply(&Message::CloseBridgeResponse { id, success: true, error: None })
                    .await
            }

            other => Err(TunnelError::Protocol(format!(
                "{} is not a bridge message",
                other.kind()
            ))),
        }
    }

    async fn open(
        &self,
        request_id: u64,
        bridge_id: String,
        service_id: String,
        service_url: String,
    ) -> Result<(), TunnelError> {
        if !service_allowed(&self.services, &service_id) {
            tracing::warn!(%bridge_id, %service_id, "service not in allowlist, rejecting open");
            return self
                .reject_open(request_id, format!("service {service_id} not allowed"))
                .await;
        }

        let target = match parse_service_url(&service_url) {
            Ok(target) => target,
            Err(reason) => {
                tracing::warn!(%bridge_id, %service_id, reason, "rejecting open");
                return self.reject_open(request_id, reason).await;
            }
        };

        let dial = tokio::time::timeout(
            DIAL_TIMEOUT,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await;
        let stream = match dial {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::info!(%bridge_id, host = %target.host, port = target.port, err = %e, "dial failed");
                return self.reject_open(request_id, format!("dial failed: {e}")).await;
            }
            Err(_) => {
                tracing::info!(%bridge_id, host = %target.host, port = target.port, "dial timed out");
                return self.reject_open(request_id, "dial timed out".to_owned()).await;
            }
        };

        let (read_half, write_half) = stream.into_split();
        let cancel = self.cancel.child_token();

        // Register before responding so relay data racing the response
        // finds the bridge.
        self.inner.write().await.insert(
            bridge_id.clone(),
            BridgeHandle { cancel: cancel.clone(), writer: Arc::new(Mutex::new(write_half)) },
        );
        self.outbound
            .reply(&Message::OpenBridgeResponse { id: request_id, success: true, error: None })
            .await?;

        tracing::info!(%bridge_id, %service_id, host = %target.host, port = target.port, "bridge open");

        tokio::spawn(forward(
            read_half,
            bridge_id,
            cancel,
            Arc::clone(&self.outbound),
            Arc::clone(&self.inner),
        ));
        Ok(())
    }

    async fn reject_open(&self, request_id: u64, reason: String) -> Result<(), TunnelError> {
        self.outbound
            .reply(&Message::OpenBridgeResponse {
                id: request_id,
                success: false,
                error: Some(reason),
            })
            .await
    }

    /// Cancel and remove a bridge. Idempotent; sockets close when the last
    /// handle drops.
    async fn close_local(&self, bridge_id: &str) -> bool {
        let removed = self.inner.write().await.remove(bridge_id);
        match removed {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Tear down every bridge (session close).
    pub async fn close_all(&self) {
        let drained: Vec<(String, BridgeHandle)> =
            self.inner.write().await.drain().collect();
        for (bridge_id, handle) in drained {
            tracing::debug!(%bridge_id, "closing bridge with session");
            handle.cancel.cancel();
        }
    }
}

/// Service → relay forwarder: read chunks, emit BridgeData frames.
async fn forward(
    mut read_half: OwnedReadHalf,
    bridge_id: String,
    cancel: CancellationToken,
    outbound: Arc<Outbound>,
    bridges: Arc<RwLock<HashMap<String, BridgeHandle>>>,
) {
    let mut buf = [0u8; READ_BUF];
    let mut chunks: u64 = 0;
    let mut bytes: u64 = 0;
    let mut notify_relay = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!(%bridge_id, "service closed its side");
                    notify_relay = true;
                    break;
                }
                Ok(n) => {
                    chunks += 1;
                    bytes += n as u64;
                    let frame = Message::BridgeData {
                        id: 0,
                        bridge_id: bridge_id.clone(),
                        data: Bytes::copy_from_slice(&buf[..n]),
                    };
                    if outbound.send(frame).await.is_err() {
                        tracing::debug!(%bridge_id, "transport gone, stopping forwarder");
                        break;
                    }
                }
                Err(e) => {
                    tracing::info!(%bridge_id, err = %e, "service read failed");
                    notify_relay = true;
                    break;
                }
            },
        }
    }

    // Only the side that removes the entry reports the close upstream; a
    // shutdown raced through close_local already told (or was told by) the
    // relay.
    if notify_relay && bridges.write().await.remove(&bridge_id).is_some() {
        let close = Message::CloseBridgeRequest { id: 0, bridge_id: bridge_id.clone() };
        // Best effort; the response is not awaited.
        let _ = outbound.send(close).await;
    }

    tracing::debug!(%bridge_id, chunks, bytes, "forwarder exited");
}

#[cfg(test)]
#[path = "bridge_tests.rs"]
mod tests;
