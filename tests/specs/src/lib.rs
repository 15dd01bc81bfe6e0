// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end tunnel scenarios.
//!
//! Spawns a real relay on an ephemeral port, real node agents with scratch
//! config files, plain-TCP echo services, and a protocol-level fake node for
//! misbehaving-peer tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use unblink_node::config::{NodeConfig, ReconnectPolicy};
use unblink_relay::auth::HmacTokenAuthority;
use unblink_relay::config::RelayConfig;
use unblink_relay::directory::MemoryDirectory;
use unblink_relay::session::NodeConn;
use unblink_relay::state::RelayState;
use unblink_relay::transport::build_router;
use unblink_tunnel::{decode_frame, encode_frame, Message};

/// Default await budget for scenario steps.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Relay config tuned for tests: short open timeout, tiny idle scan.
pub fn test_relay_config() -> RelayConfig {
    RelayConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
        secret: None,
        public_url: None,
        auth_token: None,
        open_timeout_secs: 2,
        close_timeout_secs: 2,
        bridge_queue: 64,
        bridge_idle_secs: 0,
        idle_check_secs: 1,
        bridge_open_retries: 0,
    }
}

/// An in-process relay bound to an ephemeral port.
pub struct TestRelay {
    pub state: Arc<RelayState>,
    pub port: u16,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl TestRelay {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(test_relay_config()).await
    }

    pub async fn start_with(mut config: RelayConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        config.port = port;

        let shutdown = CancellationToken::new();
        let authority = Arc::new(HmacTokenAuthority::from_config(None)?);
        let directory = Arc::new(MemoryDirectory::new(config.link_base()));
        let state =
            Arc::new(RelayState::new(config, shutdown.clone(), authority, directory));

        let router = build_router(Arc::clone(&state));
        let stop = shutdown.clone();
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await;
        });

        Ok(Self { state, port, shutdown, server })
    }

    pub fn address(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Poll until the node's session is installed and ready.
    pub async fn wait_ready(&self, node_id: &str) -> anyhow::Result<Arc<NodeConn>> {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            if let Some(conn) = self.state.lookup(node_id).await {
                if conn.is_ready() {
                    return Ok(conn);
                }
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("node {node_id} never became ready");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until the node's session is gone from the table.
    pub async fn wait_offline(&self, node_id: &str) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        while self.state.lookup(node_id).await.is_some() {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("node {node_id} never went offline");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.server.await;
    }
}

/// A real node agent running in-process against a scratch config file.
pub struct TestNode {
    pub node_id: String,
    pub config_path: PathBuf,
    pub handle: JoinHandle<anyhow::Result<()>>,
    _dir: tempfile::TempDir,
}

impl TestNode {
    /// Start a node with the given persisted token ("" for first run).
    pub fn start(relay_address: &str, node_id: &str, token: &str) -> anyhow::Result<Self> {
        Self::start_with(relay_address, node_id, token, ReconnectPolicy {
            enabled: false,
            max_attempts: 0,
        })
    }

    pub fn start_with(
        relay_address: &str,
        node_id: &str,
        token: &str,
        reconnect: ReconnectPolicy,
    ) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let config_path = dir.path().join("node.json");

        let mut config = NodeConfig::default();
        config.relay_address = relay_address.to_owned();
        config.node_id = node_id.to_owned();
        config.token = token.to_owned();
        config.reconnect = reconnect;
        config.save(&config_path)?;

        let path = config_path.clone();
        let handle =
            tokio::spawn(async move { unblink_node::supervisor::run(config, &path).await });

        Ok(Self { node_id: node_id.to_owned(), config_path, handle, _dir: dir })
    }

    /// Reload the persisted config (to observe token persistence).
    pub fn persisted(&self) -> anyhow::Result<NodeConfig> {
        NodeConfig::load_or_init(&self.config_path)
    }

    /// Abort the node task and wait for it to settle.
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

/// A plain-TCP echo service that mirrors every byte back and counts live
/// connections.
pub struct EchoService {
    pub addr: String,
    pub live: Arc<AtomicUsize>,
    listener_task: JoinHandle<()>,
}

impl EchoService {
    pub async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        let live = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&live);
        let listener_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    echo_loop(stream).await;
                    counter.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Ok(Self { addr, live, listener_task })
    }

    pub fn url(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Poll until the number of live service connections matches.
    pub async fn wait_live(&self, expected: usize) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        while self.live_connections() != expected {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!(
                    "expected {expected} live connections, have {}",
                    self.live_connections()
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    pub fn stop(self) {
        self.listener_task.abort();
    }
}

async fn echo_loop(mut stream: TcpStream) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// A protocol-level client for misbehaving-peer tests: speaks raw frames
/// over the tunnel substrate without the real node's state machine.
pub struct FakeNode {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
}

impl FakeNode {
    pub async fn connect(relay_address: &str) -> anyhow::Result<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(format!("{relay_address}/tunnel")).await?;
        Ok(Self { ws, next_id: 0 })
    }

    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Send a message, stamping a fresh id. Returns the id used.
    pub async fn send(&mut self, mut msg: Message) -> anyhow::Result<u64> {
        let id = self.fresh_id();
        msg.set_id(id);
        self.ws.send(WsMessage::Binary(encode_frame(&msg)?.into())).await?;
        Ok(id)
    }

    /// Send a response as-is (responses echo the request id).
    pub async fn reply(&mut self, msg: &Message) -> anyhow::Result<()> {
        self.ws.send(WsMessage::Binary(encode_frame(msg)?.into())).await?;
        Ok(())
    }

    /// Ship raw bytes as one substrate frame, bypassing the codec.
    pub async fn send_raw(&mut self, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.ws.send(WsMessage::Binary(bytes.into())).await?;
        Ok(())
    }

    /// Receive the next protocol message; `None` when the relay closed.
    pub async fn recv(&mut self) -> anyhow::Result<Option<Message>> {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| anyhow::anyhow!("timed out waiting for relay message"))?;
            let frame = tokio::time::timeout(remaining, self.ws.next()).await?;
            match frame {
                Some(Ok(WsMessage::Binary(buf))) => return Ok(Some(decode_frame(&buf)?)),
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Complete enrollment: fresh token, register, NodeReady.
    pub async fn enroll(&mut self, node_id: &str) -> anyhow::Result<()> {
        self.send(Message::NewTokenRequest {
            id: 0,
            node_id: node_id.to_owned(),
            hostname: "fake-host".to_owned(),
            mac_addresses: vec![],
        })
        .await?;
        let token = match self.recv().await? {
            Some(Message::NewTokenResponse { token: Some(token), .. }) => token,
            other => anyhow::bail!("expected token, got {other:?}"),
        };

        self.send(Message::RegisterRequest {
            id: 0,
            node_id: node_id.to_owned(),
            token,
            hostname: "fake-host".to_owned(),
            mac_addresses: vec![],
        })
        .await?;
        match self.recv().await? {
            Some(Message::RegisterResponse { success: true, .. }) => {}
            other => anyhow::bail!("expected registration, got {other:?}"),
        }

        self.send(Message::NodeReady { id: 0 }).await?;
        Ok(())
    }
}
