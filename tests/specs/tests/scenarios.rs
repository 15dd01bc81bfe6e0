// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end tunnel scenarios: a real relay, real node agents, scratch TCP
//! services, and a protocol-level fake node for misbehaving peers.

use std::time::Duration;

use bytes::Bytes;
use unblink_node::config::ReconnectPolicy;
use unblink_specs::{test_relay_config, EchoService, FakeNode, TestNode, TestRelay, TIMEOUT};
use unblink_tunnel::{Message, TunnelError, MAX_FRAME};

/// Drain a bridge sink until `want` bytes have arrived.
async fn read_exact_from_sink(
    sink: &mut tokio::sync::mpsc::Receiver<Bytes>,
    want: usize,
) -> anyhow::Result<Vec<u8>> {
    let mut got = Vec::with_capacity(want);
    while got.len() < want {
        let chunk = tokio::time::timeout(TIMEOUT, sink.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("sink closed early"))?;
        got.extend_from_slice(&chunk);
    }
    Ok(got)
}

// -- S1: happy-path bridge ----------------------------------------------------

#[tokio::test]
async fn s1_happy_path_bridge() -> anyhow::Result<()> {
    let relay = TestRelay::start().await?;
    let service = EchoService::start().await?;
    let node = TestNode::start(&relay.address(), "node-s1", "")?;

    let conn = relay.wait_ready("node-s1").await?;

    let (bridge_id, mut sink) = conn.open_bridge("cam-front", &service.url()).await?;
    service.wait_live(1).await?;

    conn.send(&bridge_id, Bytes::from_static(&[0x01, 0x02, 0x03])).await?;
    let echoed = read_exact_from_sink(&mut sink, 3).await?;
    assert_eq!(echoed, vec![0x01, 0x02, 0x03]);

    conn.close_bridge(&bridge_id).await;
    assert_eq!(conn.bridge_count().await, 0);
    service.wait_live(0).await?;

    // Sink readers observe end-of-stream.
    let eos = tokio::time::timeout(TIMEOUT, async {
        while sink.recv().await.is_some() {}
    })
    .await;
    assert!(eos.is_ok(), "sink never reached end-of-stream");

    // First-run enrollment persisted a token.
    let persisted = node.persisted()?;
    assert!(!persisted.token.is_empty());

    node.stop().await;
    relay.stop().await;
    service.stop();
    Ok(())
}

// -- S2: invalid existing token ----------------------------------------------

#[tokio::test]
async fn s2_stale_token_is_replaced() -> anyhow::Result<()> {
    let relay = TestRelay::start().await?;
    let node = TestNode::start(&relay.address(), "node-s2", "STALE")?;

    relay.wait_ready("node-s2").await?;

    let persisted = node.persisted()?;
    assert_ne!(persisted.token, "STALE");
    assert!(!persisted.token.is_empty());

    node.stop().await;
    relay.stop().await;
    Ok(())
}

// -- S3: open to unreachable service -----------------------------------------

#[tokio::test]
async fn s3_unreachable_service_fails_open_cleanly() -> anyhow::Result<()> {
    let relay = TestRelay::start().await?;
    let node = TestNode::start(&relay.address(), "node-s3", "")?;
    let conn = relay.wait_ready("node-s3").await?;

    let Err(err) = conn.open_bridge("cam", "tcp://127.0.0.1:1").await else {
        anyhow::bail!("open to unreachable service succeeded");
    };
    assert!(
        matches!(err, TunnelError::NodeRejected(ref reason) if reason.contains("dial")),
        "unexpected error: {err}"
    );
    assert_eq!(conn.bridge_count().await, 0);

    // The session survives; a reachable open still works.
    let service = EchoService::start().await?;
    let (bridge_id, _sink) = conn.open_bridge("cam", &service.url()).await?;
    conn.close_bridge(&bridge_id).await;

    node.stop().await;
    relay.stop().await;
    service.stop();
    Ok(())
}

// -- S4: oversize frame attack ------------------------------------------------

#[tokio::test]
async fn s4_oversize_frame_closes_session() -> anyhow::Result<()> {
    let relay = TestRelay::start().await?;
    let mut fake = FakeNode::connect(&relay.address()).await?;
    fake.enroll("node-s4").await?;
    relay.wait_ready("node-s4").await?;

    let mut frame = ((MAX_FRAME as u32) + 1).to_be_bytes().to_vec();
    frame.extend_from_slice(&[0u8; 32]);
    fake.send_raw(frame).await?;

    // The relay emits no further messages and drops the transport.
    match fake.recv().await {
        Ok(None) | Err(_) => {}
        Ok(Some(msg)) => anyhow::bail!("relay kept talking after oversize frame: {msg:?}"),
    }
    relay.wait_offline("node-s4").await?;

    relay.stop().await;
    Ok(())
}

// -- S5: request timeout and the late response --------------------------------

#[tokio::test]
async fn s5_open_timeout_cleans_pending_and_late_response_is_dropped() -> anyhow::Result<()> {
    let relay = TestRelay::start().await?;
    let mut fake = FakeNode::connect(&relay.address()).await?;
    fake.enroll("node-s5").await?;
    let conn = relay.wait_ready("node-s5").await?;

    // The fake node reads the open request but never answers.
    let (opened, request) =
        tokio::join!(conn.open_bridge("cam", "tcp://127.0.0.1:9"), fake.recv());

    let Err(err) = opened else {
        anyhow::bail!("open_bridge succeeded without a node response");
    };
    assert_eq!(err, TunnelError::Timeout);
    assert_eq!(conn.bridge_count().await, 0, "failed open left bridge state");

    // A late response finds no waiter; lenient policy keeps the session.
    let Some(Message::OpenBridgeRequest { id, .. }) = request? else {
        anyhow::bail!("fake node never saw the open request");
    };
    fake.reply(&Message::OpenBridgeResponse { id, success: true, error: None }).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let still = relay.state.lookup("node-s5").await;
    assert!(still.is_some_and(|conn| conn.is_ready()), "late response killed the session");

    relay.stop().await;
    Ok(())
}

// -- S6: session close cascades -----------------------------------------------

#[tokio::test]
async fn s6_session_close_cascades_to_all_bridges() -> anyhow::Result<()> {
    let relay = TestRelay::start().await?;
    let service = EchoService::start().await?;
    let node = TestNode::start(&relay.address(), "node-s6", "")?;
    let conn = relay.wait_ready("node-s6").await?;

    let mut sinks = Vec::new();
    for i in 0..3 {
        let (bridge_id, mut sink) = conn.open_bridge("cam", &service.url()).await?;
        conn.send(&bridge_id, Bytes::from(vec![i as u8; 16])).await?;
        let echoed = read_exact_from_sink(&mut sink, 16).await?;
        assert_eq!(echoed, vec![i as u8; 16]);
        sinks.push(sink);
    }
    service.wait_live(3).await?;
    assert_eq!(conn.bridge_count().await, 3);

    conn.close().await;

    // Every sink reaches end-of-stream within the shutdown budget.
    for mut sink in sinks {
        let eos = tokio::time::timeout(TIMEOUT, async {
            while sink.recv().await.is_some() {}
        })
        .await;
        assert!(eos.is_ok(), "sink never reached end-of-stream");
    }
    assert_eq!(conn.bridge_count().await, 0);

    // The node observes the close, tears down its TCP legs, and exits
    // (reconnect disabled).
    service.wait_live(0).await?;
    relay.wait_offline("node-s6").await?;
    let _ = tokio::time::timeout(TIMEOUT, node.handle).await?;

    relay.stop().await;
    service.stop();
    Ok(())
}

// -- protocol violations ------------------------------------------------------

#[tokio::test]
async fn node_opening_a_bridge_is_a_protocol_error() -> anyhow::Result<()> {
    let relay = TestRelay::start().await?;
    let mut fake = FakeNode::connect(&relay.address()).await?;
    fake.enroll("node-bad").await?;
    relay.wait_ready("node-bad").await?;

    fake.send(Message::OpenBridgeRequest {
        id: 0,
        bridge_id: "b-bad".to_owned(),
        service_id: "svc".to_owned(),
        service_url: "tcp://127.0.0.1:1".to_owned(),
    })
    .await?;

    match fake.recv().await {
        Ok(None) | Err(_) => {}
        Ok(Some(msg)) => anyhow::bail!("expected session close, got {msg:?}"),
    }
    relay.wait_offline("node-bad").await?;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn bridge_data_before_ready_is_a_protocol_error() -> anyhow::Result<()> {
    let relay = TestRelay::start().await?;
    let mut fake = FakeNode::connect(&relay.address()).await?;

    fake.send(Message::BridgeData {
        id: 0,
        bridge_id: "b".to_owned(),
        data: Bytes::from_static(&[1]),
    })
    .await?;

    match fake.recv().await {
        Ok(None) | Err(_) => {}
        Ok(Some(msg)) => anyhow::bail!("expected session close, got {msg:?}"),
    }

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn data_for_unknown_bridge_is_discarded_quietly() -> anyhow::Result<()> {
    let relay = TestRelay::start().await?;
    let mut fake = FakeNode::connect(&relay.address()).await?;
    fake.enroll("node-q").await?;
    let conn = relay.wait_ready("node-q").await?;

    fake.send(Message::BridgeData {
        id: 0,
        bridge_id: "never-opened".to_owned(),
        data: Bytes::from_static(&[1, 2, 3]),
    })
    .await?;

    // The session stays open and usable.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(relay.state.lookup("node-q").await.is_some());
    assert!(conn.is_ready());

    relay.stop().await;
    Ok(())
}

// -- idempotence --------------------------------------------------------------

#[tokio::test]
async fn close_bridge_twice_is_a_no_op() -> anyhow::Result<()> {
    let relay = TestRelay::start().await?;
    let service = EchoService::start().await?;
    let node = TestNode::start(&relay.address(), "node-idem", "")?;
    let conn = relay.wait_ready("node-idem").await?;

    let (bridge_id, _sink) = conn.open_bridge("cam", &service.url()).await?;
    conn.close_bridge(&bridge_id).await;
    conn.close_bridge(&bridge_id).await;
    assert_eq!(conn.bridge_count().await, 0);

    // Session is still healthy after the double close.
    let (second, _sink2) = conn.open_bridge("cam", &service.url()).await?;
    assert_ne!(second, bridge_id, "bridge ids must never be reused");

    node.stop().await;
    relay.stop().await;
    service.stop();
    Ok(())
}

#[tokio::test]
async fn session_close_is_idempotent() -> anyhow::Result<()> {
    let relay = TestRelay::start().await?;
    let node = TestNode::start(&relay.address(), "node-close2", "")?;
    let conn = relay.wait_ready("node-close2").await?;

    conn.close().await;
    conn.close().await;
    relay.wait_offline("node-close2").await?;

    node.stop().await;
    relay.stop().await;
    Ok(())
}

// -- supervisor ---------------------------------------------------------------

#[tokio::test]
async fn supervisor_respects_max_attempts() -> anyhow::Result<()> {
    // Nothing listens on this port; every dial fails.
    let node = TestNode::start_with(
        "ws://127.0.0.1:1",
        "node-retry",
        "",
        ReconnectPolicy { enabled: true, max_attempts: 2 },
    )?;

    let result = tokio::time::timeout(Duration::from_secs(30), node.handle).await??;
    assert!(result.is_err(), "supervisor should give up after the retry budget");
    Ok(())
}

// -- operational surface ------------------------------------------------------

#[tokio::test]
async fn health_reports_connected_nodes() -> anyhow::Result<()> {
    let relay = TestRelay::start().await?;
    let node = TestNode::start(&relay.address(), "node-health", "")?;
    relay.wait_ready("node-health").await?;

    let body: serde_json::Value =
        reqwest::get(format!("{}/api/v1/health", relay.base_url())).await?.json().await?;
    assert_eq!(body["status"], "running");
    assert_eq!(body["node_count"], 1);

    let nodes: serde_json::Value =
        reqwest::get(format!("{}/api/v1/nodes", relay.base_url())).await?.json().await?;
    assert_eq!(nodes[0]["node_id"], "node-health");
    assert_eq!(nodes[0]["ready"], true);

    node.stop().await;
    relay.stop().await;
    Ok(())
}

// -- idle detection -----------------------------------------------------------

#[tokio::test]
async fn idle_bridges_are_reaped() -> anyhow::Result<()> {
    let mut config = test_relay_config();
    config.bridge_idle_secs = 1;
    config.idle_check_secs = 1;

    let relay = TestRelay::start_with(config).await?;
    let service = EchoService::start().await?;
    let node = TestNode::start(&relay.address(), "node-idle", "")?;
    let conn = relay.wait_ready("node-idle").await?;

    let (_bridge_id, mut sink) = conn.open_bridge("cam", &service.url()).await?;
    service.wait_live(1).await?;

    // No traffic: the scanner closes the bridge and the sink ends.
    let eos = tokio::time::timeout(Duration::from_secs(10), async {
        while sink.recv().await.is_some() {}
    })
    .await;
    assert!(eos.is_ok(), "idle bridge was never reaped");
    assert_eq!(conn.bridge_count().await, 0);
    service.wait_live(0).await?;

    node.stop().await;
    relay.stop().await;
    service.stop();
    Ok(())
}
