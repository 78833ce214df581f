//! Test harness for in-process courier-node integration tests.
//!
//! TestNode runs a full node (API, edge, relay, consumer, push router) on
//! ephemeral ports against a temp database. TestClient speaks the edge
//! protocol over a real TCP connection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_node::bus::{BusError, BusPolicy, LocalBus, MessageBus, Subscription};
use courier_node::config::NodeConfig;
use courier_node::runtime::NodeRuntime;
use courier_protocol::{
    Ack, FrameCodec, Handshake, HandshakeReply, Packet, PacketCodec, Payload, PushMessage,
    PROTOCOL_MAGIC,
};
use courier_storage::{SqliteStorage, Store};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

pub const TEST_TOKEN: &str = "integration-token";

/// Fast timings so retries and membership refreshes happen within a test.
pub fn test_config(node_id: &str, db: &std::path::Path) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.node.node_id = node_id.into();
    cfg.node.database = db.display().to_string();
    cfg.node.api_addr = "127.0.0.1:0".into();
    cfg.node.edge_addr = "127.0.0.1:0".into();
    cfg.relay.interval_ms = 20;
    cfg.relay.backoff_base_ms = 1;
    cfg.relay.backoff_max_ms = 5;
    cfg.consumer.attempt_delay_ms = 5;
    cfg.push.membership_refresh_secs = 1;
    cfg.edge.allow_anonymous = true;
    cfg
}

/// Bus wrapper that refuses publishes while `failures_left > 0`.
pub struct FlakyBus {
    inner: LocalBus,
    failures_left: AtomicU32,
}

#[allow(dead_code)]
impl FlakyBus {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: LocalBus::new(BusPolicy {
                redelivery_delay: Duration::from_millis(20),
                ..BusPolicy::default()
            }),
            failures_left: AtomicU32::new(failures),
        }
    }

    pub fn set_failures(&self, failures: u32) {
        self.failures_left.store(failures, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageBus for FlakyBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BusError::Publish("injected failure".into()));
        }
        self.inner.publish(topic, payload).await
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, BusError> {
        self.inner.subscribe(topic, group).await
    }
}

/// A running in-process node.
pub struct TestNode {
    pub runtime: NodeRuntime,
    pub store: Arc<dyn Store>,
    pub bus: Arc<FlakyBus>,
    pub bearer_token: String,
    _tempdir: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestNode {
    pub async fn start() -> Self {
        Self::start_with(FlakyBus::new(0), |_| {}).await
    }

    pub async fn start_with(bus: FlakyBus, tweak: impl FnOnce(&mut NodeConfig)) -> Self {
        let tempdir = tempfile::tempdir().unwrap();
        let db = tempdir.path().join("courier.db");
        let mut cfg = test_config("edge-1", &db);
        tweak(&mut cfg);

        let store: Arc<dyn Store> = Arc::new(SqliteStorage::open(&db).unwrap());
        let bus = Arc::new(bus);
        let runtime = NodeRuntime::start(&cfg, store.clone(), TEST_TOKEN.into(), bus.clone())
            .await
            .unwrap();

        Self {
            runtime,
            store,
            bus,
            bearer_token: TEST_TOKEN.into(),
            _tempdir: tempdir,
        }
    }

    pub async fn shutdown(self) {
        self.runtime.shutdown().await;
    }

    /// Raw POST returning (status_code, body_json).
    pub async fn api_post_raw(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<(u16, serde_json::Value)> {
        let url = format!("http://{}{}", self.runtime.api_addr(), path);
        let resp = reqwest::Client::new()
            .post(&url)
            .bearer_auth(&self.bearer_token)
            .json(&body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let value = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
        Ok((status, value))
    }

    pub async fn api_post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let (status, value) = self.api_post_raw(path, body).await?;
        if status != 200 {
            anyhow::bail!("{path} returned {status}: {value}");
        }
        Ok(value)
    }

    pub async fn create_session(&self, session_id: &str, kind: &str, members: &[&str]) {
        self.api_post(
            "/api/v1/sessions/create",
            serde_json::json!({
                "session_id": session_id,
                "name": session_id,
                "kind": kind,
                "members": members,
            }),
        )
        .await
        .unwrap();
    }

    pub async fn inbox(&self, owner: &str, session_id: &str) -> Vec<serde_json::Value> {
        let resp = self
            .api_post(
                "/api/v1/inbox/list",
                serde_json::json!({ "owner": owner, "session_id": session_id }),
            )
            .await
            .unwrap();
        resp["entries"].as_array().cloned().unwrap_or_default()
    }

    pub async fn diagnostics(&self) -> serde_json::Value {
        self.api_post("/api/v1/diagnostics", serde_json::json!({}))
            .await
            .unwrap()
    }

    /// Poll until `owner` has `n` inbox records in `session_id`.
    pub async fn wait_inbox(&self, owner: &str, session_id: &str, n: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let records = self.inbox(owner, session_id).await;
            if records.len() >= n {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timeout waiting for {n} inbox records for {owner}, have {}", records.len());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn connect(&self, username: &str) -> TestClient {
        TestClient::connect(self.runtime.edge_addr(), username).await
    }
}

/// An edge protocol client.
pub struct TestClient {
    framed: Framed<TcpStream, PacketCodec>,
    next_seq: u32,
}

#[allow(dead_code)]
impl TestClient {
    pub async fn connect(addr: std::net::SocketAddr, username: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::<HandshakeReply>::new());
        framed
            .send(Handshake {
                magic: PROTOCOL_MAGIC,
                version: 1,
                username: username.into(),
                token: String::new(),
            })
            .await
            .unwrap();
        let reply = framed.next().await.unwrap().unwrap();
        assert!(reply.accepted, "handshake rejected: {:?}", reply.reason);

        Self {
            framed: framed.map_codec(|_| PacketCodec::new()),
            next_seq: 0,
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        self.framed.send(packet).await.unwrap();
    }

    /// Send a chat message and wait for its ack, skipping unrelated packets.
    pub async fn chat(&mut self, session_id: &str, content: &str) -> Ack {
        self.next_seq += 1;
        let seq = format!("c-{}", self.next_seq);
        self.send(Packet::chat(seq.clone(), session_id, content, 1)).await;

        loop {
            let packet = self
                .recv(Duration::from_secs(5))
                .await
                .expect("no ack received");
            if packet.seq == seq {
                match packet.payload {
                    Payload::Ack(ack) => return ack,
                    other => panic!("expected ack for {seq}, got {other:?}"),
                }
            }
        }
    }

    /// Next packet, or None on timeout / close.
    pub async fn recv(&mut self, timeout: Duration) -> Option<Packet> {
        match tokio::time::timeout(timeout, self.framed.next()).await {
            Ok(Some(Ok(packet))) => Some(packet),
            _ => None,
        }
    }

    /// Wait for the next pushed message.
    pub async fn expect_push(&mut self, timeout: Duration) -> PushMessage {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            let packet = self.recv(left).await.expect("no push received");
            if let Payload::Push(mut push) = packet.payload {
                return push.messages.remove(0);
            }
        }
    }
}
