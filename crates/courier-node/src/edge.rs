//! Edge protocol layer -- long-lived client TCP connections.
//!
//! Per connection: handshake (magic, version, token) within the handshake
//! timeout, then a packet loop. Chat packets go to ingest and are always
//! answered with an Ack carrying the client's `seq`. Pushes from the push
//! router arrive through the `ConnectionRegistry`, which is this node's
//! `PushSink`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_api::{PipelineStats, PushSink};
use courier_ingest::AcceptRequest;
use courier_protocol::{
    FrameCodec, Handshake, HandshakeReply, Packet, PacketCodec, Payload, PushTask,
    PROTOCOL_MAGIC, VERSION_MAX, VERSION_MIN,
};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::codec::Framed;

use crate::ingest_client::IngestClient;
use crate::presence::PresenceDirectory;

// ============================================================================
// Authentication
// ============================================================================

/// Verifies handshake tokens against `edge.tokens` (username -> hex SHA-256).
pub struct Authenticator {
    allow_anonymous: bool,
    tokens: HashMap<String, String>,
}

impl Authenticator {
    pub fn new(allow_anonymous: bool, tokens: HashMap<String, String>) -> Self {
        Self {
            allow_anonymous,
            tokens: tokens
                .into_iter()
                .map(|(user, hash)| (user, hash.to_ascii_lowercase()))
                .collect(),
        }
    }

    pub fn verify(&self, username: &str, token: &str) -> Result<(), String> {
        if username.is_empty() {
            return Err("username is required".into());
        }
        if self.allow_anonymous {
            return Ok(());
        }
        match self.tokens.get(username) {
            Some(expected) if *expected == crate::hash_token(token) => Ok(()),
            _ => Err("authentication failed".into()),
        }
    }
}

// ============================================================================
// Connection registry
// ============================================================================

/// Live client connections on this node, by username. A user may hold
/// several connections; pushes go to all of them.
pub struct ConnectionRegistry {
    conns: RwLock<HashMap<String, HashMap<u64, mpsc::Sender<Packet>>>>,
    next_conn_id: AtomicU64,
    next_push_seq: AtomicU64,
    queue_capacity: usize,
    stats: Arc<PipelineStats>,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize, stats: Arc<PipelineStats>) -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            next_push_seq: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            stats,
        }
    }

    /// Returns the connection id and the receiver of its outbound packets.
    pub async fn register(&self, username: &str) -> (u64, mpsc::Receiver<Packet>) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.conns
            .write()
            .await
            .entry(username.to_string())
            .or_default()
            .insert(conn_id, tx);
        (conn_id, rx)
    }

    /// Remove one connection. Returns how many the user still has.
    pub async fn unregister(&self, username: &str, conn_id: u64) -> usize {
        let mut conns = self.conns.write().await;
        let Some(user_conns) = conns.get_mut(username) else {
            return 0;
        };
        user_conns.remove(&conn_id);
        let remaining = user_conns.len();
        if remaining == 0 {
            conns.remove(username);
        }
        remaining
    }

    pub async fn connection_count(&self) -> usize {
        self.conns.read().await.values().map(HashMap::len).sum()
    }

    pub async fn user_connections(&self, username: &str) -> usize {
        self.conns
            .read()
            .await
            .get(username)
            .map_or(0, HashMap::len)
    }
}

#[async_trait]
impl PushSink for ConnectionRegistry {
    /// One `Push` packet per task per connection. Full connection queues
    /// drop the packet; the recipient catches up from the inbox.
    async fn deliver(&self, tasks: Vec<PushTask>) -> usize {
        let conns = self.conns.read().await;
        let mut delivered = 0;

        for task in tasks {
            for username in &task.target_usernames {
                let Some(user_conns) = conns.get(username) else {
                    continue;
                };
                for (conn_id, tx) in user_conns {
                    let seq = format!("p-{}", self.next_push_seq.fetch_add(1, Ordering::Relaxed));
                    match tx.try_send(Packet::push(seq, vec![task.message.clone()])) {
                        Ok(()) => delivered += 1,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            tracing::warn!(
                                username = %username,
                                conn_id,
                                msg_id = task.message.msg_id,
                                "edge: connection queue full, push dropped"
                            );
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {}
                    }
                }
            }
        }

        PipelineStats::add(&self.stats.packets_delivered, delivered as u64);
        delivered
    }
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct EdgeConfig {
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub ingest_timeout: Duration,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        let t = courier_protocol::DEFAULT_TUNING;
        Self {
            handshake_timeout: Duration::from_secs(t.handshake_timeout_secs),
            idle_timeout: Duration::from_secs(t.idle_timeout_secs),
            ingest_timeout: Duration::from_millis(t.ingest_timeout_ms),
        }
    }
}

pub struct EdgeServer {
    node_id: String,
    auth: Authenticator,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceDirectory>,
    ingest: Arc<dyn IngestClient>,
    config: EdgeConfig,
    stats: Arc<PipelineStats>,
}

impl EdgeServer {
    pub fn new(
        node_id: String,
        auth: Authenticator,
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceDirectory>,
        ingest: Arc<dyn IngestClient>,
        config: EdgeConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            node_id,
            auth,
            registry,
            presence,
            ingest,
            config,
            stats,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Accept loop -- spawns a task per client connection.
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, node_id = %self.node_id, "edge: listening");
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let server = self.clone();
                            let shutdown = shutdown.resubscribe();
                            tokio::spawn(async move {
                                server.handle_connection(stream, remote, shutdown).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "edge: accept failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("edge: shutdown signal, stopping accept loop");
                    return;
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%remote, error = %e, "edge: set_nodelay failed");
        }
        let mut framed = Framed::new(stream, FrameCodec::<Handshake>::new());

        // Connected -> Authenticated
        let handshake =
            match tokio::time::timeout(self.config.handshake_timeout, framed.next()).await {
                Ok(Some(Ok(handshake))) => handshake,
                Ok(Some(Err(e))) => {
                    tracing::warn!(%remote, error = %e, "edge: bad handshake frame");
                    PipelineStats::incr(&self.stats.handshakes_rejected);
                    return;
                }
                Ok(None) => return,
                Err(_) => {
                    tracing::debug!(%remote, "edge: handshake timed out");
                    PipelineStats::incr(&self.stats.handshakes_rejected);
                    return;
                }
            };

        if let Err(reason) = self.check_handshake(&handshake) {
            tracing::warn!(%remote, username = %handshake.username, reason = %reason, "edge: handshake rejected");
            PipelineStats::incr(&self.stats.handshakes_rejected);
            let reply = HandshakeReply {
                accepted: false,
                node_id: self.node_id.clone(),
                version: 0,
                reason: Some(reason),
            };
            if let Err(e) = framed.send(reply).await {
                tracing::debug!(%remote, error = %e, "edge: reject reply failed");
            }
            return;
        }

        // Authenticated: routable before the client learns it is accepted.
        let username = handshake.username;
        let (conn_id, outbound) = self.registry.register(&username).await;
        if let Err(e) = self.presence.online(&username, &self.node_id, &remote.to_string()) {
            tracing::warn!(username = %username, error = %e, "edge: presence update failed");
        }

        let reply = HandshakeReply {
            accepted: true,
            node_id: self.node_id.clone(),
            version: handshake.version,
            reason: None,
        };
        let sent = framed.send(reply).await;
        let reason = match sent {
            Ok(()) => {
                // Active
                PipelineStats::incr(&self.stats.connections_opened);
                tracing::info!(%remote, username = %username, conn_id, "edge: client connected");
                let framed = framed.map_codec(|_| PacketCodec::new());
                self.packet_loop(framed, outbound, &username, remote, &mut shutdown)
                    .await
            }
            Err(e) => {
                tracing::debug!(%remote, error = %e, "edge: handshake reply failed");
                "handshake reply failed"
            }
        };

        // Active -> Closed
        let remaining = self.registry.unregister(&username, conn_id).await;
        if remaining == 0 {
            if let Err(e) = self.presence.offline(&username, &self.node_id) {
                tracing::warn!(username = %username, error = %e, "edge: presence clear failed");
            }
        }
        PipelineStats::incr(&self.stats.connections_closed);
        tracing::info!(%remote, username = %username, conn_id, reason, "edge: client disconnected");
    }

    fn check_handshake(&self, handshake: &Handshake) -> Result<(), String> {
        if handshake.magic != PROTOCOL_MAGIC {
            return Err(format!(
                "invalid magic: expected {PROTOCOL_MAGIC:#010x}, got {:#010x}",
                handshake.magic
            ));
        }
        if !(VERSION_MIN..=VERSION_MAX).contains(&handshake.version) {
            return Err(format!(
                "unsupported version {} (supported {VERSION_MIN}-{VERSION_MAX})",
                handshake.version
            ));
        }
        self.auth.verify(&handshake.username, &handshake.token)
    }

    /// Runs until the client goes away, idles out or the node shuts down.
    /// Returns the close reason.
    async fn packet_loop(
        &self,
        framed: Framed<TcpStream, PacketCodec>,
        mut outbound: mpsc::Receiver<Packet>,
        username: &str,
        remote: SocketAddr,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> &'static str {
        let (mut sink, mut stream) = framed.split::<Packet>();
        let mut idle_deadline = Instant::now() + self.config.idle_timeout;

        loop {
            tokio::select! {
                _ = shutdown.recv() => return "shutdown",
                _ = tokio::time::sleep_until(idle_deadline) => return "idle timeout",
                Some(packet) = outbound.recv() => {
                    if let Err(e) = sink.send(packet).await {
                        tracing::debug!(username, error = %e, "edge: push write failed");
                        return "write failed";
                    }
                }
                inbound = stream.next() => {
                    let packet = match inbound {
                        Some(Ok(packet)) => packet,
                        Some(Err(e)) => {
                            tracing::warn!(username, error = %e, "edge: bad packet");
                            return "protocol error";
                        }
                        None => return "closed by peer",
                    };
                    idle_deadline = Instant::now() + self.config.idle_timeout;

                    if let Some(reply) = self.handle_packet(username, remote, packet).await {
                        if let Err(e) = sink.send(reply).await {
                            tracing::debug!(username, error = %e, "edge: reply write failed");
                            return "write failed";
                        }
                    }
                }
            }
        }
    }

    async fn handle_packet(
        &self,
        username: &str,
        remote: SocketAddr,
        packet: Packet,
    ) -> Option<Packet> {
        let Packet { seq, payload } = packet;
        match payload {
            Payload::Pulse(pulse) => {
                match self.presence.refresh(username, &self.node_id) {
                    // Expired or swept while connected: claim it again,
                    // unless the user has since connected to another node.
                    Ok(false) => {
                        let remote_addr = remote.to_string();
                        if let Err(e) = self.presence.reclaim(username, &self.node_id, &remote_addr) {
                            tracing::warn!(username, error = %e, "edge: presence reclaim failed");
                        }
                    }
                    Ok(true) => {}
                    Err(e) => tracing::warn!(username, error = %e, "edge: presence refresh failed"),
                }
                Some(Packet::pulse(seq, pulse.sent_at_ms))
            }
            Payload::Chat(chat) => {
                let req = AcceptRequest {
                    session_id: chat.session_id,
                    sender: username.to_string(),
                    content: chat.content,
                    msg_type: chat.msg_type,
                    client_token: seq.clone(),
                };
                let ack = match tokio::time::timeout(self.config.ingest_timeout, self.ingest.send(req))
                    .await
                {
                    Ok(Ok(receipt)) => Packet::ack_ok(seq, receipt.msg_id, receipt.seq_id),
                    Ok(Err(e)) => {
                        tracing::debug!(username, error = %e, "edge: chat rejected");
                        Packet::ack_err(seq, e.client_message())
                    }
                    Err(_) => {
                        tracing::warn!(username, "edge: ingest timed out");
                        Packet::ack_err(seq, "unavailable: ingest timed out")
                    }
                };
                Some(ack)
            }
            Payload::Ack(_) => None,
            Payload::Push(_) => {
                tracing::warn!(username, seq = %seq, "edge: client sent push packet, ignored");
                None
            }
        }
    }
}
