//! Courier API -- node HTTP API.
//!
//! HTTP on 127.0.0.1:9480 by default. Bearer token auth from
//! ~/.courier/node-token, shared by every node of a cluster.
//!
//! Serves the ingest RPC (edge -> ingest), the inbound push channel
//! (peer push router -> this node's edge layer) and operator routes.

use async_trait::async_trait;
use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Router,
};
use courier_ingest::{AcceptRequest, IngestError, IngestService};
use courier_protocol::{PushBatch, PushBatchResponse, PushTask};
use courier_storage::Store;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Pipeline diagnostics counters -- shared between the pipeline loops and the API.
#[derive(Default)]
pub struct PipelineStats {
    /// Messages accepted by ingest.
    pub messages_accepted: AtomicU64,
    /// Ingest requests rejected (validation, permission, unavailable, internal).
    pub messages_rejected: AtomicU64,
    /// Outbox intents published to the bus.
    pub intents_published: AtomicU64,
    /// Failed publish attempts that left the intent pending.
    pub intents_retried: AtomicU64,
    /// Intents that reached the retry ceiling.
    pub intents_failed: AtomicU64,
    /// Publishes refused by bus backpressure, rescheduled without a retry.
    pub intents_deferred: AtomicU64,
    /// Intents closed as sent after the consumer acked their event.
    pub intents_settled: AtomicU64,
    /// Sweeps completed by the outbox relay.
    pub relay_sweeps: AtomicU64,
    /// Relay worker panics caught at the task boundary.
    pub relay_worker_panics: AtomicU64,
    /// Bus events fanned out and acked.
    pub events_dispatched: AtomicU64,
    /// Undecodable bus events, acked and dropped.
    pub events_poison: AtomicU64,
    /// Events handed back to the bus after exhausting local attempts.
    pub events_nacked: AtomicU64,
    /// Events out of bus redeliveries; their intents are marked failed.
    pub events_dead_lettered: AtomicU64,
    /// Dispatch attempts that failed or panicked.
    pub dispatch_failures: AtomicU64,
    /// Inbox records upserted.
    pub inbox_records_written: AtomicU64,
    /// Push tasks accepted by a node queue.
    pub push_tasks_enqueued: AtomicU64,
    /// Recipients skipped because no presence entry was found.
    pub push_recipients_offline: AtomicU64,
    /// Push tasks refused at enqueue (queue full, unknown node, dead node).
    pub push_tasks_rejected: AtomicU64,
    /// Push batches sent through a push channel.
    pub push_batches_sent: AtomicU64,
    /// Push tasks lost when a node client died or closed.
    pub push_tasks_dead_lettered: AtomicU64,
    /// Push packets written to live client connections on this node.
    pub packets_delivered: AtomicU64,
    /// Edge connections that completed the handshake.
    pub connections_opened: AtomicU64,
    /// Edge connections closed.
    pub connections_closed: AtomicU64,
    /// Handshakes refused.
    pub handshakes_rejected: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        serde_json::json!({
            "messages_accepted": load(&self.messages_accepted),
            "messages_rejected": load(&self.messages_rejected),
            "intents_published": load(&self.intents_published),
            "intents_retried": load(&self.intents_retried),
            "intents_failed": load(&self.intents_failed),
            "intents_deferred": load(&self.intents_deferred),
            "intents_settled": load(&self.intents_settled),
            "relay_sweeps": load(&self.relay_sweeps),
            "relay_worker_panics": load(&self.relay_worker_panics),
            "events_dispatched": load(&self.events_dispatched),
            "events_poison": load(&self.events_poison),
            "events_nacked": load(&self.events_nacked),
            "events_dead_lettered": load(&self.events_dead_lettered),
            "dispatch_failures": load(&self.dispatch_failures),
            "inbox_records_written": load(&self.inbox_records_written),
            "push_tasks_enqueued": load(&self.push_tasks_enqueued),
            "push_recipients_offline": load(&self.push_recipients_offline),
            "push_tasks_rejected": load(&self.push_tasks_rejected),
            "push_batches_sent": load(&self.push_batches_sent),
            "push_tasks_dead_lettered": load(&self.push_tasks_dead_lettered),
            "packets_delivered": load(&self.packets_delivered),
            "connections_opened": load(&self.connections_opened),
            "connections_closed": load(&self.connections_closed),
            "handshakes_rejected": load(&self.handshakes_rejected),
        })
    }
}

/// Destination for push tasks addressed to this node: the edge
/// connection registry.
#[async_trait]
pub trait PushSink: Send + Sync {
    /// Hand tasks to live connections. Returns the number of packets written.
    async fn deliver(&self, tasks: Vec<PushTask>) -> usize;
}

/// Callback returning a count from a node-owned registry.
pub type CountFn = Box<
    dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = usize> + Send>> + Send + Sync,
>;

/// Shared state for all API handlers.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub ingest: Arc<IngestService>,
    pub node_id: String,
    pub bearer_token: String,
    pub start_time: std::time::Instant,
    /// Edge node rows older than this are not reported as live.
    pub node_ttl_ms: i64,
    pub push_sink: Option<Arc<dyn PushSink>>,
    pub stats: Arc<PipelineStats>,
    pub connection_count_fn: Option<CountFn>,
}

/// Build the axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/messages/send", post(messages_send))
        .route("/api/v1/push", post(push))
        .route("/api/v1/sessions/create", post(sessions_create))
        .route("/api/v1/sessions/add_member", post(sessions_add_member))
        .route("/api/v1/sessions/remove_member", post(sessions_remove_member))
        .route("/api/v1/sessions/members", post(sessions_members))
        .route("/api/v1/inbox/list", post(inbox_list))
        .route("/api/v1/inbox/mark_read", post(inbox_mark_read))
        .route("/api/v1/outbox/failed", post(outbox_failed))
        .route("/api/v1/outbox/requeue", post(outbox_requeue))
        .route("/api/v1/status", post(status))
        .route("/api/v1/diagnostics", post(diagnostics))
        .with_state(state)
}

// ============================================================================
// Auth middleware (inline check)
// ============================================================================

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, &'static str)> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let expected = format!("Bearer {}", state.bearer_token);
    if auth != expected {
        return Err((StatusCode::UNAUTHORIZED, "invalid bearer token"));
    }
    Ok(())
}

// ============================================================================
// Request/Response types
// ============================================================================

/// Ingest RPC body: `{session_id, sender, content, type, client_token}`.
pub type SendRequest = AcceptRequest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    pub msg_id: u64,
    pub seq_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Deserialize)]
pub struct SessionCreateRequest {
    pub session_id: String,
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub members: Vec<String>,
}

fn default_kind() -> String {
    "group".into()
}

#[derive(Deserialize)]
pub struct MemberRequest {
    pub session_id: String,
    pub username: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "member".into()
}

#[derive(Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
}

#[derive(Deserialize)]
pub struct InboxListRequest {
    pub owner: String,
    pub session_id: String,
    #[serde(default)]
    pub after_seq: i64,
    #[serde(default = "default_inbox_limit")]
    pub limit: u32,
}

fn default_inbox_limit() -> u32 {
    100
}

const MAX_INBOX_LIMIT: u32 = 1_000;

#[derive(Deserialize)]
pub struct MarkReadRequest {
    pub owner: String,
    pub session_id: String,
    pub up_to_seq: i64,
}

#[derive(Deserialize)]
pub struct FailedListRequest {
    #[serde(default = "default_failed_limit")]
    pub limit: u32,
}

fn default_failed_limit() -> u32 {
    50
}

#[derive(Deserialize)]
pub struct RequeueRequest {
    pub id: i64,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub uptime_secs: u64,
    pub live_edge_nodes: Vec<String>,
    pub connections: usize,
}

// ============================================================================
// Ingest RPC
// ============================================================================

fn ingest_status(e: &IngestError) -> StatusCode {
    match e {
        IngestError::Validation(_) => StatusCode::BAD_REQUEST,
        IngestError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        IngestError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        IngestError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn messages_send(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SendRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let ingest = state.ingest.clone();
    let result = match tokio::task::spawn_blocking(move || ingest.accept(&req)).await {
        Ok(result) => result,
        Err(e) => Err(IngestError::Internal(format!("ingest task failed: {e}"))),
    };

    match result {
        Ok(receipt) => {
            PipelineStats::incr(&state.stats.messages_accepted);
            Json(SendResponse {
                msg_id: receipt.msg_id,
                seq_id: receipt.seq_id,
                error: None,
            })
            .into_response()
        }
        Err(e) => {
            PipelineStats::incr(&state.stats.messages_rejected);
            if matches!(e, IngestError::Internal(_)) {
                tracing::error!(error = %e, "api: ingest failed");
            } else {
                tracing::debug!(error = %e, "api: ingest rejected");
            }
            (
                ingest_status(&e),
                Json(SendResponse {
                    msg_id: 0,
                    seq_id: 0,
                    error: Some(e.client_message()),
                }),
            )
                .into_response()
        }
    }
}

// ============================================================================
// Inbound push channel
// ============================================================================

async fn push(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(batch): Json<PushBatch>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    if batch.node_id != state.node_id {
        tracing::warn!(
            target_node = %batch.node_id,
            node_id = %state.node_id,
            "api: push batch for another node"
        );
        return (StatusCode::CONFLICT, "push batch addressed to another node").into_response();
    }

    let Some(sink) = &state.push_sink else {
        return (StatusCode::SERVICE_UNAVAILABLE, "edge layer not running").into_response();
    };

    let tasks = batch.tasks.len();
    let delivered = sink.deliver(batch.tasks).await;
    tracing::debug!(tasks, delivered, "api: push batch delivered");
    Json(PushBatchResponse { delivered }).into_response()
}

// ============================================================================
// Sessions
// ============================================================================

async fn sessions_create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SessionCreateRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    if req.session_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "session_id is required").into_response();
    }
    if req.kind != "direct" && req.kind != "group" {
        return (StatusCode::BAD_REQUEST, "kind must be direct or group").into_response();
    }
    if req.kind == "direct" && req.members.len() > 2 {
        return (StatusCode::BAD_REQUEST, "direct sessions have at most two members")
            .into_response();
    }

    let now = courier_protocol::now_ms();
    let result = state
        .store
        .create_session(&req.session_id, &req.name, &req.kind, now)
        .and_then(|()| {
            req.members
                .iter()
                .try_for_each(|m| state.store.add_member(&req.session_id, m, "member", now))
        });

    match result {
        Ok(()) => {
            tracing::info!(
                session = %req.session_id,
                kind = %req.kind,
                members = req.members.len(),
                "api: session created"
            );
            Json(serde_json::json!({
                "ok": true,
                "session_id": req.session_id,
            }))
            .into_response()
        }
        Err(e) => {
            tracing::warn!(session = %req.session_id, error = %e, "api: session create failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn sessions_add_member(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<MemberRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    match state.store.read_session(&req.session_id) {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, "session not found").into_response(),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }

    match state.store.add_member(
        &req.session_id,
        &req.username,
        &req.role,
        courier_protocol::now_ms(),
    ) {
        Ok(()) => {
            tracing::info!(session = %req.session_id, username = %req.username, "api: member added");
            Json(serde_json::json!({ "ok": true })).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn sessions_remove_member(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<MemberRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    match state.store.remove_member(&req.session_id, &req.username) {
        Ok(removed) => Json(serde_json::json!({ "removed": removed })).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn sessions_members(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SessionRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    match state.store.list_members(&req.session_id) {
        Ok(members) => Json(serde_json::json!({ "members": members })).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// Inbox sync
// ============================================================================

async fn inbox_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<InboxListRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let limit = req.limit.min(MAX_INBOX_LIMIT);
    match state
        .store
        .list_inbox(&req.owner, &req.session_id, req.after_seq, limit)
    {
        Ok(entries) => Json(serde_json::json!({ "entries": entries })).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn inbox_mark_read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<MarkReadRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    match state
        .store
        .mark_read(&req.owner, &req.session_id, req.up_to_seq)
    {
        Ok(updated) => Json(serde_json::json!({ "updated": updated })).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// Outbox dead letters
// ============================================================================

async fn outbox_failed(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<FailedListRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    match state.store.list_failed_intents(req.limit) {
        Ok(intents) => {
            let intents: Vec<serde_json::Value> = intents
                .iter()
                .map(|i| {
                    serde_json::json!({
                        "id": i.id,
                        "msg_id": i.msg_id,
                        "topic": i.topic,
                        "retry_count": i.retry_count,
                        "last_error": i.last_error,
                        "created_at": i.created_at,
                        "updated_at": i.updated_at,
                    })
                })
                .collect();
            Json(serde_json::json!({ "intents": intents })).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn outbox_requeue(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RequeueRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    match state.store.requeue_intent(req.id, courier_protocol::now_ms()) {
        Ok(true) => {
            tracing::info!(intent_id = req.id, "api: intent requeued");
            Json(serde_json::json!({ "requeued": true })).into_response()
        }
        Ok(false) => (StatusCode::NOT_FOUND, "no failed intent with that id").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// Status / diagnostics
// ============================================================================

fn live_node_ids(state: &AppState) -> Vec<String> {
    let since = courier_protocol::now_ms() - state.node_ttl_ms;
    match state.store.live_edge_nodes(since) {
        Ok(nodes) => nodes.into_iter().map(|n| n.node_id).collect(),
        Err(e) => {
            tracing::warn!(error = %e, "api: edge node lookup failed");
            vec![]
        }
    }
}

async fn connection_count(state: &AppState) -> usize {
    match &state.connection_count_fn {
        Some(f) => f().await,
        None => 0,
    }
}

async fn status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    Json(StatusResponse {
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        live_edge_nodes: live_node_ids(&state),
        connections: connection_count(&state).await,
    })
    .into_response()
}

async fn diagnostics(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let store = match state.store.pipeline_counts() {
        Ok(counts) => serde_json::json!({
            "sessions": counts.sessions,
            "messages": counts.messages,
            "inbox_records": counts.inbox_records,
            "outbox": {
                "pending": counts.outbox_pending,
                "inflight": counts.outbox_inflight,
                "sent": counts.outbox_sent,
                "failed": counts.outbox_failed,
            },
            "presence_entries": counts.presence_entries,
        }),
        Err(e) => serde_json::json!({ "error": e.to_string() }),
    };

    Json(serde_json::json!({
        "node_id": state.node_id,
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "connections": connection_count(&state).await,
        "live_edge_nodes": live_node_ids(&state),
        "pipeline": state.stats.snapshot(),
        "store": store,
    }))
    .into_response()
}
