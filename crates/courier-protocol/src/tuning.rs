//! Pipeline tuning -- the default timing, sizing and retry parameters.
//!
//! Every component reads its defaults from `DEFAULT_TUNING`; node config may
//! override any of them per process. Wire limits (`max_frame_bytes`,
//! `max_content_bytes`) are shared by clients and servers and are not
//! overridable.

/// A named set of pipeline parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineTuning {
    // -- Wire --
    /// Maximum edge frame size in bytes (length prefix excluded).
    pub max_frame_bytes: usize,
    /// Maximum chat content size in bytes.
    pub max_content_bytes: usize,

    // -- Outbox relay --
    /// Milliseconds between outbox sweeps.
    pub relay_interval_ms: u64,
    /// Maximum intents loaded per sweep.
    pub relay_batch_size: u32,
    /// Concurrent publishes per sweep.
    pub relay_worker_count: usize,
    /// Failed publishes before an intent is marked failed.
    pub relay_max_retry: u32,
    /// Quadratic backoff base: delay = base * retry_count^2.
    pub relay_backoff_base_ms: u64,
    /// Backoff ceiling.
    pub relay_backoff_max_ms: u64,
    /// Bus publish timeout.
    pub relay_publish_timeout_ms: u64,
    /// Lease on a published intent. Expiry without a consumer settle
    /// republishes it.
    pub relay_ack_timeout_ms: u64,

    // -- Delivery consumer --
    /// Consumer worker count.
    pub consumer_worker_count: usize,
    /// Dispatch attempts per delivery before nak.
    pub consumer_max_attempts: u32,
    /// Delay between dispatch attempts.
    pub consumer_attempt_delay_ms: u64,

    // -- Bus --
    /// Delay before a nak'd message is redelivered.
    pub bus_redelivery_delay_ms: u64,
    /// Deliveries before a message is dead-lettered.
    pub bus_max_deliver: u32,
    /// Per-group queue capacity.
    pub bus_queue_capacity: usize,

    // -- Push router --
    /// Per-node outbound queue capacity.
    pub push_queue_capacity: usize,
    /// Maximum tasks per push batch.
    pub push_batch_max: usize,
    /// Peer push timeout.
    pub push_timeout_ms: u64,
    /// Seconds between membership refreshes.
    pub membership_refresh_secs: u64,

    // -- Presence / cluster --
    /// Presence entry TTL.
    pub presence_ttl_secs: u64,
    /// Seconds between expired-presence sweeps.
    pub presence_sweep_interval_secs: u64,
    /// Seconds between edge-node heartbeats.
    pub node_heartbeat_secs: u64,
    /// Edge node considered gone after this many seconds without heartbeat.
    pub node_ttl_secs: u64,

    // -- Edge --
    /// Seconds allowed for the client handshake.
    pub handshake_timeout_secs: u64,
    /// Seconds without an inbound frame before a connection is closed.
    pub idle_timeout_secs: u64,
    /// Ingest RPC timeout.
    pub ingest_timeout_ms: u64,
    /// Outbound packets buffered per client connection.
    pub connection_queue_capacity: usize,
}

/// Defaults.
///
/// Sized for a small cluster (1-10 edge nodes). The presence TTL is a
/// multiple of the client heartbeat (30s) so one lost pulse does not drop a
/// user from routing.
pub const DEFAULT_TUNING: PipelineTuning = PipelineTuning {
    max_frame_bytes: 1024 * 1024,
    max_content_bytes: 16 * 1024,

    relay_interval_ms: 500,
    relay_batch_size: 100,
    relay_worker_count: 8,
    relay_max_retry: 5,
    relay_backoff_base_ms: 1_000,
    relay_backoff_max_ms: 5 * 60 * 1_000,
    relay_publish_timeout_ms: 3_000,
    relay_ack_timeout_ms: 60_000,

    consumer_worker_count: 8,
    consumer_max_attempts: 3,
    consumer_attempt_delay_ms: 200,

    bus_redelivery_delay_ms: 1_000,
    bus_max_deliver: 10,
    bus_queue_capacity: 4_096,

    push_queue_capacity: 1_024,
    push_batch_max: 64,
    push_timeout_ms: 2_000,
    membership_refresh_secs: 5,

    presence_ttl_secs: 120,
    presence_sweep_interval_secs: 30,
    node_heartbeat_secs: 10,
    node_ttl_secs: 30,

    handshake_timeout_secs: 10,
    idle_timeout_secs: 90,
    ingest_timeout_ms: 5_000,
    connection_queue_capacity: 256,
};
