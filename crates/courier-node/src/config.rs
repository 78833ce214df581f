//! Configuration types for courier-node.
//! Parsed from ~/.courier/config.toml.

use courier_protocol::DEFAULT_TUNING as T;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub consumer: ConsumerSection,
    #[serde(default)]
    pub push: PushSection,
    #[serde(default)]
    pub presence: PresenceSection,
    #[serde(default)]
    pub edge: EdgeSection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub cluster: ClusterSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Snowflake worker id, unique per process sharing a database (0-1023).
    #[serde(default)]
    pub worker_id: u16,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_api_addr")]
    pub api_addr: String,
    #[serde(default = "default_edge_addr")]
    pub edge_addr: String,
    /// Base URL peers use to reach this node's API. Defaults to http://{api_addr}.
    pub push_url: Option<String>,
    #[serde(default = "default_token_path")]
    pub token_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub interval_ms: u64,
    pub batch_size: u32,
    pub worker_count: usize,
    pub max_retry: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub publish_timeout_ms: u64,
    pub ack_timeout_ms: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            interval_ms: T.relay_interval_ms,
            batch_size: T.relay_batch_size,
            worker_count: T.relay_worker_count,
            max_retry: T.relay_max_retry,
            backoff_base_ms: T.relay_backoff_base_ms,
            backoff_max_ms: T.relay_backoff_max_ms,
            publish_timeout_ms: T.relay_publish_timeout_ms,
            ack_timeout_ms: T.relay_ack_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSection {
    /// Queue group shared by competing consumers.
    pub group: String,
    pub worker_count: usize,
    pub max_attempts: u32,
    pub attempt_delay_ms: u64,
    /// Route events of one session to one worker so their side effects
    /// apply in arrival order.
    pub partition_by_session: bool,
}

impl Default for ConsumerSection {
    fn default() -> Self {
        Self {
            group: "delivery".into(),
            worker_count: T.consumer_worker_count,
            max_attempts: T.consumer_max_attempts,
            attempt_delay_ms: T.consumer_attempt_delay_ms,
            partition_by_session: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushSection {
    pub queue_capacity: usize,
    pub batch_max: usize,
    pub push_timeout_ms: u64,
    pub membership_refresh_secs: u64,
}

impl Default for PushSection {
    fn default() -> Self {
        Self {
            queue_capacity: T.push_queue_capacity,
            batch_max: T.push_batch_max,
            push_timeout_ms: T.push_timeout_ms,
            membership_refresh_secs: T.membership_refresh_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSection {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            ttl_secs: T.presence_ttl_secs,
            sweep_interval_secs: T.presence_sweep_interval_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeSection {
    pub handshake_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub ingest_timeout_ms: u64,
    pub connection_queue_capacity: usize,
    /// Accept any handshake token. Development only.
    pub allow_anonymous: bool,
    /// username -> hex SHA-256 of the user's token (`courier-node token hash`).
    pub tokens: HashMap<String, String>,
    /// Remote ingest API base URL. Unset: ingest runs in this process.
    pub ingest_url: Option<String>,
}

impl Default for EdgeSection {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: T.handshake_timeout_secs,
            idle_timeout_secs: T.idle_timeout_secs,
            ingest_timeout_ms: T.ingest_timeout_ms,
            connection_queue_capacity: T.connection_queue_capacity,
            allow_anonymous: false,
            tokens: HashMap::new(),
            ingest_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub redelivery_delay_ms: u64,
    pub max_deliver: u32,
    pub queue_capacity: usize,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            redelivery_delay_ms: T.bus_redelivery_delay_ms,
            max_deliver: T.bus_max_deliver,
            queue_capacity: T.bus_queue_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipMode {
    /// Edge nodes heartbeat into the shared store.
    Store,
    /// Fixed list from `cluster.static_nodes`.
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticNodeEntry {
    pub node_id: String,
    pub push_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub membership: MembershipMode,
    pub static_nodes: Vec<StaticNodeEntry>,
    pub heartbeat_secs: u64,
    pub node_ttl_secs: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            membership: MembershipMode::Store,
            static_nodes: vec![],
            heartbeat_secs: T.node_heartbeat_secs,
            node_ttl_secs: T.node_ttl_secs,
        }
    }
}

// Default value functions
fn default_node_id() -> String {
    "edge-1".into()
}
fn default_database() -> String {
    "~/.courier/courier.db".into()
}
fn default_api_addr() -> String {
    "127.0.0.1:9480".into()
}
fn default_edge_addr() -> String {
    "0.0.0.0:9481".into()
}
fn default_token_path() -> String {
    "~/.courier/node-token".into()
}

impl NodeConfig {
    /// Load config from file, or create default if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.node_id.is_empty() {
            anyhow::bail!("node.node_id must not be empty");
        }
        if self.node.worker_id > courier_ingest::sequencer::MAX_WORKER_ID {
            anyhow::bail!(
                "node.worker_id {} out of range (max {})",
                self.node.worker_id,
                courier_ingest::sequencer::MAX_WORKER_ID
            );
        }
        if self.relay.worker_count == 0 || self.consumer.worker_count == 0 {
            anyhow::bail!("worker counts must be at least 1");
        }
        if self.relay.max_retry == 0 {
            anyhow::bail!("relay.max_retry must be at least 1");
        }
        if self.relay.ack_timeout_ms <= self.relay.publish_timeout_ms {
            anyhow::bail!("relay.ack_timeout_ms must exceed relay.publish_timeout_ms");
        }
        if self.push.queue_capacity == 0 || self.push.batch_max == 0 {
            anyhow::bail!("push.queue_capacity and push.batch_max must be at least 1");
        }
        if self.cluster.membership == MembershipMode::Static && self.cluster.static_nodes.is_empty()
        {
            anyhow::bail!("cluster.membership = \"static\" requires cluster.static_nodes");
        }
        Ok(())
    }

    /// Advertised base URL for this node's API.
    pub fn push_url(&self) -> String {
        self.node
            .push_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.node.api_addr))
    }

    pub fn node_ttl(&self) -> Duration {
        Duration::from_secs(self.cluster.node_ttl_secs)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection {
                node_id: default_node_id(),
                worker_id: 0,
                database: default_database(),
                api_addr: default_api_addr(),
                edge_addr: default_edge_addr(),
                push_url: None,
                token_path: default_token_path(),
            },
            relay: RelaySection::default(),
            consumer: ConsumerSection::default(),
            push: PushSection::default(),
            presence: PresenceSection::default(),
            edge: EdgeSection::default(),
            bus: BusSection::default(),
            cluster: ClusterSection::default(),
        }
    }
}
