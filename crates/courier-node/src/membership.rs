//! Cluster membership -- which edge nodes exist and where to push to them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_storage::{Store, StorageError};
use tokio::sync::broadcast;

use crate::push_router::PushRouter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeNode {
    pub node_id: String,
    pub push_url: String,
}

#[async_trait]
pub trait MembershipSource: Send + Sync {
    async fn nodes(&self) -> Result<Vec<EdgeNode>, StorageError>;
}

/// Fixed node list from config.
pub struct StaticMembership {
    nodes: Vec<EdgeNode>,
}

impl StaticMembership {
    pub fn new(nodes: Vec<EdgeNode>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl MembershipSource for StaticMembership {
    async fn nodes(&self) -> Result<Vec<EdgeNode>, StorageError> {
        Ok(self.nodes.clone())
    }
}

/// Nodes whose heartbeat row in the shared store is younger than `ttl`.
pub struct StoreMembership {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl StoreMembership {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }
}

#[async_trait]
impl MembershipSource for StoreMembership {
    async fn nodes(&self) -> Result<Vec<EdgeNode>, StorageError> {
        let since = courier_protocol::now_ms() - self.ttl.as_millis() as i64;
        Ok(self
            .store
            .live_edge_nodes(since)?
            .into_iter()
            .map(|row| EdgeNode {
                node_id: row.node_id,
                push_url: row.push_url,
            })
            .collect())
    }
}

/// Refresh the push router from the membership source every `interval`.
pub async fn run_membership_loop(
    router: Arc<PushRouter>,
    source: Arc<dyn MembershipSource>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                match source.nodes().await {
                    Ok(nodes) => {
                        let report = router.sync_membership(&nodes).await;
                        if report.changed() {
                            tracing::info!(
                                nodes = nodes.len(),
                                added = report.added,
                                replaced = report.replaced,
                                removed = report.removed,
                                "membership: router updated"
                            );
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "membership: refresh failed"),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("membership loop shutting down");
                return;
            }
        }
    }
}

/// Keep this node's row in `edge_nodes` fresh; remove it on shutdown.
pub async fn run_heartbeat_loop(
    store: Arc<dyn Store>,
    node_id: String,
    push_url: String,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                if let Err(e) = store.register_edge_node(&node_id, &push_url, courier_protocol::now_ms()) {
                    tracing::warn!(node_id = %node_id, error = %e, "membership: heartbeat failed");
                }
            }
            _ = shutdown.recv() => {
                if let Err(e) = store.remove_edge_node(&node_id) {
                    tracing::warn!(node_id = %node_id, error = %e, "membership: deregister failed");
                }
                tracing::info!(node_id = %node_id, "heartbeat loop shutting down");
                return;
            }
        }
    }
}
