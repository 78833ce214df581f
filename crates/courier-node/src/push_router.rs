//! Push router -- registry of edge node clients with bounded outbound queues.
//!
//! Maps node id -> NodeClient. Each client owns a bounded queue drained by
//! its own task, which batches tasks and sends them through the node's push
//! channel. Enqueue never blocks: a full queue is reported to the caller.
//!
//! A channel failure marks the client dead; its queue is closed and the
//! remaining tasks are dead-lettered. The next membership sync replaces a
//! dead client if the node is still listed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_api::PipelineStats;
use courier_protocol::{PushBatch, PushTask};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::membership::EdgeNode;
use crate::push_channel::{ChannelFactory, PushChannel};

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("unknown edge node {0}")]
    UnknownNode(String),
    #[error("push queue full for node {0}")]
    QueueFull(String),
    #[error("edge node {0} disconnected")]
    Disconnected(String),
    #[error("push router closed")]
    Closed,
    #[error("push channel error: {0}")]
    Channel(String),
    #[error("push timed out")]
    Timeout,
}

#[derive(Debug, Clone, Copy)]
pub struct PushConfig {
    pub queue_capacity: usize,
    pub batch_max: usize,
    pub push_timeout: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        let t = courier_protocol::DEFAULT_TUNING;
        Self {
            queue_capacity: t.push_queue_capacity,
            batch_max: t.push_batch_max,
            push_timeout: Duration::from_millis(t.push_timeout_ms),
        }
    }
}

struct NodeClient {
    push_url: String,
    tx: mpsc::Sender<PushTask>,
    alive: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Outcome of one membership sync.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub replaced: usize,
    pub removed: usize,
}

impl SyncReport {
    pub fn changed(&self) -> bool {
        self.added + self.replaced + self.removed > 0
    }
}

pub struct PushRouter {
    clients: RwLock<HashMap<String, NodeClient>>,
    factory: Arc<dyn ChannelFactory>,
    config: PushConfig,
    stats: Arc<PipelineStats>,
    closed: AtomicBool,
}

impl PushRouter {
    pub fn new(
        factory: Arc<dyn ChannelFactory>,
        config: PushConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            factory,
            config,
            stats,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a task for `node_id`. Never waits for queue space.
    pub async fn enqueue(&self, node_id: &str, task: PushTask) -> Result<(), PushError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PushError::Closed);
        }

        let clients = self.clients.read().await;
        let client = clients
            .get(node_id)
            .ok_or_else(|| PushError::UnknownNode(node_id.to_string()))?;

        if !client.alive.load(Ordering::Acquire) {
            return Err(PushError::Disconnected(node_id.to_string()));
        }

        match client.tx.try_send(task) {
            Ok(()) => {
                PipelineStats::incr(&self.stats.push_tasks_enqueued);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(PushError::QueueFull(node_id.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(PushError::Disconnected(node_id.to_string()))
            }
        }
    }

    /// Reconcile clients with the current node list.
    pub async fn sync_membership(&self, nodes: &[EdgeNode]) -> SyncReport {
        let mut report = SyncReport::default();
        if self.closed.load(Ordering::Acquire) {
            return report;
        }

        let mut clients = self.clients.write().await;

        clients.retain(|node_id, client| {
            let keep = nodes.iter().any(|n| &n.node_id == node_id);
            if !keep {
                tracing::info!(node_id = %node_id, push_url = %client.push_url, "push: node removed");
                report.removed += 1;
            }
            keep
        });

        for node in nodes {
            let needs_client = match clients.get(&node.node_id) {
                None => {
                    report.added += 1;
                    true
                }
                Some(existing)
                    if !existing.alive.load(Ordering::Acquire)
                        || existing.push_url != node.push_url =>
                {
                    report.replaced += 1;
                    true
                }
                Some(_) => false,
            };

            if needs_client {
                let client = self.spawn_client(node);
                if let Some(old) = clients.insert(node.node_id.clone(), client) {
                    // Dropping the old sender closes its queue; the drain
                    // loop flushes what it already holds and exits.
                    drop(old.tx);
                }
                tracing::info!(node_id = %node.node_id, push_url = %node.push_url, "push: node client ready");
            }
        }

        report
    }

    fn spawn_client(&self, node: &EdgeNode) -> NodeClient {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let alive = Arc::new(AtomicBool::new(true));
        let channel = self.factory.channel_for(node);
        let handle = tokio::spawn(drain_loop(
            node.node_id.clone(),
            rx,
            channel,
            alive.clone(),
            self.config,
            self.stats.clone(),
        ));
        NodeClient {
            push_url: node.push_url.clone(),
            tx,
            alive,
            handle,
        }
    }

    pub async fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// None for unknown nodes.
    pub async fn is_alive(&self, node_id: &str) -> Option<bool> {
        self.clients
            .read()
            .await
            .get(node_id)
            .map(|c| c.alive.load(Ordering::Acquire))
    }

    /// Stop accepting tasks and wait for every drain loop to finish.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let clients: Vec<NodeClient> = {
            let mut clients = self.clients.write().await;
            clients.drain().map(|(_, c)| c).collect()
        };

        for client in clients {
            drop(client.tx);
            if let Err(e) = client.handle.await {
                tracing::warn!(error = %e, "push: drain loop ended abnormally");
            }
        }
        tracing::info!("push router closed");
    }
}

async fn drain_loop(
    node_id: String,
    mut rx: mpsc::Receiver<PushTask>,
    channel: Arc<dyn PushChannel>,
    alive: Arc<AtomicBool>,
    config: PushConfig,
    stats: Arc<PipelineStats>,
) {
    while let Some(first) = rx.recv().await {
        let mut tasks = vec![first];
        while tasks.len() < config.batch_max {
            match rx.try_recv() {
                Ok(task) => tasks.push(task),
                Err(_) => break,
            }
        }

        let count = tasks.len();
        let batch = PushBatch {
            node_id: node_id.clone(),
            tasks,
        };

        let result = match tokio::time::timeout(config.push_timeout, channel.send(batch)).await {
            Ok(result) => result,
            Err(_) => Err(PushError::Timeout),
        };

        match result {
            Ok(delivered) => {
                PipelineStats::incr(&stats.push_batches_sent);
                tracing::debug!(node_id = %node_id, tasks = count, delivered, "push: batch sent");
            }
            Err(e) => {
                alive.store(false, Ordering::Release);
                rx.close();
                let mut lost = count;
                while rx.try_recv().is_ok() {
                    lost += 1;
                }
                PipelineStats::add(&stats.push_tasks_dead_lettered, lost as u64);
                tracing::warn!(node_id = %node_id, error = %e, lost, "push: node connection lost");
                return;
            }
        }
    }
    tracing::debug!(node_id = %node_id, "push: drain loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use courier_protocol::PushMessage;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Channel that records batches; fails every call once `fail` is set.
    #[derive(Default)]
    struct ScriptedChannel {
        batches: Mutex<Vec<PushBatch>>,
        fail: AtomicBool,
        gate: tokio::sync::Notify,
        gated: AtomicBool,
    }

    #[async_trait]
    impl PushChannel for ScriptedChannel {
        async fn send(&self, batch: PushBatch) -> Result<usize, PushError> {
            if self.gated.load(Ordering::SeqCst) {
                self.gate.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(PushError::Channel("connection reset".into()));
            }
            let n = batch.tasks.len();
            self.batches.lock().unwrap().push(batch);
            Ok(n)
        }
    }

    struct Factory {
        channel: Arc<ScriptedChannel>,
        built: AtomicUsize,
    }

    impl ChannelFactory for Factory {
        fn channel_for(&self, _node: &EdgeNode) -> Arc<dyn PushChannel> {
            self.built.fetch_add(1, Ordering::SeqCst);
            self.channel.clone()
        }
    }

    fn node(id: &str) -> EdgeNode {
        EdgeNode {
            node_id: id.into(),
            push_url: format!("http://{id}"),
        }
    }

    fn task(msg_id: u64) -> PushTask {
        PushTask {
            target_usernames: vec!["bob".into()],
            message: PushMessage {
                msg_id,
                seq_id: msg_id as i64,
                session_id: "s".into(),
                from: "alice".into(),
                content: "hi".into(),
                msg_type: 1,
                timestamp: 0,
            },
        }
    }

    fn router(
        capacity: usize,
    ) -> (PushRouter, Arc<ScriptedChannel>, Arc<Factory>, Arc<PipelineStats>) {
        let channel = Arc::new(ScriptedChannel::default());
        let factory = Arc::new(Factory {
            channel: channel.clone(),
            built: AtomicUsize::new(0),
        });
        let stats = Arc::new(PipelineStats::new());
        let router = PushRouter::new(
            factory.clone(),
            PushConfig {
                queue_capacity: capacity,
                batch_max: 8,
                push_timeout: Duration::from_millis(200),
            },
            stats.clone(),
        );
        (router, channel, factory, stats)
    }

    async fn wait_for<F: Fn() -> bool>(f: F) {
        for _ in 0..100 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_unknown_node_rejected() {
        let (router, _, _, _) = router(4);
        assert!(matches!(
            router.enqueue("edge-9", task(1)).await,
            Err(PushError::UnknownNode(_))
        ));
    }

    #[tokio::test]
    async fn test_enqueue_reaches_channel() {
        let (router, channel, _, _) = router(4);
        router.sync_membership(&[node("edge-1")]).await;
        router.enqueue("edge-1", task(1)).await.unwrap();
        router.enqueue("edge-1", task(2)).await.unwrap();

        wait_for(|| {
            channel
                .batches
                .lock()
                .unwrap()
                .iter()
                .map(|b| b.tasks.len())
                .sum::<usize>()
                == 2
        })
        .await;
        assert!(channel
            .batches
            .lock()
            .unwrap()
            .iter()
            .all(|b| b.node_id == "edge-1"));
    }

    #[tokio::test]
    async fn test_full_queue_reports_without_blocking() {
        let (router, channel, _, _) = router(2);
        channel.gated.store(true, Ordering::SeqCst);
        router.sync_membership(&[node("edge-1")]).await;

        // First task is taken by the (blocked) drain loop, two more fill the queue.
        router.enqueue("edge-1", task(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        router.enqueue("edge-1", task(2)).await.unwrap();
        router.enqueue("edge-1", task(3)).await.unwrap();
        assert!(matches!(
            router.enqueue("edge-1", task(4)).await,
            Err(PushError::QueueFull(_))
        ));

        channel.gated.store(false, Ordering::SeqCst);
        channel.gate.notify_one();
    }

    #[tokio::test]
    async fn test_channel_failure_marks_dead_then_resync_replaces() {
        let (router, channel, factory, stats) = router(4);
        channel.fail.store(true, Ordering::SeqCst);
        router.sync_membership(&[node("edge-1")]).await;

        router.enqueue("edge-1", task(1)).await.unwrap();
        for _ in 0..100 {
            if router.is_alive("edge-1").await == Some(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(router.is_alive("edge-1").await, Some(false));
        assert!(matches!(
            router.enqueue("edge-1", task(2)).await,
            Err(PushError::Disconnected(_))
        ));
        assert_eq!(stats.push_tasks_dead_lettered.load(Ordering::Relaxed), 1);

        channel.fail.store(false, Ordering::SeqCst);
        let report = router.sync_membership(&[node("edge-1")]).await;
        assert_eq!(report.replaced, 1);
        assert_eq!(factory.built.load(Ordering::SeqCst), 2);
        router.enqueue("edge-1", task(3)).await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_removes_vanished_nodes() {
        let (router, _, _, _) = router(4);
        router
            .sync_membership(&[node("edge-1"), node("edge-2")])
            .await;
        assert_eq!(router.node_ids().await, vec!["edge-1", "edge-2"]);

        let report = router.sync_membership(&[node("edge-2")]).await;
        assert_eq!(report.removed, 1);
        assert_eq!(router.node_ids().await, vec!["edge-2"]);

        // Unchanged membership is a no-op
        assert!(!router.sync_membership(&[node("edge-2")]).await.changed());
    }

    #[tokio::test]
    async fn test_close_flushes_and_refuses() {
        let (router, channel, _, _) = router(8);
        router.sync_membership(&[node("edge-1")]).await;
        for i in 0..5 {
            router.enqueue("edge-1", task(i)).await.unwrap();
        }
        router.close().await;

        let delivered: usize = channel
            .batches
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.tasks.len())
            .sum();
        assert_eq!(delivered, 5);
        assert!(matches!(
            router.enqueue("edge-1", task(9)).await,
            Err(PushError::Closed)
        ));
    }
}
