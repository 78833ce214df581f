//! Node runtime -- builds every component from config and spawns its loops.
//!
//! Shared by the binary and the integration tests. Listeners bound to port
//! 0 report their real addresses through `api_addr()` / `edge_addr()`.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use courier_api::{AppState, PipelineStats, PushSink};
use courier_ingest::{IngestService, StoreSequencer};
use courier_storage::Store;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::bus::MessageBus;
use crate::config::{MembershipMode, NodeConfig};
use crate::delivery_consumer::{ConsumerConfig, DeliveryConsumer};
use crate::edge::{Authenticator, ConnectionRegistry, EdgeConfig, EdgeServer};
use crate::fanout::FanoutDispatcher;
use crate::ingest_client::{HttpIngestClient, IngestClient, LocalIngest};
use crate::membership::{self, EdgeNode, MembershipSource, StaticMembership, StoreMembership};
use crate::outbox_relay::{OutboxLedger, OutboxRelay, RelayConfig};
use crate::presence::{self, PresenceDirectory};
use crate::push_channel::DefaultChannelFactory;
use crate::push_router::{PushConfig, PushRouter};

pub struct NodeRuntime {
    node_id: String,
    api_addr: SocketAddr,
    edge_addr: SocketAddr,
    stats: Arc<PipelineStats>,
    router: Arc<PushRouter>,
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl NodeRuntime {
    pub async fn start(
        cfg: &NodeConfig,
        store: Arc<dyn Store>,
        bearer_token: String,
        bus: Arc<dyn MessageBus>,
    ) -> anyhow::Result<Self> {
        let node_id = cfg.node.node_id.clone();
        let stats = Arc::new(PipelineStats::new());
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let api_listener = TcpListener::bind(&cfg.node.api_addr).await?;
        let api_addr = api_listener.local_addr()?;
        let edge_listener = TcpListener::bind(&cfg.node.edge_addr).await?;
        let edge_addr = edge_listener.local_addr()?;
        let push_url = cfg
            .node
            .push_url
            .clone()
            .unwrap_or_else(|| format!("http://{api_addr}"));

        tracing::info!(
            node_id = %node_id,
            worker_id = cfg.node.worker_id,
            %api_addr,
            %edge_addr,
            push_url = %push_url,
            "starting courier-node"
        );

        // Ingest
        let sequencer = StoreSequencer::new(store.clone(), cfg.node.worker_id)
            .map_err(|e| anyhow::anyhow!("sequencer: {e}"))?;
        let ingest = Arc::new(IngestService::new(store.clone(), Arc::new(sequencer)));
        let ingest_client: Arc<dyn IngestClient> = match &cfg.edge.ingest_url {
            Some(url) => {
                tracing::info!(url = %url, "edge: using remote ingest");
                Arc::new(HttpIngestClient::new(
                    reqwest::Client::new(),
                    url,
                    bearer_token.clone(),
                ))
            }
            None => Arc::new(LocalIngest::new(ingest.clone())),
        };

        // Presence + edge registry
        let presence = Arc::new(PresenceDirectory::new(
            store.clone(),
            Duration::from_secs(cfg.presence.ttl_secs),
        ));
        let registry = Arc::new(ConnectionRegistry::new(
            cfg.edge.connection_queue_capacity,
            stats.clone(),
        ));

        // Push routing
        let local_sink: Arc<dyn PushSink> = registry.clone();
        let router = Arc::new(PushRouter::new(
            Arc::new(DefaultChannelFactory::new(
                node_id.clone(),
                local_sink.clone(),
                bearer_token.clone(),
            )),
            PushConfig {
                queue_capacity: cfg.push.queue_capacity,
                batch_max: cfg.push.batch_max,
                push_timeout: Duration::from_millis(cfg.push.push_timeout_ms),
            },
            stats.clone(),
        ));

        let source: Arc<dyn MembershipSource> = match cfg.cluster.membership {
            MembershipMode::Store => {
                // Register before the first sync so this node routes to itself.
                store.register_edge_node(&node_id, &push_url, courier_protocol::now_ms())?;
                Arc::new(StoreMembership::new(store.clone(), cfg.node_ttl()))
            }
            MembershipMode::Static => Arc::new(StaticMembership::new(
                cfg.cluster
                    .static_nodes
                    .iter()
                    .map(|n| EdgeNode {
                        node_id: n.node_id.clone(),
                        push_url: n.push_url.clone(),
                    })
                    .collect(),
            )),
        };
        let initial = router.sync_membership(&source.nodes().await?).await;
        tracing::info!(added = initial.added, "push: initial membership loaded");

        // Bus consumer + fanout
        let dispatcher = Arc::new(FanoutDispatcher::new(
            store.clone(),
            presence.clone(),
            router.clone(),
            stats.clone(),
        ));
        let subscription = bus
            .subscribe(courier_protocol::PUSH_EVENT_TOPIC, &cfg.consumer.group)
            .await?;
        let consumer = DeliveryConsumer::new(
            subscription,
            dispatcher,
            ConsumerConfig {
                worker_count: cfg.consumer.worker_count,
                max_attempts: cfg.consumer.max_attempts,
                attempt_delay: Duration::from_millis(cfg.consumer.attempt_delay_ms),
                partition_by_session: cfg.consumer.partition_by_session,
                ..ConsumerConfig::default()
            },
            stats.clone(),
        )
        .with_ledger(Arc::new(OutboxLedger::new(store.clone(), stats.clone())));

        let relay = OutboxRelay::new(
            store.clone(),
            bus,
            RelayConfig {
                interval: Duration::from_millis(cfg.relay.interval_ms),
                batch_size: cfg.relay.batch_size,
                worker_count: cfg.relay.worker_count,
                max_retry: cfg.relay.max_retry,
                backoff_base: Duration::from_millis(cfg.relay.backoff_base_ms),
                backoff_max: Duration::from_millis(cfg.relay.backoff_max_ms),
                publish_timeout: Duration::from_millis(cfg.relay.publish_timeout_ms),
                ack_timeout: Duration::from_millis(cfg.relay.ack_timeout_ms),
            },
            stats.clone(),
        );

        let edge = Arc::new(EdgeServer::new(
            node_id.clone(),
            Authenticator::new(cfg.edge.allow_anonymous, cfg.edge.tokens.clone()),
            registry.clone(),
            presence.clone(),
            ingest_client,
            EdgeConfig {
                handshake_timeout: Duration::from_secs(cfg.edge.handshake_timeout_secs),
                idle_timeout: Duration::from_secs(cfg.edge.idle_timeout_secs),
                ingest_timeout: Duration::from_millis(cfg.edge.ingest_timeout_ms),
            },
            stats.clone(),
        ));

        // API state
        let registry_for_count = registry.clone();
        let state = Arc::new(AppState {
            store: store.clone(),
            ingest,
            node_id: node_id.clone(),
            bearer_token,
            start_time: std::time::Instant::now(),
            node_ttl_ms: cfg.node_ttl().as_millis() as i64,
            push_sink: Some(local_sink),
            stats: stats.clone(),
            connection_count_fn: Some(Box::new(move || {
                let registry = registry_for_count.clone();
                Box::pin(async move { registry.connection_count().await })
                    as Pin<Box<dyn Future<Output = usize> + Send>>
            })),
        });

        let mut handles = Vec::new();

        let api = courier_api::router(state);
        let mut api_shutdown = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(api_listener, api)
                .with_graceful_shutdown(async move {
                    let _ = api_shutdown.recv().await;
                })
                .await
            {
                tracing::error!(error = %e, "api: server failed");
            }
        }));

        handles.push(tokio::spawn(edge.run(edge_listener, shutdown_tx.subscribe())));
        handles.push(tokio::spawn(relay.run(shutdown_tx.subscribe())));
        handles.push(tokio::spawn(consumer.run(shutdown_tx.subscribe())));
        handles.push(tokio::spawn(membership::run_membership_loop(
            router.clone(),
            source,
            Duration::from_secs(cfg.push.membership_refresh_secs),
            shutdown_tx.subscribe(),
        )));
        if cfg.cluster.membership == MembershipMode::Store {
            handles.push(tokio::spawn(membership::run_heartbeat_loop(
                store.clone(),
                node_id.clone(),
                push_url,
                Duration::from_secs(cfg.cluster.heartbeat_secs),
                shutdown_tx.subscribe(),
            )));
        }
        handles.push(tokio::spawn(presence::run_presence_sweeper(
            presence,
            Duration::from_secs(cfg.presence.sweep_interval_secs),
            shutdown_tx.subscribe(),
        )));

        tracing::info!(tasks = handles.len(), "all tasks spawned");

        Ok(Self {
            node_id,
            api_addr,
            edge_addr,
            stats,
            router,
            registry,
            shutdown_tx,
            handles,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn edge_addr(&self) -> SocketAddr {
        self.edge_addr
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    pub fn router(&self) -> &Arc<PushRouter> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Signal every loop, wait for them, then flush the push queues.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "task ended abnormally");
            }
        }
        self.router.close().await;
        tracing::info!(node_id = %self.node_id, "shutdown complete");
    }
}
