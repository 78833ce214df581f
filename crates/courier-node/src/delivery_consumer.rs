//! Delivery consumer -- pulls conversation events off the bus and hands
//! them to the fanout dispatcher.
//!
//! Undecodable events are acked and dropped. A decoded event gets
//! `max_attempts` dispatch attempts; success acks, exhaustion naks and the
//! bus redelivers. Each attempt runs in its own task so a panic counts as
//! a failed attempt instead of killing the worker.
//!
//! A `DeliveryLedger` hears how each event ended: settled once fanned out,
//! exhausted when its final bus delivery also fails.
//!
//! With `partition_by_session` one reader routes events to worker lanes by
//! session hash, so events of one conversation are dispatched in arrival
//! order. Otherwise all workers compete on the subscription.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_api::PipelineStats;
use courier_protocol::ConversationEvent;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

use crate::bus::{Delivery, Subscription};
use crate::fanout::FanoutError;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ConversationEvent) -> Result<(), FanoutError>;
}

/// Outbox side of a delivery.
pub trait DeliveryLedger: Send + Sync {
    /// The event was fanned out.
    fn settled(&self, msg_id: u64);
    /// The bus has no redeliveries left for the event.
    fn exhausted(&self, msg_id: u64, error: &str);
}

#[derive(Debug, Clone, Copy)]
pub struct ConsumerConfig {
    pub worker_count: usize,
    pub max_attempts: u32,
    pub attempt_delay: Duration,
    pub partition_by_session: bool,
    /// Events buffered per lane when partitioned.
    pub lane_capacity: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        let t = courier_protocol::DEFAULT_TUNING;
        Self {
            worker_count: t.consumer_worker_count,
            max_attempts: t.consumer_max_attempts,
            attempt_delay: Duration::from_millis(t.consumer_attempt_delay_ms),
            partition_by_session: true,
            lane_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    /// Undecodable payload, acked without dispatch.
    Poison,
    Nacked,
    /// Failed on its final delivery, acked and handed to the ledger.
    DeadLettered,
}

pub struct DeliveryConsumer {
    subscription: Subscription,
    handler: Arc<dyn EventHandler>,
    ledger: Option<Arc<dyn DeliveryLedger>>,
    config: ConsumerConfig,
    stats: Arc<PipelineStats>,
}

/// Worker lane for a session: stable for the life of the process.
pub fn lane_for(session_id: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    session_id.hash(&mut hasher);
    (hasher.finish() % lanes.max(1) as u64) as usize
}

impl DeliveryConsumer {
    pub fn new(
        subscription: Subscription,
        handler: Arc<dyn EventHandler>,
        config: ConsumerConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            subscription,
            handler,
            ledger: None,
            config,
            stats,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn DeliveryLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            handler: self.handler.clone(),
            ledger: self.ledger.clone(),
            config: self.config,
            stats: self.stats.clone(),
        }
    }

    /// Decode, dispatch with retries, and settle one delivery.
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        match decode(&delivery, &self.stats) {
            Some(event) => self.dispatcher().dispatch_and_settle(delivery, event).await,
            None => {
                delivery.ack();
                Outcome::Poison
            }
        }
    }

    pub async fn run(self, shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            topic = self.subscription.topic(),
            group = self.subscription.group(),
            workers = self.config.worker_count,
            partitioned = self.config.partition_by_session,
            "consumer: started"
        );
        if self.config.partition_by_session {
            self.run_partitioned(shutdown).await;
        } else {
            self.run_competing(shutdown).await;
        }
        tracing::info!("consumer shutting down");
    }

    async fn run_partitioned(self, mut shutdown: broadcast::Receiver<()>) {
        let lanes = self.config.worker_count.max(1);
        let mut senders = Vec::with_capacity(lanes);
        let mut workers = JoinSet::new();

        for lane in 0..lanes {
            let (tx, mut rx) = mpsc::channel::<(Delivery, ConversationEvent)>(
                self.config.lane_capacity.max(1),
            );
            senders.push(tx);
            let dispatcher = self.dispatcher();
            workers.spawn(async move {
                while let Some((delivery, event)) = rx.recv().await {
                    dispatcher.dispatch_and_settle(delivery, event).await;
                }
                tracing::debug!(lane, "consumer: lane finished");
            });
        }

        loop {
            tokio::select! {
                next = self.subscription.next() => {
                    let Some(delivery) = next else {
                        tracing::warn!("consumer: subscription closed");
                        break;
                    };
                    let Some(event) = decode(&delivery, &self.stats) else {
                        delivery.ack();
                        continue;
                    };
                    let lane = lane_for(&event.session_id, lanes);
                    if senders[lane].send((delivery, event)).await.is_err() {
                        tracing::error!(lane, "consumer: lane closed");
                        break;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        // Closing the lanes lets in-flight work finish.
        drop(senders);
        while workers.join_next().await.is_some() {}
    }

    async fn run_competing(self, shutdown: broadcast::Receiver<()>) {
        let this = Arc::new(self);
        let mut workers = JoinSet::new();

        for _ in 0..this.config.worker_count.max(1) {
            let this = this.clone();
            let mut shutdown = shutdown.resubscribe();
            workers.spawn(async move {
                loop {
                    tokio::select! {
                        next = this.subscription.next() => {
                            match next {
                                Some(delivery) => { this.process(delivery).await; }
                                None => return,
                            }
                        }
                        _ = shutdown.recv() => return,
                    }
                }
            });
        }

        while workers.join_next().await.is_some() {}
    }
}

fn decode(delivery: &Delivery, stats: &PipelineStats) -> Option<ConversationEvent> {
    match ConversationEvent::decode(delivery.payload()) {
        Ok(event) => Some(event),
        Err(e) => {
            PipelineStats::incr(&stats.events_poison);
            tracing::warn!(
                error = %e,
                bytes = delivery.payload().len(),
                "consumer: undecodable event dropped"
            );
            None
        }
    }
}

/// Everything a worker needs to dispatch and settle one event.
struct Dispatcher {
    handler: Arc<dyn EventHandler>,
    ledger: Option<Arc<dyn DeliveryLedger>>,
    config: ConsumerConfig,
    stats: Arc<PipelineStats>,
}

impl Dispatcher {
    async fn dispatch_and_settle(&self, delivery: Delivery, event: ConversationEvent) -> Outcome {
        let event = Arc::new(event);
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let h = self.handler.clone();
            let ev = event.clone();
            let result = tokio::spawn(async move { h.handle(&ev).await }).await;

            match result {
                Ok(Ok(())) => {
                    PipelineStats::incr(&self.stats.events_dispatched);
                    if let Some(ledger) = &self.ledger {
                        ledger.settled(event.msg_id);
                    }
                    delivery.ack();
                    return Outcome::Acked;
                }
                Ok(Err(e)) => {
                    PipelineStats::incr(&self.stats.dispatch_failures);
                    tracing::warn!(
                        msg_id = event.msg_id,
                        attempt,
                        error = %e,
                        "consumer: dispatch failed"
                    );
                    last_error = e.to_string();
                }
                Err(e) if e.is_panic() => {
                    PipelineStats::incr(&self.stats.dispatch_failures);
                    tracing::error!(msg_id = event.msg_id, attempt, "consumer: dispatch panicked");
                    last_error = "dispatch panicked".into();
                }
                Err(e) => {
                    PipelineStats::incr(&self.stats.dispatch_failures);
                    tracing::warn!(msg_id = event.msg_id, attempt, error = %e, "consumer: dispatch cancelled");
                    last_error = e.to_string();
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.attempt_delay).await;
            }
        }

        if delivery.is_final() {
            PipelineStats::incr(&self.stats.events_dead_lettered);
            tracing::error!(
                msg_id = event.msg_id,
                deliveries = delivery.delivery_count(),
                error = %last_error,
                "consumer: redeliveries exhausted, failing intent"
            );
            if let Some(ledger) = &self.ledger {
                ledger.exhausted(
                    event.msg_id,
                    &format!(
                        "fanout failed on {} deliveries: {last_error}",
                        delivery.delivery_count()
                    ),
                );
            }
            delivery.ack();
            return Outcome::DeadLettered;
        }

        PipelineStats::incr(&self.stats.events_nacked);
        tracing::warn!(
            msg_id = event.msg_id,
            deliveries = delivery.delivery_count(),
            "consumer: attempts exhausted, nak"
        );
        delivery.nak();
        Outcome::Nacked
    }
}
