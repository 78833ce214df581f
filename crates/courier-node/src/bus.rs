//! Message bus -- topic publish, queue-group subscription, ack/nak.
//!
//! Every queue group subscribed to a topic receives its own copy of each
//! message; members of one group compete for it. A nak'd (or dropped
//! unsettled) delivery is redelivered after `redelivery_delay` until it has
//! been delivered `max_deliver` times, then dead-lettered.
//!
//! `LocalBus` is the in-process implementation and holds messages in memory
//! only. Durability lives in the outbox: an intent stays leased until the
//! consumer settles it, so anything lost with the process is republished.
//! Publishes with no subscribed group, or into a full group queue, are
//! refused as backpressure.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no subscribers for topic {0}")]
    NoSubscribers(String),
    #[error("queue full for topic {topic} group {group}")]
    QueueFull { topic: String, group: String },
    #[error("bus closed")]
    Closed,
    #[error("publish failed: {0}")]
    Publish(String),
}

impl BusError {
    /// Refusals that clear on their own once consumers catch up.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, BusError::NoSubscribers(_) | BusError::QueueFull { .. })
    }
}

/// Redelivery policy shared by all subscriptions of a bus.
#[derive(Debug, Clone, Copy)]
pub struct BusPolicy {
    pub redelivery_delay: Duration,
    pub max_deliver: u32,
    pub queue_capacity: usize,
}

impl Default for BusPolicy {
    fn default() -> Self {
        let t = courier_protocol::DEFAULT_TUNING;
        Self {
            redelivery_delay: Duration::from_millis(t.bus_redelivery_delay_ms),
            max_deliver: t.bus_max_deliver,
            queue_capacity: t.bus_queue_capacity,
        }
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, BusError>;
}

#[derive(Debug)]
struct Envelope {
    topic: String,
    payload: Vec<u8>,
    deliveries: u32,
}

struct GroupQueue {
    tx: mpsc::Sender<Envelope>,
    rx: Arc<Mutex<mpsc::Receiver<Envelope>>>,
}

/// Receive side of one queue group. Clones share the group's queue.
#[derive(Clone)]
pub struct Subscription {
    topic: String,
    group: String,
    rx: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    requeue: mpsc::Sender<Envelope>,
    policy: BusPolicy,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Wait for the next message. None once the bus is gone.
    pub async fn next(&self) -> Option<Delivery> {
        let envelope = {
            let mut rx = self.rx.lock().await;
            rx.recv().await?
        };
        Some(Delivery {
            envelope: Some(Envelope {
                deliveries: envelope.deliveries + 1,
                ..envelope
            }),
            group: self.group.clone(),
            requeue: self.requeue.clone(),
            policy: self.policy,
        })
    }
}

/// One delivery of a message to a queue group member.
pub struct Delivery {
    envelope: Option<Envelope>,
    group: String,
    requeue: mpsc::Sender<Envelope>,
    policy: BusPolicy,
}

impl Delivery {
    pub fn payload(&self) -> &[u8] {
        self.envelope
            .as_ref()
            .map(|e| e.payload.as_slice())
            .unwrap_or_default()
    }

    /// 1 on first delivery.
    pub fn delivery_count(&self) -> u32 {
        self.envelope.as_ref().map(|e| e.deliveries).unwrap_or(0)
    }

    /// The bus will not redeliver this message if it is nak'd.
    pub fn is_final(&self) -> bool {
        self.delivery_count() >= self.policy.max_deliver
    }

    pub fn ack(mut self) {
        self.envelope.take();
    }

    pub fn nak(mut self) {
        if let Some(envelope) = self.envelope.take() {
            schedule_redelivery(envelope, &self.group, self.requeue.clone(), self.policy);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        // Unsettled: same as nak
        if let Some(envelope) = self.envelope.take() {
            schedule_redelivery(envelope, &self.group, self.requeue.clone(), self.policy);
        }
    }
}

fn schedule_redelivery(
    envelope: Envelope,
    group: &str,
    requeue: mpsc::Sender<Envelope>,
    policy: BusPolicy,
) {
    if envelope.deliveries >= policy.max_deliver {
        tracing::error!(
            topic = %envelope.topic,
            group,
            deliveries = envelope.deliveries,
            "bus: message dead-lettered"
        );
        return;
    }

    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        tracing::warn!(topic = %envelope.topic, group, "bus: no runtime, redelivery dropped");
        return;
    };

    handle.spawn(async move {
        tokio::time::sleep(policy.redelivery_delay).await;
        if requeue.send(envelope).await.is_err() {
            tracing::debug!("bus: group queue closed before redelivery");
        }
    });
}

/// In-process bus.
pub struct LocalBus {
    topics: RwLock<HashMap<String, HashMap<String, GroupQueue>>>,
    policy: BusPolicy,
}

impl LocalBus {
    pub fn new(policy: BusPolicy) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            policy,
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(BusPolicy::default())
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let topics = self.topics.read().await;
        let groups = match topics.get(topic) {
            Some(groups) if !groups.is_empty() => groups,
            _ => return Err(BusError::NoSubscribers(topic.to_string())),
        };

        // Reserve a slot in every group first so a full group refuses the
        // whole publish instead of delivering to only some groups.
        let mut permits = Vec::with_capacity(groups.len());
        for (group, queue) in groups {
            match queue.tx.try_reserve() {
                Ok(permit) => permits.push(permit),
                Err(mpsc::error::TrySendError::Full(())) => {
                    return Err(BusError::QueueFull {
                        topic: topic.to_string(),
                        group: group.clone(),
                    })
                }
                Err(mpsc::error::TrySendError::Closed(())) => return Err(BusError::Closed),
            }
        }

        for permit in permits {
            permit.send(Envelope {
                topic: topic.to_string(),
                payload: payload.clone(),
                deliveries: 0,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, BusError> {
        let mut topics = self.topics.write().await;
        let queue = topics
            .entry(topic.to_string())
            .or_default()
            .entry(group.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.policy.queue_capacity);
                GroupQueue {
                    tx,
                    rx: Arc::new(Mutex::new(rx)),
                }
            });

        tracing::debug!(topic, group, "bus: subscribed");
        Ok(Subscription {
            topic: topic.to_string(),
            group: group.to_string(),
            rx: queue.rx.clone(),
            requeue: queue.tx.clone(),
            policy: self.policy,
        })
    }
}
