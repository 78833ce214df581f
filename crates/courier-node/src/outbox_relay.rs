//! Outbox relay -- moves committed message intents onto the bus.
//!
//! Each sweep loads due intents (oldest first) and publishes them with
//! bounded concurrency. An intent is leased (`inflight`) before its publish
//! and stays leased until the delivery consumer settles it through
//! `OutboxLedger`. A lease that expires unsettled, for example because the
//! process died with the event still in the in-memory bus, makes the intent
//! due again and costs one retry.
//!
//! Broker failures reschedule with quadratic backoff and spend the retry
//! budget; `failed` once it is gone. Bus backpressure (full group queue, no
//! subscriber yet) defers the intent without spending a retry. Delivery is
//! at-least-once; fanout writes are idempotent.

use std::sync::Arc;
use std::time::Duration;

use courier_api::PipelineStats;
use courier_storage::{IntentStatus, OutboxIntent, Store};
use rand::Rng;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;

use crate::bus::MessageBus;
use crate::delivery_consumer::DeliveryLedger;

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub interval: Duration,
    pub batch_size: u32,
    pub worker_count: usize,
    pub max_retry: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub publish_timeout: Duration,
    /// How long a published intent waits for its consumer settle.
    pub ack_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let t = courier_protocol::DEFAULT_TUNING;
        Self {
            interval: Duration::from_millis(t.relay_interval_ms),
            batch_size: t.relay_batch_size,
            worker_count: t.relay_worker_count,
            max_retry: t.relay_max_retry,
            backoff_base: Duration::from_millis(t.relay_backoff_base_ms),
            backoff_max: Duration::from_millis(t.relay_backoff_max_ms),
            publish_timeout: Duration::from_millis(t.relay_publish_timeout_ms),
            ack_timeout: Duration::from_millis(t.relay_ack_timeout_ms),
        }
    }
}

/// Counts for one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub loaded: usize,
    pub published: usize,
    /// Of `published`, intents whose previous lease expired unsettled.
    pub republished: usize,
    pub retried: usize,
    pub deferred: usize,
    pub failed: usize,
    pub panicked: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Published { republished: bool },
    Retry,
    Deferred,
    Failed,
    /// Not due any more (leased or settled elsewhere).
    Skipped,
}

/// Delay before the `retry_count`-th retry: `base * retry_count^2`, capped.
pub fn backoff_ms(retry_count: u32, base_ms: u64, max_ms: u64) -> u64 {
    let n = u64::from(retry_count);
    base_ms
        .saturating_mul(n.saturating_mul(n))
        .min(max_ms)
}

/// Up to 10% extra so intents failing together do not retry together.
fn with_jitter(delay_ms: u64) -> u64 {
    let spread = delay_ms / 10;
    if spread == 0 {
        return delay_ms;
    }
    delay_ms + rand::thread_rng().gen_range(0..=spread)
}

pub struct OutboxRelay {
    store: Arc<dyn Store>,
    bus: Arc<dyn MessageBus>,
    config: RelayConfig,
    stats: Arc<PipelineStats>,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn MessageBus>,
        config: RelayConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            stats,
        }
    }

    /// One pass over the due intents at `now_ms`. Returns once every loaded
    /// intent has been handled.
    pub async fn sweep_once(&self, now_ms: i64) -> SweepReport {
        let intents = match self.store.due_intents(now_ms, self.config.batch_size) {
            Ok(intents) => intents,
            Err(e) => {
                tracing::warn!(error = %e, "relay: failed to load due intents");
                return SweepReport::default();
            }
        };
        PipelineStats::incr(&self.stats.relay_sweeps);

        let mut report = SweepReport {
            loaded: intents.len(),
            ..Default::default()
        };
        if intents.is_empty() {
            return report;
        }

        let permits = Arc::new(Semaphore::new(self.config.worker_count.max(1)));
        let mut tasks = JoinSet::new();

        for intent in intents {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let store = self.store.clone();
            let bus = self.bus.clone();
            let config = self.config;
            let stats = self.stats.clone();
            tasks.spawn(async move {
                let settled = relay_one(&*store, &*bus, &config, &stats, intent, now_ms).await;
                drop(permit);
                settled
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Settled::Published { republished }) => {
                    report.published += 1;
                    if republished {
                        report.republished += 1;
                    }
                }
                Ok(Settled::Retry) => report.retried += 1,
                Ok(Settled::Deferred) => report.deferred += 1,
                Ok(Settled::Failed) => report.failed += 1,
                Ok(Settled::Skipped) => {}
                Err(e) => {
                    // Leased: the intent is due again once the lease runs out.
                    report.panicked += 1;
                    PipelineStats::incr(&self.stats.relay_worker_panics);
                    tracing::error!(error = %e, "relay: publish worker panicked");
                }
            }
        }

        if report.published + report.retried + report.deferred + report.failed > 0 {
            tracing::debug!(
                loaded = report.loaded,
                published = report.published,
                republished = report.republished,
                retried = report.retried,
                deferred = report.deferred,
                failed = report.failed,
                "relay: sweep complete"
            );
        }
        report
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut timer = tokio::time::interval(self.config.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch = self.config.batch_size,
            workers = self.config.worker_count,
            ack_timeout_ms = self.config.ack_timeout.as_millis() as u64,
            "relay: started"
        );

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.sweep_once(courier_protocol::now_ms()).await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("relay shutting down");
                    return;
                }
            }
        }
    }
}

async fn relay_one(
    store: &dyn Store,
    bus: &dyn MessageBus,
    config: &RelayConfig,
    stats: &PipelineStats,
    intent: OutboxIntent,
    now_ms: i64,
) -> Settled {
    let lease_until = now_ms + config.ack_timeout.as_millis() as i64;
    let leased = match store.lease_intent(intent.id, now_ms, lease_until, config.max_retry) {
        Ok(Some(outcome)) => outcome,
        Ok(None) => return Settled::Skipped,
        Err(e) => {
            tracing::warn!(intent_id = intent.id, error = %e, "relay: lease failed");
            return Settled::Retry;
        }
    };

    let republished = intent.status == IntentStatus::Inflight;
    if leased.status == IntentStatus::Failed {
        PipelineStats::incr(&stats.intents_failed);
        tracing::error!(
            intent_id = intent.id,
            msg_id = intent.msg_id,
            retries = leased.retry_count,
            "relay: intent never acknowledged, failed permanently"
        );
        return Settled::Failed;
    }
    if republished {
        PipelineStats::incr(&stats.intents_retried);
        tracing::warn!(
            intent_id = intent.id,
            msg_id = intent.msg_id,
            retries = leased.retry_count,
            "relay: lease expired unsettled, republishing"
        );
    }

    let published =
        tokio::time::timeout(config.publish_timeout, bus.publish(&intent.topic, intent.payload))
            .await;

    let error = match published {
        Ok(Ok(())) => {
            PipelineStats::incr(&stats.intents_published);
            return Settled::Published { republished };
        }
        Ok(Err(e)) if e.is_backpressure() => {
            let retry_at = now_ms + with_jitter(config.backoff_base.as_millis() as u64) as i64;
            return match store.defer_intent(intent.id, now_ms, retry_at, &e.to_string()) {
                Ok(_) => {
                    PipelineStats::incr(&stats.intents_deferred);
                    tracing::debug!(intent_id = intent.id, reason = %e, "relay: bus busy, deferred");
                    Settled::Deferred
                }
                Err(err) => {
                    // Still leased: due again when the lease runs out.
                    tracing::warn!(intent_id = intent.id, error = %err, "relay: defer failed");
                    Settled::Retry
                }
            };
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("publish timed out after {}ms", config.publish_timeout.as_millis()),
    };

    let delay = with_jitter(backoff_ms(
        leased.retry_count + 1,
        config.backoff_base.as_millis() as u64,
        config.backoff_max.as_millis() as u64,
    ));
    match store.record_intent_failure(intent.id, now_ms, now_ms + delay as i64, config.max_retry, &error) {
        Ok(Some(outcome)) if outcome.status == IntentStatus::Failed => {
            PipelineStats::incr(&stats.intents_failed);
            tracing::error!(
                intent_id = intent.id,
                msg_id = intent.msg_id,
                retries = outcome.retry_count,
                error = %error,
                "relay: intent failed permanently"
            );
            Settled::Failed
        }
        Ok(Some(outcome)) => {
            PipelineStats::incr(&stats.intents_retried);
            tracing::warn!(
                intent_id = intent.id,
                retries = outcome.retry_count,
                delay_ms = delay,
                error = %error,
                "relay: publish failed, will retry"
            );
            Settled::Retry
        }
        Ok(None) => Settled::Skipped,
        Err(e) => {
            tracing::warn!(intent_id = intent.id, error = %e, "relay: failed to record failure");
            Settled::Retry
        }
    }
}

/// Closes intents from the consumer side: `sent` once their event is fanned
/// out, `failed` when the bus runs out of redeliveries for it.
pub struct OutboxLedger {
    store: Arc<dyn Store>,
    stats: Arc<PipelineStats>,
}

impl OutboxLedger {
    pub fn new(store: Arc<dyn Store>, stats: Arc<PipelineStats>) -> Self {
        Self { store, stats }
    }
}

impl DeliveryLedger for OutboxLedger {
    fn settled(&self, msg_id: u64) {
        match self.store.settle_intent(msg_id, courier_protocol::now_ms()) {
            Ok(true) => PipelineStats::incr(&self.stats.intents_settled),
            // Duplicate delivery of an already settled event.
            Ok(false) => tracing::debug!(msg_id, "relay: intent already settled"),
            Err(e) => {
                // Lease expiry republishes it; fanout is idempotent.
                tracing::warn!(msg_id, error = %e, "relay: settle failed");
            }
        }
    }

    fn exhausted(&self, msg_id: u64, error: &str) {
        match self.store.fail_intent(msg_id, courier_protocol::now_ms(), error) {
            Ok(true) => {
                PipelineStats::incr(&self.stats.intents_failed);
                tracing::error!(msg_id, error, "relay: delivery exhausted, intent failed");
            }
            Ok(false) => tracing::debug!(msg_id, "relay: exhausted intent already closed"),
            Err(e) => tracing::warn!(msg_id, error = %e, "relay: fail intent failed"),
        }
    }
}
