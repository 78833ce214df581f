//! Fanout dispatcher -- per-event inbox writes and push routing.
//!
//! Storage fanout and push fanout run concurrently. Only storage failures
//! fail the event; push problems are logged and the recipient catches up
//! from the inbox.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use courier_api::PipelineStats;
use courier_protocol::{ConversationEvent, PushTask};
use courier_storage::{InboxRecord, Store, StorageError};

use crate::delivery_consumer::EventHandler;
use crate::presence::PresenceDirectory;
use crate::push_router::PushRouter;

#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    pub inbox_records: usize,
    pub push_tasks: usize,
    pub recipients_offline: usize,
    pub push_rejected: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct PushOutcome {
    tasks: usize,
    offline: usize,
    rejected: usize,
}

pub struct FanoutDispatcher {
    store: Arc<dyn Store>,
    presence: Arc<PresenceDirectory>,
    router: Arc<PushRouter>,
    stats: Arc<PipelineStats>,
}

impl FanoutDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        presence: Arc<PresenceDirectory>,
        router: Arc<PushRouter>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            store,
            presence,
            router,
            stats,
        }
    }

    pub async fn dispatch(&self, event: &ConversationEvent) -> Result<FanoutReport, FanoutError> {
        let members = self.store.get_members(&event.session_id)?;
        if members.is_empty() {
            tracing::warn!(
                msg_id = event.msg_id,
                session = %event.session_id,
                "fanout: session has no members"
            );
            return Ok(FanoutReport::default());
        }

        let recipients: Vec<String> = members
            .iter()
            .filter(|m| **m != event.from)
            .cloned()
            .collect();

        let (stored, pushed) = tokio::join!(
            self.storage_fanout(event, &members),
            self.push_fanout(event, &recipients),
        );
        let inbox_records = stored?;

        let report = FanoutReport {
            inbox_records,
            push_tasks: pushed.tasks,
            recipients_offline: pushed.offline,
            push_rejected: pushed.rejected,
        };
        tracing::debug!(
            msg_id = event.msg_id,
            seq_id = event.seq_id,
            session = %event.session_id,
            inbox = report.inbox_records,
            push_tasks = report.push_tasks,
            offline = report.recipients_offline,
            "fanout: event dispatched"
        );
        Ok(report)
    }

    /// One inbox record per member, sender included.
    async fn storage_fanout(
        &self,
        event: &ConversationEvent,
        members: &[String],
    ) -> Result<usize, FanoutError> {
        let records: Vec<InboxRecord> = members
            .iter()
            .map(|owner| InboxRecord {
                owner: owner.clone(),
                session_id: event.session_id.clone(),
                msg_id: event.msg_id,
                seq_id: event.seq_id,
                read_flag: false,
            })
            .collect();

        let written = self
            .store
            .upsert_inbox_records(&records, courier_protocol::now_ms())?;
        PipelineStats::add(&self.stats.inbox_records_written, written as u64);
        Ok(written)
    }

    async fn push_fanout(&self, event: &ConversationEvent, recipients: &[String]) -> PushOutcome {
        if recipients.is_empty() {
            return PushOutcome::default();
        }

        let online = match self.presence.lookup(recipients) {
            Ok(online) => online,
            Err(e) => {
                tracing::warn!(
                    msg_id = event.msg_id,
                    error = %e,
                    "fanout: presence lookup failed, skipping push"
                );
                return PushOutcome {
                    offline: recipients.len(),
                    ..Default::default()
                };
            }
        };

        let by_node = group_by_node(recipients, &online);
        let mut outcome = PushOutcome {
            offline: recipients.len() - online.len().min(recipients.len()),
            ..Default::default()
        };
        PipelineStats::add(&self.stats.push_recipients_offline, outcome.offline as u64);

        let message = event.to_push_message();
        for (node_id, usernames) in by_node {
            let task = PushTask {
                target_usernames: usernames,
                message: message.clone(),
            };
            match self.router.enqueue(&node_id, task).await {
                Ok(()) => outcome.tasks += 1,
                Err(e) => {
                    outcome.rejected += 1;
                    PipelineStats::incr(&self.stats.push_tasks_rejected);
                    tracing::warn!(
                        msg_id = event.msg_id,
                        node_id = %node_id,
                        error = %e,
                        "fanout: push enqueue failed"
                    );
                }
            }
        }
        outcome
    }
}

/// Group online recipients by the edge node serving them.
pub fn group_by_node(
    recipients: &[String],
    online: &HashMap<String, String>,
) -> BTreeMap<String, Vec<String>> {
    let mut by_node: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for username in recipients {
        if let Some(node_id) = online.get(username) {
            by_node
                .entry(node_id.clone())
                .or_default()
                .push(username.clone());
        }
    }
    by_node
}

#[async_trait]
impl EventHandler for FanoutDispatcher {
    async fn handle(&self, event: &ConversationEvent) -> Result<(), FanoutError> {
        self.dispatch(event).await.map(|_| ())
    }
}
