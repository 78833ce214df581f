//! Courier Ingest -- accepts chat messages, orders and persists them.
//!
//! `accept` validates, checks membership, allocates (msg_id, seq_id), and
//! writes the message together with its outbox intent in one transaction.
//! Publishing to the bus is left to the outbox relay.

use std::sync::Arc;

use courier_protocol::{ConversationEvent, SessionMeta, PUSH_EVENT_TOPIC};
use courier_storage::{MessageRow, NewIntent, Store};
use serde::{Deserialize, Serialize};

pub mod sequencer;

pub use sequencer::{MessageIdGenerator, Sequencer, SequencerError, StoreSequencer};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("permission denied: {sender} is not a member of {session_id}")]
    PermissionDenied { sender: String, session_id: String },
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// Whether a caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Unavailable(_) | IngestError::Internal(_))
    }

    /// Message shown to clients. Internal details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            IngestError::Internal(_) => "internal error".into(),
            other => other.to_string(),
        }
    }
}

impl From<SequencerError> for IngestError {
    fn from(e: SequencerError) -> Self {
        IngestError::Unavailable(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptRequest {
    pub session_id: String,
    pub sender: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub msg_type: i32,
    /// Client correlation token, echoed in logs only.
    #[serde(default)]
    pub client_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptReceipt {
    pub msg_id: u64,
    pub seq_id: i64,
}

pub struct IngestService {
    store: Arc<dyn Store>,
    sequencer: Arc<dyn Sequencer>,
    max_content_bytes: usize,
}

impl IngestService {
    pub fn new(store: Arc<dyn Store>, sequencer: Arc<dyn Sequencer>) -> Self {
        Self {
            store,
            sequencer,
            max_content_bytes: courier_protocol::MAX_CONTENT_BYTES,
        }
    }

    pub fn with_max_content_bytes(mut self, max: usize) -> Self {
        self.max_content_bytes = max;
        self
    }

    pub fn accept(&self, req: &AcceptRequest) -> Result<AcceptReceipt, IngestError> {
        self.validate(req)?;

        let is_member = self
            .store
            .is_member(&req.session_id, &req.sender)
            .map_err(|e| IngestError::Unavailable(e.to_string()))?;
        if !is_member {
            tracing::debug!(
                session = %req.session_id,
                sender = %req.sender,
                "ingest: sender not a member"
            );
            return Err(IngestError::PermissionDenied {
                sender: req.sender.clone(),
                session_id: req.session_id.clone(),
            });
        }

        let (to, session_meta) = self.describe_session(req)?;

        let msg_id = self.sequencer.next_message_id()?;
        let seq_id = self.sequencer.next_seq(&req.session_id)?;
        let timestamp = courier_protocol::now_ms();

        let event = ConversationEvent {
            msg_id,
            seq_id,
            session_id: req.session_id.clone(),
            from: req.sender.clone(),
            to,
            content: req.content.clone(),
            msg_type: req.msg_type,
            timestamp,
            session_meta,
        };
        let payload = event
            .encode()
            .map_err(|e| IngestError::Internal(format!("encode event: {e}")))?;

        let message = MessageRow {
            msg_id,
            session_id: req.session_id.clone(),
            sender: req.sender.clone(),
            content: req.content.clone(),
            msg_type: req.msg_type,
            seq_id,
            created_at: timestamp,
        };
        let intent = NewIntent {
            topic: PUSH_EVENT_TOPIC.to_string(),
            payload,
        };

        let intent_id = self
            .store
            .save_message_with_intent(&message, &intent)
            .map_err(|e| {
                tracing::error!(
                    msg_id,
                    session = %req.session_id,
                    error = %e,
                    "ingest: persist failed"
                );
                IngestError::Internal(e.to_string())
            })?;

        tracing::debug!(
            msg_id,
            seq_id,
            intent_id,
            session = %req.session_id,
            client_token = %req.client_token,
            "ingest: message accepted"
        );

        Ok(AcceptReceipt { msg_id, seq_id })
    }

    fn validate(&self, req: &AcceptRequest) -> Result<(), IngestError> {
        if req.session_id.trim().is_empty() {
            return Err(IngestError::Validation("session_id is required".into()));
        }
        if req.sender.trim().is_empty() {
            return Err(IngestError::Validation("sender is required".into()));
        }
        if req.content.is_empty() {
            return Err(IngestError::Validation("content is required".into()));
        }
        if req.content.len() > self.max_content_bytes {
            return Err(IngestError::Validation(format!(
                "content too large: {} bytes (max {})",
                req.content.len(),
                self.max_content_bytes
            )));
        }
        Ok(())
    }

    /// Recipient of a direct session and the session header for the event.
    fn describe_session(
        &self,
        req: &AcceptRequest,
    ) -> Result<(Option<String>, Option<SessionMeta>), IngestError> {
        let session = self
            .store
            .read_session(&req.session_id)
            .map_err(|e| IngestError::Unavailable(e.to_string()))?;

        let Some(session) = session else {
            return Ok((None, None));
        };

        let to = if session.kind == "direct" {
            self.store
                .get_members(&req.session_id)
                .map_err(|e| IngestError::Unavailable(e.to_string()))?
                .into_iter()
                .find(|m| m != &req.sender)
        } else {
            None
        };

        Ok((
            to,
            Some(SessionMeta {
                name: session.name,
                kind: session.kind,
            }),
        ))
    }
}
