//! Bus and push-channel payloads.
//!
//! `ConversationEvent` is what the outbox stores and the relay publishes on
//! `push.event`. `PushTask` / `PushBatch` travel from a node's push router to
//! the edge node serving the recipients.

use serde::{Deserialize, Serialize};

use crate::packet::PushMessage;
use crate::{ProtocolError, SessionId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub name: String,
    /// "direct" or "group".
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub msg_id: u64,
    pub seq_id: i64,
    pub session_id: SessionId,
    pub from: String,
    /// Counterpart of a direct session; None for group sessions.
    #[serde(default)]
    pub to: Option<String>,
    pub content: String,
    #[serde(rename = "type")]
    pub msg_type: i32,
    /// Unix milliseconds at ingest.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_meta: Option<SessionMeta>,
}

impl ConversationEvent {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_push_message(&self) -> PushMessage {
        PushMessage {
            msg_id: self.msg_id,
            seq_id: self.seq_id,
            session_id: self.session_id.clone(),
            from: self.from.clone(),
            content: self.content.clone(),
            msg_type: self.msg_type,
            timestamp: self.timestamp,
        }
    }
}

/// One message addressed to a set of users on a single edge node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushTask {
    pub target_usernames: Vec<String>,
    pub message: PushMessage,
}

/// Batch of push tasks sent over a node's push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushBatch {
    /// Destination edge node.
    pub node_id: String,
    pub tasks: Vec<PushTask>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushBatchResponse {
    /// Packets handed to live client connections.
    pub delivered: usize,
}
