//! Edge wire packets.
//!
//! Every frame after the handshake is a `Packet`: a client-chosen correlation
//! token plus a closed `Payload` union. The union is exhaustive on both
//! sides; an unknown variant tag fails to decode.

use serde::{Deserialize, Serialize};

use crate::SessionId;

// ============================================================================
// Handshake (first frame on a connection)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub magic: u32,
    pub version: u16,
    pub username: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub accepted: bool,
    pub node_id: String,
    pub version: u16,
    pub reason: Option<String>,
}

// ============================================================================
// Packets
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Correlation token. For `Chat` it is echoed back in the matching `Ack`.
    pub seq: String,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Heartbeat. Inbound pulses are echoed back unchanged.
    Pulse(Pulse),
    /// Client -> edge chat message.
    Chat(Chat),
    /// Edge -> client ingest result, or client -> edge liveness ack.
    Ack(Ack),
    /// Edge -> client delivery of one or more messages.
    Push(Push),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pulse {
    pub sent_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub session_id: SessionId,
    pub content: String,
    pub msg_type: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub msg_id: u64,
    pub seq_id: i64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Push {
    pub messages: Vec<PushMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    pub msg_id: u64,
    pub seq_id: i64,
    pub session_id: SessionId,
    pub from: String,
    pub content: String,
    pub msg_type: i32,
    pub timestamp: i64,
}

impl Packet {
    pub fn pulse(seq: impl Into<String>, sent_at_ms: i64) -> Self {
        Self {
            seq: seq.into(),
            payload: Payload::Pulse(Pulse { sent_at_ms }),
        }
    }

    pub fn chat(seq: impl Into<String>, session_id: &str, content: &str, msg_type: i32) -> Self {
        Self {
            seq: seq.into(),
            payload: Payload::Chat(Chat {
                session_id: session_id.to_string(),
                content: content.to_string(),
                msg_type,
            }),
        }
    }

    pub fn ack_ok(seq: impl Into<String>, msg_id: u64, seq_id: i64) -> Self {
        Self {
            seq: seq.into(),
            payload: Payload::Ack(Ack {
                msg_id,
                seq_id,
                error: None,
            }),
        }
    }

    pub fn ack_err(seq: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            seq: seq.into(),
            payload: Payload::Ack(Ack {
                msg_id: 0,
                seq_id: 0,
                error: Some(error.into()),
            }),
        }
    }

    pub fn push(seq: impl Into<String>, messages: Vec<PushMessage>) -> Self {
        Self {
            seq: seq.into(),
            payload: Payload::Push(Push { messages }),
        }
    }

    /// Short name of the payload kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self.payload {
            Payload::Pulse(_) => "pulse",
            Payload::Chat(_) => "chat",
            Payload::Ack(_) => "ack",
            Payload::Push(_) => "push",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(Packet::pulse("1", 0).kind(), "pulse");
        assert_eq!(Packet::chat("2", "s", "hi", 0).kind(), "chat");
        assert_eq!(Packet::ack_ok("3", 1, 1).kind(), "ack");
        assert_eq!(Packet::push("4", vec![]).kind(), "push");
    }

    #[test]
    fn test_ack_err_has_zero_ids() {
        let p = Packet::ack_err("c-1", "permission denied");
        match p.payload {
            Payload::Ack(ack) => {
                assert_eq!(ack.msg_id, 0);
                assert_eq!(ack.seq_id, 0);
                assert_eq!(ack.error.as_deref(), Some("permission denied"));
            }
            _ => panic!("wrong variant"),
        }
    }
}
