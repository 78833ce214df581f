//! Courier Protocol -- wire packets, frame codec, bus event types.
//!
//! Edge <-> client: TCP, 4-byte big-endian length prefix + bincode body.
//! Outbox relay -> bus -> delivery consumer: serde JSON conversation events.

pub mod codec;
pub mod events;
pub mod packet;
pub mod tuning;

pub use codec::{FrameCodec, PacketCodec};
pub use events::*;
pub use packet::*;
pub use tuning::{PipelineTuning, DEFAULT_TUNING};

/// Handshake magic number: 0xC00121E5.
pub const PROTOCOL_MAGIC: u32 = 0xC001_21E5;

/// Minimum supported edge protocol version.
pub const VERSION_MIN: u16 = 1;

/// Maximum supported edge protocol version.
pub const VERSION_MAX: u16 = 1;

/// Bus topic carrying conversation events from the outbox relay.
pub const PUSH_EVENT_TOPIC: &str = "push.event";

/// Maximum frame size on the edge socket (sourced from default tuning).
pub const MAX_FRAME_BYTES: usize = DEFAULT_TUNING.max_frame_bytes;

/// Maximum chat content size accepted by ingest (sourced from default tuning).
pub const MAX_CONTENT_BYTES: usize = DEFAULT_TUNING.max_content_bytes;

/// Conversation identifier (opaque string).
pub type SessionId = String;

/// Edge node identifier (opaque string, unique per running node).
pub type EdgeNodeId = String;

/// Prefix of presence keys: `online:{username}`.
pub const PRESENCE_KEY_PREFIX: &str = "online:";

/// Build the presence key for a user.
pub fn presence_key(username: &str) -> String {
    format!("{PRESENCE_KEY_PREFIX}{username}")
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid magic: expected {expected:#010x}, got {got:#010x}")]
    InvalidMagic { expected: u32, got: u32 },
    #[error("version mismatch: peer offers {offered}, we support {our_min}-{our_max}")]
    VersionMismatch {
        offered: u16,
        our_min: u16,
        our_max: u16,
    },
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
