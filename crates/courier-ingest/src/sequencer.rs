//! Message id and conversation sequence allocation.
//!
//! Message ids are 64-bit snowflakes:
//!
//! ```text
//!  63      22 21     12 11        0
//! +----------+---------+-----------+
//! | ms since | worker  | counter   |
//! | epoch 41 | id 10   | 12        |
//! +----------+---------+-----------+
//! ```
//!
//! Sequence numbers come from the store's atomic per-session counter.

use std::sync::{Arc, Mutex};

use courier_storage::Store;

/// 2024-01-01T00:00:00Z in Unix milliseconds.
pub const COURIER_EPOCH_MS: i64 = 1_704_067_200_000;

pub const WORKER_ID_BITS: u32 = 10;
pub const COUNTER_BITS: u32 = 12;
pub const MAX_WORKER_ID: u16 = (1 << WORKER_ID_BITS) - 1;
const MAX_COUNTER: u16 = (1 << COUNTER_BITS) - 1;

#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    #[error("sequencer unavailable: {0}")]
    Unavailable(String),
    #[error("worker id {0} out of range (max {MAX_WORKER_ID})")]
    InvalidWorkerId(u16),
}

/// Allocates message ids and per-conversation sequence numbers.
pub trait Sequencer: Send + Sync {
    fn next_message_id(&self) -> Result<u64, SequencerError>;
    fn next_seq(&self, session_id: &str) -> Result<i64, SequencerError>;
}

pub type Clock = Box<dyn Fn() -> i64 + Send + Sync>;

struct IdState {
    last_ms: i64,
    counter: u16,
}

/// Snowflake id generator.
///
/// Never regresses: a clock that steps backwards keeps using the last
/// observed millisecond, and a counter overflow moves on to the next one.
pub struct MessageIdGenerator {
    worker_id: u16,
    clock: Clock,
    state: Mutex<IdState>,
}

impl MessageIdGenerator {
    pub fn new(worker_id: u16) -> Result<Self, SequencerError> {
        Self::with_clock(worker_id, Box::new(courier_protocol::now_ms))
    }

    pub fn with_clock(worker_id: u16, clock: Clock) -> Result<Self, SequencerError> {
        if worker_id > MAX_WORKER_ID {
            return Err(SequencerError::InvalidWorkerId(worker_id));
        }
        Ok(Self {
            worker_id,
            clock,
            state: Mutex::new(IdState {
                last_ms: 0,
                counter: 0,
            }),
        })
    }

    pub fn worker_id(&self) -> u16 {
        self.worker_id
    }

    pub fn next_id(&self) -> Result<u64, SequencerError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SequencerError::Unavailable("id generator lock poisoned".into()))?;

        let now = ((self.clock)() - COURIER_EPOCH_MS).max(0);
        if now > state.last_ms {
            state.last_ms = now;
            state.counter = 0;
        } else if state.counter < MAX_COUNTER {
            state.counter += 1;
        } else {
            state.last_ms += 1;
            state.counter = 0;
        }

        Ok(compose_id(state.last_ms, self.worker_id, state.counter))
    }
}

fn compose_id(ms: i64, worker_id: u16, counter: u16) -> u64 {
    ((ms as u64) << (WORKER_ID_BITS + COUNTER_BITS))
        | ((worker_id as u64) << COUNTER_BITS)
        | counter as u64
}

/// Split a message id into (ms since courier epoch, worker id, counter).
pub fn decompose_id(id: u64) -> (i64, u16, u16) {
    let ms = (id >> (WORKER_ID_BITS + COUNTER_BITS)) as i64;
    let worker = ((id >> COUNTER_BITS) & MAX_WORKER_ID as u64) as u16;
    let counter = (id & MAX_COUNTER as u64) as u16;
    (ms, worker, counter)
}

/// Store-backed sequencer.
pub struct StoreSequencer {
    store: Arc<dyn Store>,
    ids: MessageIdGenerator,
}

impl StoreSequencer {
    pub fn new(store: Arc<dyn Store>, worker_id: u16) -> Result<Self, SequencerError> {
        Ok(Self {
            store,
            ids: MessageIdGenerator::new(worker_id)?,
        })
    }
}

impl Sequencer for StoreSequencer {
    fn next_message_id(&self) -> Result<u64, SequencerError> {
        self.ids.next_id()
    }

    fn next_seq(&self, session_id: &str) -> Result<i64, SequencerError> {
        self.store.next_seq(session_id).map_err(|e| {
            tracing::warn!(session = session_id, error = %e, "sequencer: store unavailable");
            SequencerError::Unavailable(e.to_string())
        })
    }
}
