//! Courier Storage -- rusqlite wrapper for schema v1.
//!
//! One database file may be shared by several courier-node processes.
//! WAL mode + busy_timeout for concurrent access.
//!
//! Every write that other components race on is a single atomic statement
//! (counter increment, conditional status transition, keyed upsert) or one
//! transaction, never a read followed by a separate write.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Schema version this crate reads and writes.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },
    #[error("invalid outbox status: {0}")]
    InvalidStatus(String),
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRow {
    pub session_id: String,
    pub username: String,
    pub role: String,
    pub joined_at: i64,
}

/// A message as written by ingest and read back for inbox sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub msg_id: u64,
    pub session_id: String,
    pub sender: String,
    pub content: String,
    pub msg_type: i32,
    pub seq_id: i64,
    pub created_at: i64,
}

/// Intent-to-publish, written in the same transaction as its message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIntent {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    Pending,
    /// Published and leased until `next_retry_at`, waiting for the
    /// consumer to settle it.
    Inflight,
    Sent,
    Failed,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Inflight => "inflight",
            IntentStatus::Sent => "sent",
            IntentStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(IntentStatus::Pending),
            "inflight" => Ok(IntentStatus::Inflight),
            "sent" => Ok(IntentStatus::Sent),
            "failed" => Ok(IntentStatus::Failed),
            other => Err(StorageError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxIntent {
    pub id: i64,
    pub msg_id: u64,
    pub topic: String,
    pub payload: Vec<u8>,
    pub status: IntentStatus,
    pub retry_count: u32,
    pub next_retry_at: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Intent state after a lease or a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentOutcome {
    pub status: IntentStatus,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxRecord {
    pub owner: String,
    pub session_id: String,
    pub msg_id: u64,
    pub seq_id: i64,
    pub read_flag: bool,
}

/// Inbox record joined with its message, for the reconnect/sync path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxEntry {
    pub owner: String,
    pub session_id: String,
    pub msg_id: u64,
    pub seq_id: i64,
    pub read_flag: bool,
    pub sender: String,
    pub content: String,
    pub msg_type: i32,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub username: String,
    pub edge_node_id: String,
    pub remote_addr: String,
    pub last_seen: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeNodeRow {
    pub node_id: String,
    pub push_url: String,
    pub last_seen: i64,
}

/// Aggregate counts for diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineCounts {
    pub sessions: u64,
    pub messages: u64,
    pub inbox_records: u64,
    pub outbox_pending: u64,
    pub outbox_inflight: u64,
    pub outbox_sent: u64,
    pub outbox_failed: u64,
    pub presence_entries: u64,
}

// ============================================================================
// Store trait
// ============================================================================

/// Durable store operations used by the pipeline.
pub trait Store: Send + Sync {
    // Sessions and membership
    fn create_session(&self, id: &str, name: &str, kind: &str, now_ms: i64) -> Result<()>;
    fn read_session(&self, id: &str) -> Result<Option<SessionRow>>;
    fn add_member(&self, session_id: &str, username: &str, role: &str, now_ms: i64)
        -> Result<()>;
    fn remove_member(&self, session_id: &str, username: &str) -> Result<bool>;
    fn list_members(&self, session_id: &str) -> Result<Vec<MemberRow>>;
    /// Usernames of all members of a session, sorted.
    fn get_members(&self, session_id: &str) -> Result<Vec<String>>;
    fn is_member(&self, session_id: &str, username: &str) -> Result<bool>;

    /// Atomically advance and return the conversation sequence.
    fn next_seq(&self, session_id: &str) -> Result<i64>;

    // Messages and outbox
    /// Persist a message and its outbox intent in one transaction.
    /// Returns the intent id.
    fn save_message_with_intent(&self, message: &MessageRow, intent: &NewIntent) -> Result<i64>;
    fn read_message(&self, msg_id: u64) -> Result<Option<MessageRow>>;
    /// Pending intents, and inflight intents whose lease has expired, with
    /// `next_retry_at <= now_ms`, oldest first.
    fn due_intents(&self, now_ms: i64, limit: u32) -> Result<Vec<OutboxIntent>>;
    fn read_intent(&self, id: i64) -> Result<Option<OutboxIntent>>;
    /// Take a due intent for publishing: `-> inflight` until `lease_until`.
    /// Re-leasing an expired inflight intent counts as a retry and marks it
    /// failed once retry_count reaches `max_retry`. None if the intent is
    /// not due.
    fn lease_intent(
        &self,
        id: i64,
        now_ms: i64,
        lease_until: i64,
        max_retry: u32,
    ) -> Result<Option<IntentOutcome>>;
    /// Increment retry_count, reschedule as pending, and mark failed once
    /// retry_count reaches `max_retry`. None if the intent is settled.
    fn record_intent_failure(
        &self,
        id: i64,
        now_ms: i64,
        next_retry_at: i64,
        max_retry: u32,
        error: &str,
    ) -> Result<Option<IntentOutcome>>;
    /// Back to pending at `next_retry_at` without spending a retry.
    fn defer_intent(&self, id: i64, now_ms: i64, next_retry_at: i64, reason: &str)
        -> Result<bool>;
    /// `pending|inflight -> sent` for the intent carrying `msg_id`.
    fn settle_intent(&self, msg_id: u64, now_ms: i64) -> Result<bool>;
    /// `pending|inflight -> failed` for the intent carrying `msg_id`.
    fn fail_intent(&self, msg_id: u64, now_ms: i64, error: &str) -> Result<bool>;
    fn list_failed_intents(&self, limit: u32) -> Result<Vec<OutboxIntent>>;
    /// Operator action: `failed -> pending` with a fresh retry budget.
    fn requeue_intent(&self, id: i64, now_ms: i64) -> Result<bool>;

    // Inbox
    /// Idempotent upsert keyed by (owner, session_id, seq_id), one transaction.
    fn upsert_inbox_records(&self, records: &[InboxRecord], now_ms: i64) -> Result<usize>;
    fn list_inbox(
        &self,
        owner: &str,
        session_id: &str,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<InboxEntry>>;
    fn mark_read(&self, owner: &str, session_id: &str, up_to_seq: i64) -> Result<usize>;

    // Presence
    fn set_presence(&self, entry: &PresenceEntry) -> Result<()>;
    /// Extend an entry's TTL if it is still owned by `edge_node_id`.
    fn touch_presence(
        &self,
        username: &str,
        edge_node_id: &str,
        now_ms: i64,
        expires_at: i64,
    ) -> Result<bool>;
    /// Delete an entry only if it is still owned by `edge_node_id`.
    fn clear_presence(&self, username: &str, edge_node_id: &str) -> Result<bool>;
    /// Unexpired entries for the given users.
    fn lookup_presence(
        &self,
        usernames: &[String],
        now_ms: i64,
    ) -> Result<HashMap<String, PresenceEntry>>;
    fn purge_expired_presence(&self, now_ms: i64) -> Result<usize>;

    // Edge node membership
    fn register_edge_node(&self, node_id: &str, push_url: &str, now_ms: i64) -> Result<()>;
    fn live_edge_nodes(&self, since_ms: i64) -> Result<Vec<EdgeNodeRow>>;
    fn remove_edge_node(&self, node_id: &str) -> Result<bool>;

    fn pipeline_counts(&self) -> Result<PipelineCounts>;
}

// ============================================================================
// SQLite implementation
// ============================================================================

/// SQLite-backed storage.
/// Connection wrapped in Mutex for Send + Sync (rusqlite Connection is !Sync).
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

const INTENT_COLUMNS: &str = "id, msg_id, topic, payload, status, retry_count, next_retry_at,
                              last_error, created_at, updated_at";

fn map_intent(row: &rusqlite::Row) -> rusqlite::Result<(OutboxIntent, String)> {
    let status: String = row.get(4)?;
    Ok((
        OutboxIntent {
            id: row.get(0)?,
            msg_id: row.get::<_, i64>(1)? as u64,
            topic: row.get(2)?,
            payload: row.get(3)?,
            status: IntentStatus::Pending,
            retry_count: row.get::<_, i64>(5)? as u32,
            next_retry_at: row.get(6)?,
            last_error: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        },
        status,
    ))
}

fn finish_intent((mut intent, status): (OutboxIntent, String)) -> Result<OutboxIntent> {
    intent.status = IntentStatus::parse(&status)?;
    Ok(intent)
}

fn map_message(row: &rusqlite::Row) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        msg_id: row.get::<_, i64>(0)? as u64,
        session_id: row.get(1)?,
        sender: row.get(2)?,
        content: row.get(3)?,
        msg_type: row.get(4)?,
        seq_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn map_presence(row: &rusqlite::Row) -> rusqlite::Result<PresenceEntry> {
    Ok(PresenceEntry {
        username: row.get(0)?,
        edge_node_id: row.get(1)?,
        remote_addr: row.get(2)?,
        last_seen: row.get(3)?,
        expires_at: row.get(4)?,
    })
}

impl SqliteStorage {
    fn db(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Open (or create) the database at `db_path`.
    /// Sets WAL mode and busy_timeout for concurrent access by peer processes.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;

        let storage = Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        };

        storage.ensure_schema()?;
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.db()?;
        let table_exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get(0),
        )?;

        if !table_exists {
            conn.execute_batch(include_str!("schema_v1.sql"))?;
            tracing::info!(path = %self.db_path.display(), "storage: initialised schema v1");
        }

        let version: u32 = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(0);

        if version != SCHEMA_VERSION {
            return Err(StorageError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                found: version,
            });
        }

        Ok(())
    }
}

impl Store for SqliteStorage {
    fn create_session(&self, id: &str, name: &str, kind: &str, now_ms: i64) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO sessions (id, name, kind, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               kind = excluded.kind",
            params![id, name, kind, now_ms],
        )?;
        Ok(())
    }

    fn read_session(&self, id: &str) -> Result<Option<SessionRow>> {
        let conn = self.db()?;
        let result = conn
            .query_row(
                "SELECT id, name, kind, created_at FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok(SessionRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        kind: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    fn add_member(
        &self,
        session_id: &str,
        username: &str,
        role: &str,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO session_members (session_id, username, role, joined_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(session_id, username) DO UPDATE SET
               role = excluded.role",
            params![session_id, username, role, now_ms],
        )?;
        Ok(())
    }

    fn remove_member(&self, session_id: &str, username: &str) -> Result<bool> {
        let conn = self.db()?;
        let changes = conn.execute(
            "DELETE FROM session_members WHERE session_id = ?1 AND username = ?2",
            params![session_id, username],
        )?;
        Ok(changes > 0)
    }

    fn list_members(&self, session_id: &str) -> Result<Vec<MemberRow>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, username, role, joined_at
             FROM session_members WHERE session_id = ?1 ORDER BY username",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok(MemberRow {
                    session_id: row.get(0)?,
                    username: row.get(1)?,
                    role: row.get(2)?,
                    joined_at: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn get_members(&self, session_id: &str) -> Result<Vec<String>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare_cached(
            "SELECT username FROM session_members WHERE session_id = ?1 ORDER BY username",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn is_member(&self, session_id: &str, username: &str) -> Result<bool> {
        let conn = self.db()?;
        let found: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM session_members WHERE session_id = ?1 AND username = ?2",
            params![session_id, username],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    fn next_seq(&self, session_id: &str) -> Result<i64> {
        let conn = self.db()?;
        let seq: i64 = conn.query_row(
            "INSERT INTO session_seq (session_id, last_seq) VALUES (?1, 1)
             ON CONFLICT(session_id) DO UPDATE SET last_seq = last_seq + 1
             RETURNING last_seq",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(seq)
    }

    fn save_message_with_intent(&self, message: &MessageRow, intent: &NewIntent) -> Result<i64> {
        let mut conn = self.db()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO messages (msg_id, session_id, sender, content, msg_type, seq_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.msg_id as i64,
                message.session_id,
                message.sender,
                message.content,
                message.msg_type,
                message.seq_id,
                message.created_at,
            ],
        )?;
        tx.execute(
            "INSERT INTO outbox (msg_id, topic, payload, status, retry_count, next_retry_at,
                                 created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4, ?4)",
            params![
                message.msg_id as i64,
                intent.topic,
                intent.payload,
                message.created_at,
            ],
        )?;
        let intent_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(intent_id)
    }

    fn read_message(&self, msg_id: u64) -> Result<Option<MessageRow>> {
        let conn = self.db()?;
        let result = conn
            .query_row(
                "SELECT msg_id, session_id, sender, content, msg_type, seq_id, created_at
                 FROM messages WHERE msg_id = ?1",
                params![msg_id as i64],
                map_message,
            )
            .optional()?;
        Ok(result)
    }

    fn due_intents(&self, now_ms: i64, limit: u32) -> Result<Vec<OutboxIntent>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {INTENT_COLUMNS} FROM outbox
             WHERE status IN ('pending', 'inflight') AND next_retry_at <= ?1
             ORDER BY next_retry_at ASC, id ASC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![now_ms, limit], map_intent)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(finish_intent).collect()
    }

    fn read_intent(&self, id: i64) -> Result<Option<OutboxIntent>> {
        let conn = self.db()?;
        let row = conn
            .query_row(
                &format!("SELECT {INTENT_COLUMNS} FROM outbox WHERE id = ?1"),
                params![id],
                map_intent,
            )
            .optional()?;
        row.map(finish_intent).transpose()
    }

    fn lease_intent(
        &self,
        id: i64,
        now_ms: i64,
        lease_until: i64,
        max_retry: u32,
    ) -> Result<Option<IntentOutcome>> {
        let conn = self.db()?;
        // SET expressions all see the row as it was before the update.
        let row = conn
            .query_row(
                "UPDATE outbox SET
                   retry_count = retry_count + (status = 'inflight'),
                   status = CASE
                     WHEN status = 'inflight' AND retry_count + 1 >= ?4 THEN 'failed'
                     ELSE 'inflight' END,
                   last_error = CASE
                     WHEN status = 'inflight' THEN 'delivery not acknowledged before lease expiry'
                     ELSE last_error END,
                   next_retry_at = ?3,
                   updated_at = ?2
                 WHERE id = ?1 AND status IN ('pending', 'inflight') AND next_retry_at <= ?2
                 RETURNING status, retry_count",
                params![id, now_ms, lease_until, max_retry],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        row.map(|(status, retry_count)| {
            Ok(IntentOutcome {
                status: IntentStatus::parse(&status)?,
                retry_count: retry_count as u32,
            })
        })
        .transpose()
    }

    fn record_intent_failure(
        &self,
        id: i64,
        now_ms: i64,
        next_retry_at: i64,
        max_retry: u32,
        error: &str,
    ) -> Result<Option<IntentOutcome>> {
        let conn = self.db()?;
        let row = conn
            .query_row(
                "UPDATE outbox SET
                   retry_count = retry_count + 1,
                   status = CASE WHEN retry_count + 1 >= ?3 THEN 'failed' ELSE 'pending' END,
                   next_retry_at = ?2,
                   last_error = ?4,
                   updated_at = ?5
                 WHERE id = ?1 AND status IN ('pending', 'inflight')
                 RETURNING status, retry_count",
                params![id, next_retry_at, max_retry, error, now_ms],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        match row {
            Some((status, retry_count)) => Ok(Some(IntentOutcome {
                status: IntentStatus::parse(&status)?,
                retry_count: retry_count as u32,
            })),
            None => Ok(None),
        }
    }

    fn defer_intent(
        &self,
        id: i64,
        now_ms: i64,
        next_retry_at: i64,
        reason: &str,
    ) -> Result<bool> {
        let conn = self.db()?;
        let changes = conn.execute(
            "UPDATE outbox SET status = 'pending', next_retry_at = ?2, last_error = ?3,
                               updated_at = ?4
             WHERE id = ?1 AND status IN ('pending', 'inflight')",
            params![id, next_retry_at, reason, now_ms],
        )?;
        Ok(changes > 0)
    }

    fn settle_intent(&self, msg_id: u64, now_ms: i64) -> Result<bool> {
        let conn = self.db()?;
        let changes = conn.execute(
            "UPDATE outbox SET status = 'sent', last_error = NULL, updated_at = ?2
             WHERE msg_id = ?1 AND status IN ('pending', 'inflight')",
            params![msg_id as i64, now_ms],
        )?;
        Ok(changes > 0)
    }

    fn fail_intent(&self, msg_id: u64, now_ms: i64, error: &str) -> Result<bool> {
        let conn = self.db()?;
        let changes = conn.execute(
            "UPDATE outbox SET status = 'failed', last_error = ?3, updated_at = ?2
             WHERE msg_id = ?1 AND status IN ('pending', 'inflight')",
            params![msg_id as i64, now_ms, error],
        )?;
        Ok(changes > 0)
    }

    fn list_failed_intents(&self, limit: u32) -> Result<Vec<OutboxIntent>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INTENT_COLUMNS} FROM outbox
             WHERE status = 'failed'
             ORDER BY updated_at DESC
             LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit], map_intent)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(finish_intent).collect()
    }

    fn requeue_intent(&self, id: i64, now_ms: i64) -> Result<bool> {
        let conn = self.db()?;
        let changes = conn.execute(
            "UPDATE outbox SET status = 'pending', retry_count = 0, next_retry_at = ?2,
                               updated_at = ?2
             WHERE id = ?1 AND status = 'failed'",
            params![id, now_ms],
        )?;
        Ok(changes > 0)
    }

    fn upsert_inbox_records(&self, records: &[InboxRecord], now_ms: i64) -> Result<usize> {
        let mut conn = self.db()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO inbox (owner, session_id, msg_id, seq_id, read_flag, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(owner, session_id, seq_id) DO UPDATE SET
                   msg_id = excluded.msg_id",
            )?;
            for record in records {
                stmt.execute(params![
                    record.owner,
                    record.session_id,
                    record.msg_id as i64,
                    record.seq_id,
                    record.read_flag,
                    now_ms,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    fn list_inbox(
        &self,
        owner: &str,
        session_id: &str,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<InboxEntry>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT i.owner, i.session_id, i.msg_id, i.seq_id, i.read_flag,
                    m.sender, m.content, m.msg_type, m.created_at
             FROM inbox i JOIN messages m ON m.msg_id = i.msg_id
             WHERE i.owner = ?1 AND i.session_id = ?2 AND i.seq_id > ?3
             ORDER BY i.seq_id ASC
             LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(params![owner, session_id, after_seq, limit], |row| {
                Ok(InboxEntry {
                    owner: row.get(0)?,
                    session_id: row.get(1)?,
                    msg_id: row.get::<_, i64>(2)? as u64,
                    seq_id: row.get(3)?,
                    read_flag: row.get(4)?,
                    sender: row.get(5)?,
                    content: row.get(6)?,
                    msg_type: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn mark_read(&self, owner: &str, session_id: &str, up_to_seq: i64) -> Result<usize> {
        let conn = self.db()?;
        let changes = conn.execute(
            "UPDATE inbox SET read_flag = 1
             WHERE owner = ?1 AND session_id = ?2 AND seq_id <= ?3 AND read_flag = 0",
            params![owner, session_id, up_to_seq],
        )?;
        Ok(changes)
    }

    fn set_presence(&self, entry: &PresenceEntry) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO presence (key, username, edge_node_id, remote_addr, last_seen, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(key) DO UPDATE SET
               edge_node_id = excluded.edge_node_id,
               remote_addr = excluded.remote_addr,
               last_seen = excluded.last_seen,
               expires_at = excluded.expires_at",
            params![
                courier_presence_key(&entry.username),
                entry.username,
                entry.edge_node_id,
                entry.remote_addr,
                entry.last_seen,
                entry.expires_at,
            ],
        )?;
        Ok(())
    }

    fn touch_presence(
        &self,
        username: &str,
        edge_node_id: &str,
        now_ms: i64,
        expires_at: i64,
    ) -> Result<bool> {
        let conn = self.db()?;
        let changes = conn.execute(
            "UPDATE presence SET last_seen = ?3, expires_at = ?4
             WHERE key = ?1 AND edge_node_id = ?2",
            params![courier_presence_key(username), edge_node_id, now_ms, expires_at],
        )?;
        Ok(changes > 0)
    }

    fn clear_presence(&self, username: &str, edge_node_id: &str) -> Result<bool> {
        let conn = self.db()?;
        let changes = conn.execute(
            "DELETE FROM presence WHERE key = ?1 AND edge_node_id = ?2",
            params![courier_presence_key(username), edge_node_id],
        )?;
        Ok(changes > 0)
    }

    fn lookup_presence(
        &self,
        usernames: &[String],
        now_ms: i64,
    ) -> Result<HashMap<String, PresenceEntry>> {
        if usernames.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = (0..usernames.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT username, edge_node_id, remote_addr, last_seen, expires_at
             FROM presence
             WHERE expires_at > ?1 AND key IN ({placeholders})"
        );

        let keys: Vec<String> = usernames.iter().map(|u| courier_presence_key(u)).collect();
        let mut bound: Vec<rusqlite::types::Value> = Vec::with_capacity(keys.len() + 1);
        bound.push(now_ms.into());
        bound.extend(keys.into_iter().map(rusqlite::types::Value::from));

        let conn = self.db()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(bound), map_presence)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|entry| (entry.username.clone(), entry))
            .collect())
    }

    fn purge_expired_presence(&self, now_ms: i64) -> Result<usize> {
        let conn = self.db()?;
        let changes = conn.execute(
            "DELETE FROM presence WHERE expires_at <= ?1",
            params![now_ms],
        )?;
        Ok(changes)
    }

    fn register_edge_node(&self, node_id: &str, push_url: &str, now_ms: i64) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO edge_nodes (node_id, push_url, last_seen)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(node_id) DO UPDATE SET
               push_url = excluded.push_url,
               last_seen = excluded.last_seen",
            params![node_id, push_url, now_ms],
        )?;
        Ok(())
    }

    fn live_edge_nodes(&self, since_ms: i64) -> Result<Vec<EdgeNodeRow>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT node_id, push_url, last_seen FROM edge_nodes
             WHERE last_seen >= ?1 ORDER BY node_id",
        )?;
        let rows = stmt
            .query_map(params![since_ms], |row| {
                Ok(EdgeNodeRow {
                    node_id: row.get(0)?,
                    push_url: row.get(1)?,
                    last_seen: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn remove_edge_node(&self, node_id: &str) -> Result<bool> {
        let conn = self.db()?;
        let changes = conn.execute("DELETE FROM edge_nodes WHERE node_id = ?1", params![node_id])?;
        Ok(changes > 0)
    }

    fn pipeline_counts(&self) -> Result<PipelineCounts> {
        let conn = self.db()?;

        let count = |sql: &str| -> Result<u64> {
            Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as u64)
        };

        Ok(PipelineCounts {
            sessions: count("SELECT COUNT(*) FROM sessions")?,
            messages: count("SELECT COUNT(*) FROM messages")?,
            inbox_records: count("SELECT COUNT(*) FROM inbox")?,
            outbox_pending: count("SELECT COUNT(*) FROM outbox WHERE status = 'pending'")?,
            outbox_inflight: count("SELECT COUNT(*) FROM outbox WHERE status = 'inflight'")?,
            outbox_sent: count("SELECT COUNT(*) FROM outbox WHERE status = 'sent'")?,
            outbox_failed: count("SELECT COUNT(*) FROM outbox WHERE status = 'failed'")?,
            presence_entries: count("SELECT COUNT(*) FROM presence")?,
        })
    }
}

/// `online:{username}`; mirrors `courier_protocol::presence_key` without
/// pulling the protocol crate into storage.
fn courier_presence_key(username: &str) -> String {
    format!("online:{username}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn test_db() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = SqliteStorage::open(&db_path).unwrap();
        (dir, storage)
    }

    fn message(msg_id: u64, session: &str, seq_id: i64) -> MessageRow {
        MessageRow {
            msg_id,
            session_id: session.into(),
            sender: "alice".into(),
            content: format!("msg {msg_id}"),
            msg_type: 1,
            seq_id,
            created_at: 1_000,
        }
    }

    fn intent() -> NewIntent {
        NewIntent {
            topic: "push.event".into(),
            payload: b"{}".to_vec(),
        }
    }

    fn seeded_session(storage: &SqliteStorage, id: &str, members: &[&str]) {
        storage.create_session(id, "Team", "group", 0).unwrap();
        for m in members {
            storage.add_member(id, m, "member", 0).unwrap();
        }
    }

    #[test]
    fn test_reopen_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("reopen.db");
        {
            let storage = SqliteStorage::open(&db_path).unwrap();
            storage.create_session("s1", "One", "group", 0).unwrap();
        }
        let storage = SqliteStorage::open(&db_path).unwrap();
        assert_eq!(storage.read_session("s1").unwrap().unwrap().name, "One");
    }

    #[test]
    fn test_sessions_and_members() {
        let (_dir, storage) = test_db();
        seeded_session(&storage, "team-1", &["carol", "alice", "bob"]);

        assert_eq!(
            storage.get_members("team-1").unwrap(),
            vec!["alice", "bob", "carol"]
        );
        assert!(storage.is_member("team-1", "bob").unwrap());
        assert!(!storage.is_member("team-1", "mallory").unwrap());

        // Upsert: change role
        storage.add_member("team-1", "alice", "owner", 5).unwrap();
        let members = storage.list_members("team-1").unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(members[0].role, "owner");

        assert!(storage.remove_member("team-1", "bob").unwrap());
        assert!(!storage.remove_member("team-1", "bob").unwrap()); // already removed
        assert_eq!(storage.get_members("team-1").unwrap().len(), 2);
    }

    #[test]
    fn test_next_seq_strictly_increasing_per_session() {
        let (_dir, storage) = test_db();
        let mut last = 0;
        for _ in 0..50 {
            let seq = storage.next_seq("s-a").unwrap();
            assert!(seq > last);
            last = seq;
        }
        // Independent counter per session
        assert_eq!(storage.next_seq("s-b").unwrap(), 1);
        assert_eq!(storage.next_seq("s-a").unwrap(), 51);
    }

    #[test]
    fn test_next_seq_distinct_across_handles_and_threads() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("shared.db");
        let a = Arc::new(SqliteStorage::open(&db_path).unwrap());
        let b = Arc::new(SqliteStorage::open(&db_path).unwrap());

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = if i % 2 == 0 { a.clone() } else { b.clone() };
            handles.push(std::thread::spawn(move || {
                (0..25)
                    .map(|_| store.next_seq("hot-session").unwrap())
                    .collect::<Vec<_>>()
            }));
        }

        let all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let unique: HashSet<i64> = all.iter().copied().collect();
        assert_eq!(all.len(), 200);
        assert_eq!(unique.len(), 200);
        assert_eq!(*unique.iter().max().unwrap(), 200);
    }

    #[test]
    fn test_save_message_with_intent() {
        let (_dir, storage) = test_db();
        let id = storage
            .save_message_with_intent(&message(10, "s1", 1), &intent())
            .unwrap();

        let msg = storage.read_message(10).unwrap().unwrap();
        assert_eq!(msg.seq_id, 1);

        let stored = storage.read_intent(id).unwrap().unwrap();
        assert_eq!(stored.msg_id, 10);
        assert_eq!(stored.status, IntentStatus::Pending);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.next_retry_at, 1_000);
    }

    #[test]
    fn test_save_message_with_intent_is_atomic() {
        let (_dir, storage) = test_db();
        storage
            .save_message_with_intent(&message(10, "s1", 1), &intent())
            .unwrap();

        // Same (session, seq) -> message insert fails, no intent is left behind.
        let dup = storage.save_message_with_intent(&message(11, "s1", 1), &intent());
        assert!(dup.is_err());
        assert!(storage.read_message(11).unwrap().is_none());
        assert_eq!(storage.pipeline_counts().unwrap().outbox_pending, 1);

        // Same msg_id -> rejected as a whole.
        let dup = storage.save_message_with_intent(&message(10, "s1", 2), &intent());
        assert!(dup.is_err());
        let counts = storage.pipeline_counts().unwrap();
        assert_eq!(counts.messages, 1);
        assert_eq!(counts.outbox_pending, 1);
    }

    #[test]
    fn test_due_intents_filter_and_order() {
        let (_dir, storage) = test_db();
        let first = storage
            .save_message_with_intent(&message(1, "s1", 1), &intent())
            .unwrap();
        let second = storage
            .save_message_with_intent(&message(2, "s1", 2), &intent())
            .unwrap();
        let third = storage
            .save_message_with_intent(&message(3, "s1", 3), &intent())
            .unwrap();

        // Push `second` into the future
        storage
            .record_intent_failure(second, 1_000, 50_000, 5, "bus down")
            .unwrap();
        // Retire `third`
        assert!(storage.settle_intent(3, 1_000).unwrap());

        let due = storage.due_intents(2_000, 10).unwrap();
        assert_eq!(due.iter().map(|i| i.id).collect::<Vec<_>>(), vec![first]);

        let due = storage.due_intents(60_000, 10).unwrap();
        assert_eq!(
            due.iter().map(|i| i.id).collect::<Vec<_>>(),
            vec![first, second]
        );

        let due = storage.due_intents(60_000, 1).unwrap();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn test_settle_exactly_once() {
        let (_dir, storage) = test_db();
        let id = storage
            .save_message_with_intent(&message(1, "s1", 1), &intent())
            .unwrap();
        storage.lease_intent(id, 1_000, 31_000, 5).unwrap().unwrap();

        assert!(storage.settle_intent(1, 2_000).unwrap());
        assert!(!storage.settle_intent(1, 3_000).unwrap());
        assert_eq!(
            storage.read_intent(id).unwrap().unwrap().status,
            IntentStatus::Sent
        );
        // A sent intent cannot be failed afterwards
        assert!(storage
            .record_intent_failure(id, 4_000, 5_000, 5, "late")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_failure_reaches_failed_at_max_retry() {
        let (_dir, storage) = test_db();
        let id = storage
            .save_message_with_intent(&message(1, "s1", 1), &intent())
            .unwrap();

        for expected in 1..3u32 {
            let outcome = storage
                .record_intent_failure(id, 0, 0, 3, "timeout")
                .unwrap()
                .unwrap();
            assert_eq!(outcome.retry_count, expected);
            assert_eq!(outcome.status, IntentStatus::Pending);
        }

        let outcome = storage
            .record_intent_failure(id, 0, 0, 3, "timeout")
            .unwrap()
            .unwrap();
        assert_eq!(outcome.retry_count, 3);
        assert_eq!(outcome.status, IntentStatus::Failed);

        // Terminal: excluded from sweeps, further failures are no-ops
        assert!(storage.due_intents(i64::MAX, 10).unwrap().is_empty());
        assert!(storage
            .record_intent_failure(id, 0, 0, 3, "again")
            .unwrap()
            .is_none());

        let failed = storage.list_failed_intents(10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_lease_hides_intent_until_expiry() {
        let (_dir, storage) = test_db();
        let id = storage
            .save_message_with_intent(&message(1, "s1", 1), &intent())
            .unwrap();

        let leased = storage.lease_intent(id, 1_000, 31_000, 3).unwrap().unwrap();
        assert_eq!(leased.status, IntentStatus::Inflight);
        assert_eq!(leased.retry_count, 0);
        // A second sweep inside the lease cannot take it again
        assert!(storage.lease_intent(id, 2_000, 32_000, 3).unwrap().is_none());
        assert!(storage.due_intents(30_000, 10).unwrap().is_empty());

        // Expired without a settle: due again, and the re-lease costs a retry
        let due = storage.due_intents(31_000, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].status, IntentStatus::Inflight);
        let again = storage.lease_intent(id, 31_000, 61_000, 3).unwrap().unwrap();
        assert_eq!(again.status, IntentStatus::Inflight);
        assert_eq!(again.retry_count, 1);

        storage.lease_intent(id, 61_000, 91_000, 3).unwrap().unwrap();
        let exhausted = storage.lease_intent(id, 91_000, 121_000, 3).unwrap().unwrap();
        assert_eq!(exhausted.status, IntentStatus::Failed);
        assert_eq!(exhausted.retry_count, 3);
        let failed = storage.list_failed_intents(10).unwrap();
        assert!(failed[0].last_error.as_deref().unwrap().contains("not acknowledged"));
    }

    #[test]
    fn test_defer_keeps_retry_budget() {
        let (_dir, storage) = test_db();
        let id = storage
            .save_message_with_intent(&message(1, "s1", 1), &intent())
            .unwrap();
        storage.lease_intent(id, 1_000, 31_000, 3).unwrap().unwrap();

        assert!(storage.defer_intent(id, 1_000, 1_050, "queue full").unwrap());
        let deferred = storage.read_intent(id).unwrap().unwrap();
        assert_eq!(deferred.status, IntentStatus::Pending);
        assert_eq!(deferred.retry_count, 0);
        assert_eq!(deferred.next_retry_at, 1_050);
        assert_eq!(storage.due_intents(1_050, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_fail_intent_by_msg_id_then_requeue() {
        let (_dir, storage) = test_db();
        let id = storage
            .save_message_with_intent(&message(7, "s1", 1), &intent())
            .unwrap();
        storage.lease_intent(id, 1_000, 31_000, 3).unwrap().unwrap();

        assert!(storage.fail_intent(7, 2_000, "redeliveries exhausted").unwrap());
        assert!(!storage.settle_intent(7, 2_500).unwrap());
        assert!(storage.requeue_intent(id, 3_000).unwrap());
        assert_eq!(storage.due_intents(3_000, 10).unwrap()[0].id, id);
    }

    #[test]
    fn test_requeue_failed_intent() {
        let (_dir, storage) = test_db();
        let id = storage
            .save_message_with_intent(&message(1, "s1", 1), &intent())
            .unwrap();
        storage
            .record_intent_failure(id, 0, 0, 1, "bus down")
            .unwrap();

        // Only failed intents can be requeued
        assert!(storage.requeue_intent(id, 9_000).unwrap());
        assert!(!storage.requeue_intent(id, 9_000).unwrap());

        let requeued = storage.read_intent(id).unwrap().unwrap();
        assert_eq!(requeued.status, IntentStatus::Pending);
        assert_eq!(requeued.retry_count, 0);
        assert_eq!(storage.due_intents(9_000, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_inbox_upsert_idempotent() {
        let (_dir, storage) = test_db();
        storage
            .save_message_with_intent(&message(77, "s1", 4), &intent())
            .unwrap();
        let records: Vec<InboxRecord> = ["alice", "bob"]
            .iter()
            .map(|owner| InboxRecord {
                owner: owner.to_string(),
                session_id: "s1".into(),
                msg_id: 77,
                seq_id: 4,
                read_flag: false,
            })
            .collect();

        storage.upsert_inbox_records(&records, 1).unwrap();
        storage.upsert_inbox_records(&records, 2).unwrap();

        assert_eq!(storage.pipeline_counts().unwrap().inbox_records, 2);
        let bob = storage.list_inbox("bob", "s1", 0, 10).unwrap();
        assert_eq!(bob.len(), 1);
        assert_eq!(bob[0].msg_id, 77);
        assert_eq!(bob[0].content, "msg 77");
    }

    #[test]
    fn test_inbox_sync_and_mark_read() {
        let (_dir, storage) = test_db();
        for seq in 1..=5 {
            storage
                .save_message_with_intent(&message(100 + seq as u64, "s1", seq), &intent())
                .unwrap();
            storage
                .upsert_inbox_records(
                    &[InboxRecord {
                        owner: "bob".into(),
                        session_id: "s1".into(),
                        msg_id: 100 + seq as u64,
                        seq_id: seq,
                        read_flag: false,
                    }],
                    0,
                )
                .unwrap();
        }

        let after_two = storage.list_inbox("bob", "s1", 2, 10).unwrap();
        assert_eq!(
            after_two.iter().map(|e| e.seq_id).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );

        assert_eq!(storage.mark_read("bob", "s1", 3).unwrap(), 3);
        assert_eq!(storage.mark_read("bob", "s1", 3).unwrap(), 0);
        let all = storage.list_inbox("bob", "s1", 0, 10).unwrap();
        assert!(all[2].read_flag);
        assert!(!all[3].read_flag);
    }

    #[test]
    fn test_presence_ttl_and_ownership() {
        let (_dir, storage) = test_db();
        storage
            .set_presence(&PresenceEntry {
                username: "bob".into(),
                edge_node_id: "edge-1".into(),
                remote_addr: "10.0.0.5:5000".into(),
                last_seen: 1_000,
                expires_at: 5_000,
            })
            .unwrap();

        let users = vec!["bob".to_string(), "carol".to_string()];
        let found = storage.lookup_presence(&users, 2_000).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["bob"].edge_node_id, "edge-1");

        // Expired entries are invisible
        assert!(storage.lookup_presence(&users, 5_000).unwrap().is_empty());

        // Another node cannot refresh or clear bob's entry
        assert!(!storage.touch_presence("bob", "edge-2", 3_000, 9_000).unwrap());
        assert!(!storage.clear_presence("bob", "edge-2").unwrap());

        assert!(storage.touch_presence("bob", "edge-1", 3_000, 9_000).unwrap());
        assert_eq!(storage.lookup_presence(&users, 6_000).unwrap().len(), 1);

        assert_eq!(storage.purge_expired_presence(10_000).unwrap(), 1);
        assert!(!storage.clear_presence("bob", "edge-1").unwrap());
    }

    #[test]
    fn test_presence_moves_between_nodes() {
        let (_dir, storage) = test_db();
        let mut entry = PresenceEntry {
            username: "bob".into(),
            edge_node_id: "edge-1".into(),
            remote_addr: "a".into(),
            last_seen: 0,
            expires_at: 10_000,
        };
        storage.set_presence(&entry).unwrap();
        entry.edge_node_id = "edge-2".into();
        storage.set_presence(&entry).unwrap();

        // Stale disconnect from edge-1 must not remove the edge-2 entry
        assert!(!storage.clear_presence("bob", "edge-1").unwrap());
        let found = storage.lookup_presence(&["bob".to_string()], 1).unwrap();
        assert_eq!(found["bob"].edge_node_id, "edge-2");
    }

    #[test]
    fn test_edge_node_registry() {
        let (_dir, storage) = test_db();
        storage
            .register_edge_node("edge-1", "http://10.0.0.1:9480", 1_000)
            .unwrap();
        storage
            .register_edge_node("edge-2", "http://10.0.0.2:9480", 5_000)
            .unwrap();

        let live = storage.live_edge_nodes(2_000).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].node_id, "edge-2");

        // Heartbeat brings edge-1 back
        storage
            .register_edge_node("edge-1", "http://10.0.0.1:9480", 6_000)
            .unwrap();
        assert_eq!(storage.live_edge_nodes(2_000).unwrap().len(), 2);

        assert!(storage.remove_edge_node("edge-2").unwrap());
        assert!(!storage.remove_edge_node("edge-2").unwrap());
    }
}
