//! Presence directory -- which edge node currently serves each user.
//!
//! Entries are keyed `online:{username}` and expire after the TTL unless
//! refreshed by a heartbeat. A routing hint only: a stale entry costs one
//! wasted push, and offline users catch up from their inbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use courier_storage::{PresenceEntry, Store, StorageError};
use tokio::sync::broadcast;

pub struct PresenceDirectory {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl PresenceDirectory {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn expiry(&self, now_ms: i64) -> i64 {
        now_ms + self.ttl.as_millis() as i64
    }

    /// Record `username` as connected to `edge_node_id`. Replaces any
    /// entry held by another node.
    pub fn online(
        &self,
        username: &str,
        edge_node_id: &str,
        remote_addr: &str,
    ) -> Result<(), StorageError> {
        let now = courier_protocol::now_ms();
        self.store.set_presence(&PresenceEntry {
            username: username.to_string(),
            edge_node_id: edge_node_id.to_string(),
            remote_addr: remote_addr.to_string(),
            last_seen: now,
            expires_at: self.expiry(now),
        })?;
        tracing::debug!(username, node = edge_node_id, "presence: online");
        Ok(())
    }

    /// Extend the TTL. False if the entry moved to another node or expired.
    pub fn refresh(&self, username: &str, edge_node_id: &str) -> Result<bool, StorageError> {
        let now = courier_protocol::now_ms();
        self.store
            .touch_presence(username, edge_node_id, now, self.expiry(now))
    }

    /// Re-register a live connection whose entry expired or was swept.
    /// Leaves an unexpired entry owned by another node in place; returns
    /// whether the entry was claimed.
    pub fn reclaim(
        &self,
        username: &str,
        edge_node_id: &str,
        remote_addr: &str,
    ) -> Result<bool, StorageError> {
        let current = self
            .store
            .lookup_presence(&[username.to_string()], courier_protocol::now_ms())?;
        if let Some(entry) = current.get(username) {
            if entry.edge_node_id != edge_node_id {
                tracing::debug!(username, owner = %entry.edge_node_id, "presence: held elsewhere, not reclaimed");
                return Ok(false);
            }
        }
        self.online(username, edge_node_id, remote_addr)?;
        Ok(true)
    }

    /// Remove the entry if `edge_node_id` still owns it.
    pub fn offline(&self, username: &str, edge_node_id: &str) -> Result<bool, StorageError> {
        let removed = self.store.clear_presence(username, edge_node_id)?;
        tracing::debug!(username, node = edge_node_id, removed, "presence: offline");
        Ok(removed)
    }

    /// username -> edge node id, for users with an unexpired entry.
    pub fn lookup(&self, usernames: &[String]) -> Result<HashMap<String, String>, StorageError> {
        let entries = self
            .store
            .lookup_presence(usernames, courier_protocol::now_ms())?;
        Ok(entries
            .into_iter()
            .map(|(username, entry)| (username, entry.edge_node_id))
            .collect())
    }

    pub fn sweep(&self, now_ms: i64) -> Result<usize, StorageError> {
        self.store.purge_expired_presence(now_ms)
    }
}

/// Delete expired presence rows every `interval`.
pub async fn run_presence_sweeper(
    presence: Arc<PresenceDirectory>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => {
                match presence.sweep(courier_protocol::now_ms()) {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "presence: expired entries purged"),
                    Err(e) => tracing::warn!(error = %e, "presence: sweep failed"),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("presence sweeper shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_storage::SqliteStorage;

    fn directory(ttl: Duration) -> (tempfile::TempDir, PresenceDirectory) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStorage::open(&dir.path().join("p.db")).unwrap());
        (dir, PresenceDirectory::new(store, ttl))
    }

    #[test]
    fn test_online_lookup_offline() {
        let (_dir, presence) = directory(Duration::from_secs(60));
        presence.online("bob", "edge-1", "10.1.1.1:4000").unwrap();
        presence.online("carol", "edge-2", "10.1.1.2:4000").unwrap();

        let found = presence
            .lookup(&["bob".into(), "carol".into(), "dave".into()])
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["bob"], "edge-1");
        assert_eq!(found["carol"], "edge-2");

        assert!(presence.offline("bob", "edge-1").unwrap());
        assert!(presence.lookup(&["bob".into()]).unwrap().is_empty());
    }

    #[test]
    fn test_reconnect_elsewhere_survives_stale_offline() {
        let (_dir, presence) = directory(Duration::from_secs(60));
        presence.online("bob", "edge-1", "a").unwrap();
        presence.online("bob", "edge-2", "b").unwrap();

        assert!(!presence.offline("bob", "edge-1").unwrap());
        assert!(!presence.refresh("bob", "edge-1").unwrap());
        assert!(presence.refresh("bob", "edge-2").unwrap());
        assert_eq!(presence.lookup(&["bob".into()]).unwrap()["bob"], "edge-2");
    }

    #[test]
    fn test_reclaim_keeps_other_nodes_entry() {
        let (_dir, presence) = directory(Duration::from_secs(60));
        // Swept while edge-1 still holds the connection.
        assert!(presence.reclaim("bob", "edge-1", "10.1.1.1:4000").unwrap());
        assert_eq!(presence.lookup(&["bob".into()]).unwrap()["bob"], "edge-1");

        presence.online("bob", "edge-2", "10.1.1.2:4000").unwrap();
        assert!(!presence.reclaim("bob", "edge-1", "10.1.1.1:4000").unwrap());
        let entries = presence
            .store
            .lookup_presence(&["bob".into()], courier_protocol::now_ms())
            .unwrap();
        assert_eq!(entries["bob"].edge_node_id, "edge-2");
        assert_eq!(entries["bob"].remote_addr, "10.1.1.2:4000");
    }

    #[test]
    fn test_expired_entries_ignored_and_swept() {
        let (_dir, presence) = directory(Duration::from_millis(0));
        presence.online("bob", "edge-1", "a").unwrap();
        assert!(presence.lookup(&["bob".into()]).unwrap().is_empty());
        assert_eq!(presence.sweep(courier_protocol::now_ms() + 1).unwrap(), 1);
    }
}
