//! Durable key-value storage for room state.
//!
//! Every room owns a string-keyed store with per-key last-write-wins
//! semantics. The coordinator is the only writer; records outlive any
//! single channel and are deleted on explicit leave, sweep eviction, or
//! meeting end.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing store rejected or failed the operation.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// The key scheme for per-room storage.
pub mod keys {
    /// The externally issued room code, captured from the first connection.
    pub const ROOM_CODE: &str = "roomCode";

    /// The lazily generated meeting id.
    pub const MEETING_ID: &str = "meetingId";

    /// The highest occupancy reported to the lifecycle service so far.
    pub const PEAK_USERS: &str = "peakUsers";

    /// Prefix for persisted user records; listing it yields the roster.
    pub const SESSION_PREFIX: &str = "session-";

    /// Prefix for last-seen heartbeat timestamps.
    pub const HEARTBEAT_PREFIX: &str = "heartbeat-";

    /// Key of the user record for a channel.
    #[must_use]
    pub fn session(channel_id: &str) -> String {
        format!("{SESSION_PREFIX}{channel_id}")
    }

    /// Key of the heartbeat timestamp for a channel.
    #[must_use]
    pub fn heartbeat(channel_id: &str) -> String {
        format!("{HEARTBEAT_PREFIX}{channel_id}")
    }
}

/// String-keyed durable storage for one room.
///
/// Values are JSON; callers serialize their own record types. Last write
/// wins per key.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError>;

    /// Delete the value stored under `key`.
    ///
    /// Returns `true` if a value existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Delete every key in the store.
    async fn delete_all(&self) -> Result<(), StorageError>;

    /// List every `(key, value)` pair whose key starts with `prefix`.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError>;
}

/// In-memory storage backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, Value>,
}

impl MemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn delete_all(&self) -> Result<(), StorageError> {
        self.entries.clear();
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError> {
        let mut pairs: Vec<(String, Value)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        // Stable ordering for roster listings
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStorage::new();

        store.put("roomCode", json!("abc123")).await.unwrap();
        assert_eq!(store.get("roomCode").await.unwrap(), Some(json!("abc123")));

        assert!(store.delete("roomCode").await.unwrap());
        assert!(!store.delete("roomCode").await.unwrap());
        assert_eq!(store.get("roomCode").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let store = MemoryStorage::new();

        store.put("meetingId", json!("m-1")).await.unwrap();
        store.put("meetingId", json!("m-2")).await.unwrap();
        assert_eq!(store.get("meetingId").await.unwrap(), Some(json!("m-2")));
    }

    #[tokio::test]
    async fn test_list_prefix_yields_roster() {
        let store = MemoryStorage::new();

        store
            .put(&keys::session("c2"), json!({"id": "c2"}))
            .await
            .unwrap();
        store
            .put(&keys::session("c1"), json!({"id": "c1"}))
            .await
            .unwrap();
        store.put(&keys::heartbeat("c1"), json!(42)).await.unwrap();

        let sessions = store.list_prefix(keys::SESSION_PREFIX).await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].0, "session-c1");
        assert_eq!(sessions[1].0, "session-c2");
    }

    #[tokio::test]
    async fn test_delete_all() {
        let store = MemoryStorage::new();

        store.put("roomCode", json!("abc123")).await.unwrap();
        store.put(&keys::session("c1"), json!({})).await.unwrap();
        store.delete_all().await.unwrap();
        assert!(store.is_empty());
    }
}
