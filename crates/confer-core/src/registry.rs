//! Room registry.
//!
//! Maps room codes to their coordinator instances. Rooms are fully
//! independent: each gets its own storage and coordinator, constructed on
//! first access and dropped once idle.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::coordinator::{CoordinatorConfig, RoomCoordinator};
use crate::lifecycle::LifecycleApi;
use crate::storage::{MemoryStorage, Storage};

/// Builds the storage backing a new room.
pub type StorageFactory = Arc<dyn Fn(&str) -> Arc<dyn Storage> + Send + Sync>;

/// Registry of live room coordinators.
pub struct RoomRegistry {
    rooms: DashMap<String, Arc<RoomCoordinator>>,
    lifecycle: Arc<dyn LifecycleApi>,
    config: CoordinatorConfig,
    storage_factory: StorageFactory,
}

impl RoomRegistry {
    /// Create a registry with in-memory storage per room.
    #[must_use]
    pub fn new(lifecycle: Arc<dyn LifecycleApi>, config: CoordinatorConfig) -> Self {
        Self::with_storage_factory(
            lifecycle,
            config,
            Arc::new(|_room_id| Arc::new(MemoryStorage::new()) as Arc<dyn Storage>),
        )
    }

    /// Create a registry with a custom per-room storage factory.
    #[must_use]
    pub fn with_storage_factory(
        lifecycle: Arc<dyn LifecycleApi>,
        config: CoordinatorConfig,
        storage_factory: StorageFactory,
    ) -> Self {
        Self {
            rooms: DashMap::new(),
            lifecycle,
            config,
            storage_factory,
        }
    }

    /// Get the coordinator for a room, constructing it on first access.
    #[must_use]
    pub fn get_or_create(&self, room_id: &str) -> Arc<RoomCoordinator> {
        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                debug!(room = %room_id, "Creating room coordinator");
                Arc::new(RoomCoordinator::new(
                    room_id,
                    (self.storage_factory)(room_id),
                    Arc::clone(&self.lifecycle),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    /// Drop a room's coordinator if it holds no channels and no meeting.
    ///
    /// Returns `true` if the room was removed.
    pub async fn remove_if_idle(&self, room_id: &str) -> bool {
        let coordinator = match self.rooms.get(room_id) {
            Some(entry) => entry.clone(),
            None => return false,
        };

        if !coordinator.is_idle().await {
            return false;
        }

        self.rooms.remove(room_id);
        debug!(room = %room_id, "Removed idle room coordinator");
        true
    }

    /// Number of live rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ChannelHandle;
    use crate::lifecycle::mock::MockLifecycle;
    use tokio::sync::mpsc;

    fn registry() -> RoomRegistry {
        RoomRegistry::new(
            Arc::new(MockLifecycle::valid()),
            CoordinatorConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let registry = registry();

        let a = registry.get_or_create("abc123");
        let b = registry.get_or_create("abc123");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.room_count(), 1);

        registry.get_or_create("xyz789");
        assert_eq!(registry.room_count(), 2);
    }

    #[tokio::test]
    async fn test_rooms_are_independent() {
        let registry = registry();

        let a = registry.get_or_create("abc123");
        let (tx, _rx) = mpsc::unbounded_channel();
        a.connect(ChannelHandle::new("c1", tx), "abc123", "Alice")
            .await
            .unwrap();

        let b = registry.get_or_create("xyz789");
        assert_eq!(b.room_state().await.unwrap().users.len(), 0);
        assert_eq!(a.room_state().await.unwrap().users.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_if_idle() {
        let registry = registry();

        let _ = registry.get_or_create("abc123");
        assert!(registry.remove_if_idle("abc123").await);
        assert_eq!(registry.room_count(), 0);

        // A room with a live channel is not removed.
        let room2 = registry.get_or_create("abc123");
        let (tx, _rx) = mpsc::unbounded_channel();
        room2
            .connect(ChannelHandle::new("c1", tx), "abc123", "Alice")
            .await
            .unwrap();
        assert!(!registry.remove_if_idle("abc123").await);
        assert_eq!(registry.room_count(), 1);
    }
}
