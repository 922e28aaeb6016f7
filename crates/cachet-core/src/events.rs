//! Backend events and their broadcaster.
//!
//! Every backend owns a [`BackendEventBroadcaster`]. Subscribers receive
//! item-removed and dependency-invalidated events through a tokio broadcast
//! channel; slow receivers lose the oldest events once the buffer is full.

use std::fmt;

use tokio::sync::broadcast;
use uuid::Uuid;

/// Default buffer size for the broadcast channel.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Why an item left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheItemRemovedReason {
    /// Explicit `remove_item`.
    Removed,
    /// The item's expiration elapsed.
    Expired,
    /// The store evicted the item under memory pressure.
    Evicted,
    /// One of the item's dependencies was invalidated.
    Invalidated,
    /// A store-specific eviction with no better mapping.
    Other,
}

impl fmt::Display for CacheItemRemovedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Removed => write!(f, "removed"),
            Self::Expired => write!(f, "expired"),
            Self::Evicted => write!(f, "evicted"),
            Self::Invalidated => write!(f, "invalidated"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// An event raised by a backend.
///
/// `source_id` identifies the backend instance that caused the change. It is
/// `Uuid::nil()` when the change originated in the store itself (native
/// expiry or eviction).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    ItemRemoved {
        key: String,
        reason: CacheItemRemovedReason,
        source_id: Uuid,
    },
    DependencyInvalidated {
        key: String,
        source_id: Uuid,
    },
}

impl BackendEvent {
    pub fn item_removed(key: impl Into<String>, reason: CacheItemRemovedReason, source_id: Uuid) -> Self {
        Self::ItemRemoved {
            key: key.into(),
            reason,
            source_id,
        }
    }

    pub fn dependency_invalidated(key: impl Into<String>, source_id: Uuid) -> Self {
        Self::DependencyInvalidated {
            key: key.into(),
            source_id,
        }
    }

    /// The key the event is about.
    pub fn key(&self) -> &str {
        match self {
            Self::ItemRemoved { key, .. } | Self::DependencyInvalidated { key, .. } => key,
        }
    }

    pub fn source_id(&self) -> Uuid {
        match self {
            Self::ItemRemoved { source_id, .. } | Self::DependencyInvalidated { source_id, .. } => {
                *source_id
            }
        }
    }
}

/// Broadcaster for backend events.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct BackendEventBroadcaster {
    sender: broadcast::Sender<BackendEvent>,
}

impl BackendEventBroadcaster {
    /// Create a new broadcaster with default buffer size.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Create a new broadcaster with custom buffer size.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event.
    pub fn send(&self, event: BackendEvent) -> usize {
        self.sender.send(event).unwrap_or_default()
    }

    pub fn send_item_removed(&self, key: &str, reason: CacheItemRemovedReason, source_id: Uuid) -> usize {
        self.send(BackendEvent::item_removed(key, reason, source_id))
    }

    pub fn send_dependency_invalidated(&self, key: &str, source_id: Uuid) -> usize {
        self.send(BackendEvent::dependency_invalidated(key, source_id))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BackendEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BackendEventBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendEventBroadcaster")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_to_subscribers() {
        let broadcaster = BackendEventBroadcaster::new();
        let mut rx1 = broadcaster.subscribe();
        let mut rx2 = broadcaster.subscribe();
        let id = Uuid::new_v4();

        let count = broadcaster.send_item_removed("k", CacheItemRemovedReason::Removed, id);
        assert_eq!(count, 2);

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1, e2);
        assert_eq!(e1.key(), "k");
        assert_eq!(e1.source_id(), id);
    }

    #[test]
    fn test_send_without_subscribers() {
        let broadcaster = BackendEventBroadcaster::new();
        assert_eq!(broadcaster.send_dependency_invalidated("d", Uuid::nil()), 0);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
