//! The caching backend contract.
//!
//! Every physical store and every enhancer implements [`CachingBackend`].
//! Enhancers hold an inner [`DynBackend`] and delegate to it, so they can be
//! stacked in any order without changing the interface seen by callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CacheError, CacheResult};
use crate::events::{BackendEvent, BackendEventBroadcaster, CacheItemRemovedReason};
use crate::features::CachingBackendFeatures;
use crate::item::{CacheItem, CacheValue};
use crate::scheduler::BackgroundTaskScheduler;

/// Type alias for a shared backend trait object.
pub type DynBackend = Arc<dyn CachingBackend>;

/// The storage contract shared by all backends and enhancers.
///
/// Implementations must be thread-safe (`Send + Sync`). Async operations are
/// cancelled by dropping their future; a dropped operation leaves the
/// dependency index consistent.
///
/// Any operation invoked after [`dispose`](Self::dispose) fails with
/// [`CacheError::Disposed`].
#[async_trait]
pub trait CachingBackend: Send + Sync {
    // ==================== Identity ====================

    /// Identity of this backend instance, carried as the source of the
    /// events and messages it originates.
    fn id(&self) -> Uuid;

    /// Short name used in logs and errors.
    fn backend_name(&self) -> &str;

    /// Optional operations this backend supports.
    fn features(&self) -> CachingBackendFeatures;

    /// Subscribes to item-removed and dependency-invalidated events.
    fn subscribe(&self) -> broadcast::Receiver<BackendEvent>;

    // ==================== Items ====================

    /// Stores `item` under `key`, replacing any previous value and its
    /// dependency links.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Serialization` if a remote backend cannot encode
    /// the value, or an infrastructure error for remote failures.
    async fn set_item(&self, key: &str, item: CacheItem) -> CacheResult<()>;

    /// Looks up `key`. Returns `None` when the item is absent.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidCacheItem` if a stored payload is corrupt.
    async fn get_item(&self, key: &str, include_dependencies: bool) -> CacheResult<Option<CacheValue>>;

    async fn contains_item(&self, key: &str) -> CacheResult<bool>;

    /// Removes `key` and raises an item-removed event with reason `Removed`.
    /// Removing an absent key is a no-op and raises nothing.
    async fn remove_item(&self, key: &str) -> CacheResult<()>;

    // ==================== Dependencies ====================

    /// Removes every item depending on `key`, raising item-removed events with
    /// reason `Invalidated`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotSupported` unless `features().dependencies`.
    async fn invalidate_dependency(&self, key: &str) -> CacheResult<()>;

    /// # Errors
    ///
    /// Returns `CacheError::NotSupported` unless `features().contains_dependency`.
    async fn contains_dependency(&self, key: &str) -> CacheResult<bool>;

    /// Removes every item.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotSupported` unless `features().clear`.
    async fn clear(&self) -> CacheResult<()>;

    // ==================== Lifecycle ====================

    /// Waits until all backend-owned background work has drained.
    async fn when_background_tasks_completed(&self);

    /// Number of background tasks that failed, including teardown failures.
    fn background_task_exceptions(&self) -> usize;

    /// Drains background work and releases owned resources. Idempotent.
    async fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

/// State every concrete backend carries: identity, events, background
/// scheduler and the disposed flag.
#[derive(Debug)]
pub struct BackendCore {
    id: Uuid,
    name: String,
    events: BackendEventBroadcaster,
    scheduler: BackgroundTaskScheduler,
    disposed: AtomicBool,
}

impl BackendCore {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: Uuid::new_v4(),
            scheduler: BackgroundTaskScheduler::new(name.clone()),
            name,
            events: BackendEventBroadcaster::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &BackendEventBroadcaster {
        &self.events
    }

    pub fn scheduler(&self) -> &BackgroundTaskScheduler {
        &self.scheduler
    }

    /// # Errors
    ///
    /// Returns `CacheError::Disposed` once the backend has been disposed.
    pub fn ensure_active(&self) -> CacheResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CacheError::disposed(&self.name));
        }
        Ok(())
    }

    /// Flags the backend as disposed. Returns `true` only for the first call.
    pub fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn not_supported(&self, operation: &str) -> CacheError {
        CacheError::not_supported(operation, &self.name)
    }

    pub fn emit_item_removed(&self, key: &str, reason: CacheItemRemovedReason, source_id: Uuid) {
        debug!(backend = %self.name, key = %key, reason = %reason, "item removed");
        self.events.send_item_removed(key, reason, source_id);
    }

    pub fn emit_dependency_invalidated(&self, key: &str, source_id: Uuid) {
        self.events.send_dependency_invalidated(key, source_id);
    }

    /// Drains the scheduler after marking the backend disposed.
    /// Returns `false` when the backend was already disposed.
    pub async fn dispose(&self) -> bool {
        if !self.mark_disposed() {
            return false;
        }
        self.scheduler.dispose().await;
        true
    }
}
