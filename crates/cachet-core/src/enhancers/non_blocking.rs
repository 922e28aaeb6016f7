//! Write-behind wrapper.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::backend::{BackendCore, CachingBackend, DynBackend};
use crate::error::CacheResult;
use crate::events::BackendEvent;
use crate::features::CachingBackendFeatures;
use crate::item::{CacheItem, CacheValue};

/// Runs the writes of the inner backend (`set_item`, `remove_item`,
/// `invalidate_dependency`, `clear`) on a background scheduler and returns
/// immediately. Reads are forwarded as-is.
///
/// Failed writes are logged and counted in
/// [`background_task_exceptions`](CachingBackend::background_task_exceptions);
/// callers never see them. Writes are not ordered with respect to each other.
pub struct NonBlockingCachingBackend {
    core: BackendCore,
    inner: DynBackend,
}

impl NonBlockingCachingBackend {
    pub fn new(inner: DynBackend) -> Self {
        Self {
            core: BackendCore::new(format!("non-blocking({})", inner.backend_name())),
            inner,
        }
    }

    pub fn inner(&self) -> &DynBackend {
        &self.inner
    }
}

#[async_trait]
impl CachingBackend for NonBlockingCachingBackend {
    fn id(&self) -> Uuid {
        self.inner.id()
    }

    fn backend_name(&self) -> &str {
        self.core.name()
    }

    fn features(&self) -> CachingBackendFeatures {
        self.inner.features()
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.inner.subscribe()
    }

    async fn set_item(&self, key: &str, item: CacheItem) -> CacheResult<()> {
        self.core.ensure_active()?;
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        self.core
            .scheduler()
            .enqueue(async move { inner.set_item(&key, item).await });
        Ok(())
    }

    async fn get_item(&self, key: &str, include_dependencies: bool) -> CacheResult<Option<CacheValue>> {
        self.core.ensure_active()?;
        self.inner.get_item(key, include_dependencies).await
    }

    async fn contains_item(&self, key: &str) -> CacheResult<bool> {
        self.core.ensure_active()?;
        self.inner.contains_item(key).await
    }

    async fn remove_item(&self, key: &str) -> CacheResult<()> {
        self.core.ensure_active()?;
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        self.core
            .scheduler()
            .enqueue(async move { inner.remove_item(&key).await });
        Ok(())
    }

    async fn invalidate_dependency(&self, key: &str) -> CacheResult<()> {
        self.core.ensure_active()?;
        if !self.inner.features().dependencies {
            return Err(self.core.not_supported("invalidate_dependency"));
        }
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        self.core
            .scheduler()
            .enqueue(async move { inner.invalidate_dependency(&key).await });
        Ok(())
    }

    async fn contains_dependency(&self, key: &str) -> CacheResult<bool> {
        self.core.ensure_active()?;
        self.inner.contains_dependency(key).await
    }

    async fn clear(&self) -> CacheResult<()> {
        self.core.ensure_active()?;
        if !self.inner.features().clear {
            return Err(self.core.not_supported("clear"));
        }
        let inner = Arc::clone(&self.inner);
        self.core
            .scheduler()
            .enqueue(async move { inner.clear().await });
        Ok(())
    }

    async fn when_background_tasks_completed(&self) {
        self.core.scheduler().when_queue_empty().await;
        self.inner.when_background_tasks_completed().await;
    }

    fn background_task_exceptions(&self) -> usize {
        self.core.scheduler().exception_count() + self.inner.background_task_exceptions()
    }

    async fn dispose(&self) {
        if self.core.dispose().await {
            self.inner.dispose().await;
        }
    }

    fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }
}
