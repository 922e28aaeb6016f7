//! Local memory layer in front of a remote backend.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{CachingBackend, DynBackend};
use crate::error::{CacheError, CacheResult};
use crate::events::BackendEvent;
use crate::features::CachingBackendFeatures;
use crate::item::{CacheItem, CacheItemConfiguration, CacheValue};
use crate::memory::MemoryCachingBackend;

/// How long a copy fetched from the remote layer stays in the local layer.
pub const DEFAULT_LOCAL_EXPIRATION: Duration = Duration::from_secs(300);

/// Two-level cache: reads hit the local memory layer first and fall back to
/// the remote backend; writes go to both layers.
///
/// The local layer is kept in sync by listening to the remote backend's
/// events. Removals and invalidations caused by other instances, or by the
/// remote store itself, drop the local copy. An overwrite by another
/// instance raises no event, so local copies are bounded by
/// `local_expiration`.
pub struct TwoLayerCachingBackend {
    local: MemoryCachingBackend,
    remote: DynBackend,
    local_expiration: Duration,
    name: String,
    listener: CancellationToken,
}

impl TwoLayerCachingBackend {
    pub fn new(remote: DynBackend) -> Self {
        Self::with_local(remote, MemoryCachingBackend::new(), DEFAULT_LOCAL_EXPIRATION)
    }

    /// Builds the enhancer and starts the remote event listener on the
    /// current tokio runtime.
    pub fn with_local(remote: DynBackend, local: MemoryCachingBackend, local_expiration: Duration) -> Self {
        let listener = CancellationToken::new();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(sync_local_layer(
                remote.subscribe(),
                local.clone(),
                remote.id(),
                listener.clone(),
            ));
        } else {
            warn!("no tokio runtime; the local layer will not follow remote events");
        }

        Self {
            name: format!("two-layer({})", remote.backend_name()),
            local,
            remote,
            local_expiration,
            listener,
        }
    }

    pub fn local(&self) -> &MemoryCachingBackend {
        &self.local
    }

    pub fn remote(&self) -> &DynBackend {
        &self.remote
    }

    fn local_item(&self, item: &CacheItem) -> CacheItem {
        let mut configuration = item.configuration.clone();
        configuration.apply_fallback(
            &CacheItemConfiguration::new().with_absolute_expiration(self.local_expiration),
        );
        CacheItem {
            value: item.value.clone(),
            dependencies: item.dependencies.clone(),
            configuration,
        }
    }
}

impl Drop for TwoLayerCachingBackend {
    fn drop(&mut self) {
        self.listener.cancel();
    }
}

async fn sync_local_layer(
    mut events: broadcast::Receiver<BackendEvent>,
    local: MemoryCachingBackend,
    own_id: Uuid,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };

        let outcome = match event {
            Ok(BackendEvent::ItemRemoved { key, source_id, .. }) if source_id != own_id => {
                debug!(key = %key, source = %source_id, "dropping local copy");
                local.remove_item(&key).await
            }
            Ok(BackendEvent::DependencyInvalidated { key, source_id }) if source_id != own_id => {
                local.invalidate_dependency(&key).await
            }
            Ok(_) => Ok(()),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "remote events lagged; clearing the local layer");
                local.clear().await
            }
            Err(RecvError::Closed) => break,
        };

        if let Err(e) = outcome {
            if e.is_disposed() {
                break;
            }
            warn!(error = %e, "failed to apply remote event to the local layer");
        }
    }
}

#[async_trait]
impl CachingBackend for TwoLayerCachingBackend {
    fn id(&self) -> Uuid {
        self.remote.id()
    }

    fn backend_name(&self) -> &str {
        &self.name
    }

    fn features(&self) -> CachingBackendFeatures {
        self.remote.features()
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.remote.subscribe()
    }

    async fn set_item(&self, key: &str, item: CacheItem) -> CacheResult<()> {
        self.local.set_item(key, self.local_item(&item)).await?;
        self.remote.set_item(key, item).await
    }

    async fn get_item(&self, key: &str, include_dependencies: bool) -> CacheResult<Option<CacheValue>> {
        if let Some(value) = self.local.get_item(key, include_dependencies).await? {
            return Ok(Some(value));
        }

        let Some(value) = self.remote.get_item(key, true).await? else {
            return Ok(None);
        };
        let copy = CacheItem::new(value.value.clone())
            .with_dependencies(value.dependencies.iter().cloned())
            .with_configuration(
                CacheItemConfiguration::new().with_absolute_expiration(self.local_expiration),
            );
        self.local.set_item(key, copy).await?;

        Ok(Some(if include_dependencies {
            value
        } else {
            CacheValue::new(value.value, Vec::new())
        }))
    }

    async fn contains_item(&self, key: &str) -> CacheResult<bool> {
        if self.local.contains_item(key).await? {
            return Ok(true);
        }
        self.remote.contains_item(key).await
    }

    async fn remove_item(&self, key: &str) -> CacheResult<()> {
        self.local.remove_item(key).await?;
        self.remote.remove_item(key).await
    }

    async fn invalidate_dependency(&self, key: &str) -> CacheResult<()> {
        if !self.remote.features().dependencies {
            return Err(CacheError::not_supported("invalidate_dependency", &self.name));
        }
        self.local.invalidate_dependency(key).await?;
        self.remote.invalidate_dependency(key).await
    }

    async fn contains_dependency(&self, key: &str) -> CacheResult<bool> {
        self.remote.contains_dependency(key).await
    }

    async fn clear(&self) -> CacheResult<()> {
        if !self.remote.features().clear {
            return Err(CacheError::not_supported("clear", &self.name));
        }
        self.local.clear().await?;
        self.remote.clear().await
    }

    async fn when_background_tasks_completed(&self) {
        self.local.when_background_tasks_completed().await;
        self.remote.when_background_tasks_completed().await;
    }

    fn background_task_exceptions(&self) -> usize {
        self.local.background_task_exceptions() + self.remote.background_task_exceptions()
    }

    async fn dispose(&self) {
        self.listener.cancel();
        self.local.dispose().await;
        self.remote.dispose().await;
    }

    fn is_disposed(&self) -> bool {
        self.remote.is_disposed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CacheItemRemovedReason;
    use std::sync::Arc;
    use serde_json::json;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_read_populates_local_layer() {
        let remote = Arc::new(MemoryCachingBackend::new());
        remote
            .set_item("k", CacheItem::new(json!("v")).with_dependencies(["d"]))
            .await
            .unwrap();
        let backend = TwoLayerCachingBackend::new(remote.clone());

        let value = backend.get_item("k", false).await.unwrap().unwrap();
        assert_eq!(value.value, json!("v"));
        assert!(value.dependencies.is_empty());
        assert!(backend.local().contains_item("k").await.unwrap());
        assert!(backend.local().contains_dependency("d").await.unwrap());
    }

    #[tokio::test]
    async fn test_foreign_removal_drops_local_copy() {
        let remote = Arc::new(MemoryCachingBackend::new());
        let backend = TwoLayerCachingBackend::new(remote.clone());
        backend.set_item("k", CacheItem::new(json!(1))).await.unwrap();

        // An event from the store itself (for example a native expiry).
        remote
            .events()
            .send_item_removed("k", CacheItemRemovedReason::Expired, Uuid::nil());
        settle().await;

        assert!(!backend.local().contains_item("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_hits_both_layers() {
        let remote = Arc::new(MemoryCachingBackend::new());
        let backend = TwoLayerCachingBackend::new(remote.clone());
        backend.set_item("k", CacheItem::new(json!(1))).await.unwrap();

        backend.remove_item("k").await.unwrap();
        assert!(!backend.local().contains_item("k").await.unwrap());
        assert!(!remote.contains_item("k").await.unwrap());
        assert!(backend.get_item("k", false).await.unwrap().is_none());
    }
}
