//! Recomputes registered items in the background when they leave the cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::DynBackend;
use crate::context::CachingFlow;
use crate::error::CacheResult;
use crate::events::BackendEvent;
use crate::item::{CacheItem, CacheItemConfiguration};
use crate::scheduler::BackgroundTaskScheduler;

/// Produces a fresh value for an auto-reloaded key.
pub type ValueProvider = Arc<dyn Fn() -> BoxFuture<'static, CacheResult<Value>> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    configuration: CacheItemConfiguration,
    provider: ValueProvider,
}

struct AutoReloadInner {
    backend: DynBackend,
    registrations: DashMap<String, Registration>,
    scheduler: BackgroundTaskScheduler,
    listening: AtomicBool,
    shutdown: CancellationToken,
}

impl AutoReloadInner {
    async fn reload(&self, key: &str, registration: Registration) -> CacheResult<()> {
        let flow = CachingFlow::new();
        let context = flow.open_cache_context(key);
        let computed = flow.clone().scope((registration.provider)()).await;
        let closed = flow.dispose(&context);
        let value = computed?;
        closed?;

        let item = CacheItem::new(value)
            .with_dependencies(context.dependencies())
            .with_configuration(registration.configuration);
        self.backend.set_item(key, item).await?;
        debug!(key = %key, "auto-reloaded cache item");
        Ok(())
    }
}

/// Watches a backend's item-removed events and recomputes registered keys.
///
/// Requires a backend with the `events` feature.
#[derive(Clone)]
pub struct AutoReloadManager {
    inner: Arc<AutoReloadInner>,
}

impl AutoReloadManager {
    pub fn new(backend: DynBackend) -> Self {
        Self {
            inner: Arc::new(AutoReloadInner {
                backend,
                registrations: DashMap::new(),
                scheduler: BackgroundTaskScheduler::new("auto-reload"),
                listening: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Registers `key` for auto-reload. Returns `false` when the backend
    /// raises no events; the key is then not registered.
    pub fn subscribe(&self, key: impl Into<String>, configuration: CacheItemConfiguration, provider: ValueProvider) -> bool {
        if !self.inner.backend.features().events {
            warn!(
                backend = %self.inner.backend.backend_name(),
                "backend does not support auto-reload"
            );
            return false;
        }

        self.inner
            .registrations
            .entry(key.into())
            .or_insert(Registration {
                configuration,
                provider,
            });

        if !self.inner.listening.swap(true, Ordering::AcqRel) {
            self.start_listener();
        }
        true
    }

    pub fn unsubscribe(&self, key: &str) -> bool {
        self.inner.registrations.remove(key).is_some()
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.inner.registrations.contains_key(key)
    }

    fn start_listener(&self) {
        let mut events = self.inner.backend.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime; auto-reload listener not started");
            self.inner.listening.store(false, Ordering::Release);
            return;
        };

        handle.spawn(async move {
            info!("auto-reload listener started");
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                let key = match event {
                    Ok(BackendEvent::ItemRemoved { key, .. }) => key,
                    Ok(BackendEvent::DependencyInvalidated { .. }) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "auto-reload listener lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let Some(registration) = inner.registrations.get(&key).map(|r| r.clone()) else {
                    continue;
                };
                let task_inner = Arc::clone(&inner);
                inner
                    .scheduler
                    .enqueue(async move { task_inner.reload(&key, registration).await });
            }
        });
    }

    pub async fn when_reloads_completed(&self) {
        self.inner.scheduler.when_queue_empty().await;
    }

    pub fn exception_count(&self) -> usize {
        self.inner.scheduler.exception_count()
    }

    /// Stops listening and drains pending reloads.
    pub async fn dispose(&self) {
        self.inner.shutdown.cancel();
        self.inner.scheduler.dispose().await;
    }
}
