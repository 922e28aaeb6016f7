//! Get-or-compute front end over a backend.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::auto_reload::{AutoReloadManager, ValueProvider};
use crate::backend::DynBackend;
use crate::context::{CachingContext, CachingFlow, NestedCacheRecorder};
use crate::error::{CacheError, CacheResult};
use crate::item::{CacheItem, CacheItemConfiguration};
use crate::profiles::ProfileRegistry;

/// Parent keys of cached computations, recorded when the backend cannot
/// hold the child key as a dependency.
#[derive(Debug, Default)]
pub struct NestedCallLog {
    parents_by_child: DashMap<String, HashSet<String>>,
}

impl NestedCallLog {
    pub fn parents_of(&self, child_key: &str) -> Vec<String> {
        self.parents_by_child
            .get(child_key)
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn take_parents(&self, child_key: &str) -> HashSet<String> {
        self.parents_by_child
            .remove(child_key)
            .map(|(_, parents)| parents)
            .unwrap_or_default()
    }
}

impl NestedCacheRecorder for NestedCallLog {
    fn record_nested(&self, parent_key: &str, child_key: &str) {
        self.parents_by_child
            .entry(child_key.to_string())
            .or_default()
            .insert(parent_key.to_string());
    }
}

/// Caching front end: looks values up, computes and stores them on a miss,
/// and tracks the dependencies declared while computing.
///
/// Construct one per backend and pass it around; there is no global instance.
#[derive(Clone)]
pub struct CachingService {
    backend: DynBackend,
    profiles: Arc<ProfileRegistry>,
    nested: Arc<NestedCallLog>,
    auto_reload: AutoReloadManager,
}

impl CachingService {
    pub fn new(backend: DynBackend) -> Self {
        Self::with_profiles(backend, Arc::new(ProfileRegistry::new()))
    }

    pub fn with_profiles(backend: DynBackend, profiles: Arc<ProfileRegistry>) -> Self {
        Self {
            auto_reload: AutoReloadManager::new(Arc::clone(&backend)),
            backend,
            profiles,
            nested: Arc::new(NestedCallLog::default()),
        }
    }

    pub fn backend(&self) -> &DynBackend {
        &self.backend
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    pub fn nested_calls(&self) -> &NestedCallLog {
        &self.nested
    }

    pub fn auto_reload(&self) -> &AutoReloadManager {
        &self.auto_reload
    }

    /// Returns the cached value of `key`, or runs `compute`, caches its
    /// result with the dependencies it declared and returns it.
    ///
    /// `compute` runs with a fork of the ambient [`CachingFlow`] installed, so
    /// nested `get_or_compute` calls and
    /// [`add_dependency`](crate::context::add_dependency) reach its context,
    /// also when several of them run concurrently.
    ///
    /// # Errors
    ///
    /// Returns the error of `compute`, or a backend error converted into `E`.
    /// A cached payload that does not decode as `T` yields
    /// `CacheError::InvalidCacheItem`.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        configuration: &CacheItemConfiguration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let merged = self.profiles.merge(configuration);
        if !merged.is_enabled.unwrap_or(false) {
            debug!(key = %key, "caching disabled for this profile");
            return compute().await;
        }

        let flow = CachingFlow::ambient_or_new().fork();
        if let Some(cached) = self.backend.get_item(key, true).await? {
            let value = serde_json::from_value(cached.value)
                .map_err(|e| CacheError::invalid_cache_item(key, e.to_string()))?;
            let context = flow.open_cache_context(key);
            context.add_dependencies(cached.dependencies)?;
            flow.dispose(&context)?;
            self.propagate(&context);
            debug!(key = %key, "cache hit");
            return Ok(value);
        }

        debug!(key = %key, "cache miss");
        self.compute_and_store(&flow, flow.open_cache_context(key), key, &merged, compute)
            .await
    }

    /// Recomputes `key` unconditionally and stores the new value.
    ///
    /// # Errors
    ///
    /// Same as [`get_or_compute`](Self::get_or_compute).
    pub async fn recache<T, E, F, Fut>(
        &self,
        key: &str,
        configuration: &CacheItemConfiguration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let merged = self.profiles.merge(configuration);
        let flow = CachingFlow::ambient_or_new().fork();
        self.compute_and_store(&flow, flow.open_recache_context(key), key, &merged, compute)
            .await
    }

    async fn compute_and_store<T, E, F, Fut>(
        &self,
        flow: &CachingFlow,
        context: Arc<CachingContext>,
        key: &str,
        configuration: &CacheItemConfiguration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let computed = flow.clone().scope(compute()).await;
        let closed = flow.dispose(&context);
        let value = computed?;
        closed?;

        let payload = serde_json::to_value(&value).map_err(|e| CacheError::serialization(e.to_string()))?;
        let item = CacheItem::new(payload)
            .with_dependencies(context.dependencies())
            .with_configuration(configuration.clone());
        self.backend.set_item(key, item).await?;
        self.propagate(&context);
        Ok(value)
    }

    fn propagate(&self, context: &CachingContext) {
        context.propagate_to_parent(self.backend.features(), self.nested.as_ref());
    }

    /// Keeps `key` cached: whenever it leaves the cache, `provider` is run in
    /// the background and its value stored again. Returns `false` when the
    /// backend raises no events.
    pub fn enable_auto_reload<T, F, Fut>(&self, key: &str, configuration: &CacheItemConfiguration, provider: F) -> bool
    where
        T: Serialize,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        let merged = self.profiles.merge(configuration);
        let provider: ValueProvider = Arc::new(move || {
            provider()
                .map(|result| {
                    result.and_then(|value| {
                        serde_json::to_value(&value).map_err(|e| CacheError::serialization(e.to_string()))
                    })
                })
                .boxed()
        });
        self.auto_reload.subscribe(key, merged, provider)
    }

    /// Removes `key` from the backend.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn remove(&self, key: &str) -> CacheResult<()> {
        self.backend.remove_item(key).await
    }

    /// Removes `key` and everything computed from it: its dependents when the
    /// backend tracks dependencies, otherwise the recorded enclosing
    /// computations.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn invalidate(&self, key: &str) -> CacheResult<()> {
        self.backend.remove_item(key).await?;
        if self.backend.features().dependencies {
            return self.backend.invalidate_dependency(key).await;
        }

        let mut pending: Vec<String> = self.nested.take_parents(key).into_iter().collect();
        let mut visited = HashSet::new();
        while let Some(parent) = pending.pop() {
            if !visited.insert(parent.clone()) {
                continue;
            }
            self.backend.remove_item(&parent).await?;
            pending.extend(self.nested.take_parents(&parent));
        }
        Ok(())
    }

    /// Stops auto-reload and disposes the backend.
    pub async fn dispose(&self) {
        self.auto_reload.dispose().await;
        self.backend.dispose().await;
    }
}
