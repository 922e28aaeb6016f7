//! In-process caching backend with a reverse dependency index.
//!
//! ## Storage
//!
//! - `items`: item key → stored value (payload, dependency list, expiry and
//!   priority metadata)
//! - `dependencies`: dependency key → keys of the items declaring it
//!
//! An item key is in the set of dependency `D` exactly when the stored value
//! under that key lists `D`. Empty sets are deleted.
//!
//! ## Native eviction
//!
//! Entries leave the store on their own through expiration (checked lazily on
//! read and by a periodic scan) and capacity eviction. Those removals go
//! through the eviction callback, which maps the native cause to a
//! [`CacheItemRemovedReason`], prunes the dependency links and raises the
//! item-removed event. Explicit removals raise their own event and are skipped
//! by the callback.
//!
//! All mutations of a key run under that key's stripe lock; no I/O or
//! `.await` happens while it is held.

mod locks;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::{BackendCore, CachingBackend};
use crate::error::{CacheError, CacheResult};
use crate::events::{BackendEvent, CacheItemRemovedReason};
use crate::features::CachingBackendFeatures;
use crate::item::{CacheItem, CacheItemPriority, CacheValue};

use locks::KeyLocks;

const BACKEND_NAME: &str = "memory";

/// Options of the memory backend.
#[derive(Debug, Clone)]
pub struct MemoryCachingBackendConfig {
    /// Upper bound on stored items; `None` disables capacity eviction.
    pub max_items: Option<usize>,
    /// Period of the expired-entry scan.
    pub scan_interval: Duration,
    /// Number of per-key lock stripes.
    pub lock_stripes: usize,
}

impl Default for MemoryCachingBackendConfig {
    fn default() -> Self {
        Self {
            max_items: None,
            scan_interval: Duration::from_secs(30),
            lock_stripes: locks::DEFAULT_STRIPES,
        }
    }
}

/// Why the store dropped an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NativeRemovalCause {
    /// Explicit removal through the API.
    Removed,
    Expired,
    /// Capacity pressure.
    Capacity,
    /// The entry was dropped because a dependency changed.
    DependencyChanged,
    /// Store-wide operation such as `clear`.
    StoreSpecific,
}

impl NativeRemovalCause {
    fn reason(self) -> CacheItemRemovedReason {
        match self {
            Self::Removed => CacheItemRemovedReason::Removed,
            Self::Expired => CacheItemRemovedReason::Expired,
            Self::Capacity => CacheItemRemovedReason::Evicted,
            Self::DependencyChanged => CacheItemRemovedReason::Invalidated,
            Self::StoreSpecific => CacheItemRemovedReason::Other,
        }
    }
}

struct MemoryCacheValue {
    value: Value,
    dependencies: Vec<String>,
    priority: CacheItemPriority,
    absolute_deadline: Option<Instant>,
    sliding: Option<Duration>,
    last_access: Mutex<Instant>,
    sequence: u64,
}

impl MemoryCacheValue {
    fn from_item(item: CacheItem, sequence: u64) -> Self {
        let now = Instant::now();
        let configuration = item.configuration;
        Self {
            value: item.value,
            dependencies: item.dependencies,
            priority: configuration.effective_priority(),
            absolute_deadline: configuration.absolute_expiration.map(|d| now + d),
            sliding: configuration.sliding_expiration,
            last_access: Mutex::new(now),
            sequence,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        if self.absolute_deadline.is_some_and(|deadline| deadline <= now) {
            return true;
        }
        match self.sliding {
            Some(sliding) => now.saturating_duration_since(*self.last_access.lock()) >= sliding,
            None => false,
        }
    }

    fn touch(&self, now: Instant) {
        if self.sliding.is_some() {
            *self.last_access.lock() = now;
        }
    }

    fn declares(&self, dependency: &str) -> bool {
        self.dependencies.iter().any(|d| d == dependency)
    }

    fn to_cache_value(&self, include_dependencies: bool) -> CacheValue {
        let dependencies = if include_dependencies {
            self.dependencies.clone()
        } else {
            Vec::new()
        };
        CacheValue::new(self.value.clone(), dependencies)
    }
}

struct MemoryInner {
    core: BackendCore,
    items: DashMap<String, Arc<MemoryCacheValue>>,
    dependencies: DashMap<String, HashSet<String>>,
    locks: KeyLocks,
    config: MemoryCachingBackendConfig,
    sequence: AtomicU64,
    shutdown: CancellationToken,
}

impl Drop for MemoryInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl MemoryInner {
    fn new_value(&self, item: CacheItem) -> Arc<MemoryCacheValue> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        Arc::new(MemoryCacheValue::from_item(item, sequence))
    }

    // Callers hold the stripe of `key`.
    fn link(&self, key: &str, dependencies: &[String]) {
        for dependency in dependencies {
            self.dependencies
                .entry(dependency.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    // Callers hold the stripe of `key`.
    fn unlink(&self, key: &str, dependencies: &[String]) {
        for dependency in dependencies {
            if let Entry::Occupied(mut entry) = self.dependencies.entry(dependency.clone()) {
                entry.get_mut().remove(key);
                if entry.get().is_empty() {
                    entry.remove();
                }
            }
        }
    }

    fn set_item(&self, key: &str, item: CacheItem) {
        let value = self.new_value(item);
        {
            let _guard = self.locks.lock(key);
            let previous = self.items.insert(key.to_string(), value.clone());
            if let Some(previous) = previous {
                self.unlink(key, &previous.dependencies);
            }
            self.link(key, &value.dependencies);
        }
        self.enforce_capacity();
    }

    fn lookup(&self, key: &str) -> Option<Arc<MemoryCacheValue>> {
        let value = self.items.get(key).map(|entry| entry.value().clone())?;
        if value.is_expired(Instant::now()) {
            self.evict(key, &value, NativeRemovalCause::Expired);
            return None;
        }
        Some(value)
    }

    /// Removes `key` if it is still bound to `expected` (or to anything when
    /// `expected` is `None`) and prunes its dependency links.
    fn remove_entry(&self, key: &str, expected: Option<&Arc<MemoryCacheValue>>) -> bool {
        let _guard = self.locks.lock(key);
        let removed = self.items.remove_if(key, |_, current| match expected {
            Some(expected) => Arc::ptr_eq(current, expected),
            None => true,
        });
        match removed {
            Some((_, value)) => {
                self.unlink(key, &value.dependencies);
                true
            }
            None => false,
        }
    }

    /// Removal initiated by the store itself.
    fn evict(&self, key: &str, value: &Arc<MemoryCacheValue>, cause: NativeRemovalCause) {
        if self.remove_entry(key, Some(value)) {
            self.on_evicted(key, cause);
        }
    }

    fn on_evicted(&self, key: &str, cause: NativeRemovalCause) {
        if cause == NativeRemovalCause::Removed {
            return;
        }
        self.core
            .emit_item_removed(key, cause.reason(), self.core.id());
    }

    fn invalidate_dependency_with(&self, dependency: &str, replacement: Option<&CacheItem>) {
        let snapshot: Vec<String> = match self.dependencies.get(dependency) {
            Some(keys) => keys.iter().cloned().collect(),
            None => Vec::new(),
        };

        for key in snapshot {
            let invalidated = {
                let _guard = self.locks.lock(&key);
                let current = self.items.get(&key).map(|entry| entry.value().clone());
                match current {
                    Some(current) if current.declares(dependency) => {
                        match replacement {
                            Some(item) => {
                                let value = self.new_value(item.clone());
                                self.items.insert(key.clone(), value.clone());
                                self.unlink(&key, &current.dependencies);
                                self.link(&key, &value.dependencies);
                                false
                            }
                            None => {
                                self.items.remove(&key);
                                self.unlink(&key, &current.dependencies);
                                true
                            }
                        }
                    }
                    _ => false,
                }
            };
            if invalidated {
                self.on_evicted(&key, NativeRemovalCause::DependencyChanged);
            }
        }

        self.dependencies.remove_if(dependency, |_, keys| keys.is_empty());
        self.core
            .emit_dependency_invalidated(dependency, self.core.id());
    }

    fn enforce_capacity(&self) {
        let Some(max_items) = self.config.max_items else {
            return;
        };
        let excess = self.items.len().saturating_sub(max_items);
        if excess == 0 {
            return;
        }

        let mut candidates: Vec<(String, Arc<MemoryCacheValue>)> = self
            .items
            .iter()
            .filter(|entry| entry.value().priority != CacheItemPriority::NotRemovable)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        candidates.sort_by_key(|(_, value)| (eviction_rank(value.priority), value.sequence));

        for (key, value) in candidates.into_iter().take(excess) {
            self.evict(&key, &value, NativeRemovalCause::Capacity);
        }
    }

    fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, Arc<MemoryCacheValue>)> = self
            .items
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let count = expired.len();
        for (key, value) in expired {
            self.evict(&key, &value, NativeRemovalCause::Expired);
        }
        count
    }

    fn clear(&self) {
        let keys: Vec<String> = self.items.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if self.remove_entry(&key, None) {
                self.on_evicted(&key, NativeRemovalCause::StoreSpecific);
            }
        }
    }

    fn check_dependency_invariant(&self) -> CacheResult<()> {
        let mut expected: std::collections::HashMap<String, HashSet<String>> =
            std::collections::HashMap::new();
        for entry in self.items.iter() {
            for dependency in &entry.value().dependencies {
                expected
                    .entry(dependency.clone())
                    .or_default()
                    .insert(entry.key().clone());
            }
        }

        let mut actual_count = 0;
        for entry in self.dependencies.iter() {
            actual_count += 1;
            if expected.get(entry.key()) != Some(entry.value()) {
                return Err(CacheError::assertion_failed(format!(
                    "dependency index entry '{}' does not match the stored items",
                    entry.key()
                )));
            }
        }
        if actual_count != expected.len() {
            return Err(CacheError::assertion_failed(format!(
                "dependency index has {actual_count} entries, stored items declare {}",
                expected.len()
            )));
        }
        Ok(())
    }
}

fn eviction_rank(priority: CacheItemPriority) -> u8 {
    match priority {
        CacheItemPriority::Low => 0,
        CacheItemPriority::Default => 1,
        CacheItemPriority::High => 2,
        CacheItemPriority::NotRemovable => 3,
    }
}

async fn run_expiration_scan(inner: Weak<MemoryInner>, shutdown: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let expired = inner.sweep_expired();
        if expired > 0 {
            debug!(count = expired, "expired memory cache items");
        }
    }
}

/// In-process backend supporting every optional feature.
#[derive(Clone)]
pub struct MemoryCachingBackend {
    inner: Arc<MemoryInner>,
}

impl MemoryCachingBackend {
    pub fn new() -> Self {
        Self::with_config(MemoryCachingBackendConfig::default())
    }

    /// Creates a backend. The expiration scan starts when a tokio runtime is
    /// available; otherwise expiry is only detected on access.
    pub fn with_config(config: MemoryCachingBackendConfig) -> Self {
        let inner = Arc::new(MemoryInner {
            core: BackendCore::new(BACKEND_NAME),
            items: DashMap::new(),
            dependencies: DashMap::new(),
            locks: KeyLocks::with_stripes(config.lock_stripes),
            sequence: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            config,
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(run_expiration_scan(
                Arc::downgrade(&inner),
                inner.shutdown.clone(),
                inner.config.scan_interval,
            ));
        }

        Self { inner }
    }

    /// Invalidates `dependency`, replacing each dependent item with
    /// `replacement` instead of removing it when one is given.
    ///
    /// Replaced items raise no item-removed event; the swap happens under the
    /// item's lock so readers see either the old or the new value.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Disposed` after disposal.
    pub fn invalidate_dependency_with(&self, dependency: &str, replacement: Option<&CacheItem>) -> CacheResult<()> {
        self.inner.core.ensure_active()?;
        self.inner.invalidate_dependency_with(dependency, replacement);
        Ok(())
    }

    /// Runs one expiration scan now. Returns the number of expired items.
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep_expired()
    }

    pub fn len(&self) -> usize {
        self.inner.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.is_empty()
    }

    /// Rebuilds the reverse index from the item table and compares it with
    /// the live one.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::AssertionFailed` on any mismatch.
    pub fn check_dependency_invariant(&self) -> CacheResult<()> {
        self.inner.check_dependency_invariant()
    }

    #[cfg(test)]
    pub(crate) fn events(&self) -> &crate::events::BackendEventBroadcaster {
        self.inner.core.events()
    }
}

impl Default for MemoryCachingBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CachingBackend for MemoryCachingBackend {
    fn id(&self) -> Uuid {
        self.inner.core.id()
    }

    fn backend_name(&self) -> &str {
        self.inner.core.name()
    }

    fn features(&self) -> CachingBackendFeatures {
        CachingBackendFeatures::full()
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.inner.core.events().subscribe()
    }

    async fn set_item(&self, key: &str, item: CacheItem) -> CacheResult<()> {
        self.inner.core.ensure_active()?;
        self.inner.set_item(key, item);
        Ok(())
    }

    async fn get_item(&self, key: &str, include_dependencies: bool) -> CacheResult<Option<CacheValue>> {
        self.inner.core.ensure_active()?;
        Ok(self.inner.lookup(key).map(|value| {
            value.touch(Instant::now());
            value.to_cache_value(include_dependencies)
        }))
    }

    async fn contains_item(&self, key: &str) -> CacheResult<bool> {
        self.inner.core.ensure_active()?;
        Ok(self.inner.lookup(key).is_some())
    }

    async fn remove_item(&self, key: &str) -> CacheResult<()> {
        self.inner.core.ensure_active()?;
        if self.inner.remove_entry(key, None) {
            self.inner
                .core
                .emit_item_removed(key, CacheItemRemovedReason::Removed, self.inner.core.id());
        }
        Ok(())
    }

    async fn invalidate_dependency(&self, key: &str) -> CacheResult<()> {
        self.invalidate_dependency_with(key, None)
    }

    async fn contains_dependency(&self, key: &str) -> CacheResult<bool> {
        self.inner.core.ensure_active()?;
        Ok(self.inner.dependencies.contains_key(key))
    }

    async fn clear(&self) -> CacheResult<()> {
        self.inner.core.ensure_active()?;
        self.inner.clear();
        Ok(())
    }

    async fn when_background_tasks_completed(&self) {
        self.inner.core.scheduler().when_queue_empty().await;
    }

    fn background_task_exceptions(&self) -> usize {
        self.inner.core.scheduler().exception_count()
    }

    async fn dispose(&self) {
        if self.inner.core.dispose().await {
            self.inner.shutdown.cancel();
            self.inner.items.clear();
            self.inner.dependencies.clear();
            info!(backend = BACKEND_NAME, "memory caching backend disposed");
        }
    }

    fn is_disposed(&self) -> bool {
        self.inner.core.is_disposed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::CacheItemConfiguration;
    use serde_json::json;

    fn item(value: Value, dependencies: &[&str]) -> CacheItem {
        CacheItem::new(value).with_dependencies(dependencies.iter().copied())
    }

    #[test]
    fn test_native_cause_mapping() {
        assert_eq!(NativeRemovalCause::StoreSpecific.reason(), CacheItemRemovedReason::Other);
        assert_eq!(
            NativeRemovalCause::DependencyChanged.reason(),
            CacheItemRemovedReason::Invalidated
        );
        assert_eq!(NativeRemovalCause::Capacity.reason(), CacheItemRemovedReason::Evicted);
        assert_eq!(NativeRemovalCause::Expired.reason(), CacheItemRemovedReason::Expired);
        assert_eq!(NativeRemovalCause::Removed.reason(), CacheItemRemovedReason::Removed);
    }

    #[tokio::test]
    async fn test_replacing_an_item_moves_its_links() {
        let backend = MemoryCachingBackend::new();
        backend.set_item("k", item(json!(1), &["a", "b"])).await.unwrap();
        backend.set_item("k", item(json!(2), &["b", "c"])).await.unwrap();

        assert!(!backend.contains_dependency("a").await.unwrap());
        assert!(backend.contains_dependency("b").await.unwrap());
        assert!(backend.contains_dependency("c").await.unwrap());
        backend.check_dependency_invariant().unwrap();
    }

    #[tokio::test]
    async fn test_eviction_of_stale_value_is_ignored() {
        let backend = MemoryCachingBackend::new();
        let mut events = backend.subscribe();
        backend.set_item("k", item(json!(1), &["old"])).await.unwrap();
        let stale = backend.inner.items.get("k").map(|e| e.value().clone()).unwrap();

        backend.set_item("k", item(json!(2), &["new"])).await.unwrap();
        backend.inner.evict("k", &stale, NativeRemovalCause::Capacity);

        assert_eq!(
            backend.get_item("k", false).await.unwrap().map(|v| v.value),
            Some(json!(2))
        );
        assert!(events.try_recv().is_err());
        backend.check_dependency_invariant().unwrap();
    }

    #[tokio::test]
    async fn test_explicit_removal_is_skipped_by_eviction_callback() {
        let backend = MemoryCachingBackend::new();
        let mut events = backend.subscribe();
        backend.inner.on_evicted("k", NativeRemovalCause::Removed);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_capacity_evicts_lowest_priority_first() {
        let backend = MemoryCachingBackend::with_config(MemoryCachingBackendConfig {
            max_items: Some(2),
            ..Default::default()
        });
        let pinned = CacheItemConfiguration::new().with_priority(CacheItemPriority::NotRemovable);
        let low = CacheItemConfiguration::new().with_priority(CacheItemPriority::Low);

        backend
            .set_item("pinned", CacheItem::new(json!(0)).with_configuration(pinned))
            .await
            .unwrap();
        backend.set_item("normal", CacheItem::new(json!(1))).await.unwrap();
        backend
            .set_item("low", CacheItem::new(json!(2)).with_configuration(low))
            .await
            .unwrap();

        assert_eq!(backend.len(), 2);
        assert!(backend.contains_item("pinned").await.unwrap());
        assert!(backend.contains_item("normal").await.unwrap());
        assert!(!backend.contains_item("low").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_expiration_is_refreshed_by_reads() {
        let backend = MemoryCachingBackend::new();
        let config = CacheItemConfiguration::new().with_sliding_expiration(Duration::from_secs(10));
        backend
            .set_item("k", CacheItem::new(json!(1)).with_configuration(config))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(backend.get_item("k", false).await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(backend.get_item("k", false).await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(backend.get_item("k", false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_with_replacement_keeps_item() {
        let backend = MemoryCachingBackend::new();
        let mut events = backend.subscribe();
        backend.set_item("k", item(json!("old"), &["d"])).await.unwrap();

        let replacement = item(json!("new"), &["e"]);
        backend.invalidate_dependency_with("d", Some(&replacement)).unwrap();

        let value = backend.get_item("k", true).await.unwrap().unwrap();
        assert_eq!(value.value, json!("new"));
        assert_eq!(value.dependencies, vec!["e".to_string()]);
        assert!(!backend.contains_dependency("d").await.unwrap());
        assert!(matches!(
            events.try_recv().unwrap(),
            BackendEvent::DependencyInvalidated { .. }
        ));
        backend.check_dependency_invariant().unwrap();
    }
}
