//! Redis backend with dependency tracking.
//!
//! Besides the value, every item stores the set of its dependencies under
//! `<prefix>:dependencies:<key>`, and every dependency stores the set of
//! items depending on it under `<prefix>:dependency:<dependency>`. Both sides
//! are updated together in optimistic transactions watching the item's
//! dependency set.
//!
//! Dependency sets do not expire with their value. A
//! [`RedisDependencyGarbageCollector`](crate::RedisDependencyGarbageCollector)
//! must run against the same database to clean them up.

use std::collections::HashSet;

use async_trait::async_trait;
use cachet_core::{
    BackendEvent, CacheError, CacheItem, CacheResult, CacheValue, CachingBackend, CachingBackendFeatures,
};
use deadpool_redis::Connection;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{RedisCachingBackend, RedisInner, set_command};
use crate::config::RedisCachingBackendConfig;
use crate::connection::{RedisConnection, redis_error};
use crate::events::RedisEventKind;

/// Runs `EXEC` of an atomic pipeline. `None` means a watched key changed.
pub(crate) async fn exec<T: redis::FromRedisValue>(
    conn: &mut Connection,
    pipe: &redis::Pipeline,
) -> CacheResult<Option<T>> {
    pipe.query_async(conn).await.map_err(redis_error)
}

pub(crate) async fn watch<K: redis::ToRedisArgs>(conn: &mut Connection, keys: K) -> CacheResult<()> {
    let _: () = redis::cmd("WATCH").arg(keys).query_async(conn).await.map_err(redis_error)?;
    Ok(())
}

pub(crate) async fn unwatch(conn: &mut Connection) {
    let result: redis::RedisResult<()> = redis::cmd("UNWATCH").query_async(conn).await;
    if let Err(e) = result {
        debug!(error = %e, "UNWATCH failed");
    }
}

pub(crate) async fn members(conn: &mut Connection, set_key: &str) -> CacheResult<Vec<String>> {
    redis::cmd("SMEMBERS")
        .arg(set_key)
        .query_async(conn)
        .await
        .map_err(redis_error)
}

/// Outcome of [`DependenciesRedisCachingBackend::remove_with_links`].
enum Removal {
    /// `DEL` result of the value key.
    Deleted(i64),
    /// The item no longer declares the dependency; only the stale reverse
    /// link was dropped.
    Unlinked,
}

/// Redis backend supporting `invalidate_dependency` and
/// `contains_dependency`. `clear` is not supported.
#[derive(Clone)]
pub struct DependenciesRedisCachingBackend {
    base: RedisCachingBackend,
}

impl DependenciesRedisCachingBackend {
    /// Creates a backend and subscribes to its notifications.
    ///
    /// # Errors
    ///
    /// Same as [`RedisCachingBackend::create`].
    pub async fn create(connection: RedisConnection, config: RedisCachingBackendConfig) -> CacheResult<Self> {
        let base = RedisCachingBackend::create(connection, config.with_dependencies(true)).await?;
        Ok(Self { base })
    }

    pub(crate) fn from_base(base: RedisCachingBackend) -> Self {
        Self { base }
    }

    pub fn config(&self) -> &RedisCachingBackendConfig {
        self.base.config()
    }

    pub fn connection(&self) -> &RedisConnection {
        self.base.connection()
    }

    fn inner(&self) -> &RedisInner {
        &self.base.inner
    }

    fn max_retries(&self) -> u32 {
        self.inner().config.transaction_max_retries
    }

    /// Deletes `key` and its links in one transaction.
    ///
    /// With `only_if` set, the item is deleted only while it still declares
    /// that dependency; otherwise the reverse link from that dependency to
    /// `key` is removed instead, so a concurrent re-set keeps its own links.
    async fn remove_with_links(&self, key: &str, only_if: Option<&str>) -> CacheResult<Removal> {
        let inner = self.inner();
        let value_key = inner.keys.value_key(key);
        let dependencies_key = inner.keys.dependencies_key(key);
        let mut conn = inner.connection.get().await?;

        for attempt in 1..=self.max_retries() {
            watch(&mut conn, &dependencies_key).await?;
            let dependencies = match members(&mut conn, &dependencies_key).await {
                Ok(dependencies) => dependencies,
                Err(e) => {
                    unwatch(&mut conn).await;
                    return Err(e);
                }
            };

            let mut pipe = redis::pipe();
            pipe.atomic();
            let declared = only_if.is_none_or(|dependency| dependencies.iter().any(|d| d == dependency));
            if declared {
                pipe.del(&value_key).del(&dependencies_key).ignore();
                for dependency in &dependencies {
                    pipe.srem(inner.keys.dependency_key(dependency), key).ignore();
                }
            } else if let Some(dependency) = only_if {
                pipe.srem(inner.keys.dependency_key(dependency), key).ignore();
            }

            match exec::<Vec<i64>>(&mut conn, &pipe).await? {
                Some(replies) if declared => {
                    return Ok(Removal::Deleted(replies.first().copied().unwrap_or(0)));
                }
                Some(_) => return Ok(Removal::Unlinked),
                None => debug!(key = %key, attempt, "removal transaction conflicted, retrying"),
            }
        }
        Err(CacheError::transaction_conflict(key, self.max_retries()))
    }
}

#[async_trait]
impl CachingBackend for DependenciesRedisCachingBackend {
    fn id(&self) -> Uuid {
        self.base.id()
    }

    fn backend_name(&self) -> &str {
        self.base.backend_name()
    }

    fn features(&self) -> CachingBackendFeatures {
        self.base.base_features().with_dependencies(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.base.subscribe()
    }

    async fn set_item(&self, key: &str, item: CacheItem) -> CacheResult<()> {
        let inner = self.inner();
        inner.core.ensure_active()?;
        let payload = inner.encode_payload(&item)?;
        let expiry = inner.expiry(&item);
        let value_key = inner.keys.value_key(key);
        let dependencies_key = inner.keys.dependencies_key(key);
        let declared: HashSet<&str> = item.dependencies.iter().map(String::as_str).collect();

        let mut conn = inner.connection.get().await?;
        for attempt in 1..=self.max_retries() {
            watch(&mut conn, &dependencies_key).await?;
            let previous = match members(&mut conn, &dependencies_key).await {
                Ok(previous) => previous,
                Err(e) => {
                    unwatch(&mut conn).await;
                    return Err(e);
                }
            };

            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.add_command(set_command(&value_key, &payload, expiry)).ignore();
            pipe.del(&dependencies_key).ignore();
            if !item.dependencies.is_empty() {
                pipe.sadd(&dependencies_key, &item.dependencies).ignore();
            }
            for stale in previous.iter().filter(|d| !declared.contains(d.as_str())) {
                pipe.srem(inner.keys.dependency_key(stale), key).ignore();
            }
            for dependency in &item.dependencies {
                pipe.sadd(inner.keys.dependency_key(dependency), key).ignore();
            }

            if exec::<redis::Value>(&mut conn, &pipe).await?.is_some() {
                return Ok(());
            }
            debug!(key = %key, attempt, "set transaction conflicted, retrying");
        }
        Err(CacheError::transaction_conflict(key, self.max_retries()))
    }

    async fn get_item(&self, key: &str, include_dependencies: bool) -> CacheResult<Option<CacheValue>> {
        let inner = self.inner();
        inner.core.ensure_active()?;
        let Some(value) = inner.read_value(key).await? else {
            return Ok(None);
        };

        let dependencies = if include_dependencies {
            let mut conn = inner.connection.get().await?;
            let mut dependencies = members(&mut conn, &inner.keys.dependencies_key(key)).await?;
            dependencies.sort();
            dependencies
        } else {
            Vec::new()
        };
        Ok(Some(CacheValue::new(value, dependencies)))
    }

    async fn contains_item(&self, key: &str) -> CacheResult<bool> {
        self.base.contains_item(key).await
    }

    async fn remove_item(&self, key: &str) -> CacheResult<()> {
        self.inner().core.ensure_active()?;
        if let Removal::Deleted(deleted) = self.remove_with_links(key, None).await?
            && deleted > 0
        {
            self.inner().send_event(RedisEventKind::ItemRemoved, key).await?;
        }
        Ok(())
    }

    async fn invalidate_dependency(&self, key: &str) -> CacheResult<()> {
        let inner = self.inner();
        inner.core.ensure_active()?;
        let dependency_key = inner.keys.dependency_key(key);

        // Items linked after this snapshot keep their links; the set
        // disappears once its last member is removed.
        let dependents = {
            let mut conn = inner.connection.get().await?;
            members(&mut conn, &dependency_key).await?
        };
        for item in dependents {
            if let Removal::Deleted(deleted) = self.remove_with_links(&item, Some(key)).await?
                && deleted > 0
            {
                inner.send_event(RedisEventKind::ItemInvalidated, &item).await?;
            }
        }
        inner.send_event(RedisEventKind::DependencyInvalidated, key).await
    }

    async fn contains_dependency(&self, key: &str) -> CacheResult<bool> {
        let inner = self.inner();
        inner.core.ensure_active()?;
        let mut conn = inner.connection.get().await?;
        let exists: bool = redis::cmd("EXISTS")
            .arg(inner.keys.dependency_key(key))
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(exists)
    }

    async fn clear(&self) -> CacheResult<()> {
        Err(self.inner().core.not_supported("clear"))
    }

    async fn when_background_tasks_completed(&self) {
        self.base.when_background_tasks_completed().await;
    }

    fn background_task_exceptions(&self) -> usize {
        self.base.background_task_exceptions()
    }

    async fn dispose(&self) {
        self.base.dispose().await;
    }

    fn is_disposed(&self) -> bool {
        self.base.is_disposed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::RedisNotification;
    use cachet_core::CacheItemRemovedReason;
    use std::time::Duration;

    fn offline_backend() -> DependenciesRedisCachingBackend {
        let connection = RedisConnection::open("redis://127.0.0.1:1", -1, 2, Duration::from_millis(100)).unwrap();
        let config = RedisCachingBackendConfig::default()
            .with_key_prefix("app")
            .with_dependencies(true);
        DependenciesRedisCachingBackend::from_base(RedisCachingBackend::new_uninitialized(connection, config))
    }

    #[tokio::test]
    async fn test_dependency_events_are_handled() {
        let backend = offline_backend();
        let mut events = backend.subscribe();
        let peer = Uuid::new_v4();

        backend.base.inject_notification(&RedisNotification {
            channel: "app:events".to_string(),
            payload: format!("item-invalidated:{peer}:report:7"),
        });
        backend.base.inject_notification(&RedisNotification {
            channel: "app:events".to_string(),
            payload: format!("dependency-invalidated:{peer}:tenant:42"),
        });

        assert_eq!(
            events.try_recv().unwrap(),
            BackendEvent::item_removed("report:7", CacheItemRemovedReason::Invalidated, peer)
        );
        assert_eq!(
            events.try_recv().unwrap(),
            BackendEvent::dependency_invalidated("tenant:42", peer)
        );
    }

    #[tokio::test]
    async fn test_features_and_clear() {
        let backend = offline_backend();
        let features = backend.features();
        assert!(features.dependencies);
        assert!(features.contains_dependency);
        assert!(!features.clear);
        assert_eq!(backend.backend_name(), "redis-dependencies");
        assert!(backend.clear().await.unwrap_err().is_not_supported());
    }

    #[tokio::test]
    async fn test_operations_after_dispose_fail() {
        let backend = offline_backend();
        backend.dispose().await;
        assert!(backend.is_disposed());
        assert!(backend.set_item("k", CacheItem::new(serde_json::json!(1))).await.unwrap_err().is_disposed());
        assert!(backend.invalidate_dependency("d").await.unwrap_err().is_disposed());
    }
}
