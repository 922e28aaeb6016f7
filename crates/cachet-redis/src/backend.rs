//! Redis caching backend without dependency support.
//!
//! Values live under `<prefix>:value:<key>`. Removals are announced on
//! `<prefix>:events` as `item-removed:<id>:<key>`; every instance, the sender
//! included, turns received events into item-removed events. Expirations
//! and evictions are picked up from keyspace notifications and carry the nil
//! source id.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use cachet_core::serializer::SerializerPool;
use cachet_core::{
    BackendCore, BackendEvent, CacheError, CacheItem, CacheItemConfiguration, CacheItemPriority,
    CacheItemRemovedReason, CacheResult, CacheValue, CachingBackend, CachingBackendFeatures,
};
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RedisCachingBackendConfig;
use crate::connection::{RedisConnection, redis_error};
use crate::events::{RedisEvent, RedisEventKind};
use crate::keys::{RedisKeyBuilder, VALUE_KIND};
use crate::notifications::{NotificationHandler, RedisNotification, RedisNotificationQueue, Subscription};

const PLAIN_HEADER: u8 = 0;
const SLIDING_HEADER: u8 = 1;

pub(crate) const BACKEND_NAME: &str = "redis";
pub(crate) const DEPENDENCIES_BACKEND_NAME: &str = "redis-dependencies";

/// Milliseconds for `PX`/`PEXPIRE`; Redis rejects zero.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Time to live of a stored item: absolute, else sliding, else none for
/// `NotRemovable`, else the default.
pub(crate) fn expiry_for(configuration: &CacheItemConfiguration, default_expiration: Duration) -> Option<Duration> {
    if let Some(absolute) = configuration.absolute_expiration {
        return Some(absolute);
    }
    if let Some(sliding) = configuration.sliding_expiration {
        return Some(sliding);
    }
    if configuration.effective_priority() == CacheItemPriority::NotRemovable {
        return None;
    }
    Some(default_expiration)
}

/// `SET key payload [PX ms]`.
pub(crate) fn set_command(value_key: &str, payload: &[u8], expiry: Option<Duration>) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(value_key).arg(payload);
    if let Some(expiry) = expiry {
        cmd.arg("PX").arg(millis(expiry));
    }
    cmd
}

pub(crate) struct RedisInner {
    pub(crate) core: BackendCore,
    pub(crate) connection: RedisConnection,
    pub(crate) keys: RedisKeyBuilder,
    pub(crate) config: RedisCachingBackendConfig,
    serializers: SerializerPool,
    notifications: OnceLock<RedisNotificationQueue>,
    teardown_failures: AtomicUsize,
}

impl RedisInner {
    fn notifications(&self) -> CacheResult<&RedisNotificationQueue> {
        self.notifications
            .get()
            .ok_or_else(|| CacheError::assertion_failed("the notification queue has not been initialized"))
    }

    /// Header byte, then the serialized value.
    pub(crate) fn encode_payload(&self, item: &CacheItem) -> CacheResult<Vec<u8>> {
        let body = self.serializers.serialize(&item.value)?;
        let mut payload = Vec::with_capacity(body.len() + 9);
        match item.configuration.sliding_expiration {
            Some(sliding) => {
                payload.push(SLIDING_HEADER);
                payload.extend_from_slice(&millis(sliding).to_be_bytes());
            }
            None => payload.push(PLAIN_HEADER),
        }
        payload.extend_from_slice(&body);
        Ok(payload)
    }

    pub(crate) fn decode_payload(&self, key: &str, payload: &[u8]) -> CacheResult<(Value, Option<Duration>)> {
        match payload.split_first() {
            Some((&PLAIN_HEADER, body)) => Ok((self.serializers.deserialize(key, body)?, None)),
            Some((&SLIDING_HEADER, rest)) if rest.len() >= 8 => {
                let (ms, body) = rest.split_at(8);
                let mut raw = [0u8; 8];
                raw.copy_from_slice(ms);
                let sliding = Duration::from_millis(u64::from_be_bytes(raw));
                Ok((self.serializers.deserialize(key, body)?, Some(sliding)))
            }
            Some((header, _)) => Err(CacheError::invalid_cache_item(
                key,
                format!("unknown payload header {header}"),
            )),
            None => Err(CacheError::invalid_cache_item(key, "empty payload")),
        }
    }

    pub(crate) fn expiry(&self, item: &CacheItem) -> Option<Duration> {
        expiry_for(&item.configuration, self.config.default_expiration)
    }

    /// Reads and decodes a value; a sliding item gets its expiration
    /// refreshed in the background.
    pub(crate) async fn read_value(&self, key: &str) -> CacheResult<Option<Value>> {
        let value_key = self.keys.value_key(key);
        let mut conn = self.connection.get().await?;
        let payload: Option<Vec<u8>> = redis::cmd("GET")
            .arg(&value_key)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        let Some(payload) = payload else {
            return Ok(None);
        };

        let (value, sliding) = self.decode_payload(key, &payload)?;
        if let Some(sliding) = sliding {
            let connection = self.connection.clone();
            self.core.scheduler().enqueue(async move {
                let mut conn = connection.get().await?;
                let _: i64 = redis::cmd("PEXPIRE")
                    .arg(&value_key)
                    .arg(millis(sliding))
                    .query_async(&mut conn)
                    .await
                    .map_err(redis_error)?;
                Ok(())
            });
        }
        Ok(Some(value))
    }

    pub(crate) async fn send_event(&self, kind: RedisEventKind, key: &str) -> CacheResult<()> {
        let channel = self.keys.events_channel();
        let message = RedisEvent::new(kind, self.core.id(), key).encode();
        debug!(message = %message, channel = %channel, "Publishing event");

        let mut conn = self.connection.get().await?;
        let _: i64 = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(&message)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    fn process_notification(&self, notification: &RedisNotification) {
        if notification.channel == self.keys.events_channel() {
            self.process_event(&notification.payload);
        } else {
            self.process_keyspace_notification(notification);
        }
    }

    fn process_event(&self, raw: &str) {
        let event = match RedisEvent::parse(raw) {
            Ok(event) => event,
            Err(reason) => {
                warn!(event = %raw, reason = %reason, "Cannot parse the event, skipping it");
                return;
            }
        };

        let dependencies = self.config.supports_dependencies;
        match event.kind {
            RedisEventKind::ItemRemoved => {
                self.core
                    .emit_item_removed(&event.key, CacheItemRemovedReason::Removed, event.source_id);
            }
            RedisEventKind::ItemInvalidated if dependencies => {
                self.core
                    .emit_item_removed(&event.key, CacheItemRemovedReason::Invalidated, event.source_id);
            }
            RedisEventKind::DependencyInvalidated if dependencies => {
                self.core.emit_dependency_invalidated(&event.key, event.source_id);
            }
            kind => debug!(kind = %kind, "event ignored"),
        }
    }

    fn process_keyspace_notification(&self, notification: &RedisNotification) {
        let Some((kind, key)) = self.keys.parse_keyspace_channel(&notification.channel) else {
            return;
        };
        if kind != VALUE_KIND {
            return;
        }
        let reason = match notification.payload.as_str() {
            "expired" => CacheItemRemovedReason::Expired,
            "evicted" => CacheItemRemovedReason::Evicted,
            _ => return,
        };
        self.core.emit_item_removed(key, reason, Uuid::nil());
    }
}

impl Drop for RedisInner {
    fn drop(&mut self) {
        if self.core.is_disposed() {
            return;
        }
        warn!(backend = %self.core.name(), "Redis backend dropped without dispose");
        if self.config.owns_connection {
            self.connection.close();
        }
    }
}

/// Redis backend storing serialized values with expiration.
///
/// `clear` and the dependency operations are not supported; see
/// [`DependenciesRedisCachingBackend`](crate::DependenciesRedisCachingBackend).
/// Call [`dispose`](CachingBackend::dispose) for a clean shutdown.
#[derive(Clone)]
pub struct RedisCachingBackend {
    pub(crate) inner: Arc<RedisInner>,
}

impl RedisCachingBackend {
    /// Creates a backend and subscribes to its notifications.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Configuration` for an invalid configuration and
    /// `CacheError::Timeout` if the subscription cannot be established within
    /// `connection_timeout`. The backend is disposed before the error is
    /// returned.
    pub async fn create(connection: RedisConnection, config: RedisCachingBackendConfig) -> CacheResult<Self> {
        config.validate()?;
        let backend = Self::new_uninitialized(connection, config);
        if let Err(e) = backend.init().await {
            backend.dispose().await;
            return Err(e);
        }
        Ok(backend)
    }

    pub(crate) fn new_uninitialized(connection: RedisConnection, config: RedisCachingBackendConfig) -> Self {
        let name = if config.supports_dependencies {
            DEPENDENCIES_BACKEND_NAME
        } else {
            BACKEND_NAME
        };
        Self {
            inner: Arc::new(RedisInner {
                core: BackendCore::new(name),
                keys: RedisKeyBuilder::new(config.key_prefix.clone()),
                serializers: SerializerPool::new(config.serializer_factory()),
                notifications: OnceLock::new(),
                teardown_failures: AtomicUsize::new(0),
                connection,
                config,
            }),
        }
    }

    pub(crate) async fn init(&self) -> CacheResult<()> {
        let weak = Arc::downgrade(&self.inner);
        let handler: NotificationHandler = Arc::new(move |notification: RedisNotification| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.process_notification(&notification);
                }
                Ok::<_, CacheError>(())
            }
            .boxed()
        });

        let subscription = Subscription::default()
            .channel(self.inner.keys.events_channel())
            .pattern(self.inner.keys.keyspace_pattern());
        let queue = RedisNotificationQueue::start(
            self.inner.core.name(),
            self.inner.connection.client().clone(),
            subscription,
            handler,
            self.inner.config.connection_timeout,
        )
        .await?;

        self.inner
            .notifications
            .set(queue)
            .map_err(|_| CacheError::assertion_failed("the notification queue was initialized twice"))?;
        info!(
            backend = %self.inner.core.name(),
            prefix = %self.inner.keys.prefix(),
            "Redis caching backend initialized"
        );
        Ok(())
    }

    pub fn config(&self) -> &RedisCachingBackendConfig {
        &self.inner.config
    }

    pub fn connection(&self) -> &RedisConnection {
        &self.inner.connection
    }

    pub fn keys(&self) -> &RedisKeyBuilder {
        &self.inner.keys
    }

    pub(crate) fn base_features(&self) -> CachingBackendFeatures {
        CachingBackendFeatures::none().with_events(self.inner.notifications.get().is_some())
    }

    /// Delivers a received notification as if it came from Redis.
    #[cfg(test)]
    pub(crate) fn inject_notification(&self, notification: &RedisNotification) {
        self.inner.process_notification(notification);
    }
}

#[async_trait]
impl CachingBackend for RedisCachingBackend {
    fn id(&self) -> Uuid {
        self.inner.core.id()
    }

    fn backend_name(&self) -> &str {
        self.inner.core.name()
    }

    fn features(&self) -> CachingBackendFeatures {
        self.base_features()
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.inner.core.events().subscribe()
    }

    async fn set_item(&self, key: &str, item: CacheItem) -> CacheResult<()> {
        self.inner.core.ensure_active()?;
        let payload = self.inner.encode_payload(&item)?;
        let expiry = self.inner.expiry(&item);

        let mut conn = self.inner.connection.get().await?;
        let _: () = set_command(&self.inner.keys.value_key(key), &payload, expiry)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    async fn get_item(&self, key: &str, _include_dependencies: bool) -> CacheResult<Option<CacheValue>> {
        self.inner.core.ensure_active()?;
        let value = self.inner.read_value(key).await?;
        Ok(value.map(|value| CacheValue::new(value, Vec::new())))
    }

    async fn contains_item(&self, key: &str) -> CacheResult<bool> {
        self.inner.core.ensure_active()?;
        let mut conn = self.inner.connection.get().await?;
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.inner.keys.value_key(key))
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(exists)
    }

    async fn remove_item(&self, key: &str) -> CacheResult<()> {
        self.inner.core.ensure_active()?;
        let mut conn = self.inner.connection.get().await?;
        let deleted: i64 = redis::cmd("DEL")
            .arg(self.inner.keys.value_key(key))
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        drop(conn);

        if deleted > 0 {
            self.inner.send_event(RedisEventKind::ItemRemoved, key).await?;
        }
        Ok(())
    }

    async fn invalidate_dependency(&self, _key: &str) -> CacheResult<()> {
        Err(self.inner.core.not_supported("invalidate_dependency"))
    }

    async fn contains_dependency(&self, _key: &str) -> CacheResult<bool> {
        Err(self.inner.core.not_supported("contains_dependency"))
    }

    async fn clear(&self) -> CacheResult<()> {
        Err(self.inner.core.not_supported("clear"))
    }

    async fn when_background_tasks_completed(&self) {
        self.inner.core.scheduler().when_queue_empty().await;
        if let Ok(queue) = self.inner.notifications() {
            queue.when_queue_empty().await;
        }
    }

    fn background_task_exceptions(&self) -> usize {
        let notifications = self
            .inner
            .notifications()
            .map(RedisNotificationQueue::exception_count)
            .unwrap_or_default();
        self.inner.core.scheduler().exception_count()
            + notifications
            + self.inner.teardown_failures.load(Ordering::Relaxed)
    }

    async fn dispose(&self) {
        if !self.inner.core.dispose().await {
            return;
        }
        if let Some(queue) = self.inner.notifications.get()
            && !queue.dispose().await
        {
            self.inner.teardown_failures.fetch_add(1, Ordering::Relaxed);
        }
        if self.inner.config.owns_connection {
            self.inner.connection.close();
        }
        info!(backend = %self.inner.core.name(), "Redis caching backend disposed");
    }

    fn is_disposed(&self) -> bool {
        self.inner.core.is_disposed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offline_backend(config: RedisCachingBackendConfig) -> RedisCachingBackend {
        let connection = RedisConnection::open("redis://127.0.0.1:1", -1, 2, Duration::from_millis(100)).unwrap();
        RedisCachingBackend::new_uninitialized(connection, config)
    }

    #[test]
    fn test_expiry_precedence() {
        let default = Duration::from_secs(60);
        let absolute = CacheItemConfiguration::new()
            .with_absolute_expiration(Duration::from_secs(5))
            .with_sliding_expiration(Duration::from_secs(9));
        assert_eq!(expiry_for(&absolute, default), Some(Duration::from_secs(5)));

        let sliding = CacheItemConfiguration::new().with_sliding_expiration(Duration::from_secs(9));
        assert_eq!(expiry_for(&sliding, default), Some(Duration::from_secs(9)));

        let pinned = CacheItemConfiguration::new().with_priority(CacheItemPriority::NotRemovable);
        assert_eq!(expiry_for(&pinned, default), None);

        assert_eq!(expiry_for(&CacheItemConfiguration::new(), default), Some(default));
    }

    #[tokio::test]
    async fn test_payload_header() {
        let backend = offline_backend(RedisCachingBackendConfig::default());
        let inner = &backend.inner;

        let plain = CacheItem::new(json!({"a": 1}));
        let bytes = inner.encode_payload(&plain).unwrap();
        assert_eq!(bytes[0], PLAIN_HEADER);
        assert_eq!(inner.decode_payload("k", &bytes).unwrap(), (json!({"a": 1}), None));

        let sliding = CacheItem::new(json!("v"))
            .with_configuration(CacheItemConfiguration::new().with_sliding_expiration(Duration::from_millis(1500)));
        let bytes = inner.encode_payload(&sliding).unwrap();
        assert_eq!(bytes[0], SLIDING_HEADER);
        assert_eq!(
            inner.decode_payload("k", &bytes).unwrap(),
            (json!("v"), Some(Duration::from_millis(1500)))
        );

        assert!(inner.decode_payload("k", &[]).unwrap_err().is_invalid_cache_item());
        assert!(inner.decode_payload("k", &[7, 1, 2]).unwrap_err().is_invalid_cache_item());
        assert!(inner.decode_payload("k", &[0, b'{']).unwrap_err().is_invalid_cache_item());
    }

    #[tokio::test]
    async fn test_events_become_item_removed_events() {
        let backend = offline_backend(RedisCachingBackendConfig::default().with_key_prefix("app"));
        let mut events = backend.subscribe();
        let peer = Uuid::new_v4();

        backend.inject_notification(&RedisNotification {
            channel: "app:events".to_string(),
            payload: format!("item-removed:{peer}:user:1"),
        });
        assert_eq!(
            events.try_recv().unwrap(),
            BackendEvent::item_removed("user:1", CacheItemRemovedReason::Removed, peer)
        );

        backend.inject_notification(&RedisNotification {
            channel: "__keyspace@0__:app:value:user:2".to_string(),
            payload: "expired".to_string(),
        });
        assert_eq!(
            events.try_recv().unwrap(),
            BackendEvent::item_removed("user:2", CacheItemRemovedReason::Expired, Uuid::nil())
        );
    }

    #[tokio::test]
    async fn test_malformed_and_foreign_notifications_are_dropped() {
        let backend = offline_backend(RedisCachingBackendConfig::default().with_key_prefix("app"));
        let mut events = backend.subscribe();
        let peer = Uuid::new_v4();

        for notification in [
            ("app:events", "item-removed:not-a-guid:somekey".to_string()),
            ("app:events", format!("item-invalidated:{peer}:k")),
            ("__keyspace@0__:app:value:k", "set".to_string()),
            ("__keyspace@0__:app:dependencies:k", "expired".to_string()),
        ] {
            backend.inject_notification(&RedisNotification {
                channel: notification.0.to_string(),
                payload: notification.1,
            });
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsupported_operations() {
        let backend = offline_backend(RedisCachingBackendConfig::default());
        assert!(backend.clear().await.unwrap_err().is_not_supported());
        assert!(backend.invalidate_dependency("d").await.unwrap_err().is_not_supported());
        assert!(backend.contains_dependency("d").await.unwrap_err().is_not_supported());
        assert!(!backend.features().events);
        assert_eq!(backend.background_task_exceptions(), 0);
    }
}
