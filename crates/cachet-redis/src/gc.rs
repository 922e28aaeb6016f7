//! Dependency garbage collection for [`DependenciesRedisCachingBackend`](crate::DependenciesRedisCachingBackend).
//!
//! When a value key expires or is evicted, Redis leaves its dependency sets
//! behind. The collector listens to keyspace notifications of value keys and
//! removes the item's dependency set and its membership in every
//! `<prefix>:dependency:*` set. [`perform_full_collection`](RedisDependencyGarbageCollector::perform_full_collection)
//! does the same for every orphaned item found by `SCAN`, which covers
//! notifications missed while no collector was running.
//!
//! Keyspace notifications must be enabled on the server, see
//! [`enable_keyspace_notifications`].

use std::sync::Arc;

use cachet_core::{CacheError, CacheResult};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::RedisCachingBackendConfig;
use crate::connection::{RedisConnection, redis_error};
use crate::dependencies::{exec, members, unwatch, watch};
use crate::keys::{DEPENDENCIES_KIND, RedisKeyBuilder, VALUE_KIND};
use crate::notifications::{NotificationHandler, RedisNotification, RedisNotificationQueue, Subscription};

/// Keyspace events the collector relies on: keyspace channel, expired and
/// evicted.
const REQUIRED_KEYSPACE_EVENTS: &str = "Kxe";

const SCAN_BATCH: usize = 256;

/// Adds the keyspace events the collector needs to the server's
/// `notify-keyspace-events`, keeping the flags already set.
///
/// # Errors
///
/// Returns `CacheError::Connection` if the configuration cannot be read or
/// written (managed Redis offerings often forbid `CONFIG`).
pub async fn enable_keyspace_notifications(connection: &RedisConnection) -> CacheResult<()> {
    let mut conn = connection.get().await?;
    let current: Vec<String> = redis::cmd("CONFIG")
        .arg("GET")
        .arg("notify-keyspace-events")
        .query_async(&mut conn)
        .await
        .map_err(redis_error)?;

    let mut flags = current.get(1).cloned().unwrap_or_default();
    let before = flags.clone();
    for flag in REQUIRED_KEYSPACE_EVENTS.chars() {
        // `A` is an alias covering `x` and `e`.
        let covered = flags.contains(flag) || (flag != 'K' && flags.contains('A'));
        if !covered {
            flags.push(flag);
        }
    }
    if flags == before {
        return Ok(());
    }

    let _: () = redis::cmd("CONFIG")
        .arg("SET")
        .arg("notify-keyspace-events")
        .arg(&flags)
        .query_async(&mut conn)
        .await
        .map_err(redis_error)?;
    info!(flags = %flags, "Enabled Redis keyspace notifications");
    Ok(())
}

struct CollectorInner {
    connection: RedisConnection,
    keys: RedisKeyBuilder,
    max_retries: u32,
}

impl CollectorInner {
    /// Removes the links of `key` if its value is gone. Returns whether
    /// anything was removed.
    async fn collect_item(&self, key: &str) -> CacheResult<bool> {
        let value_key = self.keys.value_key(key);
        let dependencies_key = self.keys.dependencies_key(key);
        let mut conn = self.connection.get().await?;

        for attempt in 1..=self.max_retries {
            watch(&mut conn, vec![value_key.as_str(), dependencies_key.as_str()]).await?;
            let exists: bool = match redis::cmd("EXISTS").arg(&value_key).query_async(&mut conn).await {
                Ok(exists) => exists,
                Err(e) => {
                    unwatch(&mut conn).await;
                    return Err(redis_error(e));
                }
            };
            let dependencies = if exists {
                Vec::new()
            } else {
                match members(&mut conn, &dependencies_key).await {
                    Ok(dependencies) => dependencies,
                    Err(e) => {
                        unwatch(&mut conn).await;
                        return Err(e);
                    }
                }
            };
            if dependencies.is_empty() {
                unwatch(&mut conn).await;
                return Ok(false);
            }

            let mut pipe = redis::pipe();
            pipe.atomic().del(&dependencies_key).ignore();
            for dependency in &dependencies {
                pipe.srem(self.keys.dependency_key(dependency), key).ignore();
            }
            if exec::<redis::Value>(&mut conn, &pipe).await?.is_some() {
                debug!(key = %key, dependencies = dependencies.len(), "collected dependency links");
                return Ok(true);
            }
            debug!(key = %key, attempt, "collection transaction conflicted, retrying");
        }
        Err(CacheError::transaction_conflict(key, self.max_retries))
    }

    async fn process_notification(&self, notification: RedisNotification) -> CacheResult<()> {
        let Some((kind, key)) = self.keys.parse_keyspace_channel(&notification.channel) else {
            return Ok(());
        };
        if kind != VALUE_KIND || !matches!(notification.payload.as_str(), "expired" | "evicted") {
            return Ok(());
        }
        self.collect_item(key).await.map(|_| ())
    }
}

/// Cleans up dependency links left behind by expired or evicted items.
pub struct RedisDependencyGarbageCollector {
    inner: Arc<CollectorInner>,
    queue: Mutex<Option<Arc<RedisNotificationQueue>>>,
}

impl RedisDependencyGarbageCollector {
    /// Subscribes to keyspace notifications of the value keys of
    /// `config.key_prefix`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Configuration` for an invalid configuration and
    /// `CacheError::Timeout` if the subscription cannot be established within
    /// `connection_timeout`.
    pub async fn create(connection: RedisConnection, config: &RedisCachingBackendConfig) -> CacheResult<Self> {
        config.validate()?;
        let inner = Arc::new(CollectorInner {
            keys: RedisKeyBuilder::new(config.key_prefix.clone()),
            max_retries: config.transaction_max_retries,
            connection,
        });

        let weak = Arc::downgrade(&inner);
        let handler: NotificationHandler = Arc::new(move |notification: RedisNotification| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.process_notification(notification).await,
                    None => Ok(()),
                }
            }
            .boxed()
        });
        let queue = RedisNotificationQueue::start(
            "redis-dependency-gc",
            inner.connection.client().clone(),
            Subscription::default().pattern(inner.keys.keyspace_pattern()),
            handler,
            config.connection_timeout,
        )
        .await?;

        info!(prefix = %inner.keys.prefix(), "Redis dependency garbage collector started");
        Ok(Self {
            inner,
            queue: Mutex::new(Some(Arc::new(queue))),
        })
    }

    /// Scans every item dependency set and collects the ones whose value is
    /// gone. Returns the number of items collected.
    ///
    /// # Errors
    ///
    /// Returns the first Redis error encountered.
    pub async fn perform_full_collection(&self) -> CacheResult<usize> {
        let pattern = self.inner.keys.scan_pattern(DEPENDENCIES_KIND);
        let mut keys = Vec::new();
        {
            let mut conn = self.inner.connection.get().await?;
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await
                    .map_err(redis_error)?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
        }

        let mut collected = 0;
        for full_key in &keys {
            let Some((_, key)) = self.inner.keys.parse_key(full_key) else {
                continue;
            };
            if self.inner.collect_item(key).await? {
                collected += 1;
            }
        }
        info!(scanned = keys.len(), collected, "Full dependency collection finished");
        Ok(collected)
    }

    /// Waits until every received notification has been processed.
    pub async fn when_queue_empty(&self) {
        let queue = self.queue.lock().clone();
        if let Some(queue) = queue {
            queue.when_queue_empty().await;
        }
    }

    /// Number of notifications whose processing failed.
    pub fn exception_count(&self) -> usize {
        self.queue
            .lock()
            .as_ref()
            .map(|queue| queue.exception_count())
            .unwrap_or_default()
    }

    /// Stops listening. Idempotent.
    pub async fn dispose(&self) {
        let queue = self.queue.lock().take();
        if let Some(queue) = queue {
            queue.dispose().await;
            info!(prefix = %self.inner.keys.prefix(), "Redis dependency garbage collector disposed");
        }
    }
}

impl std::fmt::Debug for RedisDependencyGarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDependencyGarbageCollector")
            .field("prefix", &self.inner.keys.prefix())
            .field("running", &self.queue.lock().is_some())
            .finish()
    }
}
