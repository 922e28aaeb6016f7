//! Invalidation transport over a Redis pub/sub channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cachet_core::invalidation::{InvalidationTransport, MessageSink};
use cachet_core::{CacheError, CacheResult};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::DEFAULT_CONNECTION_TIMEOUT;
use crate::connection::RedisConnection;
use crate::notifications::{NotificationHandler, RedisNotification, RedisNotificationQueue, Subscription};

/// Default channel of invalidation messages.
pub const DEFAULT_INVALIDATION_CHANNEL: &str = "cache-invalidation";

/// Publishes invalidation messages on one channel and delivers the messages
/// received on it, including our own.
pub struct RedisInvalidationTransport {
    connection: RedisConnection,
    channel: String,
    connection_timeout: Duration,
    queue: Mutex<Option<Arc<RedisNotificationQueue>>>,
}

impl RedisInvalidationTransport {
    pub fn new(connection: RedisConnection, channel: impl Into<String>) -> Self {
        Self {
            connection,
            channel: channel.into(),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            queue: Mutex::new(None),
        }
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits until every received message has been handed to the sink.
    pub async fn when_queue_empty(&self) {
        let queue = self.queue.lock().clone();
        if let Some(queue) = queue {
            queue.when_queue_empty().await;
        }
    }
}

#[async_trait]
impl InvalidationTransport for RedisInvalidationTransport {
    async fn send_message(&self, message: &str) -> CacheResult<()> {
        let mut conn = self
            .connection
            .get()
            .await
            .map_err(|e| CacheError::transport(e.to_string()))?;
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(message)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::transport(format!("failed to publish on '{}': {e}", self.channel)))?;
        debug!(channel = %self.channel, receivers, "published invalidation message");
        Ok(())
    }

    async fn subscribe(&self, sink: MessageSink) -> CacheResult<()> {
        if self.queue.lock().is_some() {
            return Err(CacheError::invalid_operation("the transport is already subscribed"));
        }

        let handler: NotificationHandler = Arc::new(move |notification: RedisNotification| {
            sink(notification.payload);
            async { Ok::<_, CacheError>(()) }.boxed()
        });
        let queue = RedisNotificationQueue::start(
            format!("invalidation:{}", self.channel),
            self.connection.client().clone(),
            Subscription::default().channel(&self.channel),
            handler,
            self.connection_timeout,
        )
        .await?;

        let queue = Arc::new(queue);
        let raced = {
            let mut slot = self.queue.lock();
            match *slot {
                Some(_) => true,
                None => {
                    *slot = Some(queue.clone());
                    false
                }
            }
        };
        if raced {
            queue.dispose().await;
            return Err(CacheError::invalid_operation("the transport is already subscribed"));
        }
        Ok(())
    }

    async fn close(&self) {
        let queue = self.queue.lock().take();
        if let Some(queue) = queue {
            queue.dispose().await;
        }
    }
}

impl std::fmt::Debug for RedisInvalidationTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisInvalidationTransport")
            .field("channel", &self.channel)
            .field("subscribed", &self.queue.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_to_unreachable_server_is_transport_error() {
        let connection = RedisConnection::open("redis://127.0.0.1:1", -1, 1, Duration::from_millis(100)).unwrap();
        let transport = RedisInvalidationTransport::new(connection, DEFAULT_INVALIDATION_CHANNEL);
        let err = transport.send_message("app:item:x:y").await.unwrap_err();
        assert!(matches!(err, CacheError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_subscribe_to_unreachable_server_times_out() {
        let connection = RedisConnection::open("redis://127.0.0.1:1", -1, 1, Duration::from_millis(100)).unwrap();
        let transport = RedisInvalidationTransport::new(connection, "invalidation")
            .with_connection_timeout(Duration::from_millis(300));
        let sink: MessageSink = Arc::new(|_: String| {});
        assert!(transport.subscribe(sink).await.unwrap_err().is_timeout());
        transport.close().await;
    }
}
