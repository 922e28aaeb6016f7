//! Redis pub/sub subscription feeding a background handler.
//!
//! The first subscription is established before [`RedisNotificationQueue::start`]
//! returns, retrying until the connection timeout. Afterwards a dedicated
//! task reads messages and hands each one to the handler on the queue's own
//! scheduler. When the connection drops the task resubscribes with
//! exponential backoff; only [`RedisNotificationQueue::dispose`] stops it.
//!
//! ```text
//! Redis ──PUBLISH / keyspace──▶ receive loop ──enqueue──▶ handler(notification)
//!                                   │
//!                                   └─ stream closed ─▶ backoff ─▶ resubscribe
//! ```

use std::sync::Arc;
use std::time::Duration;

use cachet_core::{BackgroundTaskScheduler, CacheError, CacheResult};
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use redis::aio::PubSub;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300); // 5 minutes max
const SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One message received from Redis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisNotification {
    pub channel: String,
    pub payload: String,
}

/// Processes received notifications.
pub type NotificationHandler = Arc<dyn Fn(RedisNotification) -> BoxFuture<'static, CacheResult<()>> + Send + Sync>;

/// Channels and patterns of one subscription.
#[derive(Debug, Clone, Default)]
pub struct Subscription {
    pub channels: Vec<String>,
    pub patterns: Vec<String>,
}

impl Subscription {
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channels.push(channel.into());
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    async fn open(&self, client: &redis::Client) -> redis::RedisResult<PubSub> {
        let mut pubsub = client.get_async_pubsub().await?;
        for channel in &self.channels {
            pubsub.subscribe(channel).await?;
        }
        for pattern in &self.patterns {
            pubsub.psubscribe(pattern).await?;
        }
        Ok(pubsub)
    }

    /// Retries until `timeout` elapses.
    async fn open_within(&self, client: &redis::Client, timeout: Duration) -> CacheResult<PubSub> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.open(client)).await {
                Ok(Ok(pubsub)) => return Ok(pubsub),
                Ok(Err(e)) => debug!(error = %e, "subscription attempt failed, retrying"),
                Err(_) => break,
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(SUBSCRIBE_RETRY_DELAY.min(remaining)).await;
        }
        Err(CacheError::timeout(format!(
            "could not subscribe to {:?} {:?} within {timeout:?}",
            self.channels, self.patterns
        )))
    }
}

/// A running subscription and the scheduler its handler runs on.
pub struct RedisNotificationQueue {
    name: String,
    scheduler: BackgroundTaskScheduler,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RedisNotificationQueue {
    /// Subscribes and starts the receive loop.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Timeout` if the subscription cannot be
    /// established within `timeout`.
    pub async fn start(
        name: impl Into<String>,
        client: redis::Client,
        subscription: Subscription,
        handler: NotificationHandler,
        timeout: Duration,
    ) -> CacheResult<Self> {
        let name = name.into();
        let pubsub = subscription.open_within(&client, timeout).await?;
        info!(
            queue = %name,
            channels = ?subscription.channels,
            patterns = ?subscription.patterns,
            "Subscribed to Redis notifications"
        );

        let scheduler = BackgroundTaskScheduler::new(format!("{name}-notifications"));
        let shutdown = CancellationToken::new();
        let receiver = Receiver {
            name: name.clone(),
            client,
            subscription,
            handler,
            scheduler: scheduler.clone(),
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(receiver.run(pubsub));

        Ok(Self {
            name,
            scheduler,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Waits until every received notification has been handled.
    pub async fn when_queue_empty(&self) {
        self.scheduler.when_queue_empty().await;
    }

    /// Number of handler invocations that failed or panicked.
    pub fn exception_count(&self) -> usize {
        self.scheduler.exception_count()
    }

    /// Stops the receive loop and drains pending handlers.
    ///
    /// Returns `false` if the receive loop had panicked.
    pub async fn dispose(&self) -> bool {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        let stopped_cleanly = match task {
            Some(task) => match task.await {
                Ok(()) => true,
                Err(e) => {
                    error!(queue = %self.name, error = %e, "notification receive loop failed");
                    !e.is_panic()
                }
            },
            None => true,
        };
        self.scheduler.dispose().await;
        stopped_cleanly
    }
}

impl Drop for RedisNotificationQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for RedisNotificationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisNotificationQueue")
            .field("name", &self.name)
            .field("scheduler", &self.scheduler)
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}

struct Receiver {
    name: String,
    client: redis::Client,
    subscription: Subscription,
    handler: NotificationHandler,
    scheduler: BackgroundTaskScheduler,
    shutdown: CancellationToken,
}

impl Receiver {
    async fn run(self, mut pubsub: PubSub) {
        loop {
            if !self.drain(&mut pubsub).await {
                return;
            }
            warn!(queue = %self.name, "Redis pub/sub stream ended, reconnecting");
            match self.reconnect().await {
                Some(fresh) => pubsub = fresh,
                None => return,
            }
        }
    }

    /// Forwards messages until the stream ends. Returns `false` on shutdown.
    async fn drain(&self, pubsub: &mut PubSub) -> bool {
        let mut stream = pubsub.on_message();
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                message = stream.next() => message,
            };
            let Some(message) = message else {
                return true;
            };

            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(queue = %self.name, error = %e, "failed to read notification payload");
                    continue;
                }
            };
            let notification = RedisNotification {
                channel: message.get_channel_name().to_string(),
                payload,
            };
            self.scheduler.enqueue((self.handler)(notification));
        }
    }

    async fn reconnect(&self) -> Option<PubSub> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(backoff) => {}
            }
            match self.subscription.open(&self.client).await {
                Ok(pubsub) => {
                    info!(queue = %self.name, "Resubscribed to Redis notifications");
                    return Some(pubsub);
                }
                Err(e) => {
                    error!(
                        queue = %self.name,
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "Redis notification subscription error, reconnecting..."
                    );
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    #[tokio::test]
    async fn test_unreachable_server_times_out() {
        let client = redis::Client::open("redis://127.0.0.1:1").unwrap();
        let handler: NotificationHandler = Arc::new(|_: RedisNotification| async { Ok::<_, CacheError>(()) }.boxed());
        let started = std::time::Instant::now();

        let err = RedisNotificationQueue::start(
            "test",
            client,
            Subscription::default().channel("events"),
            handler,
            Duration::from_millis(500),
        )
        .await
        .unwrap_err();

        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
