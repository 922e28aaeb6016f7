//! Distributed invalidation relay.
//!
//! [`CacheInvalidator`] wraps a local backend. Local removals and dependency
//! invalidations are applied to the wrapped backend first, then published on
//! an [`InvalidationTransport`] in the background. Messages received from
//! peers are applied to the wrapped backend directly, so they are never
//! published again; messages carrying our own source id are dropped.
//!
//! ```text
//! Instance A: invalidator.remove_item("k")
//!   ↓ local remove, then (background) send "app:item:<A>:k"
//! Transport
//!   ↓
//! Instance B: underlying.remove_item("k")
//! Instance A: echo of <A>, dropped
//! ```

mod message;
mod transport;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BackendCore, CachingBackend, DynBackend};
use crate::error::CacheResult;
use crate::events::BackendEvent;
use crate::features::CachingBackendFeatures;
use crate::item::{CacheItem, CacheValue};

pub use message::{InvalidationKind, InvalidationMessage, MalformedMessage, parse_message};
pub use transport::{InProcessBus, InProcessTransport, InvalidationTransport, MessageSink};

/// Default namespace of invalidation messages.
pub const DEFAULT_INVALIDATION_PREFIX: &str = "invalidation";

#[derive(Debug, Clone)]
pub struct CacheInvalidatorOptions {
    /// Namespace shared by every instance of one application. Messages with
    /// another prefix are ignored.
    pub prefix: String,
}

impl Default for CacheInvalidatorOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_INVALIDATION_PREFIX.to_string(),
        }
    }
}

/// What happened to a received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Different prefix.
    Ignored,
    /// Rejected as malformed.
    Malformed(MalformedMessage),
    /// Sent by this instance.
    Echo,
    /// Applied to the underlying backend.
    Applied(InvalidationKind),
}

struct InvalidatorInner {
    core: BackendCore,
    underlying: DynBackend,
    transport: Arc<dyn InvalidationTransport>,
    options: CacheInvalidatorOptions,
}

impl InvalidatorInner {
    async fn handle_message(&self, raw: &str) -> CacheResult<MessageOutcome> {
        let message = match parse_message(&self.options.prefix, raw) {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(MessageOutcome::Ignored),
            Err(reason) => {
                warn!(message = %raw, reason = %reason, "dropping malformed invalidation message");
                return Ok(MessageOutcome::Malformed(reason));
            }
        };

        if message.source_id == self.underlying.id() {
            debug!(message = %raw, "skipping self-originated invalidation message");
            return Ok(MessageOutcome::Echo);
        }

        match message.kind {
            InvalidationKind::Dependency => {
                self.underlying.invalidate_dependency(&message.key).await?;
                debug!(key = %message.key, source = %message.source_id, "invalidated dependency");
            }
            InvalidationKind::Item => {
                self.underlying.remove_item(&message.key).await?;
                debug!(key = %message.key, source = %message.source_id, "removed item");
            }
        }
        Ok(MessageOutcome::Applied(message.kind))
    }

    fn publish(&self, kind: InvalidationKind, key: &str) {
        let message = InvalidationMessage::new(kind, self.underlying.id(), key).encode(&self.options.prefix);
        let transport = Arc::clone(&self.transport);
        self.core.scheduler().enqueue(async move {
            debug!(message = %message, "sending invalidation message");
            transport.send_message(&message).await
        });
    }
}

/// Relays invalidations of a local backend to peer instances.
#[derive(Clone)]
pub struct CacheInvalidator {
    inner: Arc<InvalidatorInner>,
}

impl CacheInvalidator {
    /// Wraps `underlying` and subscribes to `transport`.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the subscription fails.
    pub async fn new(
        underlying: DynBackend,
        transport: Arc<dyn InvalidationTransport>,
        options: CacheInvalidatorOptions,
    ) -> CacheResult<Self> {
        let inner = Arc::new(InvalidatorInner {
            core: BackendCore::new(format!("invalidator({})", underlying.backend_name())),
            underlying,
            transport,
            options,
        });

        let weak = Arc::downgrade(&inner);
        let sink: MessageSink = Arc::new(move |message: String| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let handler = Arc::clone(&inner);
            inner.core.scheduler().enqueue(async move {
                handler.handle_message(&message).await.map(|_| ())
            });
        });
        inner.transport.subscribe(sink).await?;

        info!(prefix = %inner.options.prefix, "cache invalidator subscribed");
        Ok(Self { inner })
    }

    pub fn options(&self) -> &CacheInvalidatorOptions {
        &self.inner.options
    }

    pub fn underlying(&self) -> &DynBackend {
        &self.inner.underlying
    }

    /// Applies one received message. Malformed and foreign messages are
    /// logged and dropped, never returned as errors.
    ///
    /// # Errors
    ///
    /// Returns the underlying backend's error if applying the message fails.
    pub async fn on_message_received(&self, message: &str) -> CacheResult<MessageOutcome> {
        self.inner.handle_message(message).await
    }
}

#[async_trait]
impl CachingBackend for CacheInvalidator {
    fn id(&self) -> Uuid {
        self.inner.underlying.id()
    }

    fn backend_name(&self) -> &str {
        self.inner.core.name()
    }

    fn features(&self) -> CachingBackendFeatures {
        self.inner.underlying.features()
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.inner.underlying.subscribe()
    }

    async fn set_item(&self, key: &str, item: CacheItem) -> CacheResult<()> {
        self.inner.core.ensure_active()?;
        self.inner.underlying.set_item(key, item).await
    }

    async fn get_item(&self, key: &str, include_dependencies: bool) -> CacheResult<Option<CacheValue>> {
        self.inner.core.ensure_active()?;
        self.inner.underlying.get_item(key, include_dependencies).await
    }

    async fn contains_item(&self, key: &str) -> CacheResult<bool> {
        self.inner.core.ensure_active()?;
        self.inner.underlying.contains_item(key).await
    }

    async fn remove_item(&self, key: &str) -> CacheResult<()> {
        self.inner.core.ensure_active()?;
        self.inner.underlying.remove_item(key).await?;
        self.inner.publish(InvalidationKind::Item, key);
        Ok(())
    }

    async fn invalidate_dependency(&self, key: &str) -> CacheResult<()> {
        self.inner.core.ensure_active()?;
        self.inner.underlying.invalidate_dependency(key).await?;
        self.inner.publish(InvalidationKind::Dependency, key);
        Ok(())
    }

    async fn contains_dependency(&self, key: &str) -> CacheResult<bool> {
        self.inner.core.ensure_active()?;
        self.inner.underlying.contains_dependency(key).await
    }

    async fn clear(&self) -> CacheResult<()> {
        self.inner.core.ensure_active()?;
        self.inner.underlying.clear().await
    }

    async fn when_background_tasks_completed(&self) {
        self.inner.core.scheduler().when_queue_empty().await;
        self.inner.underlying.when_background_tasks_completed().await;
    }

    fn background_task_exceptions(&self) -> usize {
        self.inner.core.scheduler().exception_count() + self.inner.underlying.background_task_exceptions()
    }

    async fn dispose(&self) {
        if self.inner.core.dispose().await {
            self.inner.transport.close().await;
            self.inner.underlying.dispose().await;
        }
    }

    fn is_disposed(&self) -> bool {
        self.inner.core.is_disposed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CacheItemRemovedReason;
    use crate::error::CacheError;
    use crate::memory::MemoryCachingBackend;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl InvalidationTransport for RecordingTransport {
        async fn send_message(&self, message: &str) -> CacheResult<()> {
            if self.fail {
                return Err(CacheError::transport("bus down"));
            }
            self.sent.lock().push(message.to_string());
            Ok(())
        }
    }

    async fn invalidator(transport: Arc<RecordingTransport>) -> (CacheInvalidator, Arc<MemoryCachingBackend>) {
        let memory = Arc::new(MemoryCachingBackend::new());
        let invalidator = CacheInvalidator::new(memory.clone(), transport, CacheInvalidatorOptions::default())
            .await
            .unwrap();
        (invalidator, memory)
    }

    #[tokio::test]
    async fn test_local_removal_is_published_after_delegation() {
        let transport = Arc::new(RecordingTransport::default());
        let (invalidator, memory) = invalidator(transport.clone()).await;
        memory.set_item("k", CacheItem::new(json!(1))).await.unwrap();

        invalidator.remove_item("k").await.unwrap();
        assert!(!memory.contains_item("k").await.unwrap());

        invalidator.when_background_tasks_completed().await;
        assert_eq!(
            *transport.sent.lock(),
            vec![format!("invalidation:item:{}:k", memory.id())]
        );
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_fail_local_mutation() {
        let transport = Arc::new(RecordingTransport {
            fail: true,
            ..Default::default()
        });
        let (invalidator, _memory) = invalidator(transport).await;

        invalidator.invalidate_dependency("d").await.unwrap();
        invalidator.when_background_tasks_completed().await;
        assert_eq!(invalidator.background_task_exceptions(), 1);
    }

    #[tokio::test]
    async fn test_own_echo_is_not_applied() {
        let transport = Arc::new(RecordingTransport::default());
        let (invalidator, memory) = invalidator(transport.clone()).await;
        let mut events = memory.subscribe();
        memory.set_item("k", CacheItem::new(json!(1))).await.unwrap();

        let echo = format!("invalidation:item:{}:k", memory.id());
        let outcome = invalidator.on_message_received(&echo).await.unwrap();

        assert_eq!(outcome, MessageOutcome::Echo);
        assert!(memory.contains_item("k").await.unwrap());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_peer_messages_are_applied() {
        let transport = Arc::new(RecordingTransport::default());
        let (invalidator, memory) = invalidator(transport.clone()).await;
        let mut events = memory.subscribe();
        memory
            .set_item("k", CacheItem::new(json!(1)).with_dependencies(["d"]))
            .await
            .unwrap();

        let peer = Uuid::new_v4();
        let outcome = invalidator
            .on_message_received(&format!("invalidation:dependency:{peer}:d"))
            .await
            .unwrap();

        assert_eq!(outcome, MessageOutcome::Applied(InvalidationKind::Dependency));
        assert!(!memory.contains_item("k").await.unwrap());
        assert_eq!(
            events.recv().await.unwrap(),
            BackendEvent::item_removed("k", CacheItemRemovedReason::Invalidated, memory.id())
        );

        invalidator.when_background_tasks_completed().await;
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let transport = Arc::new(RecordingTransport::default());
        let (invalidator, memory) = invalidator(transport).await;
        memory.set_item("somekey", CacheItem::new(json!(1))).await.unwrap();

        let outcome = invalidator
            .on_message_received("item-removed:not-a-guid:somekey")
            .await
            .unwrap();
        assert_eq!(outcome, MessageOutcome::Ignored);

        let outcome = invalidator
            .on_message_received("invalidation:item:not-a-guid:somekey")
            .await
            .unwrap();
        assert!(matches!(outcome, MessageOutcome::Malformed(_)));
        assert!(memory.contains_item("somekey").await.unwrap());
    }
}
