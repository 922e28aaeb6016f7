//! Pub/sub transports for invalidation messages.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};

/// Receives every message delivered by a transport.
pub type MessageSink = Arc<dyn Fn(String) + Send + Sync>;

/// A message bus carrying invalidation messages between instances.
///
/// Only [`send_message`](Self::send_message) is required. Transports that
/// can receive implement [`subscribe`](Self::subscribe); framing, parsing and
/// echo filtering are done by the invalidator.
#[async_trait]
pub trait InvalidationTransport: Send + Sync {
    /// # Errors
    ///
    /// Returns `CacheError::Transport` if the message could not be sent.
    async fn send_message(&self, message: &str) -> CacheResult<()>;

    /// Starts delivering received messages to `sink` until
    /// [`close`](Self::close).
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established.
    async fn subscribe(&self, sink: MessageSink) -> CacheResult<()> {
        let _ = sink;
        Ok(())
    }

    async fn close(&self) {}
}

/// An in-process message bus. Every transport connected to the same bus
/// receives every message, including its own.
#[derive(Clone, Debug)]
pub struct InProcessBus {
    sender: broadcast::Sender<String>,
}

impl InProcessBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    pub fn connect(&self) -> InProcessTransport {
        InProcessTransport {
            sender: self.sender.clone(),
            shutdown: CancellationToken::new(),
        }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One connection to an [`InProcessBus`].
#[derive(Debug)]
pub struct InProcessTransport {
    sender: broadcast::Sender<String>,
    shutdown: CancellationToken,
}

#[async_trait]
impl InvalidationTransport for InProcessTransport {
    async fn send_message(&self, message: &str) -> CacheResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(CacheError::transport("in-process transport is closed"));
        }
        let receivers = self.sender.send(message.to_string()).unwrap_or_default();
        debug!(receivers, "published invalidation message");
        Ok(())
    }

    async fn subscribe(&self, sink: MessageSink) -> CacheResult<()> {
        let mut receiver = self.sender.subscribe();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = receiver.recv() => message,
                };
                match message {
                    Ok(message) => sink(message),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "in-process invalidation receiver lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }
}
