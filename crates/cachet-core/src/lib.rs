//! # cachet-core
//!
//! Caching backends with dependency tracking for Cachet.
//!
//! ## Overview
//!
//! The main trait is [`CachingBackend`], the contract every store and every
//! enhancer implements:
//! - item storage with absolute or sliding expiration and priorities
//! - dependency tracking: invalidating a dependency key removes every item
//!   that declared it
//! - item-removed and dependency-invalidated events
//! - background work that can be awaited and counted
//!
//! This crate provides the in-process [`MemoryCachingBackend`], the
//! [`enhancers`] that wrap any backend, the [`invalidation`] relay that keeps
//! several instances consistent, and [`CachingService`], which computes
//! values on a miss and records the dependencies declared while computing.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use cachet_core::prelude::*;
//!
//! let service = CachingService::new(Arc::new(MemoryCachingBackend::new()));
//! let name: String = service
//!     .get_or_compute("user:1", &CacheItemConfiguration::new(), || async {
//!         add_dependency("tenant:42")?;
//!         Ok::<_, CacheError>(load_user_name(1).await)
//!     })
//!     .await?;
//!
//! // Drops "user:1" and everything computed from it.
//! service.invalidate("tenant:42").await?;
//! ```
//!
//! ## Stacking backends
//!
//! ```ignore
//! let remote: DynBackend = Arc::new(redis_backend);
//! let backend = TwoLayerCachingBackend::new(Arc::new(NonBlockingCachingBackend::new(remote)));
//! ```

pub mod auto_reload;
mod backend;
pub mod blocking;
pub mod context;
pub mod enhancers;
mod error;
mod events;
mod features;
pub mod invalidation;
mod item;
pub mod memory;
pub mod profiles;
mod scheduler;
pub mod serializer;
pub mod service;

// Re-export the core contract
pub use auto_reload::{AutoReloadManager, ValueProvider};
pub use backend::{BackendCore, CachingBackend, DynBackend};
pub use blocking::BlockingCachingBackend;
pub use context::{CachingContext, CachingContextKind, CachingFlow, NestedCacheRecorder, add_dependency};
pub use enhancers::{DEFAULT_LOCAL_EXPIRATION, NonBlockingCachingBackend, TwoLayerCachingBackend};
pub use error::{CacheError, CacheResult, ErrorCategory};
pub use events::{BackendEvent, BackendEventBroadcaster, CacheItemRemovedReason};
pub use features::CachingBackendFeatures;
pub use invalidation::{
    CacheInvalidator, CacheInvalidatorOptions, InProcessBus, InvalidationTransport, MessageOutcome,
};
pub use item::{CacheItem, CacheItemConfiguration, CacheItemPriority, CacheValue};
pub use memory::{MemoryCachingBackend, MemoryCachingBackendConfig};
pub use profiles::{DEFAULT_PROFILE, ProfileRegistry};
pub use scheduler::BackgroundTaskScheduler;
pub use serializer::{CachingSerializer, SerializerKind, SerializerPool};
pub use service::{CachingService, NestedCallLog};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use cachet_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::context::{CachingFlow, add_dependency};
    pub use crate::enhancers::{NonBlockingCachingBackend, TwoLayerCachingBackend};
    pub use crate::error::{CacheError, CacheResult};
    pub use crate::events::{BackendEvent, CacheItemRemovedReason};
    pub use crate::features::CachingBackendFeatures;
    pub use crate::invalidation::{CacheInvalidator, CacheInvalidatorOptions};
    pub use crate::item::{CacheItem, CacheItemConfiguration, CacheItemPriority, CacheValue};
    pub use crate::memory::MemoryCachingBackend;
    pub use crate::service::CachingService;
    pub use crate::{CachingBackend, DynBackend};
}
