//! # cachet-redis
//!
//! Redis caching backends for Cachet.
//!
//! ## Overview
//!
//! - [`RedisCachingBackend`]: values with expiration, item-removed events on
//!   `<prefix>:events`, expiration and eviction events from keyspace
//!   notifications
//! - [`DependenciesRedisCachingBackend`]: adds dependency tracking with Redis
//!   sets updated in optimistic transactions
//! - [`RedisDependencyGarbageCollector`]: removes the dependency links of
//!   expired and evicted items
//! - [`RedisInvalidationTransport`]: carries [`CacheInvalidator`](cachet_core::invalidation::CacheInvalidator)
//!   messages over a pub/sub channel
//! - [`create_redis_backend`]: builds the configured stack, optionally behind
//!   a local memory layer
//!
//! ## Key layout
//!
//! ```text
//! <prefix>:value:<key>                 serialized value
//! <prefix>:dependencies:<key>          SET of dependencies declared by <key>
//! <prefix>:dependency:<dependency>     SET of items depending on <dependency>
//! <prefix>:events                      pub/sub channel, "<kind>:<sourceId>:<key>"
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use cachet_redis::{RedisCachingBackendConfig, RedisConnection, create_redis_backend};
//!
//! let connection = RedisConnection::open("redis://localhost:6379", -1, 16, Duration::from_secs(5))?;
//! let backend = create_redis_backend(
//!     connection,
//!     RedisCachingBackendConfig::new().with_key_prefix("app").with_owns_connection(true),
//! )
//! .await?;
//! ```

mod backend;
mod config;
mod connection;
mod dependencies;
pub mod events;
mod factory;
mod gc;
pub mod keys;
pub mod notifications;
mod transport;

pub use backend::RedisCachingBackend;
pub use config::{
    DEFAULT_CONNECTION_TIMEOUT, DEFAULT_EXPIRATION, DEFAULT_KEY_PREFIX, RedisCachingBackendConfig,
};
pub use connection::RedisConnection;
pub use dependencies::DependenciesRedisCachingBackend;
pub use events::{RedisEvent, RedisEventKind};
pub use factory::{LOCALLY_CACHED_PREFIX_SUFFIX, create_redis_backend};
pub use gc::{RedisDependencyGarbageCollector, enable_keyspace_notifications};
pub use keys::RedisKeyBuilder;
pub use transport::{DEFAULT_INVALIDATION_CHANNEL, RedisInvalidationTransport};
