//! # cachet
//!
//! Builds a caching stack from configuration.
//!
//! Configuration is read from `cachet.toml` (or a given path) and overridden
//! by `CACHET__<SECTION>__<FIELD>` environment variables. Depending on it,
//! [`create_caching_backend`] returns one of:
//!
//! ```text
//! redis.enabled         -> Redis backend (see cachet_redis::create_redis_backend)
//! invalidation.enabled  -> CacheInvalidator(memory) relaying over Redis pub/sub
//! otherwise             -> memory backend
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let config = cachet::config::loader::load_config(None).map_err(anyhow::Error::msg)?;
//! cachet::observability::init_tracing_from_config(&config.logging);
//! let service = cachet::create_caching_service(&config).await?;
//! ```

pub mod config;
pub mod observability;

use std::sync::Arc;

use anyhow::Context;
use cachet_core::invalidation::{CacheInvalidator, CacheInvalidatorOptions};
use cachet_core::{CachingBackend, CachingService, DynBackend, MemoryCachingBackend, ProfileRegistry};
use cachet_redis::{RedisConnection, RedisInvalidationTransport, create_redis_backend};
use tracing::info;

pub use crate::config::CachetConfig;
pub use cachet_core;
pub use cachet_redis;

fn open_redis(config: &CachetConfig) -> anyhow::Result<RedisConnection> {
    RedisConnection::open(
        &config.redis.url,
        config.redis.database,
        config.redis.pool_size,
        config.redis.timeout(),
    )
    .with_context(|| format!("failed to open Redis connection to {}", config.redis.url))
}

/// Creates the backend selected by `config`.
pub async fn create_caching_backend(config: &CachetConfig) -> anyhow::Result<DynBackend> {
    config.validate().map_err(anyhow::Error::msg)?;

    if config.redis.enabled {
        let connection = open_redis(config)?;
        let backend = create_redis_backend(connection, config.redis.backend_config())
            .await
            .context("failed to create Redis caching backend")?;
        info!(backend = %backend.backend_name(), "Caching backend ready");
        return Ok(backend);
    }

    let memory: DynBackend = Arc::new(MemoryCachingBackend::with_config(config.memory.backend_config()));
    if !config.invalidation.enabled {
        info!(backend = %memory.backend_name(), "Caching backend ready");
        return Ok(memory);
    }

    let transport = RedisInvalidationTransport::new(open_redis(config)?, &config.invalidation.channel)
        .with_connection_timeout(config.redis.connection_timeout());
    let invalidator = CacheInvalidator::new(
        memory,
        Arc::new(transport),
        CacheInvalidatorOptions {
            prefix: config.invalidation.prefix.clone(),
        },
    )
    .await
    .context("failed to subscribe the cache invalidator")?;
    info!(
        channel = %config.invalidation.channel,
        prefix = %config.invalidation.prefix,
        "Caching backend ready with invalidation relay"
    );
    Ok(Arc::new(invalidator))
}

/// Creates the backend and a [`CachingService`] with the configured
/// profiles.
pub async fn create_caching_service(config: &CachetConfig) -> anyhow::Result<CachingService> {
    let backend = create_caching_backend(config).await?;
    let profiles = ProfileRegistry::new();
    for (name, profile) in &config.profiles {
        profiles.register(name.clone(), profile.to_configuration());
    }
    Ok(CachingService::with_profiles(backend, Arc::new(profiles)))
}
