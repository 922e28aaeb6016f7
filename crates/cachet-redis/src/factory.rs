//! Builds the backend stack described by a [`RedisCachingBackendConfig`].

use std::sync::Arc;

use cachet_core::{CacheResult, CachingBackend, DynBackend, NonBlockingCachingBackend, TwoLayerCachingBackend};
use tracing::info;

use crate::backend::RedisCachingBackend;
use crate::config::RedisCachingBackendConfig;
use crate::connection::RedisConnection;
use crate::dependencies::DependenciesRedisCachingBackend;

/// Suffix appended to the key prefix of a Redis layer behind a local cache,
/// so it never shares keys with a directly used backend.
pub const LOCALLY_CACHED_PREFIX_SUFFIX: &str = "L2";

/// Creates the Redis backend for `config`:
///
/// | `supports_dependencies` | `locally_cached` | result |
/// |---|---|---|
/// | no  | no  | `RedisCachingBackend` |
/// | yes | no  | `DependenciesRedisCachingBackend` |
/// | any | yes | `TwoLayerCachingBackend(NonBlockingCachingBackend(<redis>))` |
///
/// # Errors
///
/// Propagates the creation error of the Redis backend, which is disposed
/// first.
pub async fn create_redis_backend(
    connection: RedisConnection,
    mut config: RedisCachingBackendConfig,
) -> CacheResult<DynBackend> {
    let locally_cached = config.locally_cached;
    if locally_cached {
        config.key_prefix.push_str(LOCALLY_CACHED_PREFIX_SUFFIX);
    }

    let remote: DynBackend = if config.supports_dependencies {
        Arc::new(DependenciesRedisCachingBackend::create(connection, config).await?)
    } else {
        Arc::new(RedisCachingBackend::create(connection, config).await?)
    };
    if !locally_cached {
        return Ok(remote);
    }

    let non_blocking: DynBackend = Arc::new(NonBlockingCachingBackend::new(remote));
    let backend = TwoLayerCachingBackend::new(non_blocking);
    info!(backend = %backend.backend_name(), "Created locally cached Redis backend");
    Ok(Arc::new(backend))
}
