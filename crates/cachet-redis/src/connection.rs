//! Redis connection handle shared by backends, collectors and transports.

use std::time::Duration;

use cachet_core::{CacheError, CacheResult};
use deadpool_redis::{Pool, Runtime};
use redis::IntoConnectionInfo;
use tracing::info;

/// A command pool plus a client for dedicated pub/sub connections.
///
/// Cloning is cheap and shares the pool. Pub/sub needs its own connection,
/// so subscribers open one from [`client`](Self::client) instead of taking
/// one from the pool.
#[derive(Clone)]
pub struct RedisConnection {
    pool: Pool,
    client: redis::Client,
}

impl RedisConnection {
    /// Builds a pool for `url`. No connection is opened yet.
    ///
    /// `database` overrides the database of the URL when non-negative.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Configuration` if the URL is invalid or the pool
    /// cannot be created.
    pub fn open(url: &str, database: i64, pool_size: usize, timeout: Duration) -> CacheResult<Self> {
        let mut connection_info = url
            .into_connection_info()
            .map_err(|e| CacheError::configuration(format!("invalid Redis URL '{url}': {e}")))?;
        if database >= 0 {
            connection_info.redis.db = database;
        }

        let client = redis::Client::open(connection_info.clone())
            .map_err(|e| CacheError::configuration(format!("failed to create Redis client: {e}")))?;

        let mut pool_config = deadpool_redis::Config::from_connection_info(connection_info);
        let mut settings = pool_config.get_pool_config();
        settings.max_size = pool_size;
        settings.timeouts.wait = Some(timeout);
        settings.timeouts.create = Some(timeout);
        settings.timeouts.recycle = Some(timeout);
        pool_config.pool = Some(settings);

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::configuration(format!("failed to create Redis pool: {e}")))?;

        info!(pool_size, "Redis connection pool created");
        Ok(Self { pool, client })
    }

    /// Wraps an existing pool and client.
    pub fn from_parts(pool: Pool, client: redis::Client) -> Self {
        Self { pool, client }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn client(&self) -> &redis::Client {
        &self.client
    }

    /// Takes a connection from the pool.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Connection` if no connection is available.
    pub async fn get(&self) -> CacheResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::connection(format!("failed to get Redis connection: {e}")))
    }

    /// Closes the pool. Connections in use are dropped when returned.
    pub fn close(&self) {
        self.pool.close();
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection")
            .field("pool", &self.pool.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Maps a Redis command error into the caching taxonomy.
pub(crate) fn redis_error(e: redis::RedisError) -> CacheError {
    CacheError::connection(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_configuration_error() {
        let err = RedisConnection::open("not a url", -1, 4, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, CacheError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_open_does_not_connect() {
        let connection = RedisConnection::open("redis://127.0.0.1:1", 3, 4, Duration::from_millis(200)).unwrap();
        assert!(!connection.is_closed());

        let err = connection.get().await.err().expect("expected connection error");
        assert!(matches!(err, CacheError::Connection { .. }));

        connection.close();
        assert!(connection.is_closed());
    }
}
