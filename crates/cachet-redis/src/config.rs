//! Options of the Redis caching backends.

use std::fmt;
use std::time::Duration;

use cachet_core::serializer::{SerializerFactory, SerializerKind};
use cachet_core::{CacheError, CacheResult};

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "cache";

/// Default expiration of items that declare none.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Default time allowed to establish the notification subscription.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration of [`RedisCachingBackend`](crate::RedisCachingBackend) and
/// [`DependenciesRedisCachingBackend`](crate::DependenciesRedisCachingBackend).
#[derive(Clone)]
pub struct RedisCachingBackendConfig {
    /// Namespace of every key and channel. Must not contain `:`.
    pub key_prefix: String,
    /// Database index; negative selects the connection's default.
    pub database: i64,
    /// Built-in serializer used when `create_serializer` is unset.
    pub serializer: SerializerKind,
    /// Custom serializer factory.
    pub create_serializer: Option<SerializerFactory>,
    /// Close the connection pool when the backend is disposed.
    pub owns_connection: bool,
    /// Attempts of an optimistic transaction before giving up.
    pub transaction_max_retries: u32,
    /// Use [`DependenciesRedisCachingBackend`](crate::DependenciesRedisCachingBackend).
    /// At least one [`RedisDependencyGarbageCollector`](crate::RedisDependencyGarbageCollector)
    /// must then run against the same database.
    pub supports_dependencies: bool,
    /// Put a local memory layer in front of Redis.
    pub locally_cached: bool,
    /// Expiration of items without an explicit one, unless `NotRemovable`.
    pub default_expiration: Duration,
    /// Time allowed to establish the notification subscription.
    pub connection_timeout: Duration,
}

impl RedisCachingBackendConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn with_dependencies(mut self, supports_dependencies: bool) -> Self {
        self.supports_dependencies = supports_dependencies;
        self
    }

    pub fn with_locally_cached(mut self, locally_cached: bool) -> Self {
        self.locally_cached = locally_cached;
        self
    }

    pub fn with_owns_connection(mut self, owns_connection: bool) -> Self {
        self.owns_connection = owns_connection;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_transaction_max_retries(mut self, retries: u32) -> Self {
        self.transaction_max_retries = retries;
        self
    }

    pub fn with_serializer(mut self, serializer: SerializerKind) -> Self {
        self.serializer = serializer;
        self
    }

    /// # Errors
    ///
    /// Returns `CacheError::Configuration` if the key prefix is empty or
    /// contains `:`, or if no transaction attempt is allowed.
    pub fn validate(&self) -> CacheResult<()> {
        if self.key_prefix.is_empty() {
            return Err(CacheError::configuration("key_prefix must not be empty"));
        }
        if self.key_prefix.contains(':') {
            return Err(CacheError::configuration(format!(
                "key_prefix '{}' cannot contain the ':' character",
                self.key_prefix
            )));
        }
        if self.transaction_max_retries == 0 {
            return Err(CacheError::configuration("transaction_max_retries must be at least 1"));
        }
        Ok(())
    }

    pub(crate) fn serializer_factory(&self) -> SerializerFactory {
        self.create_serializer
            .clone()
            .unwrap_or_else(|| self.serializer.factory())
    }
}

impl Default for RedisCachingBackendConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            database: -1,
            serializer: SerializerKind::Json,
            create_serializer: None,
            owns_connection: false,
            transaction_max_retries: 5,
            supports_dependencies: false,
            locally_cached: false,
            default_expiration: DEFAULT_EXPIRATION,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
        }
    }
}

impl fmt::Debug for RedisCachingBackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCachingBackendConfig")
            .field("key_prefix", &self.key_prefix)
            .field("database", &self.database)
            .field("serializer", &self.serializer)
            .field("custom_serializer", &self.create_serializer.is_some())
            .field("owns_connection", &self.owns_connection)
            .field("transaction_max_retries", &self.transaction_max_retries)
            .field("supports_dependencies", &self.supports_dependencies)
            .field("locally_cached", &self.locally_cached)
            .field("default_expiration", &self.default_expiration)
            .field("connection_timeout", &self.connection_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RedisCachingBackendConfig::default();
        assert_eq!(config.key_prefix, "cache");
        assert_eq!(config.database, -1);
        assert_eq!(config.transaction_max_retries, 5);
        assert_eq!(config.default_expiration, Duration::from_secs(86_400));
        assert_eq!(config.connection_timeout, Duration::from_secs(60));
        assert!(!config.owns_connection);
        assert!(!config.supports_dependencies);
        config.validate().unwrap();
    }

    #[test]
    fn test_prefix_with_delimiter_is_rejected() {
        let err = RedisCachingBackendConfig::new()
            .with_key_prefix("app:cache")
            .validate()
            .unwrap_err();
        assert!(matches!(err, CacheError::Configuration { .. }));
    }
}
