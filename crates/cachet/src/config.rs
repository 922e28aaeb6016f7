use std::collections::HashMap;
use std::time::Duration;

use cachet_core::serializer::SerializerKind;
use cachet_core::{CacheItemConfiguration, CacheItemPriority, MemoryCachingBackendConfig};
use cachet_redis::RedisCachingBackendConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CachetConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Local memory backend
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Redis backend
    #[serde(default)]
    pub redis: RedisConfig,
    /// Invalidation relay in front of the memory backend
    #[serde(default)]
    pub invalidation: InvalidationConfig,
    /// Caching profiles by name
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

impl CachetConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.memory.scan_interval_ms == 0 {
            return Err("memory.scan_interval_ms must be > 0".into());
        }
        if self.memory.max_items == Some(0) {
            return Err("memory.max_items must be > 0 when set".into());
        }
        if self.redis.enabled || self.invalidation.enabled {
            if self.redis.url.trim().is_empty() {
                return Err("redis.url must not be empty".into());
            }
            if self.redis.pool_size == 0 {
                return Err("redis.pool_size must be > 0".into());
            }
            if self.redis.timeout_ms == 0 || self.redis.connection_timeout_ms == 0 {
                return Err("redis timeouts must be > 0".into());
            }
        }
        if self.redis.enabled {
            self.redis.backend_config().validate().map_err(|e| e.to_string())?;
        }
        if self.invalidation.enabled {
            if self.redis.enabled {
                return Err(
                    "invalidation.enabled relays a local memory cache and cannot be combined with redis.enabled".into(),
                );
            }
            if self.invalidation.prefix.is_empty() || self.invalidation.prefix.contains(':') {
                return Err("invalidation.prefix must be non-empty and must not contain ':'".into());
            }
            if self.invalidation.channel.is_empty() {
                return Err("invalidation.channel must not be empty".into());
            }
        }
        for (name, profile) in &self.profiles {
            if profile.absolute_expiration_secs == Some(0) || profile.sliding_expiration_secs == Some(0) {
                return Err(format!("profiles.{name}: expirations must be > 0"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level of the cachet crates, or a full filter directive string
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Level of every other target (redis, deadpool, ...)
    #[serde(default = "default_dependencies_level")]
    pub dependencies_level: String,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_dependencies_level() -> String {
    "warn".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dependencies_level: default_dependencies_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Upper bound on stored items; unbounded when unset
    #[serde(default)]
    pub max_items: Option<usize>,
    /// Period of the expired-entry scan in milliseconds
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
}

fn default_scan_interval_ms() -> u64 {
    30_000
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_items: None,
            scan_interval_ms: default_scan_interval_ms(),
        }
    }
}

impl MemoryConfig {
    pub fn backend_config(&self) -> MemoryCachingBackendConfig {
        MemoryCachingBackendConfig {
            max_items: self.max_items,
            scan_interval: Duration::from_millis(self.scan_interval_ms),
            ..MemoryCachingBackendConfig::default()
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Store items in Redis instead of the local memory backend
    /// Default: false
    #[serde(default)]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Pool wait/create/recycle timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Database index; negative keeps the one of the URL
    #[serde(default = "default_database")]
    pub database: i64,

    #[serde(default)]
    pub serializer: SerializerKind,

    /// Close the pool when the backend is disposed
    #[serde(default = "default_owns_connection")]
    pub owns_connection: bool,

    #[serde(default = "default_transaction_max_retries")]
    pub transaction_max_retries: u32,

    #[serde(default)]
    pub supports_dependencies: bool,

    /// Keep a local memory layer in front of Redis
    #[serde(default)]
    pub locally_cached: bool,

    #[serde(default = "default_expiration_secs")]
    pub default_expiration_secs: u64,

    /// Time allowed to establish the notification subscription
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

fn default_key_prefix() -> String {
    cachet_redis::DEFAULT_KEY_PREFIX.to_string()
}

fn default_database() -> i64 {
    -1
}

fn default_owns_connection() -> bool {
    true
}

fn default_transaction_max_retries() -> u32 {
    5
}

fn default_expiration_secs() -> u64 {
    cachet_redis::DEFAULT_EXPIRATION.as_secs()
}

fn default_connection_timeout_ms() -> u64 {
    60_000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            key_prefix: default_key_prefix(),
            database: default_database(),
            serializer: SerializerKind::default(),
            owns_connection: default_owns_connection(),
            transaction_max_retries: default_transaction_max_retries(),
            supports_dependencies: false,
            locally_cached: false,
            default_expiration_secs: default_expiration_secs(),
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn backend_config(&self) -> RedisCachingBackendConfig {
        RedisCachingBackendConfig {
            key_prefix: self.key_prefix.clone(),
            database: self.database,
            serializer: self.serializer,
            create_serializer: None,
            owns_connection: self.owns_connection,
            transaction_max_retries: self.transaction_max_retries,
            supports_dependencies: self.supports_dependencies,
            locally_cached: self.locally_cached,
            default_expiration: Duration::from_secs(self.default_expiration_secs),
            connection_timeout: self.connection_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationConfig {
    /// Relay removals of the memory backend over Redis pub/sub
    #[serde(default)]
    pub enabled: bool,
    /// Namespace shared by the instances of one application
    #[serde(default = "default_invalidation_prefix")]
    pub prefix: String,
    #[serde(default = "default_invalidation_channel")]
    pub channel: String,
}

fn default_invalidation_prefix() -> String {
    cachet_core::invalidation::DEFAULT_INVALIDATION_PREFIX.to_string()
}

fn default_invalidation_channel() -> String {
    cachet_redis::DEFAULT_INVALIDATION_CHANNEL.to_string()
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prefix: default_invalidation_prefix(),
            channel: default_invalidation_channel(),
        }
    }
}

/// One named caching profile. Unset fields fall back to the default profile.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfileConfig {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub auto_reload: Option<bool>,
    #[serde(default)]
    pub absolute_expiration_secs: Option<u64>,
    #[serde(default)]
    pub sliding_expiration_secs: Option<u64>,
    #[serde(default)]
    pub priority: Option<CacheItemPriority>,
}

impl ProfileConfig {
    pub fn to_configuration(&self) -> CacheItemConfiguration {
        CacheItemConfiguration {
            is_enabled: self.enabled,
            auto_reload: self.auto_reload,
            absolute_expiration: self.absolute_expiration_secs.map(Duration::from_secs),
            sliding_expiration: self.sliding_expiration_secs.map(Duration::from_secs),
            priority: self.priority,
            ..CacheItemConfiguration::default()
        }
    }
}

/// Layered loading: defaults, then the TOML file, then `CACHET__*`
/// environment variables.
pub mod loader {
    use std::path::{Path, PathBuf};

    use config::{Config, Environment, File, FileFormat};

    use super::CachetConfig;

    /// Read when no path is given and `CACHET_CONFIG` is unset.
    pub const DEFAULT_CONFIG_FILE: &str = "cachet.toml";

    /// Names the configuration file when no path is given.
    pub const CONFIG_PATH_VAR: &str = "CACHET_CONFIG";

    fn resolve_path(path: Option<&Path>) -> PathBuf {
        match path {
            Some(path) => path.to_path_buf(),
            None => std::env::var_os(CONFIG_PATH_VAR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE)),
        }
    }

    /// Loads and validates the configuration. A missing file leaves the
    /// defaults in place.
    pub fn load_config(path: Option<&str>) -> Result<CachetConfig, String> {
        load_from(path.map(Path::new))
    }

    pub fn load_from<P: AsRef<Path>>(path: Option<P>) -> Result<CachetConfig, String> {
        let file = resolve_path(path.as_ref().map(AsRef::as_ref));
        let built = Config::builder()
            .add_source(File::from(file.as_path()).format(FileFormat::Toml).required(false))
            // e.g. CACHET__REDIS__POOL_SIZE=32
            .add_source(Environment::with_prefix("CACHET").try_parsing(true).separator("__"))
            .build()
            .map_err(|e| format!("cannot read {}: {e}", file.display()))?;

        let config: CachetConfig = built
            .try_deserialize()
            .map_err(|e| format!("invalid configuration in {}: {e}", file.display()))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CachetConfig::default();
        config.validate().unwrap();
        assert!(!config.redis.enabled);
        assert_eq!(config.redis.key_prefix, "cache");
        assert_eq!(config.redis.backend_config().default_expiration, Duration::from_secs(86_400));
        assert_eq!(config.memory.backend_config().scan_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_redis_prefix_is_validated_only_when_enabled() {
        let mut config = CachetConfig::default();
        config.redis.key_prefix = "a:b".into();
        config.validate().unwrap();

        config.redis.enabled = true;
        assert!(config.validate().unwrap_err().contains("':'"));
    }

    #[test]
    fn test_invalidation_excludes_redis_storage() {
        let mut config = CachetConfig::default();
        config.invalidation.enabled = true;
        config.validate().unwrap();

        config.redis.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_profile_to_configuration() {
        let profile = ProfileConfig {
            enabled: Some(true),
            absolute_expiration_secs: Some(60),
            priority: Some(CacheItemPriority::High),
            ..ProfileConfig::default()
        };
        let configuration = profile.to_configuration();
        assert_eq!(configuration.is_enabled, Some(true));
        assert_eq!(configuration.absolute_expiration, Some(Duration::from_secs(60)));
        assert_eq!(configuration.sliding_expiration, None);
        assert_eq!(configuration.priority, Some(CacheItemPriority::High));
    }
}
