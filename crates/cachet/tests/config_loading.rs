use std::time::Duration;
use std::{env, fs};

use cachet::cachet_core::{CacheItemConfiguration, CacheItemPriority, CachingBackend};
use cachet::config::loader::{load_config, load_from};
use cachet::{create_caching_backend, create_caching_service};

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("cachet.toml");

    let toml_content = r#"
[logging]
level = "debug"

[memory]
max_items = 1000
scan_interval_ms = 500

[redis]
url = "redis://cache.internal:6380"
key_prefix = "orders"
serializer = "msgpack"
supports_dependencies = true

[profiles.reports]
absolute_expiration_secs = 600
priority = "high"

[profiles.disabled]
enabled = false
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.logging.level, "debug");
    assert_eq!(cfg.memory.max_items, Some(1000));
    assert_eq!(cfg.memory.backend_config().scan_interval, Duration::from_millis(500));
    assert_eq!(cfg.redis.key_prefix, "orders");
    assert_eq!(cfg.redis.pool_size, 10);
    let redis = cfg.redis.backend_config();
    assert!(redis.supports_dependencies);
    assert_eq!(redis.database, -1);
    let reports = cfg.profiles["reports"].to_configuration();
    assert_eq!(reports.absolute_expiration, Some(Duration::from_secs(600)));
    assert_eq!(reports.priority, Some(CacheItemPriority::High));
    assert_eq!(cfg.profiles["disabled"].enabled, Some(false));

    // 2) Env override should win over file
    unsafe {
        env::set_var("CACHET__REDIS__POOL_SIZE", "32");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.redis.pool_size, 32);
    unsafe {
        env::remove_var("CACHET__REDIS__POOL_SIZE");
    }

    // 3) Invalid config is rejected
    let invalid = dir.path().join("invalid.toml");
    fs::write(&invalid, "[redis]\nenabled = true\nkey_prefix = \"a:b\"\n").expect("write toml");
    let err = load_config(invalid.to_str()).unwrap_err();
    assert!(err.contains("key_prefix"), "unexpected error: {err}");
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("absent.toml");
    let cfg = load_config(path.to_str()).expect("defaults");
    assert!(!cfg.redis.enabled);
    assert!(!cfg.invalidation.enabled);
    assert!(cfg.profiles.is_empty());
}

#[test]
fn path_argument_and_directives_in_level() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("custom.toml");
    fs::write(&path, "[logging]\nlevel = \"info,redis=trace\"\ndependencies_level = \"error\"\n").expect("write toml");

    let cfg = load_from(Some(&path)).expect("config");
    assert_eq!(cfg.logging.dependencies_level, "error");
    assert_eq!(
        cachet::observability::filter_directives(&cfg.logging.level, &cfg.logging.dependencies_level),
        "info,redis=trace"
    );

    fs::write(&path, "[memory]\nscan_interval_ms = \"soon\"\n").expect("write toml");
    let err = load_from(Some(&path)).unwrap_err();
    assert!(err.contains("custom.toml"), "unexpected error: {err}");
}

#[tokio::test]
async fn memory_service_from_config() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("cachet.toml");
    fs::write(&path, "[profiles.off]\nenabled = false\n").expect("write toml");
    let cfg = load_config(path.to_str()).expect("config");

    let service = create_caching_service(&cfg).await.expect("service");
    assert_eq!(service.backend().backend_name(), "memory");

    let mut calls = 0;
    for _ in 0..2 {
        let value: u32 = service
            .get_or_compute("answer", &CacheItemConfiguration::new(), || {
                calls += 1;
                async { Ok::<_, cachet::cachet_core::CacheError>(42) }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }
    assert_eq!(calls, 1);

    // The configured profile disables caching.
    let off = CacheItemConfiguration::new().with_profile("off");
    for _ in 0..2 {
        let _: u32 = service
            .get_or_compute("uncached", &off, || {
                calls += 1;
                async { Ok::<_, cachet::cachet_core::CacheError>(7) }
            })
            .await
            .unwrap();
    }
    assert_eq!(calls, 3);
    assert!(!service.backend().contains_item("uncached").await.unwrap());

    service.dispose().await;
}

#[tokio::test]
async fn unreachable_redis_fails_with_context() {
    let mut cfg = cachet::CachetConfig::default();
    cfg.redis.enabled = true;
    cfg.redis.url = "redis://127.0.0.1:1".into();
    cfg.redis.connection_timeout_ms = 500;

    let err = create_caching_backend(&cfg).await.err().expect("must fail");
    assert!(err.to_string().contains("Redis caching backend"));
}
