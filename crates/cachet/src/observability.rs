//! Tracing setup for applications embedding the caching stack.
//!
//! The filter scopes [`LoggingConfig::level`] to the cachet crates and keeps
//! every other target at [`LoggingConfig::dependencies_level`]. `RUST_LOG`,
//! when set, replaces the computed filter. The level can be changed later
//! through [`apply_logging_level`].

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::config::LoggingConfig;

/// Crates whose events follow the configured cache level.
const CACHE_TARGETS: [&str; 3] = ["cachet", "cachet_core", "cachet_redis"];

struct FilterHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    dependencies_level: String,
}

static FILTER_HANDLE: OnceLock<FilterHandle> = OnceLock::new();

/// Directives applying `level` to the cache crates and `others` elsewhere.
/// A `level` that already holds directives is used as is.
pub fn filter_directives(level: &str, others: &str) -> String {
    if level.contains('=') || level.contains(',') {
        return level.to_string();
    }
    let mut directives = vec![others.to_string()];
    directives.extend(CACHE_TARGETS.iter().map(|target| format!("{target}={level}")));
    directives.join(",")
}

pub fn init_tracing() {
    init_tracing_from_config(&LoggingConfig::default());
}

pub fn init_tracing_from_config(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&logging.level, &logging.dependencies_level)));

    let (filter_layer, handle) = reload::Layer::new(filter);
    let installed = FilterHandle {
        handle,
        dependencies_level: logging.dependencies_level.clone(),
    };
    if FILTER_HANDLE.set(installed).is_err() {
        return;
    }
    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(true))
        .try_init();
}

pub fn init_tracing_with_level(level: &str) {
    init_tracing_from_config(&LoggingConfig {
        level: level.to_string(),
        ..LoggingConfig::default()
    });
}

/// Changes the cache crates' level at runtime. Returns `false` when tracing
/// was not initialized through this module.
pub fn apply_logging_level(level: &str) -> bool {
    FILTER_HANDLE.get().is_some_and(|installed| {
        let directives = filter_directives(level, &installed.dependencies_level);
        installed.handle.reload(EnvFilter::new(directives)).is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_is_scoped_to_cache_crates() {
        assert_eq!(
            filter_directives("debug", "warn"),
            "warn,cachet=debug,cachet_core=debug,cachet_redis=debug"
        );
        assert_eq!(filter_directives("info,redis=trace", "warn"), "info,redis=trace");
    }

    #[test]
    fn test_level_can_be_changed_after_init() {
        init_tracing_with_level("warn");
        assert!(apply_logging_level("debug"));
        tracing::debug!("visible after reload");
    }
}
