//! Cache item model: stored items, values returned by lookups and
//! per-item configuration.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Retention priority of a cached item.
///
/// Backends without a notion of priority treat `Low` and `High` as `Default`.
/// `NotRemovable` items are never evicted for capacity and get no default
/// expiration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheItemPriority {
    #[default]
    Default,
    Low,
    High,
    NotRemovable,
}

/// Per-item caching options.
///
/// Every field is optional; unset fields are filled by
/// [`apply_fallback`](Self::apply_fallback) from a profile or an enclosing
/// configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheItemConfiguration {
    pub is_enabled: Option<bool>,
    pub profile_name: Option<String>,
    pub auto_reload: Option<bool>,
    pub absolute_expiration: Option<Duration>,
    pub sliding_expiration: Option<Duration>,
    pub priority: Option<CacheItemPriority>,
    pub ignore_this_parameter: Option<bool>,
}

impl CacheItemConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_absolute_expiration(mut self, expiration: Duration) -> Self {
        self.absolute_expiration = Some(expiration);
        self
    }

    pub fn with_sliding_expiration(mut self, expiration: Duration) -> Self {
        self.sliding_expiration = Some(expiration);
        self
    }

    pub fn with_priority(mut self, priority: CacheItemPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_profile(mut self, profile_name: impl Into<String>) -> Self {
        self.profile_name = Some(profile_name.into());
        self
    }

    pub fn with_auto_reload(mut self, auto_reload: bool) -> Self {
        self.auto_reload = Some(auto_reload);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.is_enabled = Some(enabled);
        self
    }

    /// Fills every unset field from `fallback`. Explicitly set values are kept.
    pub fn apply_fallback(&mut self, fallback: &CacheItemConfiguration) {
        if self.auto_reload.is_none() {
            self.auto_reload = fallback.auto_reload;
        }
        if self.absolute_expiration.is_none() {
            self.absolute_expiration = fallback.absolute_expiration;
        }
        if self.sliding_expiration.is_none() {
            self.sliding_expiration = fallback.sliding_expiration;
        }
        if self.priority.is_none() {
            self.priority = fallback.priority;
        }
        if self.profile_name.is_none() {
            self.profile_name.clone_from(&fallback.profile_name);
        }
        if self.is_enabled.is_none() {
            self.is_enabled = fallback.is_enabled;
        }
        if self.ignore_this_parameter.is_none() {
            self.ignore_this_parameter = fallback.ignore_this_parameter;
        }
    }

    /// Effective priority, `Default` when unset.
    pub fn effective_priority(&self) -> CacheItemPriority {
        self.priority.unwrap_or_default()
    }
}

/// An item handed to a backend for storage.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheItem {
    pub value: Value,
    pub dependencies: Vec<String>,
    pub configuration: CacheItemConfiguration,
}

impl CacheItem {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            dependencies: Vec::new(),
            configuration: CacheItemConfiguration::default(),
        }
    }

    /// Sets the dependency keys. Duplicates are dropped, first occurrence wins.
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        self.dependencies = dependencies
            .into_iter()
            .map(Into::into)
            .filter(|d: &String| seen.insert(d.clone()))
            .collect();
        self
    }

    pub fn with_configuration(mut self, configuration: CacheItemConfiguration) -> Self {
        self.configuration = configuration;
        self
    }
}

/// A value returned by a backend lookup.
///
/// `dependencies` is only populated when the caller asked for them.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheValue {
    pub value: Value,
    pub dependencies: Vec<String>,
}

impl CacheValue {
    pub fn new(value: Value, dependencies: Vec<String>) -> Self {
        Self {
            value,
            dependencies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_fallback_keeps_explicit_values() {
        let mut config = CacheItemConfiguration::new()
            .with_absolute_expiration(Duration::from_secs(10))
            .with_priority(CacheItemPriority::High);
        let profile = CacheItemConfiguration::new()
            .with_absolute_expiration(Duration::from_secs(60))
            .with_sliding_expiration(Duration::from_secs(5))
            .with_priority(CacheItemPriority::Low)
            .with_auto_reload(true);

        config.apply_fallback(&profile);

        assert_eq!(config.absolute_expiration, Some(Duration::from_secs(10)));
        assert_eq!(config.priority, Some(CacheItemPriority::High));
        assert_eq!(config.sliding_expiration, Some(Duration::from_secs(5)));
        assert_eq!(config.auto_reload, Some(true));
        assert_eq!(config.profile_name, None);
    }

    #[test]
    fn test_dependencies_are_deduplicated() {
        let item = CacheItem::new(json!(1)).with_dependencies(["a", "b", "a"]);
        assert_eq!(item.dependencies, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_priority_serde() {
        let p: CacheItemPriority = serde_json::from_str("\"not_removable\"").unwrap();
        assert_eq!(p, CacheItemPriority::NotRemovable);
        assert_eq!(CacheItemConfiguration::new().effective_priority(), CacheItemPriority::Default);
    }
}
