//! Named bundles of default item configuration.

use dashmap::DashMap;
use tracing::debug;

use crate::item::CacheItemConfiguration;

/// Name of the profile used when an item names none.
pub const DEFAULT_PROFILE: &str = "default";

/// Registry of caching profiles.
///
/// The `default` profile always exists and is enabled unless overridden.
#[derive(Debug)]
pub struct ProfileRegistry {
    profiles: DashMap<String, CacheItemConfiguration>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        let profiles = DashMap::new();
        profiles.insert(
            DEFAULT_PROFILE.to_string(),
            CacheItemConfiguration::new().with_enabled(true),
        );
        Self { profiles }
    }

    /// Adds or replaces a profile.
    pub fn register(&self, name: impl Into<String>, configuration: CacheItemConfiguration) {
        self.profiles.insert(name.into(), configuration);
    }

    /// Returns the profile named `name`, falling back to the default profile.
    pub fn get(&self, name: &str) -> CacheItemConfiguration {
        if let Some(profile) = self.profiles.get(name) {
            return profile.clone();
        }
        debug!(profile = %name, "unknown caching profile, using default");
        self.default_profile()
    }

    pub fn default_profile(&self) -> CacheItemConfiguration {
        self.profiles
            .get(DEFAULT_PROFILE)
            .map(|profile| profile.clone())
            .unwrap_or_else(|| CacheItemConfiguration::new().with_enabled(true))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    /// Fills the unset fields of `configuration` from its profile, then from
    /// the default profile.
    pub fn merge(&self, configuration: &CacheItemConfiguration) -> CacheItemConfiguration {
        let mut merged = configuration.clone();
        let profile_name = merged.profile_name.clone().unwrap_or_else(|| DEFAULT_PROFILE.to_string());
        merged.apply_fallback(&self.get(&profile_name));
        merged.apply_fallback(&self.default_profile());
        merged
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_merge_prefers_explicit_then_profile_then_default() {
        let registry = ProfileRegistry::new();
        registry.register(
            "short",
            CacheItemConfiguration::new()
                .with_absolute_expiration(Duration::from_secs(5))
                .with_auto_reload(true),
        );

        let config = CacheItemConfiguration::new()
            .with_profile("short")
            .with_auto_reload(false);
        let merged = registry.merge(&config);

        assert_eq!(merged.auto_reload, Some(false));
        assert_eq!(merged.absolute_expiration, Some(Duration::from_secs(5)));
        assert_eq!(merged.is_enabled, Some(true));
    }

    #[test]
    fn test_unknown_profile_uses_default() {
        let registry = ProfileRegistry::new();
        registry.register(DEFAULT_PROFILE, CacheItemConfiguration::new().with_enabled(false));

        let merged = registry.merge(&CacheItemConfiguration::new().with_profile("missing"));
        assert_eq!(merged.is_enabled, Some(false));
        assert_eq!(merged.profile_name.as_deref(), Some("missing"));
        assert!(!registry.contains("missing"));
    }
}
