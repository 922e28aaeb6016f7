//! Redis key layout: `<prefix>:<kind>:<key>`.

/// Kind segment of value keys.
pub const VALUE_KIND: &str = "value";
/// Kind segment of the set of dependencies declared by an item.
pub const DEPENDENCIES_KIND: &str = "dependencies";
/// Kind segment of the set of items depending on a key.
pub const DEPENDENCY_KIND: &str = "dependency";

const KEYSPACE_PREFIX: &str = "__keyspace@";

/// Builds and parses the keys and channels of one key prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisKeyBuilder {
    prefix: String,
}

impl RedisKeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn value_key(&self, key: &str) -> String {
        format!("{}:{VALUE_KIND}:{key}", self.prefix)
    }

    pub fn dependencies_key(&self, key: &str) -> String {
        format!("{}:{DEPENDENCIES_KIND}:{key}", self.prefix)
    }

    pub fn dependency_key(&self, dependency: &str) -> String {
        format!("{}:{DEPENDENCY_KIND}:{dependency}", self.prefix)
    }

    /// Channel of application-level events.
    pub fn events_channel(&self) -> String {
        format!("{}:events", self.prefix)
    }

    /// Keyspace notification pattern of value keys, in every database.
    pub fn keyspace_pattern(&self) -> String {
        format!("{KEYSPACE_PREFIX}*__:{}:{VALUE_KIND}:*", self.prefix)
    }

    /// `SCAN` pattern of all keys of `kind`.
    pub fn scan_pattern(&self, kind: &str) -> String {
        format!("{}:{kind}:*", self.prefix)
    }

    /// Splits `<prefix>:<kind>:<key>` into kind and key.
    pub fn parse_key<'a>(&self, full_key: &'a str) -> Option<(&'a str, &'a str)> {
        let rest = full_key.strip_prefix(self.prefix.as_str())?.strip_prefix(':')?;
        let (kind, key) = rest.split_once(':')?;
        if kind.is_empty() || key.is_empty() {
            return None;
        }
        Some((kind, key))
    }

    /// Extracts kind and key from a channel like
    /// `__keyspace@0__:<prefix>:<kind>:<key>`.
    pub fn parse_keyspace_channel<'a>(&self, channel: &'a str) -> Option<(&'a str, &'a str)> {
        let rest = channel.strip_prefix(KEYSPACE_PREFIX)?;
        let (_, full_key) = rest.split_once("__:")?;
        self.parse_key(full_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let keys = RedisKeyBuilder::new("app");
        assert_eq!(keys.value_key("user:1"), "app:value:user:1");
        assert_eq!(keys.dependencies_key("user:1"), "app:dependencies:user:1");
        assert_eq!(keys.dependency_key("tenant:42"), "app:dependency:tenant:42");
        assert_eq!(keys.events_channel(), "app:events");
        assert_eq!(keys.keyspace_pattern(), "__keyspace@*__:app:value:*");
    }

    #[test]
    fn test_parse_keyspace_channel() {
        let keys = RedisKeyBuilder::new("app");
        assert_eq!(
            keys.parse_keyspace_channel("__keyspace@0__:app:value:user:1"),
            Some(("value", "user:1"))
        );
        assert_eq!(keys.parse_keyspace_channel("__keyspace@0__:other:value:k"), None);
        assert_eq!(keys.parse_keyspace_channel("app:events"), None);
        // A longer prefix sharing our prefix is a different namespace.
        assert_eq!(keys.parse_key("appL2:value:k"), None);
    }
}
