//! Capability descriptor of a caching backend.

/// Optional operations a backend supports.
///
/// Callers must check the relevant flag before using an optional operation;
/// unsupported operations fail with [`CacheError::NotSupported`](crate::CacheError::NotSupported).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachingBackendFeatures {
    /// The backend raises item-removed events.
    pub events: bool,
    /// `clear` is supported.
    pub clear: bool,
    /// `invalidate_dependency` is supported.
    pub dependencies: bool,
    /// `contains_dependency` is supported.
    pub contains_dependency: bool,
}

impl CachingBackendFeatures {
    /// Every optional operation supported.
    pub const fn full() -> Self {
        Self {
            events: true,
            clear: true,
            dependencies: true,
            contains_dependency: true,
        }
    }

    /// No optional operation supported.
    pub const fn none() -> Self {
        Self {
            events: false,
            clear: false,
            dependencies: false,
            contains_dependency: false,
        }
    }

    pub const fn with_events(mut self, events: bool) -> Self {
        self.events = events;
        self
    }

    pub const fn with_clear(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    pub const fn with_dependencies(mut self, dependencies: bool) -> Self {
        self.dependencies = dependencies;
        self.contains_dependency = dependencies;
        self
    }
}

impl Default for CachingBackendFeatures {
    fn default() -> Self {
        Self::full()
    }
}
