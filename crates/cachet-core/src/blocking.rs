//! Synchronous facade over an async backend.

use tokio::runtime::Handle;

use crate::backend::DynBackend;
use crate::error::CacheResult;
use crate::item::{CacheItem, CacheValue};

/// Runs backend operations to completion on a runtime handle.
///
/// Meant for callers outside the runtime, such as plain threads. Calling it
/// from inside an async task panics, like [`Handle::block_on`].
#[derive(Clone)]
pub struct BlockingCachingBackend {
    backend: DynBackend,
    handle: Handle,
}

impl BlockingCachingBackend {
    pub fn new(backend: DynBackend, handle: Handle) -> Self {
        Self { backend, handle }
    }

    pub fn inner(&self) -> &DynBackend {
        &self.backend
    }

    pub fn set_item(&self, key: &str, item: CacheItem) -> CacheResult<()> {
        self.handle.block_on(self.backend.set_item(key, item))
    }

    pub fn get_item(&self, key: &str, include_dependencies: bool) -> CacheResult<Option<CacheValue>> {
        self.handle.block_on(self.backend.get_item(key, include_dependencies))
    }

    pub fn contains_item(&self, key: &str) -> CacheResult<bool> {
        self.handle.block_on(self.backend.contains_item(key))
    }

    pub fn remove_item(&self, key: &str) -> CacheResult<()> {
        self.handle.block_on(self.backend.remove_item(key))
    }

    pub fn invalidate_dependency(&self, key: &str) -> CacheResult<()> {
        self.handle.block_on(self.backend.invalidate_dependency(key))
    }

    pub fn contains_dependency(&self, key: &str) -> CacheResult<bool> {
        self.handle.block_on(self.backend.contains_dependency(key))
    }

    pub fn clear(&self) -> CacheResult<()> {
        self.handle.block_on(self.backend.clear())
    }

    pub fn when_background_tasks_completed(&self) {
        self.handle.block_on(self.backend.when_background_tasks_completed());
    }

    pub fn dispose(&self) {
        self.handle.block_on(self.backend.dispose());
    }
}
