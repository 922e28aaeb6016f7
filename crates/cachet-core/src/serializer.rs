//! Value serializers and the pool that lends them out.
//!
//! Serializer instances may keep state between calls, so each one is used by
//! a single caller at a time. The pool keeps a stack of idle instances and
//! drops any instance that failed, so a broken codec state is never reused.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CacheError, CacheResult};

/// Turns cached values into bytes and back.
pub trait CachingSerializer: Send {
    /// # Errors
    ///
    /// Returns `CacheError::Serialization` if the value cannot be encoded.
    fn serialize(&mut self, value: &Value) -> CacheResult<Vec<u8>>;

    /// # Errors
    ///
    /// Returns `CacheError::Serialization` if the bytes cannot be decoded.
    fn deserialize(&mut self, bytes: &[u8]) -> CacheResult<Value>;
}

/// JSON text encoding.
#[derive(Debug, Default)]
pub struct JsonSerializer;

impl CachingSerializer for JsonSerializer {
    fn serialize(&mut self, value: &Value) -> CacheResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CacheError::serialization(e.to_string()))
    }

    fn deserialize(&mut self, bytes: &[u8]) -> CacheResult<Value> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::serialization(e.to_string()))
    }
}

/// MessagePack binary encoding.
#[derive(Debug, Default)]
pub struct MessagePackSerializer;

impl CachingSerializer for MessagePackSerializer {
    fn serialize(&mut self, value: &Value) -> CacheResult<Vec<u8>> {
        rmp_serde::to_vec(value).map_err(|e| CacheError::serialization(e.to_string()))
    }

    fn deserialize(&mut self, bytes: &[u8]) -> CacheResult<Value> {
        rmp_serde::from_slice(bytes).map_err(|e| CacheError::serialization(e.to_string()))
    }
}

/// Built-in serializer choices, selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    #[default]
    Json,
    #[serde(alias = "messagepack")]
    Msgpack,
}

/// Creates serializer instances for a pool.
pub type SerializerFactory = Arc<dyn Fn() -> Box<dyn CachingSerializer> + Send + Sync>;

impl SerializerKind {
    pub fn factory(self) -> SerializerFactory {
        match self {
            Self::Json => Arc::new(|| Box::new(JsonSerializer) as Box<dyn CachingSerializer>),
            Self::Msgpack => {
                Arc::new(|| Box::new(MessagePackSerializer) as Box<dyn CachingSerializer>)
            }
        }
    }
}

/// A stack of reusable serializer instances.
pub struct SerializerPool {
    factory: SerializerFactory,
    idle: Mutex<Vec<Box<dyn CachingSerializer>>>,
    discarded: AtomicUsize,
}

impl SerializerPool {
    pub fn new(factory: SerializerFactory) -> Self {
        Self {
            factory,
            idle: Mutex::new(Vec::new()),
            discarded: AtomicUsize::new(0),
        }
    }

    fn rent(&self) -> Box<dyn CachingSerializer> {
        let idle = self.idle.lock().pop();
        idle.unwrap_or_else(|| (self.factory)())
    }

    fn give_back(&self, serializer: Box<dyn CachingSerializer>) {
        self.idle.lock().push(serializer);
    }

    fn discard(&self, serializer: Box<dyn CachingSerializer>) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        drop(serializer);
    }

    /// # Errors
    ///
    /// Returns `CacheError::Serialization` if the value cannot be encoded.
    pub fn serialize(&self, value: &Value) -> CacheResult<Vec<u8>> {
        let mut serializer = self.rent();
        match serializer.serialize(value) {
            Ok(bytes) => {
                self.give_back(serializer);
                Ok(bytes)
            }
            Err(e) => {
                self.discard(serializer);
                Err(e)
            }
        }
    }

    /// Decodes the payload stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidCacheItem` if the payload cannot be decoded.
    pub fn deserialize(&self, key: &str, bytes: &[u8]) -> CacheResult<Value> {
        let mut serializer = self.rent();
        match serializer.deserialize(bytes) {
            Ok(value) => {
                self.give_back(serializer);
                Ok(value)
            }
            Err(e) => {
                self.discard(serializer);
                Err(CacheError::invalid_cache_item(key, e.to_string()))
            }
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of instances dropped after a failure.
    pub fn discarded_count(&self) -> usize {
        self.discarded.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for SerializerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializerPool")
            .field("idle", &self.idle_count())
            .field("discarded", &self.discarded_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pool_reuses_instances() {
        let pool = SerializerPool::new(SerializerKind::Json.factory());
        let bytes = pool.serialize(&json!({"a": 1})).unwrap();
        assert_eq!(pool.idle_count(), 1);

        let value = pool.deserialize("k", &bytes).unwrap();
        assert_eq!(value, json!({"a": 1}));
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_failed_serializer_is_discarded() {
        let pool = SerializerPool::new(SerializerKind::Msgpack.factory());
        pool.serialize(&json!(1)).unwrap();

        let err = pool.deserialize("k", &[0xc1]).unwrap_err();
        assert!(err.is_invalid_cache_item());
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.discarded_count(), 1);
    }

    #[test]
    fn test_msgpack_handles_nested_values() {
        let pool = SerializerPool::new(SerializerKind::Msgpack.factory());
        let value = json!({"user": {"id": 1, "tags": ["a", "b"]}, "active": true});
        let bytes = pool.serialize(&value).unwrap();
        assert_eq!(pool.deserialize("k", &bytes).unwrap(), value);
    }

    #[test]
    fn test_serializer_kind_from_config_string() {
        let kind: SerializerKind = serde_json::from_str("\"msgpack\"").unwrap();
        assert_eq!(kind, SerializerKind::Msgpack);
    }
}
