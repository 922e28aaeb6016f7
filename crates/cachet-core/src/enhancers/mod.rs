//! Backend decorators.
//!
//! Each enhancer wraps an inner [`DynBackend`](crate::DynBackend) and
//! implements [`CachingBackend`](crate::CachingBackend) itself, so enhancers
//! stack freely. An enhancer reports the identity of the backend it wraps.

mod non_blocking;
mod two_layer;

pub use non_blocking::NonBlockingCachingBackend;
pub use two_layer::{DEFAULT_LOCAL_EXPIRATION, TwoLayerCachingBackend};
