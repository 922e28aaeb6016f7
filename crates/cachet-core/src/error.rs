//! Error types for the caching layer.
//!
//! Errors raised while serving a caller's request propagate as [`CacheError`].
//! Failures of background work (publishing, notification processing,
//! teardown) are logged and counted instead and never reach a caller.

use std::fmt;

/// Result alias for caching operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur during caching operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The backend does not support the requested operation.
    #[error("Operation '{operation}' is not supported by the {backend} backend")]
    NotSupported {
        /// The operation that was invoked.
        operation: String,
        /// The name of the backend.
        backend: String,
    },

    /// A usage protocol was violated.
    #[error("Invalid operation: {message}")]
    InvalidOperation {
        /// Description of the violation.
        message: String,
    },

    /// A stored payload could not be deserialized.
    #[error("Invalid cache item '{key}': {message}")]
    InvalidCacheItem {
        /// The key of the corrupt item.
        key: String,
        /// Description of the decoding failure.
        message: String,
    },

    /// A connection or subscription was not established in time.
    #[error("Timed out: {message}")]
    Timeout {
        /// Description of what timed out.
        message: String,
    },

    /// An internal invariant was violated.
    #[error("Assertion failed: {message}")]
    AssertionFailed {
        /// Description of the broken invariant.
        message: String,
    },

    /// The backend has already been disposed.
    #[error("The {backend} backend has been disposed")]
    Disposed {
        /// The name of the backend.
        backend: String,
    },

    /// The remote store could not be reached.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// A value could not be serialized.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
    },

    /// A pub/sub transport failed to deliver a message.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport error.
        message: String,
    },

    /// An optimistic transaction kept conflicting.
    #[error("Transaction on '{key}' conflicted {attempts} times")]
    TransactionConflict {
        /// The key the transaction was watching.
        key: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// The configuration is invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },
}

impl CacheError {
    /// Creates a new `NotSupported` error.
    #[must_use]
    pub fn not_supported(operation: impl Into<String>, backend: impl Into<String>) -> Self {
        Self::NotSupported {
            operation: operation.into(),
            backend: backend.into(),
        }
    }

    /// Creates a new `InvalidOperation` error.
    #[must_use]
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidCacheItem` error.
    #[must_use]
    pub fn invalid_cache_item(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidCacheItem {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Creates a new `AssertionFailed` error.
    #[must_use]
    pub fn assertion_failed(message: impl Into<String>) -> Self {
        Self::AssertionFailed {
            message: message.into(),
        }
    }

    /// Creates a new `Disposed` error.
    #[must_use]
    pub fn disposed(backend: impl Into<String>) -> Self {
        Self::Disposed {
            backend: backend.into(),
        }
    }

    /// Creates a new `Connection` error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a new `Serialization` error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new `Transport` error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a new `TransactionConflict` error.
    #[must_use]
    pub fn transaction_conflict(key: impl Into<String>, attempts: u32) -> Self {
        Self::TransactionConflict {
            key: key.into(),
            attempts,
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a not supported error.
    #[must_use]
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported { .. })
    }

    /// Returns `true` if this is an invalid operation error.
    #[must_use]
    pub fn is_invalid_operation(&self) -> bool {
        matches!(self, Self::InvalidOperation { .. })
    }

    /// Returns `true` if this is an invalid cache item error.
    #[must_use]
    pub fn is_invalid_cache_item(&self) -> bool {
        matches!(self, Self::InvalidCacheItem { .. })
    }

    /// Returns `true` if this is a timeout error.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if the backend was already disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed { .. })
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotSupported { .. } => ErrorCategory::Unsupported,
            Self::InvalidOperation { .. } => ErrorCategory::Usage,
            Self::Disposed { .. } => ErrorCategory::Usage,
            Self::InvalidCacheItem { .. } => ErrorCategory::Data,
            Self::Serialization { .. } => ErrorCategory::Data,
            Self::Timeout { .. } => ErrorCategory::Infrastructure,
            Self::Connection { .. } => ErrorCategory::Infrastructure,
            Self::Transport { .. } => ErrorCategory::Infrastructure,
            Self::TransactionConflict { .. } => ErrorCategory::Conflict,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::AssertionFailed { .. } => ErrorCategory::Internal,
        }
    }
}

/// Categories of caching errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Operation not supported by the backend's feature set.
    Unsupported,
    /// API misuse (wrong context, disposed backend).
    Usage,
    /// Corrupt or unencodable payload.
    Data,
    /// Connectivity or transport failure.
    Infrastructure,
    /// Optimistic concurrency conflict.
    Conflict,
    /// Invalid configuration.
    Configuration,
    /// Internal defect.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported => write!(f, "unsupported"),
            Self::Usage => write!(f, "usage"),
            Self::Data => write!(f, "data"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Conflict => write!(f, "conflict"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::not_supported("clear", "redis");
        assert_eq!(
            err.to_string(),
            "Operation 'clear' is not supported by the redis backend"
        );

        let err = CacheError::invalid_cache_item("user:1", "bad header");
        assert_eq!(err.to_string(), "Invalid cache item 'user:1': bad header");

        let err = CacheError::transaction_conflict("k", 5);
        assert_eq!(err.to_string(), "Transaction on 'k' conflicted 5 times");
    }

    #[test]
    fn test_error_predicates() {
        assert!(CacheError::not_supported("clear", "redis").is_not_supported());
        assert!(CacheError::timeout("subscribe").is_timeout());
        assert!(CacheError::disposed("memory").is_disposed());
        assert!(CacheError::invalid_operation("x").is_invalid_operation());
        assert!(!CacheError::connection("x").is_timeout());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            CacheError::invalid_cache_item("k", "m").category(),
            ErrorCategory::Data
        );
        assert_eq!(
            CacheError::timeout("m").category(),
            ErrorCategory::Infrastructure
        );
        assert_eq!(
            CacheError::assertion_failed("m").category(),
            ErrorCategory::Internal
        );
        assert_eq!(ErrorCategory::Unsupported.to_string(), "unsupported");
    }
}
