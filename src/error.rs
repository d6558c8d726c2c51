//! Error types for the tiered cache
//!
//! This module defines the library error enum plus the injected error
//! handler used by the persistent tier. I/O failures on the cold tier are
//! reported through the handler and degrade to cache misses; they are never
//! surfaced through `get`/`set`.

use std::sync::Arc;
use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// Filesystem error on the persistent tier
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A tier rejected a write after eviction could not make room
    #[error("Capacity exhausted in tier {tier}")]
    CapacityExhausted { tier: &'static str },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted after `shutdown()`
    #[error("Cache is shut down")]
    ShutDown,

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Callback invoked for recovered persistent-tier failures.
///
/// The cache keeps serving (a failed read is a miss, a failed flush is
/// retried on the next cycle); the handler exists so the host can observe
/// those failures.
pub type ErrorHandler = Arc<dyn Fn(&CacheError) + Send + Sync>;

/// Default handler: log at warn level and move on.
pub fn default_error_handler() -> ErrorHandler {
    Arc::new(|err| tracing::warn!("cache error: {}", err))
}

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CacheError::Serialization("bad payload".to_string());
        assert_eq!(error.to_string(), "Serialization error: bad payload");

        let cap = CacheError::CapacityExhausted { tier: "l1" };
        assert!(cap.to_string().contains("l1"));

        let config = CacheError::Config("max_entries must be greater than 0".to_string());
        assert!(config.to_string().starts_with("Configuration error"));
    }

    #[test]
    fn test_error_conversion() {
        let error: CacheError = "test error".into();
        assert!(matches!(error, CacheError::Other(_)));

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let error: CacheError = io.into();
        assert!(matches!(error, CacheError::Io(_)));
    }

    #[test]
    fn test_default_handler_does_not_panic() {
        let handler = default_error_handler();
        handler(&CacheError::Other("recovered".to_string()));
    }
}
