//! Error types
//!
//! Errors raised by the cache itself (`CacheError`) are kept apart from errors
//! emitted by the wrapped streams (`SourceError`). The latter travel through the
//! read cells untouched, so every reader observes the exact same instance.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Boxed error accepted from stream producers
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Error type for registry and entry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Key is already bound to an entry of a different value type
    KeyMisuse {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    /// Entry was torn down before the attach reached it
    Evicted(String),
    /// Read cell was dropped before it settled
    Closed(String),
    /// No entry exists for the key
    NotFound(String),
    /// A one-shot request with this key is already in flight
    RequestExists(String),
    /// No one-shot request exists for the key
    RequestNotFound(String),
    /// Called outside a Tokio runtime, so nothing could drive the source
    NoRuntime(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::KeyMisuse {
                key,
                expected,
                found,
            } => write!(
                f,
                "Key {} is bound to {}, requested as {}",
                key, found, expected
            ),
            CacheError::Evicted(key) => write!(f, "Entry evicted: {}", key),
            CacheError::Closed(key) => write!(f, "Entry closed before settling: {}", key),
            CacheError::NotFound(key) => write!(f, "No entry with key: {}", key),
            CacheError::RequestExists(key) => write!(f, "Request already in use: {}", key),
            CacheError::RequestNotFound(key) => write!(f, "No request with key: {}", key),
            CacheError::NoRuntime(key) => write!(f, "No Tokio runtime to drive entry: {}", key),
        }
    }
}

impl StdError for CacheError {}

/// Error emitted by a wrapped stream
///
/// Cloning is a reference-count bump; clones compare equal under [`SourceError::ptr_eq`].
#[derive(Clone)]
pub struct SourceError(Arc<dyn StdError + Send + Sync + 'static>);

impl SourceError {
    /// Wrap a producer error
    pub fn new(err: impl Into<BoxError>) -> Self {
        Self(Arc::from(err.into()))
    }

    /// Borrow the original error
    pub fn get_ref(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.0
    }

    /// Attempt to downcast to the producer's concrete error type
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    /// Whether both values share the same underlying error instance
    pub fn ptr_eq(&self, other: &SourceError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl StdError for SourceError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

/// A stream completed without emitting anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptyStream;

impl fmt::Display for EmptyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stream completed without emitting a value")
    }
}

impl StdError for EmptyStream {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_preserves_message() {
        let err = SourceError::new("boom");
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_source_error_clone_is_same_instance() {
        let err = SourceError::new("boom");
        let clone = err.clone();
        assert!(err.ptr_eq(&clone));

        let other = SourceError::new("boom");
        assert!(!err.ptr_eq(&other));
    }

    #[test]
    fn test_source_error_downcast() {
        let err = SourceError::new(EmptyStream);
        assert_eq!(err.downcast_ref::<EmptyStream>(), Some(&EmptyStream));
        assert!(err.downcast_ref::<CacheError>().is_none());
    }

    #[test]
    fn test_cache_error_display() {
        let err = CacheError::KeyMisuse {
            key: "A".into(),
            expected: "u32",
            found: "alloc::string::String",
        };
        assert_eq!(
            err.to_string(),
            "Key A is bound to alloc::string::String, requested as u32"
        );
        assert_eq!(CacheError::NotFound("x".into()).to_string(), "No entry with key: x");
    }
}
