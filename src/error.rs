//! Error types for the limiter.

use thiserror::Error;

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// The identifier is empty, too long, or contains unsafe characters
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// The policy has a non-positive call limit or window
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    /// The ledger could not be opened, read, written, or locked in time
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Persisted bytes could not be decoded
    #[error("storage corrupt: {0}")]
    StorageCorrupt(String),

    /// Configuration-related errors
    #[error("configuration error: {0}")]
    Config(String),
}

impl LimiterError {
    /// Stable, machine-readable name of the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            LimiterError::InvalidIdentifier(_) => "invalid_identifier",
            LimiterError::InvalidPolicy(_) => "invalid_policy",
            LimiterError::StoreUnavailable(_) => "store_unavailable",
            LimiterError::StorageCorrupt(_) => "storage_corrupt",
            LimiterError::Config(_) => "config",
        }
    }

    /// Whether the caller may safely retry the same operation.
    ///
    /// Only store availability problems qualify: nothing was committed, so a
    /// retry cannot double-count. The limiter never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LimiterError::StoreUnavailable(_))
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_unavailable_is_retryable() {
        assert!(LimiterError::StoreUnavailable("lock timeout".into()).is_retryable());
        assert!(!LimiterError::StorageCorrupt("bad record".into()).is_retryable());
        assert!(!LimiterError::InvalidPolicy("zero".into()).is_retryable());
        assert!(!LimiterError::InvalidIdentifier("empty".into()).is_retryable());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(LimiterError::InvalidIdentifier(String::new()).kind(), "invalid_identifier");
        assert_eq!(LimiterError::StorageCorrupt(String::new()).kind(), "storage_corrupt");
    }
}
