//! Error types for STRATUM cache operations

use thiserror::Error;

/// Cache operation errors.
///
/// All variants are `Clone` so a single failure can be fanned out to every
/// waiter sharing an in-flight computation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Remote tier error: {reason}")]
    RemoteTier { reason: String },

    #[error("Remote tier timed out after {timeout_ms}ms")]
    RemoteTimeout { timeout_ms: u64 },

    #[error("Circuit breaker is open, remote tier bypassed")]
    BreakerOpen,

    #[error("Corrupt cache entry for key {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    #[error("Codec error: {reason}")]
    Codec { reason: String },

    #[error("Compute failed for key {key}: {reason}")]
    ComputeFailed { key: String, reason: String },

    #[error("Invalidation broadcast failed: {reason}")]
    BroadcastFailed { reason: String },

    #[error("Cache service is shut down")]
    ShutDown,
}

impl CacheError {
    /// Build a codec error from any displayable cause.
    pub fn codec(reason: impl std::fmt::Display) -> Self {
        Self::Codec {
            reason: reason.to_string(),
        }
    }

    /// Build a compute failure for the given key from any displayable cause.
    pub fn compute(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::ComputeFailed {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// True if this error came from the remote tier (or its timeout) and
    /// should count toward the circuit breaker.
    pub fn is_remote_failure(&self) -> bool {
        matches!(
            self,
            Self::RemoteTier { .. } | Self::RemoteTimeout { .. }
        )
    }
}

/// Configuration errors, reported at service construction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Missing required configuration: {field}")]
    MissingRequired { field: String },
}

impl ConfigError {
    pub fn invalid(
        field: impl Into<String>,
        value: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for cache operations.
pub type StratumResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_failures_count_toward_breaker() {
        assert!(CacheError::RemoteTier {
            reason: "connection refused".to_string()
        }
        .is_remote_failure());
        assert!(CacheError::RemoteTimeout { timeout_ms: 250 }.is_remote_failure());
        assert!(!CacheError::BreakerOpen.is_remote_failure());
        assert!(!CacheError::ShutDown.is_remote_failure());
    }

    #[test]
    fn test_error_messages_name_the_key() {
        let err = CacheError::compute("q:abc", "connection reset");
        assert!(err.to_string().contains("q:abc"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("eviction_batch_percent", 0, "must be between 1 and 50");
        assert!(err.to_string().contains("eviction_batch_percent"));
    }
}
