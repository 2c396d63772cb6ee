//! Cache configuration.
//!
//! One explicit struct with builder methods; validated once at service
//! construction so misconfiguration fails fast instead of surfacing as
//! odd runtime behavior.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Where cached values live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// In-process L1 only.
    #[default]
    Memory,
    /// L1 plus a remote tier, with write-through puts: the remote tier is
    /// awaited before `put` returns, trading latency for cross-node
    /// visibility.
    Distributed,
    /// L1 plus a remote tier, with fire-and-forget puts.
    Hybrid,
}

impl StorageMode {
    /// True when a remote tier participates.
    pub fn uses_remote(&self) -> bool {
        !matches!(self, Self::Memory)
    }
}

/// Compression applied to payloads above the size threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
}

/// Configuration for the cache service.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Default TTL for entries without an explicit one.
    pub ttl: Duration,
    /// Size bound for the in-process store, in stored bytes.
    pub max_size_bytes: u64,
    /// Tier layout and put semantics.
    pub storage_mode: StorageMode,
    /// Share of capacity evicted per pressure pass, in percent.
    pub eviction_batch_percent: u8,
    /// Serialized payloads larger than this are compressed.
    pub compression_threshold_bytes: usize,
    /// Compression algorithm for oversized payloads.
    pub compression: Compression,
    /// Consecutive remote failures before the breaker opens.
    pub circuit_breaker_threshold: u32,
    /// How long the breaker stays open before probing.
    pub circuit_breaker_cooldown: Duration,
    /// Whether table writes cascade through the dependency graph.
    pub smart_invalidation_enabled: bool,
    /// Upper bound on any single remote tier call.
    pub remote_timeout: Duration,
    /// Cadence of the background TTL sweep.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_size_bytes: 64 * 1024 * 1024,
            storage_mode: StorageMode::Memory,
            eviction_batch_percent: 15,
            compression_threshold_bytes: 4096,
            compression: Compression::Gzip,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(30),
            smart_invalidation_enabled: true,
            remote_timeout: Duration::from_millis(250),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_size_bytes(mut self, bytes: u64) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    pub fn with_storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }

    pub fn with_eviction_batch_percent(mut self, percent: u8) -> Self {
        self.eviction_batch_percent = percent;
        self
    }

    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold_bytes = bytes;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_breaker_threshold(mut self, threshold: u32) -> Self {
        self.circuit_breaker_threshold = threshold;
        self
    }

    pub fn with_breaker_cooldown(mut self, cooldown: Duration) -> Self {
        self.circuit_breaker_cooldown = cooldown;
        self
    }

    pub fn with_smart_invalidation(mut self, enabled: bool) -> Self {
        self.smart_invalidation_enabled = enabled;
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Validate option values and combinations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl.is_zero() {
            return Err(ConfigError::invalid("ttl", "0s", "must be positive"));
        }
        if self.max_size_bytes == 0 {
            return Err(ConfigError::invalid(
                "max_size_bytes",
                0,
                "must be positive",
            ));
        }
        if !(1..=50).contains(&self.eviction_batch_percent) {
            return Err(ConfigError::invalid(
                "eviction_batch_percent",
                self.eviction_batch_percent,
                "must be between 1 and 50",
            ));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker_threshold",
                0,
                "must be at least 1",
            ));
        }
        if self.circuit_breaker_cooldown.is_zero() {
            return Err(ConfigError::invalid(
                "circuit_breaker_cooldown",
                "0s",
                "must be positive",
            ));
        }
        if self.remote_timeout.is_zero() && self.storage_mode.uses_remote() {
            return Err(ConfigError::invalid(
                "remote_timeout",
                "0s",
                "must be positive when a remote tier is configured",
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::invalid(
                "sweep_interval",
                "0s",
                "must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = CacheConfig::new()
            .with_ttl(Duration::from_secs(60))
            .with_max_size_bytes(1024)
            .with_storage_mode(StorageMode::Hybrid)
            .with_eviction_batch_percent(20)
            .with_compression_threshold(512)
            .with_compression(Compression::None)
            .with_breaker_threshold(3)
            .with_breaker_cooldown(Duration::from_secs(5))
            .with_smart_invalidation(false)
            .with_remote_timeout(Duration::from_millis(100))
            .with_sweep_interval(Duration::from_secs(1));

        assert_eq!(config.ttl, Duration::from_secs(60));
        assert_eq!(config.max_size_bytes, 1024);
        assert_eq!(config.storage_mode, StorageMode::Hybrid);
        assert_eq!(config.eviction_batch_percent, 20);
        assert_eq!(config.compression, Compression::None);
        assert!(!config.smart_invalidation_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let config = CacheConfig::new().with_ttl(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_batch_percent_out_of_range() {
        assert!(CacheConfig::new()
            .with_eviction_batch_percent(0)
            .validate()
            .is_err());
        assert!(CacheConfig::new()
            .with_eviction_batch_percent(51)
            .validate()
            .is_err());
        assert!(CacheConfig::new()
            .with_eviction_batch_percent(10)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_memory_mode_ignores_remote_timeout() {
        let config = CacheConfig::new()
            .with_storage_mode(StorageMode::Memory)
            .with_remote_timeout(Duration::ZERO);
        assert!(config.validate().is_ok());

        let config = config.with_storage_mode(StorageMode::Distributed);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_mode_serde_names() {
        assert_eq!(
            serde_json::to_string(&StorageMode::Hybrid).expect("serializes"),
            "\"hybrid\""
        );
        let mode: StorageMode = serde_json::from_str("\"distributed\"").expect("deserializes");
        assert_eq!(mode, StorageMode::Distributed);
    }
}
