//! STRATUM Core - Cache Data Types
//!
//! Pure data structures with no behavior beyond their own bookkeeping.
//! All other crates depend on this. This crate contains the cache entry
//! model, key derivation, configuration, statistics, and error types -
//! no storage logic and no I/O.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod config;
pub mod entry;
pub mod error;
pub mod key;
pub mod seq;
pub mod stats;

pub use config::{CacheConfig, Compression, StorageMode};
pub use entry::{CacheEntry, WireEntry, CODEC_GZIP, CODEC_RAW};
pub use error::{CacheError, ConfigError, StratumResult};
pub use key::{normalize_query, QueryKey};
pub use seq::{InvalidationMessage, Seq, SeqCounter};
pub use stats::{CacheMetrics, CacheStats};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Identifier for a cache node participating in invalidation broadcast.
/// UUIDv7 embeds a Unix timestamp, making IDs naturally sortable by creation time.
pub type NodeId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 NodeId (timestamp-sortable).
pub fn new_node_id() -> NodeId {
    Uuid::now_v7()
}
