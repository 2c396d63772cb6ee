//! The cache entry model.
//!
//! Entries are replaced on recompute, never mutated in place; the only
//! interior mutability is access bookkeeping (count and recency), which
//! must update under concurrent reads without a write lock.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::key::QueryKey;
use crate::Timestamp;

/// Payload marker byte: stored bytes are the raw serialized value.
pub const CODEC_RAW: u8 = 0;
/// Payload marker byte: stored bytes are gzip-compressed.
pub const CODEC_GZIP: u8 = 1;

/// A single live cache entry.
///
/// `expires_at` is measured on the monotonic clock, fixed at creation, and
/// never extended implicitly. The payload always begins with a one-byte codec
/// marker ([`CODEC_RAW`] or [`CODEC_GZIP`]) followed by the serialized value;
/// size accounting uses the stored (possibly compressed) length.
#[derive(Debug)]
pub struct CacheEntry {
    key: QueryKey,
    payload: Vec<u8>,
    created_at: Timestamp,
    expires_at: Instant,
    ttl: Duration,
    tags: BTreeSet<String>,
    dependent_tables: BTreeSet<String>,
    access_count: AtomicU64,
    /// UTC millis of the most recent access; LRU ordering key.
    last_accessed_at: AtomicI64,
}

impl CacheEntry {
    /// Create an entry expiring `ttl` from now.
    pub fn new(
        key: QueryKey,
        payload: Vec<u8>,
        ttl: Duration,
        tags: BTreeSet<String>,
        dependent_tables: BTreeSet<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            key,
            payload,
            created_at: now,
            expires_at: Instant::now() + ttl,
            ttl,
            tags,
            dependent_tables,
            access_count: AtomicU64::new(0),
            last_accessed_at: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Marker byte plus serialized (possibly compressed) value.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Stored size in bytes; this is what eviction accounting uses.
    pub fn stored_size(&self) -> usize {
        self.payload.len()
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn dependent_tables(&self) -> &BTreeSet<String> {
        &self.dependent_tables
    }

    /// True once the monotonic deadline has passed. An expired entry is a
    /// miss wherever it is observed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time left before expiry, zero if already expired.
    pub fn remaining_ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Age since creation on the wall clock.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Record a read: bump the access count and refresh recency.
    pub fn touch(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_accessed_at
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// UTC millis of the most recent access (creation time if never read).
    pub fn last_accessed_millis(&self) -> i64 {
        self.last_accessed_at.load(Ordering::Relaxed)
    }

    /// Convert to the wire form used by the remote tier, carrying the
    /// remaining TTL rather than the local monotonic deadline.
    pub fn to_wire(&self) -> WireEntry {
        WireEntry {
            key: self.key.as_str().to_string(),
            payload: self.payload.clone(),
            ttl_remaining_ms: self.remaining_ttl().as_millis() as u64,
            tags: self.tags.clone(),
            dependent_tables: self.dependent_tables.clone(),
            created_at: self.created_at,
        }
    }

    /// Rebuild a local entry from the wire form. The deadline restarts from
    /// the remaining TTL the sender observed, so cross-tier transfer only
    /// ever shortens a value's total lifetime, never stretches it.
    pub fn from_wire(wire: WireEntry) -> Self {
        let ttl = Duration::from_millis(wire.ttl_remaining_ms);
        Self {
            key: QueryKey::explicit(wire.key),
            payload: wire.payload,
            created_at: wire.created_at,
            expires_at: Instant::now() + ttl,
            ttl,
            tags: wire.tags,
            dependent_tables: wire.dependent_tables,
            access_count: AtomicU64::new(0),
            last_accessed_at: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }
}

impl Clone for CacheEntry {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            payload: self.payload.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            ttl: self.ttl,
            tags: self.tags.clone(),
            dependent_tables: self.dependent_tables.clone(),
            access_count: AtomicU64::new(self.access_count.load(Ordering::Relaxed)),
            last_accessed_at: AtomicI64::new(self.last_accessed_at.load(Ordering::Relaxed)),
        }
    }
}

/// Serializable entry form exchanged with the remote tier.
///
/// Monotonic deadlines do not travel between processes; the wire form
/// carries the remaining TTL instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEntry {
    pub key: String,
    pub payload: Vec<u8>,
    pub ttl_remaining_ms: u64,
    pub tags: BTreeSet<String>,
    pub dependent_tables: BTreeSet<String>,
    pub created_at: Timestamp,
}
