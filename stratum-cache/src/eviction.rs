//! Size-pressure eviction.
//!
//! When stored bytes exceed the configured limit, a batch of the
//! least-recently-used entries is removed in one pass rather than one entry
//! per put. Batch size is a percentage of the current entry count, so a
//! single oversized insert triggers one sweep instead of a long tail of
//! tiny ones. A transient overshoot between an insert and the next
//! enforcement pass is accepted.

use std::cmp::max;
use tracing::{debug, info};

use stratum_core::CacheMetrics;

use crate::invalidation::InvalidationEngine;
use crate::store::MemoryStore;

/// LRU batch eviction policy.
pub struct EvictionManager {
    max_size_bytes: u64,
    batch_percent: u8,
}

impl EvictionManager {
    pub fn new(max_size_bytes: u64, batch_percent: u8) -> Self {
        Self {
            max_size_bytes,
            batch_percent,
        }
    }

    /// True when the store currently exceeds the size limit.
    pub fn over_limit(&self, store: &MemoryStore) -> bool {
        store.size_bytes() > self.max_size_bytes
    }

    /// Number of entries one eviction batch covers, at least one.
    fn batch_size(&self, entries: usize) -> usize {
        max(1, entries * self.batch_percent as usize / 100)
    }

    /// Evict LRU batches until the store is back under the limit. Evicted
    /// entries are dropped from the invalidation indices as well. Returns
    /// the number of entries removed.
    pub fn enforce(
        &self,
        store: &MemoryStore,
        engine: &InvalidationEngine,
        metrics: &CacheMetrics,
    ) -> usize {
        let mut evicted = 0usize;

        while self.over_limit(store) {
            let mut candidates = store.eviction_candidates();
            if candidates.is_empty() {
                break;
            }
            candidates.sort_by_key(|c| c.last_accessed_millis);
            let batch = self.batch_size(candidates.len());

            let mut removed_in_batch = 0usize;
            for candidate in candidates.into_iter().take(batch) {
                // A concurrent remove may have won the race; skip silently.
                if let Some(entry) = store.remove(&candidate.key) {
                    engine.unindex_entry(&entry);
                    removed_in_batch += 1;
                }
            }

            if removed_in_batch == 0 {
                break;
            }
            evicted += removed_in_batch;
            debug!(
                removed = removed_in_batch,
                size_bytes = store.size_bytes(),
                "evicted LRU batch"
            );
        }

        if evicted > 0 {
            metrics.record_evictions(evicted as u64);
            info!(
                evicted,
                size_bytes = store.size_bytes(),
                max_size_bytes = self.max_size_bytes,
                "size pressure relieved"
            );
        }
        evicted
    }
}
