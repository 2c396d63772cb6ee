//! Tiered store: L1 in-process map composed with an optional L2 remote tier.
//!
//! Reads check L1 first; on miss, the remote tier is consulted only when the
//! circuit breaker permits, and an L2 hit backfills L1 before returning.
//! Writes land in L1 synchronously (read-your-write within the process) and
//! reach L2 asynchronously unless write-through is configured. Every remote
//! call runs under a bounded timeout; a timeout is a failure for breaker
//! accounting and the operation degrades to L1-only behavior.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use stratum_core::{CacheEntry, CacheError, CacheMetrics, StratumResult};

use crate::breaker::CircuitBreaker;
use crate::store::memory::{Lookup, MemoryStore};
use crate::store::remote::RemoteTier;

/// Which tier served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitTier {
    L1,
    L2,
}

/// L1 + optional L2 with breaker-guarded remote access.
pub struct TieredStore {
    l1: Arc<MemoryStore>,
    l2: Option<Arc<dyn RemoteTier>>,
    breaker: Arc<CircuitBreaker>,
    remote_timeout: Duration,
    write_through: bool,
    metrics: Arc<CacheMetrics>,
}

impl TieredStore {
    pub fn new(
        l1: Arc<MemoryStore>,
        l2: Option<Arc<dyn RemoteTier>>,
        breaker: Arc<CircuitBreaker>,
        remote_timeout: Duration,
        write_through: bool,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            l1,
            l2,
            breaker,
            remote_timeout,
            write_through,
            metrics,
        }
    }

    pub fn l1(&self) -> &Arc<MemoryStore> {
        &self.l1
    }

    /// Look up a key across tiers. Hit/miss/expiry accounting happens here.
    pub async fn get(&self, key: &str) -> Option<(CacheEntry, HitTier)> {
        match self.l1.lookup(key) {
            Lookup::Hit(entry) => {
                self.metrics.record_hit();
                return Some((entry, HitTier::L1));
            }
            Lookup::Expired => {
                // An expired lookup is a miss; fall through to L2, which may
                // hold a fresher copy written by a peer.
                self.metrics.record_expired(1);
            }
            Lookup::Absent => {}
        }

        if let Some(l2) = &self.l2 {
            match guarded(&self.breaker, self.remote_timeout, l2.get(key)).await {
                Ok(Some(wire)) => {
                    let entry = CacheEntry::from_wire(wire);
                    if !entry.is_expired() {
                        // Backfill L1 before returning.
                        self.l1.insert(entry.clone());
                        self.metrics.record_hit();
                        debug!(key, "remote tier hit, backfilled L1");
                        return Some((entry, HitTier::L2));
                    }
                }
                Ok(None) => {}
                Err(CacheError::BreakerOpen) => {
                    debug!(key, "circuit open, skipping remote tier");
                }
                Err(err) => {
                    warn!(key, error = %err, "remote tier get failed, degrading to L1-only");
                }
            }
        }

        self.metrics.record_miss();
        None
    }

    /// Store an entry in L1 (synchronously) and L2 (per write mode).
    /// Returns the L1 entry this one replaced, for index reconciliation.
    pub async fn put(&self, entry: CacheEntry) -> Option<CacheEntry> {
        let wire = self.l2.as_ref().map(|_| entry.to_wire());
        let replaced = self.l1.insert(entry);

        if let (Some(l2), Some(wire)) = (&self.l2, wire) {
            if self.write_through {
                if let Err(err) =
                    guarded(&self.breaker, self.remote_timeout, l2.put(wire)).await
                {
                    warn!(error = %err, "write-through to remote tier failed");
                }
            } else {
                let l2 = Arc::clone(l2);
                let breaker = Arc::clone(&self.breaker);
                let timeout = self.remote_timeout;
                tokio::spawn(async move {
                    if let Err(err) = guarded(&breaker, timeout, l2.put(wire)).await {
                        warn!(error = %err, "async remote tier put failed");
                    }
                });
            }
        }

        replaced
    }

    /// Remove a key from both tiers. The L2 removal follows the configured
    /// write mode; a lost removal is bounded by the entry's TTL.
    pub async fn remove(&self, key: &str) -> Option<CacheEntry> {
        let removed = self.l1.remove(key);

        if let Some(l2) = &self.l2 {
            if self.write_through {
                if let Err(err) = guarded(
                    &self.breaker,
                    self.remote_timeout,
                    l2.remove(key),
                )
                .await
                {
                    warn!(key, error = %err, "remote tier remove failed");
                }
            } else {
                let l2 = Arc::clone(l2);
                let breaker = Arc::clone(&self.breaker);
                let timeout = self.remote_timeout;
                let key = key.to_string();
                tokio::spawn(async move {
                    if let Err(err) = guarded(&breaker, timeout, l2.remove(&key)).await {
                        warn!(key, error = %err, "async remote tier remove failed");
                    }
                });
            }
        }

        removed
    }

    /// Drop everything from both tiers. Returns the number of L1 entries
    /// removed.
    pub async fn clear(&self) -> usize {
        let count = self.l1.clear();
        if let Some(l2) = &self.l2 {
            if let Err(err) = guarded(&self.breaker, self.remote_timeout, l2.clear()).await {
                warn!(error = %err, "remote tier clear failed");
            }
        }
        count
    }
}

/// Run a remote tier call under the breaker and a bounded timeout.
async fn guarded<T, F>(
    breaker: &CircuitBreaker,
    timeout: Duration,
    op: F,
) -> StratumResult<T>
where
    F: Future<Output = StratumResult<T>>,
{
    if !breaker.allow_request() {
        return Err(CacheError::BreakerOpen);
    }

    match tokio::time::timeout(timeout, op).await {
        Ok(Ok(value)) => {
            breaker.record_success();
            Ok(value)
        }
        Ok(Err(err)) => {
            breaker.record_failure();
            Err(err)
        }
        Err(_) => {
            breaker.record_failure();
            Err(CacheError::RemoteTimeout {
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}
