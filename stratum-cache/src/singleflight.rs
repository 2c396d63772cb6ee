//! Stampede protection for cache misses.
//!
//! Concurrent misses on the same key share a single computation. The first
//! caller becomes the leader and runs the compute on a spawned task, so the
//! work finishes even if that caller is cancelled; every caller, leader
//! included, waits on a watch channel carrying the result. Errors fan out to
//! all waiters, and the in-flight slot is always released, result or panic.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use stratum_core::{CacheEntry, CacheError, StratumResult};

type FlightResult = Option<StratumResult<CacheEntry>>;

/// Per-key deduplication of in-flight computations.
pub struct Singleflight {
    in_flight: Arc<DashMap<String, watch::Receiver<FlightResult>>>,
}

impl Singleflight {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Number of keys currently being computed.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Run `compute` for `key`, or join the computation already running for
    /// it. Exactly one compute executes per key at a time; its result,
    /// success or failure, is delivered to every concurrent caller.
    pub async fn run<F>(&self, key: &str, compute: F) -> StratumResult<CacheEntry>
    where
        F: Future<Output = StratumResult<CacheEntry>> + Send + 'static,
    {
        let mut rx = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                debug!(key, "joining in-flight computation");
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(rx.clone());

                let guard = FlightGuard {
                    map: Arc::clone(&self.in_flight),
                    key: key.to_string(),
                };
                tokio::spawn(async move {
                    let result = compute.await;
                    // Release the slot before publishing, so a caller
                    // arriving after the result starts a fresh flight.
                    drop(guard);
                    let _ = tx.send(Some(result));
                });
                rx
            }
        };

        // Bound to a local so the watch ref releases before rx drops.
        let outcome = match rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => match slot.as_ref() {
                Some(result) => result.clone(),
                None => Err(abandoned(key)),
            },
            // The sender was dropped without publishing, meaning the
            // compute task panicked.
            Err(_) => Err(abandoned(key)),
        };
        outcome
    }
}

impl Default for Singleflight {
    fn default() -> Self {
        Self::new()
    }
}

fn abandoned(key: &str) -> CacheError {
    CacheError::ComputeFailed {
        key: key.to_string(),
        reason: "computation abandoned before producing a result".to_string(),
    }
}

/// Clears the in-flight slot when the leader task ends, however it ends.
struct FlightGuard {
    map: Arc<DashMap<String, watch::Receiver<FlightResult>>>,
    key: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}
