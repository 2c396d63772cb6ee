//! Background cache maintenance task.
//!
//! One task per service instance handles the two periodic duties: sweeping
//! expired entries out of L1 on a fixed interval, and enforcing the size
//! limit when a put signals pressure. It runs until the shutdown signal is
//! received, at which point it exits promptly without a final sweep (expiry
//! is lazy everywhere else, so nothing is lost).

use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use stratum_core::{CacheConfig, CacheMetrics};

use crate::eviction::EvictionManager;
use crate::invalidation::InvalidationEngine;
use crate::store::MemoryStore;

/// Shared state the maintenance task operates on.
pub(crate) struct MaintenanceContext {
    pub store: Arc<MemoryStore>,
    pub engine: Arc<InvalidationEngine>,
    pub eviction: EvictionManager,
    pub metrics: Arc<CacheMetrics>,
    /// Signalled by puts that push the store over the size limit.
    pub pressure: Arc<Notify>,
}

impl MaintenanceContext {
    /// Remove every expired entry and its index references.
    pub(crate) fn sweep_expired(&self) -> usize {
        let mut removed = 0usize;
        for key in self.store.expired_keys() {
            if let Some(entry) = self.store.remove(&key) {
                self.engine.unindex_entry(&entry);
                removed += 1;
            }
        }
        if removed > 0 {
            self.metrics.record_expired(removed as u64);
            debug!(removed, "swept expired entries");
        }
        removed
    }

    pub(crate) fn enforce_size_limit(&self) -> usize {
        self.eviction
            .enforce(&self.store, &self.engine, &self.metrics)
    }
}

/// Run periodic maintenance until `shutdown_rx` flips to `true`.
pub(crate) async fn maintenance_task(
    ctx: MaintenanceContext,
    config: CacheConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut sweep_interval = interval(config.sweep_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so a freshly started
    // service does not sweep an empty store.
    sweep_interval.tick().await;

    info!(
        sweep_interval_secs = config.sweep_interval.as_secs(),
        "cache maintenance task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("cache maintenance task shutting down");
                    break;
                }
            }
            _ = sweep_interval.tick() => {
                ctx.sweep_expired();
                ctx.enforce_size_limit();
            }
            _ = ctx.pressure.notified() => {
                ctx.enforce_size_limit();
            }
        }
    }
}
