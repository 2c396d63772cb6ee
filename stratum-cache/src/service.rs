//! The cache service facade.
//!
//! `CacheService` wires the tiers, codec, breaker, singleflight,
//! invalidation engine, and background maintenance into one long-lived
//! object with an explicit lifecycle: created once at startup with
//! `new`/`with_remote`, torn down with `shutdown`. There is no ambient
//! global state; every index is owned here and never exposed for external
//! mutation.
//!
//! # Design
//!
//! - Reads go through [`TieredStore`]; a corrupt payload is purged and
//!   surfaced as a miss, never as a hard error.
//! - `get_or_compute` is singleflight-guarded, so N concurrent misses on a
//!   key run the compute exactly once and share the outcome.
//! - Writers call [`invalidate_table`](CacheService::invalidate_table)
//!   after their transaction commits, never before; invalidating early
//!   would let a concurrent reader repopulate the cache with stale data
//!   between commit and invalidation.
//! - Puts that push the store over its size limit notify the maintenance
//!   task, which evicts in LRU batches off the caller's path.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stratum_core::{
    new_node_id, CacheConfig, CacheEntry, CacheError, CacheMetrics, CacheStats, ConfigError,
    QueryKey, StorageMode, StratumResult,
};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::bus::{BusSubscription, InvalidationBus};
use crate::codec::PayloadCodec;
use crate::eviction::EvictionManager;
use crate::invalidation::InvalidationEngine;
use crate::singleflight::Singleflight;
use crate::store::{HitTier, MemoryStore, RemoteTier, TieredStore};
use crate::sweeper::{maintenance_task, MaintenanceContext};

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// Where a returned value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    /// Served from the in-process tier.
    L1,
    /// Served from the remote tier (and backfilled into L1).
    L2,
    /// Freshly computed on this call.
    Computed,
}

impl From<HitTier> for HitSource {
    fn from(tier: HitTier) -> Self {
        match tier {
            HitTier::L1 => HitSource::L1,
            HitTier::L2 => HitSource::L2,
        }
    }
}

/// A cache read result with provenance metadata.
#[derive(Debug, Clone)]
pub struct CacheHit<T> {
    pub value: T,
    /// Wall-clock time since the value was computed.
    pub age: Duration,
    pub source: HitSource,
}

impl<T> CacheHit<T> {
    /// True when the value was served from a cache tier rather than
    /// computed on this call.
    pub fn cached(&self) -> bool {
        self.source != HitSource::Computed
    }
}

/// Per-entry options for `put` and `get_or_compute`.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    ttl: Option<Duration>,
    tags: BTreeSet<String>,
    dependent_tables: BTreeSet<String>,
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the configured default TTL for this entry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.dependent_tables.insert(table.into());
        self
    }

    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependent_tables
            .extend(tables.into_iter().map(Into::into));
        self
    }
}

/// The external collaborator that actually runs queries on a miss.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &str, params: &[Value]) -> StratumResult<Value>;
}

// ============================================================================
// SERVICE
// ============================================================================

/// Process-wide cache facade. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct CacheService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: CacheConfig,
    codec: PayloadCodec,
    store: TieredStore,
    l1: Arc<MemoryStore>,
    engine: Arc<InvalidationEngine>,
    flight: Singleflight,
    breaker: Arc<CircuitBreaker>,
    bus: Option<Arc<dyn InvalidationBus>>,
    metrics: Arc<CacheMetrics>,
    pressure: Arc<Notify>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheService {
    /// Build a single-process cache with no remote tier.
    ///
    /// Spawns the maintenance task, so a tokio runtime must be running.
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        Self::build(config, None, None)
    }

    /// Build a cache backed by a remote tier and an invalidation bus.
    /// Requires `storage_mode` to be `Distributed` or `Hybrid`.
    pub fn with_remote(
        config: CacheConfig,
        remote: Arc<dyn RemoteTier>,
        bus: Arc<dyn InvalidationBus>,
    ) -> Result<Self, ConfigError> {
        if !config.storage_mode.uses_remote() {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "storage_mode=memory".to_string(),
                option_b: "remote tier".to_string(),
            });
        }
        Self::build(config, Some(remote), Some(bus))
    }

    fn build(
        config: CacheConfig,
        remote: Option<Arc<dyn RemoteTier>>,
        bus: Option<Arc<dyn InvalidationBus>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let metrics = Arc::new(CacheMetrics::new());
        let l1 = Arc::new(MemoryStore::new(Arc::clone(&metrics)));
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker_threshold,
            config.circuit_breaker_cooldown,
        ));
        // Distributed mode writes through to L2 so peers observe puts
        // immediately; hybrid mode treats L2 as best-effort.
        let write_through = config.storage_mode == StorageMode::Distributed;
        let store = TieredStore::new(
            Arc::clone(&l1),
            remote,
            Arc::clone(&breaker),
            config.remote_timeout,
            write_through,
            Arc::clone(&metrics),
        );

        let node_id = new_node_id();
        let engine = Arc::new(InvalidationEngine::new(node_id));
        let pressure = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(maintenance_task(
            MaintenanceContext {
                store: Arc::clone(&l1),
                engine: Arc::clone(&engine),
                eviction: EvictionManager::new(
                    config.max_size_bytes,
                    config.eviction_batch_percent,
                ),
                metrics: Arc::clone(&metrics),
                pressure: Arc::clone(&pressure),
            },
            config.clone(),
            shutdown_rx.clone(),
        )));

        if let Some(bus) = &bus {
            tasks.push(tokio::spawn(invalidation_listener(
                bus.subscribe(),
                Arc::clone(&l1),
                Arc::clone(&engine),
                shutdown_rx,
            )));
        }

        info!(
            node_id = %node_id,
            mode = ?config.storage_mode,
            max_size_bytes = config.max_size_bytes,
            ttl_secs = config.ttl.as_secs(),
            "cache service started"
        );

        Ok(Self {
            inner: Arc::new(ServiceInner {
                codec: PayloadCodec::new(
                    config.compression_threshold_bytes,
                    config.compression,
                ),
                config,
                store,
                l1,
                engine,
                flight: Singleflight::new(),
                breaker,
                bus,
                metrics,
                pressure,
                closed: AtomicBool::new(false),
                shutdown_tx,
                tasks: Mutex::new(tasks),
            }),
        })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Look up a cached value. Returns `None` on a miss, an expired entry,
    /// or a corrupt payload (which is purged in passing).
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &QueryKey,
    ) -> StratumResult<Option<CacheHit<T>>> {
        self.ensure_open()?;

        let Some((entry, tier)) = self.inner.store.get(key.as_str()).await else {
            return Ok(None);
        };

        match self.inner.codec.decode(entry.payload()) {
            Ok(value) => Ok(Some(CacheHit {
                value,
                age: entry.age(),
                source: tier.into(),
            })),
            Err(err) => {
                warn!(key = key.as_str(), error = %err, "corrupt cache entry, purging");
                self.inner.purge(key.as_str()).await;
                Ok(None)
            }
        }
    }

    /// Return the cached value for `key`, or run `compute` to produce it.
    ///
    /// Concurrent misses on the same key share a single `compute`
    /// execution; its failure propagates to every waiter and caches
    /// nothing. The computation runs on a spawned task, so a cancelled
    /// caller does not abandon the waiters.
    pub async fn get_or_compute<T, F>(
        &self,
        key: &QueryKey,
        options: PutOptions,
        compute: F,
    ) -> StratumResult<CacheHit<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Future<Output = StratumResult<T>> + Send + 'static,
    {
        if let Some(hit) = self.get(key).await? {
            return Ok(hit);
        }

        let inner = Arc::clone(&self.inner);
        let flight_key = key.clone();
        let entry = self
            .inner
            .flight
            .run(key.as_str(), async move {
                let value = compute.await?;
                let payload = inner.codec.encode(&value)?;
                let ttl = options.ttl.unwrap_or(inner.config.ttl);
                let entry = CacheEntry::new(
                    flight_key,
                    payload,
                    ttl,
                    options.tags,
                    options.dependent_tables,
                );
                inner.store_entry(entry.clone()).await;
                Ok(entry)
            })
            .await?;

        let value = self.inner.codec.decode(entry.payload())?;
        Ok(CacheHit {
            value,
            age: entry.age(),
            source: HitSource::Computed,
        })
    }

    /// Run a query through the cache, deriving the key from the normalized
    /// query text and parameters.
    pub async fn cached_query(
        &self,
        executor: Arc<dyn QueryExecutor>,
        query: &str,
        params: &[Value],
        options: PutOptions,
    ) -> StratumResult<CacheHit<Value>> {
        let key = QueryKey::derive(query, params);
        let query = query.to_string();
        let params = params.to_vec();
        self.get_or_compute(&key, options, async move {
            executor.execute(&query, &params).await
        })
        .await
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store a value directly, replacing any existing entry for the key.
    pub async fn put<T: Serialize>(
        &self,
        key: &QueryKey,
        value: &T,
        options: PutOptions,
    ) -> StratumResult<()> {
        self.ensure_open()?;
        let payload = self.inner.codec.encode(value)?;
        let ttl = options.ttl.unwrap_or(self.inner.config.ttl);
        let entry = CacheEntry::new(
            key.clone(),
            payload,
            ttl,
            options.tags,
            options.dependent_tables,
        );
        self.inner.store_entry(entry).await;
        Ok(())
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Drop a single entry from every tier.
    pub async fn invalidate_key(&self, key: &QueryKey) -> StratumResult<()> {
        self.ensure_open()?;
        self.inner.purge(key.as_str()).await;
        Ok(())
    }

    /// Drop every entry carrying a tag. Returns the number removed locally.
    pub async fn invalidate_tag(&self, tag: &str) -> StratumResult<usize> {
        self.ensure_open()?;
        let keys = self.inner.engine.take_keys_for_tag(tag);
        let mut removed = 0usize;
        for key in keys {
            if self.inner.purge(&key).await {
                removed += 1;
            }
        }
        debug!(tag, removed, "tag invalidated");
        Ok(removed)
    }

    /// Drop every entry whose `dependent_tables` contains `table`, and no
    /// others. Call this after the write transaction commits.
    ///
    /// In distributed operation the invalidation is also published to peer
    /// nodes. A lost broadcast is not retried; entry TTLs bound the
    /// worst-case staleness on peers.
    ///
    /// With smart invalidation disabled the dependency graph is not
    /// consulted and every tier is dropped wholesale instead; leaving the
    /// remote tier populated would let the next read backfill the written
    /// table's stale rows straight back into L1.
    pub async fn invalidate_table(&self, table: &str) -> StratumResult<usize> {
        self.ensure_open()?;

        if !self.inner.config.smart_invalidation_enabled {
            let removed = self.inner.store.clear().await;
            self.inner.engine.clear_indices();
            return Ok(removed);
        }

        let keys = self.inner.engine.take_keys_for_table(table);
        let mut removed = 0usize;
        for key in keys {
            if self.inner.purge(&key).await {
                removed += 1;
            }
        }
        debug!(table, removed, "table invalidated");

        if let Some(bus) = &self.inner.bus {
            let message = self.inner.engine.next_message(table);
            if let Err(err) = bus.publish(message).await {
                warn!(table, error = %err, "invalidation broadcast lost, TTL bounds peer staleness");
            }
        }

        Ok(removed)
    }

    /// Drop everything from every tier. Returns the number of local
    /// entries removed.
    pub async fn clear(&self) -> StratumResult<usize> {
        self.ensure_open()?;
        let removed = self.inner.store.clear().await;
        self.inner.engine.clear_indices();
        info!(removed, "cache cleared");
        Ok(removed)
    }

    // ========================================================================
    // Observability and lifecycle
    // ========================================================================

    pub fn stats(&self) -> CacheStats {
        self.inner.metrics.snapshot()
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.inner.breaker.state()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop background tasks and reject further operations. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);
        let tasks = {
            let mut guard = self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("cache service shut down");
    }

    fn ensure_open(&self) -> StratumResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CacheError::ShutDown);
        }
        Ok(())
    }
}

impl ServiceInner {
    /// Index and store an entry, reconciling index references the replaced
    /// entry held, and signal size pressure when the put overshoots.
    async fn store_entry(&self, entry: CacheEntry) {
        self.engine.index_entry(&entry);
        let new = entry.clone();
        if let Some(old) = self.store.put(entry).await {
            self.engine.unindex_stale(&old, &new);
        }
        if self.l1.size_bytes() > self.config.max_size_bytes {
            self.pressure.notify_one();
        }
    }

    /// Remove an entry from every tier along with its index references.
    async fn purge(&self, key: &str) -> bool {
        match self.store.remove(key).await {
            Some(entry) => {
                self.engine.unindex_entry(&entry);
                true
            }
            None => false,
        }
    }
}

/// Owns a service handle and converts committed writes into table
/// invalidations.
#[derive(Clone)]
pub struct WriteNotifier {
    service: CacheService,
}

impl WriteNotifier {
    pub fn new(service: CacheService) -> Self {
        Self { service }
    }

    /// Notify that a write transaction against `table` has committed.
    pub async fn table_written(&self, table: &str) -> StratumResult<usize> {
        self.service.invalidate_table(table).await
    }
}

/// Apply peer invalidations until shutdown. Messages from this node and
/// duplicates are skipped by the engine's sequence dedup; applying one
/// removes the affected L1 entries only (the origin already handled L2).
async fn invalidation_listener(
    mut subscription: BusSubscription,
    l1: Arc<MemoryStore>,
    engine: Arc<InvalidationEngine>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            message = subscription.recv() => {
                let Some(message) = message else { break };
                if !engine.should_apply(&message) {
                    continue;
                }
                let keys = engine.take_keys_for_table(&message.table);
                let mut removed = 0usize;
                for key in keys {
                    if let Some(entry) = l1.remove(&key) {
                        engine.unindex_entry(&entry);
                        removed += 1;
                    }
                }
                debug!(
                    table = %message.table,
                    seq = %message.seq,
                    removed,
                    "applied peer invalidation"
                );
            }
        }
    }
}
