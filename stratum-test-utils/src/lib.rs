//! STRATUM Test Utilities
//!
//! Centralized test infrastructure for the STRATUM workspace:
//! - Mock query executor with scriptable results and an execution counter
//! - Flaky remote tier for circuit breaker and degradation tests
//! - Entry and row fixtures for common scenarios

// Re-export the types mocks are built against for convenience
pub use stratum_cache::{InMemoryRemoteTier, QueryExecutor, RemoteTier};
pub use stratum_core::{
    CacheEntry, CacheError, QueryKey, StratumResult, WireEntry, CODEC_RAW,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// MOCK QUERY EXECUTOR
// ============================================================================

/// Scriptable [`QueryExecutor`] that counts executions.
///
/// Unscripted queries return a canned row set; `script` pins a result to a
/// specific query string, and `fail_all` flips every execution into an
/// error. Execution counts are the backbone of singleflight assertions.
#[derive(Default)]
pub struct MockQueryExecutor {
    executions: AtomicU64,
    scripted: Mutex<HashMap<String, Value>>,
    fail_all: AtomicBool,
    /// Artificial latency per execution, widening race windows in
    /// concurrency tests.
    delay: Mutex<Option<Duration>>,
}

impl MockQueryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the result returned for an exact query string.
    pub fn script(&self, query: impl Into<String>, result: Value) {
        if let Ok(mut scripted) = self.scripted.lock() {
            scripted.insert(query.into(), result);
        }
    }

    /// Make every subsequent execution fail.
    pub fn fail_all(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    /// Sleep this long inside every execution.
    pub fn with_delay(self, delay: Duration) -> Self {
        if let Ok(mut slot) = self.delay.lock() {
            *slot = Some(delay);
        }
        self
    }

    /// Number of times `execute` has run.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryExecutor for MockQueryExecutor {
    async fn execute(&self, query: &str, params: &[Value]) -> StratumResult<Value> {
        self.executions.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay.lock().ok().and_then(|slot| *slot);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_all.load(Ordering::SeqCst) {
            return Err(CacheError::compute(query, "scripted executor failure"));
        }

        let scripted = self
            .scripted
            .lock()
            .ok()
            .and_then(|scripted| scripted.get(query).cloned());
        Ok(scripted.unwrap_or_else(|| sample_rows(params.len())))
    }
}

// ============================================================================
// FLAKY REMOTE TIER
// ============================================================================

/// Remote tier whose failures are scriptable, for breaker and
/// degradation tests. While healthy it behaves like
/// [`InMemoryRemoteTier`]; while failing, every call errors and the call
/// counter still advances.
#[derive(Default)]
pub struct FlakyRemoteTier {
    inner: InMemoryRemoteTier,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl FlakyRemoteTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> StratumResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::RemoteTier {
                reason: "scripted remote failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteTier for FlakyRemoteTier {
    async fn get(&self, key: &str) -> StratumResult<Option<WireEntry>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn put(&self, entry: WireEntry) -> StratumResult<()> {
        self.check()?;
        self.inner.put(entry).await
    }

    async fn remove(&self, key: &str) -> StratumResult<()> {
        self.check()?;
        self.inner.remove(key).await
    }

    async fn clear(&self) -> StratumResult<()> {
        self.check()?;
        self.inner.clear().await
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

/// A small JSON row set shaped like a query result.
pub fn sample_rows(seed: usize) -> Value {
    json!([
        { "id": seed + 1, "name": "alpha", "total": 120.50 },
        { "id": seed + 2, "name": "beta", "total": 88.00 },
    ])
}

/// A payload comfortably above typical compression thresholds.
pub fn large_rows(count: usize) -> Value {
    let rows: Vec<Value> = (0..count)
        .map(|i| json!({ "id": i, "description": "x".repeat(64) }))
        .collect();
    Value::Array(rows)
}

/// A raw-codec entry with the given key, tags, and dependent tables.
pub fn entry_fixture(key: &str, tags: &[&str], tables: &[&str]) -> CacheEntry {
    let tags: BTreeSet<String> = tags.iter().map(|t| t.to_string()).collect();
    let tables: BTreeSet<String> = tables.iter().map(|t| t.to_string()).collect();
    CacheEntry::new(
        QueryKey::explicit(key),
        vec![CODEC_RAW, 1, 2, 3],
        Duration::from_secs(60),
        tags,
        tables,
    )
}
