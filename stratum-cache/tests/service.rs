//! End-to-end tests for the cache service facade.

use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use stratum_cache::{
    BreakerState, BroadcastBus, CacheService, FailingBus, HitSource, InvalidationBus, PutOptions,
    QueryExecutor, RemoteTier,
};
use stratum_core::{
    CacheConfig, CacheError, Compression, QueryKey, StorageMode, WireEntry, CODEC_GZIP,
};
use stratum_test_utils::{sample_rows, FlakyRemoteTier, InMemoryRemoteTier, MockQueryExecutor};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn memory_config() -> CacheConfig {
    CacheConfig::default().with_sweep_interval(Duration::from_secs(3600))
}

fn distributed_config() -> CacheConfig {
    memory_config()
        .with_storage_mode(StorageMode::Distributed)
        .with_remote_timeout(Duration::from_millis(200))
}

#[tokio::test]
async fn test_put_then_get_within_ttl() {
    init_tracing();
    let service = CacheService::new(memory_config()).expect("service builds");
    let key = QueryKey::explicit("orders:recent");
    let rows = sample_rows(0);

    service
        .put(&key, &rows, PutOptions::new())
        .await
        .expect("put succeeds");

    let hit = service
        .get::<Value>(&key)
        .await
        .expect("get succeeds")
        .expect("entry present");
    assert_eq!(hit.value, rows);
    assert!(hit.cached());
    assert_eq!(hit.source, HitSource::L1);
    assert!(hit.age < Duration::from_secs(5));

    service.shutdown().await;
}

#[tokio::test]
async fn test_entry_absent_after_ttl() {
    let service = CacheService::new(memory_config()).expect("service builds");
    let key = QueryKey::explicit("orders:recent");

    service
        .put(
            &key,
            &json!({"n": 1}),
            PutOptions::new().with_ttl(Duration::from_millis(30)),
        )
        .await
        .expect("put succeeds");

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(service
        .get::<Value>(&key)
        .await
        .expect("get succeeds")
        .is_none());

    let stats = service.stats();
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.misses, 1);
    service.shutdown().await;
}

#[tokio::test]
async fn test_invalidate_tag_removes_exactly_tagged_entries() {
    let service = CacheService::new(memory_config()).expect("service builds");
    for (name, tag) in [("a", "products"), ("b", "products"), ("c", "products")] {
        service
            .put(
                &QueryKey::explicit(name),
                &json!({"q": name}),
                PutOptions::new().with_tag(tag),
            )
            .await
            .expect("put succeeds");
    }
    service
        .put(
            &QueryKey::explicit("d"),
            &json!({"q": "d"}),
            PutOptions::new().with_tag("categories"),
        )
        .await
        .expect("put succeeds");

    let removed = service
        .invalidate_tag("products")
        .await
        .expect("invalidation succeeds");
    assert_eq!(removed, 3);

    for name in ["a", "b", "c"] {
        assert!(service
            .get::<Value>(&QueryKey::explicit(name))
            .await
            .expect("get succeeds")
            .is_none());
    }
    assert!(service
        .get::<Value>(&QueryKey::explicit("d"))
        .await
        .expect("get succeeds")
        .is_some());
    service.shutdown().await;
}

#[tokio::test]
async fn test_invalidate_table_spares_unrelated_entries() {
    let service = CacheService::new(memory_config()).expect("service builds");
    service
        .put(
            &QueryKey::explicit("orders-query"),
            &json!({"rows": 3}),
            PutOptions::new().with_tables(["orders", "users"]),
        )
        .await
        .expect("put succeeds");
    service
        .put(
            &QueryKey::explicit("categories-query"),
            &json!({"rows": 9}),
            PutOptions::new().with_table("categories"),
        )
        .await
        .expect("put succeeds");

    let removed = service
        .invalidate_table("orders")
        .await
        .expect("invalidation succeeds");
    assert_eq!(removed, 1);
    assert!(service
        .get::<Value>(&QueryKey::explicit("orders-query"))
        .await
        .expect("get succeeds")
        .is_none());
    assert!(service
        .get::<Value>(&QueryKey::explicit("categories-query"))
        .await
        .expect("get succeeds")
        .is_some());
    service.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_get_or_compute_runs_one_execution() {
    let service = CacheService::new(memory_config()).expect("service builds");
    let executor = Arc::new(MockQueryExecutor::new().with_delay(Duration::from_millis(50)));

    let mut handles = Vec::new();
    for _ in 0..12 {
        let service = service.clone();
        let executor = Arc::clone(&executor);
        handles.push(tokio::spawn(async move {
            service
                .cached_query(
                    executor,
                    "SELECT * FROM orders WHERE status = ?",
                    &[json!("open")],
                    PutOptions::new().with_table("orders"),
                )
                .await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(
            handle
                .await
                .expect("task completes")
                .expect("query succeeds"),
        );
    }
    assert_eq!(executor.executions(), 1);
    let first = &results[0].value;
    assert!(results.iter().all(|hit| &hit.value == first));

    // A later call is a plain cache hit, still no second execution.
    let hit = service
        .cached_query(
            Arc::clone(&executor) as Arc<dyn QueryExecutor>,
            "SELECT * FROM orders WHERE status = ?",
            &[json!("open")],
            PutOptions::new(),
        )
        .await
        .expect("query succeeds");
    assert_eq!(hit.source, HitSource::L1);
    assert_eq!(executor.executions(), 1);
    service.shutdown().await;
}

#[tokio::test]
async fn test_compute_failure_reaches_all_waiters_and_caches_nothing() {
    let service = CacheService::new(memory_config()).expect("service builds");
    let executor = Arc::new(MockQueryExecutor::new().with_delay(Duration::from_millis(30)));
    executor.fail_all(true);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let service = service.clone();
        let executor = Arc::clone(&executor);
        handles.push(tokio::spawn(async move {
            service
                .cached_query(executor, "SELECT 1", &[], PutOptions::new())
                .await
        }));
    }
    for handle in handles {
        let result = handle.await.expect("task completes");
        assert!(matches!(result, Err(CacheError::ComputeFailed { .. })));
    }

    // Nothing was cached, so a healthy retry recomputes.
    executor.fail_all(false);
    let hit = service
        .cached_query(
            Arc::clone(&executor) as Arc<dyn QueryExecutor>,
            "SELECT 1",
            &[],
            PutOptions::new(),
        )
        .await
        .expect("query succeeds");
    assert_eq!(hit.source, HitSource::Computed);
    service.shutdown().await;
}

#[tokio::test]
async fn test_key_derivation_normalizes_whitespace() {
    let service = CacheService::new(memory_config()).expect("service builds");
    let executor = Arc::new(MockQueryExecutor::new());

    service
        .cached_query(
            Arc::clone(&executor) as Arc<dyn QueryExecutor>,
            "SELECT *   FROM orders\n WHERE id = ?",
            &[json!(7)],
            PutOptions::new(),
        )
        .await
        .expect("query succeeds");
    let hit = service
        .cached_query(
            Arc::clone(&executor) as Arc<dyn QueryExecutor>,
            "SELECT * FROM orders WHERE id = ?",
            &[json!(7)],
            PutOptions::new(),
        )
        .await
        .expect("query succeeds");

    assert_eq!(executor.executions(), 1);
    assert_eq!(hit.source, HitSource::L1);
    service.shutdown().await;
}

#[tokio::test]
async fn test_size_limit_enforced_by_background_eviction() {
    let config = memory_config()
        .with_max_size_bytes(4096)
        .with_compression(Compression::None)
        .with_eviction_batch_percent(20);
    let service = CacheService::new(config).expect("service builds");

    // Each payload is ~600 bytes serialized; 20 of them far exceed 4 KiB.
    for i in 0..20 {
        service
            .put(
                &QueryKey::explicit(format!("k{i}")),
                &json!({ "id": i, "blob": "x".repeat(512) }),
                PutOptions::new(),
            )
            .await
            .expect("put succeeds");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    // Give the maintenance task a moment to absorb the pressure signals.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = service.stats();
    assert!(stats.size_bytes <= 4096, "size {} over limit", stats.size_bytes);
    assert!(stats.evictions > 0);
    // Newest entries survive LRU eviction.
    assert!(service
        .get::<Value>(&QueryKey::explicit("k19"))
        .await
        .expect("get succeeds")
        .is_some());
    service.shutdown().await;
}

#[tokio::test]
async fn test_breaker_opens_then_recovers() {
    let remote = Arc::new(FlakyRemoteTier::new());
    let config = distributed_config()
        .with_breaker_threshold(3)
        .with_breaker_cooldown(Duration::from_millis(100));
    let service = CacheService::with_remote(
        config,
        Arc::clone(&remote) as Arc<dyn RemoteTier>,
        Arc::new(BroadcastBus::default()),
    )
    .expect("service builds");

    remote.set_failing(true);
    for i in 0..3 {
        let _ = service
            .get::<Value>(&QueryKey::explicit(format!("missing-{i}")))
            .await;
    }
    assert_eq!(service.breaker_state(), BreakerState::Open);

    // While open, remote calls are skipped entirely and L1 still serves.
    let calls_when_opened = remote.calls();
    service
        .put(&QueryKey::explicit("local"), &json!(1), PutOptions::new())
        .await
        .expect("put succeeds");
    assert!(service
        .get::<Value>(&QueryKey::explicit("local"))
        .await
        .expect("get succeeds")
        .is_some());
    assert_eq!(remote.calls(), calls_when_opened);

    // After the cooldown a probe goes through and closes the circuit.
    remote.set_failing(false);
    tokio::time::sleep(Duration::from_millis(150)).await;
    let _ = service
        .get::<Value>(&QueryKey::explicit("probe"))
        .await
        .expect("get succeeds");
    assert_eq!(service.breaker_state(), BreakerState::Closed);
    service.shutdown().await;
}

#[tokio::test]
async fn test_distributed_put_visible_to_peer_via_l2() {
    let remote = Arc::new(InMemoryRemoteTier::new());
    let bus = Arc::new(BroadcastBus::default());
    let node_a = CacheService::with_remote(
        distributed_config(),
        Arc::clone(&remote) as Arc<dyn RemoteTier>,
        Arc::clone(&bus) as Arc<dyn InvalidationBus>,
    )
    .expect("service builds");
    let node_b = CacheService::with_remote(
        distributed_config(),
        Arc::clone(&remote) as Arc<dyn RemoteTier>,
        Arc::clone(&bus) as Arc<dyn InvalidationBus>,
    )
    .expect("service builds");

    let key = QueryKey::explicit("shared");
    node_a
        .put(&key, &json!({"from": "a"}), PutOptions::new())
        .await
        .expect("put succeeds");

    let hit = node_b
        .get::<Value>(&key)
        .await
        .expect("get succeeds")
        .expect("entry present");
    assert_eq!(hit.source, HitSource::L2);
    assert_eq!(hit.value, json!({"from": "a"}));

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn test_peer_invalidation_over_bus() {
    let remote = Arc::new(InMemoryRemoteTier::new());
    let bus = Arc::new(BroadcastBus::default());
    let node_a = CacheService::with_remote(
        distributed_config(),
        Arc::clone(&remote) as Arc<dyn RemoteTier>,
        Arc::clone(&bus) as Arc<dyn InvalidationBus>,
    )
    .expect("service builds");
    let node_b = CacheService::with_remote(
        distributed_config(),
        Arc::clone(&remote) as Arc<dyn RemoteTier>,
        Arc::clone(&bus) as Arc<dyn InvalidationBus>,
    )
    .expect("service builds");

    // Both nodes cache an orders-dependent entry locally.
    let key = QueryKey::explicit("orders-query");
    let opts = || PutOptions::new().with_table("orders");
    node_a
        .put(&key, &json!(1), opts())
        .await
        .expect("put succeeds");
    node_b
        .put(&key, &json!(1), opts())
        .await
        .expect("put succeeds");

    // A write on node A invalidates node B's copy through the bus.
    node_a
        .invalidate_table("orders")
        .await
        .expect("invalidation succeeds");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats_b = node_b.stats();
    assert_eq!(stats_b.entries, 0, "peer L1 still holds the entry");

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn test_lost_broadcast_is_not_an_error() {
    let remote = Arc::new(InMemoryRemoteTier::new());
    let service = CacheService::with_remote(
        distributed_config(),
        Arc::clone(&remote) as Arc<dyn RemoteTier>,
        Arc::new(FailingBus),
    )
    .expect("service builds");

    service
        .put(
            &QueryKey::explicit("orders-query"),
            &json!(1),
            PutOptions::new().with_table("orders"),
        )
        .await
        .expect("put succeeds");

    // The local removal succeeds; the lost broadcast is only logged.
    let removed = service
        .invalidate_table("orders")
        .await
        .expect("invalidation succeeds");
    assert_eq!(removed, 1);
    service.shutdown().await;
}

#[tokio::test]
async fn test_disabled_smart_invalidation_clears_everything() {
    let config = memory_config().with_smart_invalidation(false);
    let service = CacheService::new(config).expect("service builds");

    service
        .put(
            &QueryKey::explicit("a"),
            &json!(1),
            PutOptions::new().with_table("orders"),
        )
        .await
        .expect("put succeeds");
    service
        .put(&QueryKey::explicit("b"), &json!(2), PutOptions::new())
        .await
        .expect("put succeeds");

    // Without the dependency graph the fallback is a full local clear.
    let removed = service
        .invalidate_table("orders")
        .await
        .expect("invalidation succeeds");
    assert_eq!(removed, 2);
    assert_eq!(service.stats().entries, 0);
    service.shutdown().await;
}

#[tokio::test]
async fn test_disabled_smart_invalidation_clears_remote_tier_too() {
    let remote = Arc::new(InMemoryRemoteTier::new());
    let config = distributed_config().with_smart_invalidation(false);
    let service = CacheService::with_remote(
        config,
        Arc::clone(&remote) as Arc<dyn RemoteTier>,
        Arc::new(BroadcastBus::default()),
    )
    .expect("service builds");

    let key = QueryKey::explicit("orders-query");
    service
        .put(&key, &json!({"rows": 1}), PutOptions::new().with_table("orders"))
        .await
        .expect("put succeeds");

    service
        .invalidate_table("orders")
        .await
        .expect("invalidation succeeds");

    // With every tier cleared, a later read cannot backfill the written
    // table's old rows from L2.
    assert!(service
        .get::<Value>(&key)
        .await
        .expect("get succeeds")
        .is_none());
    assert!(remote
        .get("orders-query")
        .await
        .expect("remote get succeeds")
        .is_none());
    service.shutdown().await;
}

#[tokio::test]
async fn test_corrupt_remote_entry_is_a_miss_and_purged() {
    let remote = Arc::new(InMemoryRemoteTier::new());
    remote
        .put(WireEntry {
            key: "bad".to_string(),
            payload: vec![CODEC_GZIP, 0xde, 0xad, 0xbe, 0xef],
            ttl_remaining_ms: 60_000,
            tags: BTreeSet::new(),
            dependent_tables: BTreeSet::new(),
            created_at: chrono::Utc::now(),
        })
        .await
        .expect("seed succeeds");

    let service = CacheService::with_remote(
        distributed_config(),
        Arc::clone(&remote) as Arc<dyn RemoteTier>,
        Arc::new(BroadcastBus::default()),
    )
    .expect("service builds");

    // An undecodable payload reads as a miss, never an error.
    assert!(service
        .get::<Value>(&QueryKey::explicit("bad"))
        .await
        .expect("get succeeds")
        .is_none());
    // And it was dropped from every tier in passing.
    assert!(remote
        .get("bad")
        .await
        .expect("remote get succeeds")
        .is_none());
    service.shutdown().await;
}

#[tokio::test]
async fn test_compression_round_trips_large_payloads() {
    let config = memory_config().with_compression_threshold(256);
    let service = CacheService::new(config).expect("service builds");
    let key = QueryKey::explicit("big");
    let payload = stratum_test_utils::large_rows(200);

    service
        .put(&key, &payload, PutOptions::new())
        .await
        .expect("put succeeds");
    let hit = service
        .get::<Value>(&key)
        .await
        .expect("get succeeds")
        .expect("entry present");
    assert_eq!(hit.value, payload);

    // Repetitive rows compress far below their serialized size.
    let serialized = serde_json::to_vec(&payload).expect("payload serializes").len() as u64;
    assert!(service.stats().size_bytes < serialized / 2);
    service.shutdown().await;
}

#[tokio::test]
async fn test_hit_rate_tracks_reads() {
    let service = CacheService::new(memory_config()).expect("service builds");
    let key = QueryKey::explicit("k");
    service
        .put(&key, &json!(1), PutOptions::new())
        .await
        .expect("put succeeds");

    for _ in 0..3 {
        service.get::<Value>(&key).await.expect("get succeeds");
    }
    service
        .get::<Value>(&QueryKey::explicit("absent"))
        .await
        .expect("get succeeds");

    let stats = service.stats();
    assert_eq!(stats.hits, 3);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
    service.shutdown().await;
}

#[tokio::test]
async fn test_operations_rejected_after_shutdown() {
    let service = CacheService::new(memory_config()).expect("service builds");
    service.shutdown().await;
    assert!(service.is_shut_down());

    let key = QueryKey::explicit("k");
    assert!(matches!(
        service.get::<Value>(&key).await,
        Err(CacheError::ShutDown)
    ));
    assert!(matches!(
        service.put(&key, &json!(1), PutOptions::new()).await,
        Err(CacheError::ShutDown)
    ));
    assert!(matches!(
        service.invalidate_table("orders").await,
        Err(CacheError::ShutDown)
    ));

    // Shutdown is idempotent.
    service.shutdown().await;
}

#[tokio::test]
async fn test_memory_mode_rejects_remote_tier() {
    let result = CacheService::with_remote(
        memory_config(),
        Arc::new(InMemoryRemoteTier::new()) as Arc<dyn RemoteTier>,
        Arc::new(BroadcastBus::default()),
    );
    assert!(result.is_err());
}
