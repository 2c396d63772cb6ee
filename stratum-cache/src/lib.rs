//! STRATUM Cache - Tiered Query Result Cache Engine
//!
//! The engine crate: storage tiers, compression codec, circuit breaker,
//! singleflight miss coalescing, the invalidation engine and bus, the TTL
//! sweeper, and the `CacheService` facade that wires them together.
//! Pure data types and errors live in `stratum-core`.

pub mod breaker;
pub mod bus;
pub mod codec;
pub mod eviction;
pub mod invalidation;
pub mod service;
pub mod singleflight;
pub mod store;

mod sweeper;

pub use breaker::{BreakerState, CircuitBreaker};
pub use bus::{BroadcastBus, BusSubscription, FailingBus, InvalidationBus};
pub use codec::PayloadCodec;
pub use eviction::EvictionManager;
pub use invalidation::InvalidationEngine;
pub use service::{
    CacheHit, CacheService, HitSource, PutOptions, QueryExecutor, WriteNotifier,
};
pub use singleflight::Singleflight;
pub use store::{
    EvictionCandidate, HitTier, InMemoryRemoteTier, Lookup, MemoryStore, RemoteTier, TieredStore,
};
