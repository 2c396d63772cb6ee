//! Remote (L2) tier abstraction.
//!
//! The distributed transport is swappable: the engine only sees async
//! get/put/remove/clear over wire-form entries. Implementations own their
//! own expiry; the in-memory implementation here serves single-node
//! deployments and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use stratum_core::{StratumResult, WireEntry};

/// A remote cache tier shared between nodes.
///
/// All methods must respect the caller's timeout discipline: the engine
/// wraps every call in a bounded timeout and treats timeouts as failures
/// for circuit-breaker accounting.
#[async_trait]
pub trait RemoteTier: Send + Sync {
    /// Fetch an entry. Implementations should not return entries whose
    /// remaining TTL has elapsed.
    async fn get(&self, key: &str) -> StratumResult<Option<WireEntry>>;

    /// Store an entry with its remaining TTL.
    async fn put(&self, entry: WireEntry) -> StratumResult<()>;

    /// Remove an entry if present.
    async fn remove(&self, key: &str) -> StratumResult<()>;

    /// Drop all entries.
    async fn clear(&self) -> StratumResult<()>;
}

struct StoredRemote {
    entry: WireEntry,
    deadline: Instant,
}

/// In-memory [`RemoteTier`] backed by a `tokio` RwLock.
#[derive(Default)]
pub struct InMemoryRemoteTier {
    entries: RwLock<HashMap<String, StoredRemote>>,
}

impl InMemoryRemoteTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries (expired ones may still be counted until
    /// their next lookup).
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl RemoteTier for InMemoryRemoteTier {
    async fn get(&self, key: &str) -> StratumResult<Option<WireEntry>> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(stored) if stored.deadline > Instant::now() => {
                    let mut entry = stored.entry.clone();
                    // Report the TTL still remaining, not the original one.
                    entry.ttl_remaining_ms =
                        stored.deadline.saturating_duration_since(Instant::now()).as_millis() as u64;
                    return Ok(Some(entry));
                }
                Some(_) => {}
            }
        }
        // Expired: drop it under the write lock.
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn put(&self, entry: WireEntry) -> StratumResult<()> {
        let deadline = Instant::now() + Duration::from_millis(entry.ttl_remaining_ms);
        self.entries
            .write()
            .await
            .insert(entry.key.clone(), StoredRemote { entry, deadline });
        Ok(())
    }

    async fn remove(&self, key: &str) -> StratumResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> StratumResult<()> {
        self.entries.write().await.clear();
        Ok(())
    }
}
