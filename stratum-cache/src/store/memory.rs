//! In-process (L1) store.
//!
//! A concurrent map keyed by cache key, so unrelated keys never contend.
//! Expired entries are removed lazily on lookup and reported distinctly so
//! the caller can account them as expirations rather than plain misses.
//! Index references left behind by lazy removal self-heal on the next
//! invalidation pass.

use dashmap::DashMap;
use std::sync::Arc;

use stratum_core::{CacheEntry, CacheMetrics};

/// Outcome of an L1 lookup.
#[derive(Debug)]
pub enum Lookup {
    /// Live entry; access bookkeeping already updated.
    Hit(CacheEntry),
    /// An entry existed but its TTL had passed; it has been removed.
    Expired,
    Absent,
}

/// The L1 store. Size gauges live in the shared [`CacheMetrics`] so the
/// sweeper and service observe one consistent view.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, CacheEntry>,
    metrics: Arc<CacheMetrics>,
}

/// Snapshot row used for LRU eviction ordering.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: String,
    pub last_accessed_millis: i64,
    pub stored_size: usize,
}

impl MemoryStore {
    pub fn new(metrics: Arc<CacheMetrics>) -> Self {
        Self {
            entries: DashMap::new(),
            metrics,
        }
    }

    /// Look up a key, lazily removing it if expired.
    pub fn lookup(&self, key: &str) -> Lookup {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                // Release the read guard before removing. The removal
                // re-checks expiry so a concurrent insert that refreshed
                // the key in the gap is left alone.
                drop(entry);
                if let Some((_, removed)) =
                    self.entries.remove_if(key, |_, e| e.is_expired())
                {
                    self.metrics.sub_stored(removed.stored_size() as u64);
                }
                return Lookup::Expired;
            }
            entry.touch();
            return Lookup::Hit(entry.clone());
        }
        Lookup::Absent
    }

    /// Insert an entry, returning the one it replaced.
    ///
    /// A put followed by a same-process lookup always observes the new
    /// value: the map write is synchronous.
    pub fn insert(&self, entry: CacheEntry) -> Option<CacheEntry> {
        let key = entry.key().as_str().to_string();
        self.metrics.add_stored(entry.stored_size() as u64);
        let old = self.entries.insert(key, entry);
        if let Some(ref old_entry) = old {
            self.metrics.sub_stored(old_entry.stored_size() as u64);
        }
        old
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.remove(key).map(|(_, entry)| entry);
        if let Some(ref entry) = removed {
            self.metrics.sub_stored(entry.stored_size() as u64);
        }
        removed
    }

    /// Drop every entry, returning how many were removed.
    pub fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.metrics.reset_stored();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size_bytes(&self) -> u64 {
        self.metrics.size_bytes()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Snapshot of live entries for LRU ordering. Taken without holding any
    /// shard lock across the whole pass; eviction tolerates entries that
    /// disappear between snapshot and removal.
    pub fn eviction_candidates(&self) -> Vec<EvictionCandidate> {
        self.entries
            .iter()
            .map(|entry| EvictionCandidate {
                key: entry.key().as_str().to_string(),
                last_accessed_millis: entry.last_accessed_millis(),
                stored_size: entry.stored_size(),
            })
            .collect()
    }

    /// Keys of entries whose TTL has passed, for the eager sweep.
    pub fn expired_keys(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.is_expired())
            .map(|entry| entry.key().as_str().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use stratum_core::{QueryKey, CODEC_RAW};

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(CacheMetrics::new()))
    }

    fn entry(key: &str, ttl: Duration, size: usize) -> CacheEntry {
        let mut payload = vec![CODEC_RAW];
        payload.resize(size, 0);
        CacheEntry::new(
            QueryKey::explicit(key),
            payload,
            ttl,
            BTreeSet::new(),
            BTreeSet::new(),
        )
    }

    #[test]
    fn test_insert_then_lookup_hits() {
        let store = store();
        store.insert(entry("a", Duration::from_secs(60), 16));

        match store.lookup("a") {
            Lookup::Hit(found) => {
                assert_eq!(found.key().as_str(), "a");
                assert_eq!(found.access_count(), 1);
            }
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[test]
    fn test_absent_key() {
        assert!(matches!(store().lookup("missing"), Lookup::Absent));
    }

    #[test]
    fn test_expired_entry_removed_on_lookup() {
        let store = store();
        store.insert(entry("a", Duration::ZERO, 16));
        assert_eq!(store.len(), 1);

        assert!(matches!(store.lookup("a"), Lookup::Expired));
        assert_eq!(store.len(), 0);
        assert_eq!(store.size_bytes(), 0);
        // Gone entirely on the next lookup.
        assert!(matches!(store.lookup("a"), Lookup::Absent));
    }

    #[test]
    fn test_refreshed_entry_survives_concurrent_expiry_removal() {
        // A reader that observed an expired entry must not delete a fresh
        // replacement written between its read and its removal.
        let store = Arc::new(store());
        for _ in 0..200 {
            store.insert(entry("a", Duration::ZERO, 16));
            let reader = {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store.lookup("a");
                })
            };
            store.insert(entry("a", Duration::from_secs(60), 16));
            reader.join().expect("reader thread");

            assert!(matches!(store.lookup("a"), Lookup::Hit(_)));
            store.remove("a");
        }
        assert_eq!(store.size_bytes(), 0);
    }

    #[test]
    fn test_replace_updates_size_accounting() {
        let store = store();
        store.insert(entry("a", Duration::from_secs(60), 100));
        assert_eq!(store.size_bytes(), 100);

        let old = store.insert(entry("a", Duration::from_secs(60), 40));
        assert!(old.is_some());
        assert_eq!(store.size_bytes(), 40);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_returns_entry_and_updates_gauges() {
        let store = store();
        store.insert(entry("a", Duration::from_secs(60), 32));
        let removed = store.remove("a").expect("entry present");
        assert_eq!(removed.key().as_str(), "a");
        assert_eq!(store.size_bytes(), 0);
        assert!(store.remove("a").is_none());
    }

    #[test]
    fn test_clear() {
        let store = store();
        store.insert(entry("a", Duration::from_secs(60), 8));
        store.insert(entry("b", Duration::from_secs(60), 8));
        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
        assert_eq!(store.size_bytes(), 0);
    }

    #[test]
    fn test_eviction_candidates_reflect_recency() {
        let store = store();
        store.insert(entry("old", Duration::from_secs(60), 8));
        std::thread::sleep(Duration::from_millis(5));
        store.insert(entry("new", Duration::from_secs(60), 8));

        let candidates = store.eviction_candidates();
        assert_eq!(candidates.len(), 2);
        let old = candidates.iter().find(|c| c.key == "old").expect("old present");
        let new = candidates.iter().find(|c| c.key == "new").expect("new present");
        assert!(old.last_accessed_millis <= new.last_accessed_millis);
    }

    #[test]
    fn test_expired_keys_only_lists_expired() {
        let store = store();
        store.insert(entry("live", Duration::from_secs(60), 8));
        store.insert(entry("dead", Duration::ZERO, 8));

        let expired = store.expired_keys();
        assert_eq!(expired, vec!["dead".to_string()]);
    }
}
