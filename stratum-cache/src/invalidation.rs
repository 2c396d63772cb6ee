//! Dependency graph, tag index, and broadcast sequencing.
//!
//! The engine tracks which cache keys depend on which tables and which keys
//! carry which tags, so a committed write to table `T` can remove exactly the
//! affected entries and nothing else. For distributed operation it stamps
//! outbound invalidations with a per-table monotonically increasing sequence
//! and deduplicates inbound messages per `(origin, table)`, which makes
//! at-least-once delivery safe: duplicates and reordered messages are
//! skipped or reapplied without harm.
//!
//! The engine owns only the indices. Removing the entries themselves from
//! the storage tiers is the caller's job, driven by the key sets returned
//! here. Index references can therefore briefly outlive their entries (lazy
//! expiry, eviction races); lookups against a missing key simply find
//! nothing, and the reference disappears the next time the key is taken.

use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

use stratum_core::{CacheEntry, InvalidationMessage, NodeId, Seq, SeqCounter};

/// Table and tag indices plus broadcast sequence state.
pub struct InvalidationEngine {
    /// Dependency graph: table name to the keys cached from it.
    tables: DashMap<String, HashSet<String>>,
    /// Tag index: tag to the keys carrying it.
    tags: DashMap<String, HashSet<String>>,
    /// Outbound per-table sequence counters.
    counters: DashMap<String, SeqCounter>,
    /// Highest sequence applied per remote `(origin, table)`.
    seen: DashMap<(NodeId, String), Seq>,
    node_id: NodeId,
}

impl InvalidationEngine {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            tables: DashMap::new(),
            tags: DashMap::new(),
            counters: DashMap::new(),
            seen: DashMap::new(),
            node_id,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    // ========================================================================
    // Index maintenance
    // ========================================================================

    /// Register an entry's tags and dependent tables.
    pub fn index_entry(&self, entry: &CacheEntry) {
        let key = entry.key().as_str();
        for table in entry.dependent_tables() {
            self.tables
                .entry(table.clone())
                .or_default()
                .insert(key.to_string());
        }
        for tag in entry.tags() {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    /// Drop an entry's index references.
    pub fn unindex_entry(&self, entry: &CacheEntry) {
        let key = entry.key().as_str();
        self.unindex(key, entry.tags(), entry.dependent_tables());
    }

    /// Drop references the old entry held that the new one does not. Used
    /// when a put replaces an existing entry whose tags or tables changed.
    pub fn unindex_stale(&self, old: &CacheEntry, new: &CacheEntry) {
        let key = old.key().as_str();
        let stale_tables: BTreeSet<String> = old
            .dependent_tables()
            .difference(new.dependent_tables())
            .cloned()
            .collect();
        let stale_tags: BTreeSet<String> =
            old.tags().difference(new.tags()).cloned().collect();
        self.unindex(key, &stale_tags, &stale_tables);
    }

    fn unindex(&self, key: &str, tags: &BTreeSet<String>, tables: &BTreeSet<String>) {
        for table in tables {
            if let Some(mut keys) = self.tables.get_mut(table) {
                keys.remove(key);
                if keys.is_empty() {
                    drop(keys);
                    self.tables.remove_if(table, |_, keys| keys.is_empty());
                }
            }
        }
        for tag in tags {
            if let Some(mut keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    drop(keys);
                    self.tags.remove_if(tag, |_, keys| keys.is_empty());
                }
            }
        }
    }

    /// Remove and return every key indexed under a table.
    pub fn take_keys_for_table(&self, table: &str) -> Vec<String> {
        self.tables
            .remove(table)
            .map(|(_, keys)| keys.into_iter().collect())
            .unwrap_or_default()
    }

    /// Remove and return every key indexed under a tag.
    pub fn take_keys_for_tag(&self, tag: &str) -> Vec<String> {
        self.tags
            .remove(tag)
            .map(|(_, keys)| keys.into_iter().collect())
            .unwrap_or_default()
    }

    /// Reset both indices. Sequence state is kept so peers still
    /// deduplicate correctly after a clear.
    pub fn clear_indices(&self) {
        self.tables.clear();
        self.tags.clear();
    }

    // ========================================================================
    // Broadcast sequencing
    // ========================================================================

    /// Build the next outbound invalidation message for a table.
    pub fn next_message(&self, table: &str) -> InvalidationMessage {
        let seq = self
            .counters
            .entry(table.to_string())
            .or_default()
            .advance();
        InvalidationMessage {
            origin: self.node_id,
            table: table.to_string(),
            seq,
        }
    }

    /// Decide whether an inbound message should be applied, recording its
    /// sequence if so. Messages from this node and messages at or below the
    /// highest applied sequence are skipped.
    pub fn should_apply(&self, message: &InvalidationMessage) -> bool {
        if message.origin == self.node_id {
            return false;
        }
        let slot = (message.origin, message.table.clone());
        let mut seen = self.seen.entry(slot).or_insert(Seq::zero());
        if message.seq.is_newer_than(*seen) {
            *seen = message.seq;
            true
        } else {
            debug!(
                table = %message.table,
                seq = %message.seq,
                "skipping duplicate or stale invalidation message"
            );
            false
        }
    }
}
