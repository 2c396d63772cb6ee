//! Invalidation sequence numbers and broadcast messages.
//!
//! Each table carries a monotonically increasing sequence. Peers apply
//! broadcast invalidations with at-least-once delivery, deduplicating on
//! `(table, seq)`; reapplying a duplicate or out-of-order message is a
//! harmless no-op because invalidation is idempotent.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::NodeId;

/// A point in a table's invalidation history.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Seq(u64);

impl Seq {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// The zero sequence (nothing invalidated yet).
    pub fn zero() -> Self {
        Self(0)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_newer_than(&self, other: Seq) -> bool {
        self.0 > other.0
    }
}

impl std::fmt::Display for Seq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread-safe per-table sequence source.
#[derive(Debug, Default)]
pub struct SeqCounter {
    value: AtomicU64,
}

impl SeqCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the next sequence.
    pub fn advance(&self) -> Seq {
        Seq(self.value.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// The most recently issued sequence.
    pub fn current(&self) -> Seq {
        Seq(self.value.load(Ordering::SeqCst))
    }
}

/// An invalidation broadcast to peer nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    /// Node that published the message; receivers skip their own.
    pub origin: NodeId,
    /// Table whose dependents must be dropped.
    pub table: String,
    /// Per-table sequence for deduplication.
    pub seq: Seq,
}

impl InvalidationMessage {
    pub fn new(origin: NodeId, table: impl Into<String>, seq: Seq) -> Self {
        Self {
            origin,
            table: table.into(),
            seq,
        }
    }
}
