//! Storage tiers: the in-process L1 map, the remote L2 trait, and the
//! tiered composition that routes between them.

pub mod memory;
pub mod remote;
pub mod tiered;

pub use memory::{EvictionCandidate, Lookup, MemoryStore};
pub use remote::{InMemoryRemoteTier, RemoteTier};
pub use tiered::{HitTier, TieredStore};
