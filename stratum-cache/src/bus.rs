//! Abstract invalidation transport.
//!
//! Distributed invalidation travels over a publish/subscribe channel that is
//! deliberately decoupled from the storage tiers, so the transport can be
//! swapped (in-process broadcast here, a message broker in a larger
//! deployment) without touching the engine. Delivery is at-least-once at
//! best; the engine's sequence dedup and entry TTLs absorb duplicates and
//! losses.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use stratum_core::{CacheError, InvalidationMessage, StratumResult};

/// Publish/subscribe seam for invalidation messages.
#[async_trait]
pub trait InvalidationBus: Send + Sync {
    /// Publish a message to every peer, including this process.
    async fn publish(&self, message: InvalidationMessage) -> StratumResult<()>;

    /// Open a subscription delivering every message published after this
    /// call.
    fn subscribe(&self) -> BusSubscription;
}

/// Receiving half of a bus subscription.
pub struct BusSubscription {
    rx: broadcast::Receiver<InvalidationMessage>,
}

impl BusSubscription {
    /// Wait for the next message. Returns `None` once the bus is closed.
    /// A slow subscriber that lags behind skips the overwritten messages
    /// and keeps going; skipped invalidations are bounded by entry TTLs.
    pub async fn recv(&mut self) -> Option<InvalidationMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "invalidation subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// In-process bus backed by a tokio broadcast channel. Serves a single
/// process's subscribers; multi-node deployments put a real transport
/// behind the same trait.
pub struct BroadcastBus {
    tx: broadcast::Sender<InvalidationMessage>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl InvalidationBus for BroadcastBus {
    async fn publish(&self, message: InvalidationMessage) -> StratumResult<()> {
        // send() fails only when no subscriber exists, which is not an
        // error for a cache with no peers.
        let _ = self.tx.send(message);
        Ok(())
    }

    fn subscribe(&self) -> BusSubscription {
        BusSubscription {
            rx: self.tx.subscribe(),
        }
    }
}

/// Bus that rejects every publish, for failure-path tests.
pub struct FailingBus;

#[async_trait]
impl InvalidationBus for FailingBus {
    async fn publish(&self, _message: InvalidationMessage) -> StratumResult<()> {
        Err(CacheError::BroadcastFailed {
            reason: "bus unavailable".to_string(),
        })
    }

    fn subscribe(&self) -> BusSubscription {
        let (_, rx) = broadcast::channel(1);
        BusSubscription { rx }
    }
}
