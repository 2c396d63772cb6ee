//! Circuit breaker guarding the remote tier.
//!
//! Closed -> (threshold consecutive failures) -> Open -> (cooldown) ->
//! HalfOpen -> probe success -> Closed, probe failure -> Open. While open,
//! remote calls are skipped entirely and the cache degrades to the
//! in-process tier.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_transition: Instant,
    /// In HalfOpen, whether the single allowed probe is outstanding.
    probe_in_flight: bool,
}

/// Failure-isolation state machine for remote tier calls.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_transition: Instant::now(),
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // No panics occur while the lock is held; recover from poisoning
        // rather than propagating it.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a remote call may proceed right now.
    ///
    /// In Open state, the cooldown elapsing moves the breaker to HalfOpen
    /// and admits exactly one probe; further callers are refused until the
    /// probe resolves.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if inner.last_transition.elapsed() >= self.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.last_transition = Instant::now();
                    inner.probe_in_flight = true;
                    info!("circuit breaker half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful remote call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state != BreakerState::Closed {
            inner.state = BreakerState::Closed;
            inner.last_transition = Instant::now();
            info!("circuit breaker closed");
        }
    }

    /// Record a failed or timed-out remote call.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.probe_in_flight = false;
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.threshold {
                    inner.state = BreakerState::Open;
                    inner.last_transition = Instant::now();
                    warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.last_transition = Instant::now();
                warn!("circuit breaker probe failed, reopening");
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Reset to Closed with counters cleared.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        inner.last_transition = Instant::now();
    }
}
