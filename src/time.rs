//! Time abstraction so RNR backoff, credit retry, and reorder-window tests
//! can run deterministically instead of racing a wall clock.

use std::fmt::Debug;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Anything that can tell the engine what time it is.
pub trait TimeProvider: Debug + Send + Sync {
    fn now(&self) -> Instant;
}

/// The default provider, backed by `Instant::now()`.
#[derive(Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A manually-advanced clock for deterministic simulations of RNR backoff,
/// reassembly timeouts, and reorder-window draining.
#[derive(Debug)]
pub struct ManualClock {
    instant: RwLock<Instant>,
}

impl ManualClock {
    pub fn new(start: Instant) -> Self {
        Self {
            instant: RwLock::new(start),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.instant.write().unwrap() += duration;
    }

    pub fn set(&self, instant: Instant) {
        *self.instant.write().unwrap() = instant;
    }
}

impl TimeProvider for ManualClock {
    fn now(&self) -> Instant {
        *self.instant.read().unwrap()
    }
}
