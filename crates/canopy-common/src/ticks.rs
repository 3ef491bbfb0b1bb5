//! Injectable monotonic time source.
//!
//! All expiry and liveness logic is expressed in "ticks" read from a
//! [`Ticker`] rather than wall time, so timeouts are deterministic under
//! test: production uses [`SystemTicker`], tests use [`ManualTicker`] and
//! advance it explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A monotonic tick source. One tick is one nanosecond for the system
/// implementation; tests may use any unit as long as it never goes
/// backwards.
pub trait Ticker: Send + Sync {
    /// Current monotonic reading.
    fn read(&self) -> u64;
}

/// Ticker backed by the OS monotonic clock.
pub struct SystemTicker {
    origin: Instant,
}

impl SystemTicker {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for SystemTicker {
    fn read(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Manually-advanced ticker for deterministic tests.
#[derive(Default)]
pub struct ManualTicker {
    now: AtomicU64,
}

impl ManualTicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `delta` ticks.
    pub fn advance(&self, delta: u64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }

    /// Set the clock to an absolute reading. Panics if it would go backwards.
    pub fn set(&self, value: u64) {
        let previous = self.now.swap(value, Ordering::SeqCst);
        assert!(previous <= value, "manual ticker moved backwards");
    }
}

impl Ticker for ManualTicker {
    fn read(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
