//! Time sources for quota accounting and timers
//!
//! All scheduler timestamps are signed nanoseconds. A timestamp of `0` is
//! reserved to mean "not attributed", so every clock starts at 1 or later.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Nanosecond clock used by quota groups and the carrier pool
pub trait Clock: Send + Sync {
    /// Current time in nanoseconds, always > 0
    fn now_ns(&self) -> i64;

    /// Block the calling thread for `ns` nanoseconds
    fn park_for(&self, ns: i64);
}

/// Wall-clock time backed by `Instant`
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> i64 {
        let elapsed = self.origin.elapsed().as_nanos();
        i64::try_from(elapsed).unwrap_or(i64::MAX - 1) + 1
    }

    fn park_for(&self, ns: i64) {
        if ns > 0 {
            std::thread::sleep(Duration::from_nanos(ns as u64));
        }
    }
}

/// Manually advanced clock for deterministic tests
///
/// `park_for` advances the clock instead of sleeping, so a parked caller
/// observes exactly the requested delay.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ns: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ns.max(1)),
        }
    }

    /// Move time forward by `ns`
    pub fn advance(&self, ns: i64) {
        self.now.fetch_add(ns.max(0), Ordering::SeqCst);
    }

    /// Jump to an absolute time; never moves backwards
    pub fn set(&self, ns: i64) {
        self.now.fetch_max(ns, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn park_for(&self, ns: i64) {
        self.advance(ns);
    }
}

/// Milliseconds to nanoseconds
pub const fn ms(value: i64) -> i64 {
    value * 1_000_000
}
