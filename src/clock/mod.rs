mod virtual_clock;

pub use virtual_clock::VirtualClock;

use std::time::Instant;

/// Monotonic, high-resolution time source independent of the decoded signal.
/// Used to interpolate between LTC updates.
#[cfg_attr(test, mockall::automock)]
pub trait ReferenceClock {
    /// Seconds since an arbitrary fixed origin. Never goes backwards.
    fn now(&self) -> f64;
}

/// `Instant`-backed reference clock, origin at construction
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock { origin: Instant::now() }
    }

    /// Shares an origin with capture threads so their stamps line up
    pub fn with_origin(origin: Instant) -> Self {
        MonotonicClock { origin }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceClock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}
