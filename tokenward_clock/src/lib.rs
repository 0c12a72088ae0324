//! Utilities for telling and faking time
//!
//! Expiry decisions in the `tokenward` crates are made against a [`Clock`]
//! rather than by calling [`Instant::now()`] directly, so that tests can move
//! time forward deterministically with a [`TestClock`].

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use
)]
#![forbid(unsafe_code)]

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Represents a monotonic clock, which can tell the current instant
pub trait Clock {
    /// Gets the current instant according to this clock
    fn now(&self) -> Instant;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    #[inline]
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// The system clock as provided by `std::time::Instant`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct System;

impl Clock for System {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A test clock which only moves when told to
///
/// Clones share the same elapsed time, so a clone can be handed to the code
/// under test while the test itself advances the original.
#[derive(Clone, Debug)]
pub struct TestClock {
    origin: Instant,
    elapsed_nanos: Arc<AtomicU64>,
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    #[inline]
    fn now(&self) -> Instant {
        self.origin + Duration::from_nanos(self.elapsed_nanos.load(Ordering::Acquire))
    }
}

impl TestClock {
    /// Creates a new test clock frozen at the current instant
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed_nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Moves the clock forward by `by`
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_nanos.fetch_add(nanos, Ordering::AcqRel);
    }

    /// Moves the clock forward by `secs` seconds
    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }

    /// Total time this clock has been advanced since it was created
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_does_not_move_on_its_own() {
        let clock = TestClock::new();
        let first = clock.now();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.now(), first);
    }

    #[test]
    fn clones_observe_advances() {
        let clock = TestClock::new();
        let shared = clock.clone();
        let before = shared.now();

        clock.advance_secs(30);

        assert_eq!(shared.now() - before, Duration::from_secs(30));
        assert_eq!(shared.elapsed(), Duration::from_secs(30));
    }

    #[test]
    fn arc_clock_delegates() {
        let clock = Arc::new(TestClock::new());
        let before = clock.now();
        clock.advance(Duration::from_millis(250));
        assert_eq!(Clock::now(&clock) - before, Duration::from_millis(250));
    }
}
