/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Millisecond epoch clock abstraction.
//!
//! Session timing is entirely deadline-based: every timer in the state
//! machines is a u64 millisecond deadline compared against an injected
//! clock, so tests can drive time deterministically.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of epoch-relative time in milliseconds.
pub trait EpochClock: Send + Sync {
    /// Returns the current time in milliseconds since the Unix epoch.
    fn time_ms(&self) -> u64;
}

/// Wall-clock implementation of [`EpochClock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEpochClock;

impl EpochClock for SystemEpochClock {
    fn time_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Manually advanced clock for tests.
///
/// Cloning shares the underlying time source, so a test can hold one handle
/// and hand another to the code under test.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock set to `now_ms`.
    #[must_use]
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(now_ms)),
        }
    }

    /// Sets the current time.
    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    /// Advances the current time by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl EpochClock for ManualClock {
    fn time_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotone_enough() {
        let clock = SystemEpochClock;
        let a = clock.time_ms();
        let b = clock.time_ms();
        assert!(b >= a);
        // Sanity: after 2020-01-01.
        assert!(a > 1_577_836_800_000);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.time_ms(), 100);

        clock.advance(50);
        assert_eq!(clock.time_ms(), 150);

        clock.set(10);
        assert_eq!(clock.time_ms(), 10);

        let shared = clock.clone();
        shared.advance(5);
        assert_eq!(clock.time_ms(), 15);
    }
}
