//! The time abstraction injected into every device, so HEV cycle expiry and uptime/downtime
//! reporting are testable without real elapsed time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A source of "now", for both monotonic comparisons and wire-format timestamps.
pub trait Clock: Send + Sync {
    /// A monotonic instant, used for cycle-duration comparisons.
    fn now(&self) -> Instant;
    /// Nanoseconds since the Unix epoch, for fields like [lifx_protocol::Message::StateInfo::time].
    fn now_unix_nanos(&self) -> u64;
}

/// The production clock: wraps [Instant::now] and [SystemTime::now].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_unix_nanos(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// A test double whose `now()` only advances when explicitly stepped.
///
/// Holds a fixed base [Instant] and an offset in nanoseconds; `now_unix_nanos` starts at zero
/// and advances by the same offset, so duration comparisons in test code don't need to care
/// which representation a handler reads.
#[derive(Clone)]
pub struct SteppedClock {
    base: Instant,
    offset_nanos: Arc<AtomicU64>,
}

impl SteppedClock {
    pub fn new() -> SteppedClock {
        SteppedClock {
            base: Instant::now(),
            offset_nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Advance the clock by the given number of nanoseconds.
    pub fn advance(&self, nanos: u64) {
        self.offset_nanos.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Default for SteppedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SteppedClock {
    fn now(&self) -> Instant {
        self.base + std::time::Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }

    fn now_unix_nanos(&self) -> u64 {
        self.offset_nanos.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stepped_clock_only_advances_when_told() {
        let clock = SteppedClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);
        clock.advance(1_000_000_000);
        assert!(clock.now() > t0);
        assert_eq!(clock.now_unix_nanos(), 1_000_000_000);
    }
}
