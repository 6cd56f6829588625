use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Monotonic time source for the scheduler and the measurement history.
///
/// Implementations only provide `now()`; everything the server derives from
/// time (tick deltas, wall-clock seconds for the history ring) goes through
/// [`TimeBase`].
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Production clock backed by std::time::Instant.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Couples a monotonic clock to a unix-millisecond anchor taken at startup.
///
/// The history ring is keyed by wall-clock seconds while control timing must
/// stay monotonic. Anchoring once keeps the two consistent: after startup,
/// wall time advances exactly as fast as the monotonic clock and an NTP step
/// cannot tear holes in (or fold) the history sequence. Tests pin the anchor
/// to get deterministic sequence numbers.
pub struct TimeBase {
    clock: Arc<dyn Clock + Send + Sync>,
    epoch: Instant,
    unix_epoch_ms: u64,
}

impl TimeBase {
    /// Anchor to the system clock now.
    pub fn new(clock: Arc<dyn Clock + Send + Sync>) -> Self {
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::anchored(clock, unix_ms)
    }

    /// Anchor to an explicit unix time (deterministic tests).
    pub fn anchored(clock: Arc<dyn Clock + Send + Sync>, unix_epoch_ms: u64) -> Self {
        let epoch = clock.now();
        Self {
            clock,
            epoch,
            unix_epoch_ms,
        }
    }

    /// Milliseconds since the process epoch, saturating at 0 on underflow.
    pub fn elapsed_ms(&self) -> u64 {
        self.clock
            .now()
            .saturating_duration_since(self.epoch)
            .as_millis() as u64
    }

    /// Current unix time in milliseconds: the anchor plus monotonic elapsed.
    pub fn now_unix_ms(&self) -> u64 {
        self.unix_epoch_ms + self.elapsed_ms()
    }
}

/// Deterministic clock for tests, advanced manually.
///
/// Not gated behind cfg(test): the engine crate's integration tests drive
/// scheduler ticks and history time with it.
pub mod test_clock {
    use super::*;

    /// now() = origin + offset; nothing moves unless a test says so.
    #[derive(Debug, Clone)]
    pub struct TestClock {
        origin: Instant,
        offset: Arc<Mutex<Duration>>,
    }

    impl Default for TestClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TestClock {
        pub fn new() -> Self {
            Self {
                origin: Instant::now(),
                offset: Arc::new(Mutex::new(Duration::ZERO)),
            }
        }

        /// Advance the clock by the given duration.
        pub fn advance(&self, d: Duration) {
            if let Ok(mut off) = self.offset.lock() {
                *off = off.saturating_add(d);
            }
        }

        /// Set the absolute offset relative to origin.
        pub fn set_offset(&self, d: Duration) {
            if let Ok(mut off) = self.offset.lock() {
                *off = d;
            }
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            let off = self.offset.lock().map(|g| *g).unwrap_or(Duration::ZERO);
            self.origin + off
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_clock::TestClock;
    use super::*;

    #[test]
    fn timebase_tracks_the_monotonic_clock_from_its_anchor() {
        let clock = TestClock::new();
        let tb = TimeBase::anchored(Arc::new(clock.clone()), 1_000_000_000);
        assert_eq!(tb.now_unix_ms(), 1_000_000_000);
        clock.advance(Duration::from_millis(1234));
        assert_eq!(tb.elapsed_ms(), 1234);
        assert_eq!(tb.now_unix_ms(), 1_000_001_234);
    }

    #[test]
    fn timebase_is_immune_to_offset_rollback() {
        let clock = TestClock::new();
        clock.set_offset(Duration::from_millis(500));
        let tb = TimeBase::anchored(Arc::new(clock.clone()), 0);
        // A clock that goes backwards relative to the epoch saturates to 0
        // instead of wrapping.
        clock.set_offset(Duration::ZERO);
        assert_eq!(tb.elapsed_ms(), 0);
    }
}
