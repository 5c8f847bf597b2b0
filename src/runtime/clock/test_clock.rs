use crate::runtime::clock::{Clock, CycleTime};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

/// A clock implementation for testing that starts at a baseline and advances
/// only when told to.
///
/// By default the wall clock starts at Unix epoch (1970-01-01 00:00:00 UTC)
/// and the monotonic component at a synthetic "instant zero" captured at
/// creation. This makes test assertions predictable: time never moves unless
/// the test calls `advance` or `set_elapsed`.
pub struct TestClock(Rc<RefCell<TestClockInner>>);

impl TestClock {
    /// Create a new test clock starting at Unix epoch (time zero)
    pub fn new() -> Self {
        TestClock(Rc::new(RefCell::new(TestClockInner::new())))
    }

    /// Advance both monotonic and wall time by the specified duration
    pub fn advance(&self, duration: Duration) {
        self.0.borrow_mut().elapsed += duration;
    }

    /// Set the current time to a specific offset from the baseline
    pub fn set_elapsed(&self, elapsed: Duration) {
        self.0.borrow_mut().elapsed = elapsed;
    }

    /// Get the current elapsed time from baseline
    pub fn elapsed(&self) -> Duration {
        self.0.borrow().elapsed
    }

    /// Reset back to baseline (time zero)
    pub fn reset(&self) {
        self.0.borrow_mut().elapsed = Duration::ZERO;
    }
}

impl Clock for TestClock {
    fn cycle_time(&mut self) -> CycleTime {
        let inner = self.0.borrow();
        CycleTime::new(
            inner.base_instant + inner.elapsed,
            inner.base_wall_time + inner.elapsed,
        )
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for TestClock {
    fn clone(&self) -> Self {
        TestClock(self.0.clone())
    }
}

struct TestClockInner {
    /// The baseline wall time (Unix epoch)
    base_wall_time: OffsetDateTime,

    /// Synthetic baseline instant captured at creation
    base_instant: Instant,

    /// How much time has elapsed from the baseline
    elapsed: Duration,
}

impl TestClockInner {
    fn new() -> Self {
        Self {
            base_wall_time: OffsetDateTime::UNIX_EPOCH,
            base_instant: Instant::now(),
            elapsed: Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_starts_at_epoch() {
        let mut clock = TestClock::new();
        let time = clock.cycle_time();
        assert_eq!(time.unix_timestamp(), OffsetDateTime::UNIX_EPOCH);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_clock_advance() {
        let mut clock = TestClock::new();
        clock.advance(Duration::from_secs(3600));
        let time = clock.cycle_time();
        assert_eq!(
            time.unix_timestamp(),
            OffsetDateTime::UNIX_EPOCH + Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_predictable_instants() {
        let mut clock = TestClock::new();
        let first = clock.cycle_time();

        clock.advance(Duration::from_millis(500));
        let second = clock.cycle_time();

        assert_eq!(
            second.now().duration_since(first.now()),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_time_is_frozen_between_advances() {
        let mut clock = TestClock::new();
        let first = clock.cycle_time();
        let second = clock.cycle_time();
        assert_eq!(first.now(), second.now());
        assert_eq!(first.unix_timestamp(), second.unix_timestamp());
    }

    #[test]
    fn test_clone_shares_state() {
        let clock1 = TestClock::new();
        let clock2 = clock1.clone();

        clock1.advance(Duration::from_secs(100));
        assert_eq!(clock2.elapsed(), Duration::from_secs(100));
    }

    #[test]
    fn test_set_elapsed_and_reset() {
        let clock = TestClock::new();
        clock.set_elapsed(Duration::from_secs(300));
        assert_eq!(clock.elapsed(), Duration::from_secs(300));

        clock.reset();
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }
}
