use crate::runtime::clock::{Clock, CycleTime};
use std::time::{Duration, Instant};
use time::OffsetDateTime;

const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 3600;

/// A clock that combines wall time accuracy with monotonic performance.
///
/// The clock establishes a baseline by measuring both wall time and
/// monotonic time together, then derives wall timestamps from the monotonic
/// clock so that a single `Instant::now()` syscall serves both components.
/// The baseline is resynced periodically to absorb clock drift and NTP
/// adjustments.
pub struct PrecisionClock {
    /// Cached wall time at baseline measurement
    base_wall_time: OffsetDateTime,

    /// Monotonic time at baseline measurement
    base_instant: Instant,

    /// When we last performed a resync
    last_resync: Instant,

    /// How often to automatically resync
    resync_interval: Duration,
}

impl PrecisionClock {
    /// Create a new precision clock with the default resync interval
    pub fn new() -> Self {
        Self::with_resync_interval(Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS))
    }

    /// Create a precision clock with a custom resync interval
    pub fn with_resync_interval(resync_interval: Duration) -> Self {
        let base_instant = Instant::now();
        Self {
            base_wall_time: OffsetDateTime::now_utc(),
            base_instant,
            last_resync: base_instant,
            resync_interval,
        }
    }

    fn resync(&mut self, now: Instant) {
        self.base_wall_time = OffsetDateTime::now_utc();
        self.base_instant = Instant::now();
        self.last_resync = now;
    }
}

impl Default for PrecisionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for PrecisionClock {
    fn cycle_time(&mut self) -> CycleTime {
        let now = Instant::now();
        if now.duration_since(self.last_resync) >= self.resync_interval {
            self.resync(now);
        }
        let wall = self.base_wall_time + now.duration_since(self.base_instant);
        CycleTime::new(now, wall)
    }
}
