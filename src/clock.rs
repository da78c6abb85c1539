//! The process-wide wall clock.
//!
//! Run timing and the optional `timestamp` metadata on root outputs both
//! read [`wall_clock`]. The clock is created on first use and never
//! changes afterwards, so node threads share it without locking.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Nanoseconds since the wall clock was first read in this process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ClockTime(u64);

impl ClockTime {
    /// Nanoseconds.
    #[inline]
    pub const fn nanos(self) -> u64 {
        self.0
    }
}

/// Saturates at zero.
impl std::ops::Sub for ClockTime {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl From<Duration> for ClockTime {
    fn from(d: Duration) -> Self {
        Self(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }
}

impl From<ClockTime> for Duration {
    fn from(t: ClockTime) -> Self {
        Duration::from_nanos(t.0)
    }
}

/// Monotonic clock anchored at the instant it was created.
#[derive(Debug)]
pub struct WallClock {
    epoch: Instant,
}

impl WallClock {
    /// Time elapsed since the clock's epoch.
    #[inline]
    pub fn now(&self) -> ClockTime {
        ClockTime::from(self.epoch.elapsed())
    }
}

/// The process-wide wall clock.
pub fn wall_clock() -> &'static WallClock {
    static CLOCK: OnceLock<WallClock> = OnceLock::new();
    CLOCK.get_or_init(|| WallClock {
        epoch: Instant::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_time_conversions() {
        let t = ClockTime::from(Duration::from_millis(1500));
        assert_eq!(t.nanos(), 1_500_000_000);
        assert_eq!(Duration::from(t), Duration::from_millis(1500));
    }

    #[test]
    fn test_clock_time_sub_saturates() {
        let a = ClockTime::from(Duration::from_secs(2));
        let b = ClockTime::from(Duration::from_secs(3));
        assert_eq!((b - a).nanos(), 1_000_000_000);
        assert_eq!(a - b, ClockTime::default());
    }

    #[test]
    fn test_wall_clock_monotonic() {
        let clock = wall_clock();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(2));
        let t2 = clock.now();
        assert!(t2 > t1);
        assert!(std::ptr::eq(clock, wall_clock()));
    }
}
