//! Monotonic and wall-clock time.
//!
//! Every scheduler in this crate is driven by [`steady_time`], derived from
//! `CLOCK_MONOTONIC`. Wall time ([`system_time`]) is used only for
//! human-readable stamps and protocol headers (e.g. HTTP `Date`), never for
//! scheduling, since it can jump backwards or forwards under NTP/DST.
//!
//! See also: [clock_gettime(3)](https://man7.org/linux/man-pages/man3/clock_gettime.3.html)

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The largest delay/period accepted by [`crate::timer::TimerScheduler`].
pub const MAX_TIMER_DURATION: Duration = Duration::from_secs(24_000 * 3600);

/// A point in monotonic time, immune to wall-clock adjustments.
///
/// Backed by `CLOCK_MONOTONIC`, not [`std::time::Instant`], because we need
/// a value that is `Copy`, orderable across threads, and safely
/// constructible from a raw nanosecond count (timers store deadlines this
/// way rather than holding a `libc::timespec`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SteadyTime(u64);

impl SteadyTime {
    /// The current monotonic time.
    pub fn now() -> Self {
        SteadyTime(monotonic_nanos())
    }

    /// Builds a `SteadyTime` from a raw nanosecond count previously
    /// obtained from [`SteadyTime::as_nanos`], e.g. after round-tripping
    /// through an `AtomicU64`.
    pub fn from_nanos(nanos: u64) -> Self {
        SteadyTime(nanos)
    }

    pub fn checked_add(self, d: Duration) -> Option<Self> {
        self.0.checked_add(d.as_nanos() as u64).map(SteadyTime)
    }

    pub fn saturating_duration_since(self, earlier: SteadyTime) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    pub fn as_nanos(self) -> u64 {
        self.0
    }
}

impl std::ops::Add<Duration> for SteadyTime {
    type Output = SteadyTime;

    fn add(self, rhs: Duration) -> SteadyTime {
        self.checked_add(rhs).unwrap_or(SteadyTime(u64::MAX))
    }
}

impl std::ops::Sub for SteadyTime {
    type Output = Duration;

    fn sub(self, rhs: SteadyTime) -> Duration {
        self.saturating_duration_since(rhs)
    }
}

/// Monotonic time in nanoseconds since an unspecified starting point.
///
/// Derived from `clock_gettime(CLOCK_MONOTONIC)`.
pub fn monotonic_nanos() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer for clock_gettime.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// The wall clock time, for human-readable stamps and protocol headers only.
///
/// Never use this value to order events; it is not monotonic.
pub fn system_time() -> SystemTime {
    SystemTime::now()
}

/// Seconds since the Unix epoch, as used in HTTP `Date` headers and logs.
pub fn unix_seconds() -> u64 {
    system_time()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_time_is_monotonic_non_decreasing() {
        let a = SteadyTime::now();
        let b = SteadyTime::now();
        assert!(b >= a);
    }

    #[test]
    fn add_and_sub_round_trip() {
        let a = SteadyTime::now();
        let b = a + Duration::from_millis(50);
        assert!(b - a >= Duration::from_millis(50));
    }
}
