//! Monotonic time primitives for the data-link timers.
//!
//! Two representations: [`Instant`] is a point in time with an arbitrary
//! epoch, [`Duration`] is the signed difference between two instants. Both
//! are opaque nanosecond counts. The zero value doubles as the "unset"
//! sentinel for timer expiries, so [`Instant::now`] never returns it.

use std::ops::{Add, Div, Mul, Sub};
use std::sync::OnceLock;

const NANOS_PER_MICRO: i64 = 1_000;
const NANOS_PER_MILLI: i64 = 1_000_000;
const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A span of time with nanosecond resolution. May be negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(i64);

impl Duration {
    /// The zero duration.
    pub const ZERO: Duration = Duration(0);

    /// Create a duration from whole nanoseconds.
    pub const fn nanos(nanos: i64) -> Self {
        Duration(nanos)
    }

    /// Create a duration from whole microseconds.
    pub const fn micros(micros: i64) -> Self {
        Duration(micros * NANOS_PER_MICRO)
    }

    /// Create a duration from whole milliseconds.
    pub const fn millis(millis: i64) -> Self {
        Duration(millis * NANOS_PER_MILLI)
    }

    /// Create a duration from whole seconds.
    pub const fn seconds(seconds: i64) -> Self {
        Duration(seconds * NANOS_PER_SEC)
    }

    /// Create a duration from whole minutes.
    pub const fn minutes(minutes: i64) -> Self {
        Duration(minutes * 60 * NANOS_PER_SEC)
    }

    /// Whole milliseconds in this duration, rounding toward zero.
    pub const fn as_millis(self) -> i64 {
        self.0 / NANOS_PER_MILLI
    }

    /// Whole nanoseconds in this duration.
    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Clamp a negative duration to zero.
    pub fn max_zero(self) -> Self {
        if self.0 < 0 { Duration::ZERO } else { self }
    }

    /// Convert to a `std::time::Duration`, clamping negatives to zero.
    pub fn to_std(self) -> std::time::Duration {
        std::time::Duration::from_nanos(self.0.max(0) as u64)
    }
}

impl Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl Mul<i64> for Duration {
    type Output = Duration;
    fn mul(self, rhs: i64) -> Duration {
        Duration(self.0 * rhs)
    }
}

impl Div<i64> for Duration {
    type Output = Duration;
    fn div(self, rhs: i64) -> Duration {
        Duration(self.0 / rhs)
    }
}

/// A point on the monotonic clock. The epoch is arbitrary; instants are
/// only compared and subtracted, never interpreted as wall time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(i64);

impl Instant {
    /// The "unset" sentinel. Never produced by [`Instant::now`].
    pub const ZERO: Instant = Instant(0);

    /// Current monotonic time.
    pub fn now() -> Instant {
        static EPOCH: OnceLock<std::time::Instant> = OnceLock::new();
        let epoch = EPOCH.get_or_init(std::time::Instant::now);
        // +1 keeps the sentinel out of the value range.
        Instant(epoch.elapsed().as_nanos() as i64 + 1)
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// An instant from a raw nanosecond count. Intended for injected test
    /// clocks; production code uses [`Instant::now`].
    pub const fn from_nanos(nanos: i64) -> Instant {
        Instant(nanos)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0 + rhs.0)
    }
}

impl Sub for Instant {
    type Output = Duration;
    fn sub(self, rhs: Instant) -> Duration {
        Duration(self.0 - rhs.0)
    }
}
