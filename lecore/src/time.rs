//! Time base used by the scheduler and the connection state machines.
//!
//! Everything runs on a 32-bit microsecond clock that wraps after about 71 minutes. Ordering
//! comparisons between [`Instant`]s are wraparound-aware as long as the two instants are less than
//! half the clock range apart, which the link layer guarantees: nothing it schedules lies further
//! out than a supervision timeout.

use core::fmt;
use core::ops::{Add, AddAssign, Mul, Sub};

/// A duration with microsecond resolution.
///
/// Arithmetic saturates instead of overflowing.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(u32);

impl Duration {
    /// The interframe spacing between two packets of a connection event.
    pub const T_IFS: Self = Duration(150);

    /// Length of a BLE slot, the unit of advertising and window timing.
    pub const SLOT: Self = Duration(625);

    /// Unit of connection intervals, window sizes and window offsets.
    pub const CONN_UNIT: Self = Duration(1_250);

    /// Unit of the supervision timeout field.
    pub const SUPERVISION_UNIT: Self = Duration(10_000);

    pub const fn from_micros(micros: u32) -> Self {
        Duration(micros)
    }

    pub const fn from_millis(millis: u32) -> Self {
        Duration(millis * 1_000)
    }

    pub const fn from_secs(secs: u32) -> Self {
        Duration(secs * 1_000_000)
    }

    /// Creates a duration from a count of 1.25 ms connection units.
    pub fn from_conn_units(units: u16) -> Self {
        Self::CONN_UNIT * u32::from(units)
    }

    /// Creates a duration from a count of 10 ms supervision timeout units.
    pub fn from_supervision_units(units: u16) -> Self {
        Self::SUPERVISION_UNIT * u32::from(units)
    }

    pub fn as_micros(&self) -> u32 {
        self.0
    }

    pub fn whole_millis(&self) -> u32 {
        self.0 / 1_000
    }

    /// Returns how many whole multiples of `unit` are needed to cover `self`.
    ///
    /// Returns `u32::MAX` when `unit` is zero.
    pub fn div_ceil(&self, unit: Duration) -> u32 {
        if unit.0 == 0 {
            return u32::MAX;
        }
        let unit = u64::from(unit.0);
        ((u64::from(self.0) + unit - 1) / unit) as u32
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Duration(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl Mul<u32> for Duration {
    type Output = Self;

    fn mul(self, rhs: u32) -> Self {
        Duration(self.0.saturating_mul(rhs))
    }
}

fn fmt_micros(micros: u32, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if micros >= 1_000_000 {
        write!(f, "{}.{:06}s", micros / 1_000_000, micros % 1_000_000)
    } else if micros >= 1_000 {
        write!(f, "{}.{:03}ms", micros / 1_000, micros % 1_000)
    } else {
        write!(f, "{}µs", micros)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_micros(self.0, f)
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_micros(self.0, f)
    }
}

/// A point in time on the controller's microsecond clock.
///
/// `Instant`s are obtained from a [`Timer`]. Instants from different timers must not be mixed.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Instant(u32);

impl Instant {
    /// Creates an `Instant` from raw microseconds since an implementation-defined epoch.
    ///
    /// This should only be called from a [`Timer`] implementation or a test.
    pub const fn from_raw_micros(micros: u32) -> Self {
        Instant(micros)
    }

    pub fn raw_micros(&self) -> u32 {
        self.0
    }

    /// Returns the duration from `earlier` to `self`, or zero if `earlier` is actually later.
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        if earlier.is_after(*self) {
            Duration(0)
        } else {
            Duration(self.0.wrapping_sub(earlier.0))
        }
    }

    /// Returns whether `self` lies strictly after `other`.
    pub fn is_after(&self, other: Instant) -> bool {
        (self.0.wrapping_sub(other.0) as i32) > 0
    }

    /// Returns whether `self` lies strictly before `other`.
    pub fn is_before(&self, other: Instant) -> bool {
        other.is_after(*self)
    }

    /// Returns the later of `self` and `other`.
    pub fn max(self, other: Instant) -> Instant {
        if other.is_after(self) {
            other
        } else {
            self
        }
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.duration_since(rhs)
    }
}

impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, d: Duration) -> Self {
        Instant(self.0.wrapping_add(d.as_micros()))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, d: Duration) {
        *self = *self + d;
    }
}

impl Sub<Duration> for Instant {
    type Output = Self;

    fn sub(self, d: Duration) -> Self {
        Instant(self.0.wrapping_sub(d.as_micros()))
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_micros(self.0, f)
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_micros(self.0, f)
    }
}

/// Monotonic time source.
///
/// The platform provides an implementation with microsecond accuracy. Tests use a manually
/// advanced mock.
pub trait Timer {
    /// Obtain the current time.
    ///
    /// The returned instants must never move backwards, except when the raw value wraps around.
    fn now(&self) -> Instant;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_across_wraparound() {
        let before = Instant::from_raw_micros(u32::MAX - 10);
        let after = before + Duration::from_micros(20);
        assert_eq!(after.raw_micros(), 9);
        assert!(after.is_after(before));
        assert!(before.is_before(after));
        assert_eq!(after - before, Duration::from_micros(20));
        assert_eq!(before - after, Duration::from_micros(0));
        assert_eq!(before.max(after), after);
    }

    #[test]
    fn unit_conversions() {
        assert_eq!(Duration::from_conn_units(6).as_micros(), 7_500);
        assert_eq!(Duration::from_supervision_units(10).whole_millis(), 100);
        assert_eq!(Duration::from_millis(100).div_ceil(Duration::from_millis(30)), 4);
        assert_eq!(Duration::from_millis(90).div_ceil(Duration::from_millis(30)), 3);
    }

    #[test]
    fn display() {
        assert_eq!(Duration::from_micros(1_250).to_string(), "1.250ms");
        assert_eq!(Duration::from_secs(40).to_string(), "40.000000s");
    }
}
