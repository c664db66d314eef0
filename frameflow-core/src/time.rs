use std::{
    fmt,
    ops::{Add, Sub},
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Media time in 100-nanosecond ticks.
///
/// Signed so that deltas between request times can go backwards; all
/// arithmetic saturates instead of wrapping because stream timestamping
/// clamps against the representable maximum.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Ticks(i64);

pub const TICKS_PER_SECOND: i64 = 10_000_000;

impl Ticks {
    pub const ZERO: Ticks = Ticks(0);
    pub const MAX: Ticks = Ticks(i64::MAX);

    pub const fn from_ticks(ticks: i64) -> Ticks {
        Ticks(ticks)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub const fn from_millis(millis: i64) -> Ticks {
        Ticks(millis.saturating_mul(TICKS_PER_SECOND / 1000))
    }

    pub fn from_secs_f64(secs: f64) -> Ticks {
        let ticks = secs * TICKS_PER_SECOND as f64;
        if ticks >= i64::MAX as f64 {
            Ticks::MAX
        } else if ticks <= i64::MIN as f64 {
            Ticks(i64::MIN)
        } else {
            Ticks(ticks.round() as i64)
        }
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / TICKS_PER_SECOND as f64
    }

    pub fn from_duration(duration: Duration) -> Ticks {
        Ticks::from_secs_f64(duration.as_secs_f64())
    }

    /// Negative times map to a zero duration.
    pub fn as_duration(self) -> Duration {
        Duration::from_secs_f64(self.as_secs_f64().max(0.0))
    }

    pub const fn saturating_add(self, other: Ticks) -> Ticks {
        Ticks(self.0.saturating_add(other.0))
    }

    pub const fn saturating_sub(self, other: Ticks) -> Ticks {
        Ticks(self.0.saturating_sub(other.0))
    }

    pub const fn saturating_mul(self, factor: i64) -> Ticks {
        Ticks(self.0.saturating_mul(factor))
    }

    pub fn saturating_mul_f64(self, factor: f64) -> Ticks {
        Ticks::from_secs_f64(self.as_secs_f64() * factor)
    }

    pub const fn abs(self) -> Ticks {
        Ticks(self.0.abs())
    }

    pub fn abs_diff(self, other: Ticks) -> Ticks {
        (self - other).abs()
    }

    /// `⌊t / q⌋ · q`, flooring toward negative infinity so that negative
    /// times stay in stable bins.
    pub fn quantize(self, quantum: Ticks) -> Ticks {
        debug_assert!(quantum.0 > 0);
        Ticks(self.0.div_euclid(quantum.0) * quantum.0)
    }

    pub fn clamp(self, lo: Ticks, hi: Ticks) -> Ticks {
        Ticks(self.0.clamp(lo.0, hi.0))
    }

    pub fn max(self, other: Ticks) -> Ticks {
        Ticks(self.0.max(other.0))
    }

    pub fn min(self, other: Ticks) -> Ticks {
        Ticks(self.0.min(other.0))
    }
}

impl Add for Ticks {
    type Output = Ticks;

    fn add(self, other: Ticks) -> Ticks {
        self.saturating_add(other)
    }
}

impl Sub for Ticks {
    type Output = Ticks;

    fn sub(self, other: Ticks) -> Ticks {
        self.saturating_sub(other)
    }
}

impl From<Duration> for Ticks {
    fn from(duration: Duration) -> Ticks {
        Ticks::from_duration(duration)
    }
}

impl fmt::Debug for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}s", self.as_secs_f64())
    }
}

impl fmt::Display for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}s", self.as_secs_f64())
    }
}

/// Cache bins are never finer than this, whatever the frame rate says.
pub(crate) const MIN_QUANTUM: Ticks = Ticks::from_millis(10);

/// Quantization unit for a file: one tick under the frame duration (so a
/// frame and its own timestamp land in the same bin even after rounding),
/// floored at [`MIN_QUANTUM`].
pub(crate) fn quantum_for(frame_duration: Ticks) -> Ticks {
    frame_duration
        .saturating_sub(Ticks::from_ticks(1))
        .max(MIN_QUANTUM)
}

/// The widest acceptable `|returned.time − requested.time|`.
pub(crate) fn seek_tolerance(frame_duration: Ticks) -> Ticks {
    frame_duration
        .saturating_sub(Ticks::from_ticks(1))
        .max(Ticks::from_ticks(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_floors_toward_negative_infinity() {
        let q = Ticks::from_millis(10);
        assert_eq!(Ticks::from_millis(101).quantize(q), Ticks::from_millis(100));
        assert_eq!(Ticks::from_millis(100).quantize(q), Ticks::from_millis(100));
        assert_eq!(Ticks::from_millis(99).quantize(q), Ticks::from_millis(90));
        assert_eq!(Ticks::from_millis(-1).quantize(q), Ticks::from_millis(-10));
        assert_eq!(Ticks::ZERO.quantize(q), Ticks::ZERO);
    }

    #[test]
    fn test_conversions_round_trip() {
        let t = Ticks::from_secs_f64(1.5);
        assert_eq!(t.get(), 15_000_000);
        assert_eq!(t.as_secs_f64(), 1.5);
        assert_eq!(Ticks::from_duration(Duration::from_millis(20)), Ticks::from_millis(20));
        assert_eq!(Ticks::from_millis(-5).as_duration(), Duration::ZERO);
    }

    #[test]
    fn test_saturating_arithmetic() {
        assert_eq!(Ticks::MAX + Ticks::from_millis(1), Ticks::MAX);
        assert_eq!(Ticks::MAX.saturating_mul(2), Ticks::MAX);
        assert_eq!(Ticks::from_secs_f64(f64::MAX), Ticks::MAX);
    }

    #[test]
    fn test_quantum_for_common_rates() {
        // 60 fps: quantum is one tick under the frame duration.
        let fd_60 = Ticks::from_secs_f64(1.0 / 60.0);
        assert_eq!(quantum_for(fd_60), fd_60 - Ticks::from_ticks(1));
        // 240 fps: the frame duration dips under the floor.
        let fd_240 = Ticks::from_secs_f64(1.0 / 240.0);
        assert_eq!(quantum_for(fd_240), MIN_QUANTUM);
    }

    #[test]
    fn test_seek_tolerance_never_zero() {
        assert_eq!(seek_tolerance(Ticks::from_ticks(1)), Ticks::from_ticks(1));
        let fd = Ticks::from_millis(40);
        assert_eq!(seek_tolerance(fd), fd - Ticks::from_ticks(1));
    }
}
