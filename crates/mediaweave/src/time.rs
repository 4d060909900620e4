//! Presentation time primitives.
//!
//! All presentation and system times are counted in 100 ns units, the
//! resolution every clock, descriptor and sink in this crate agrees on.

use std::ops::{Add, Neg, Sub};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// TIME TYPES
// =============================================================================

/// Number of [`MediaTime`] units per second.
pub const UNITS_PER_SECOND: i64 = 10_000_000;

/// Time in 100 ns units. Signed so reverse playback and offsets can go negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct MediaTime(pub i64);

impl MediaTime {
    pub const ZERO: MediaTime = MediaTime(0);

    pub fn zero() -> Self {
        Self::ZERO
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * UNITS_PER_SECOND as f64) as i64)
    }

    pub fn from_millis(millis: i64) -> Self {
        Self(millis * 10_000)
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / UNITS_PER_SECOND as f64
    }

    pub fn as_millis(self) -> i64 {
        self.0 / 10_000
    }

    /// Wall-clock duration of this span; negative spans clamp to zero.
    pub fn to_duration(self) -> Duration {
        let ticks = self.0.max(0);
        let secs = (ticks / UNITS_PER_SECOND) as u64;
        let nanos = ((ticks % UNITS_PER_SECOND) * 100) as u32;
        Duration::new(secs, nanos)
    }

    /// Raw monotonic system time, measured from the first call in this process.
    pub fn system_now() -> Self {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        Self((epoch.elapsed().as_nanos() / 100) as i64)
    }
}

impl Add for MediaTime {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        MediaTime(self.0.saturating_add(rhs.0))
    }
}

impl Sub for MediaTime {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        MediaTime(self.0.saturating_sub(rhs.0))
    }
}

impl Neg for MediaTime {
    type Output = Self;
    fn neg(self) -> Self::Output {
        MediaTime(-self.0)
    }
}

impl From<Duration> for MediaTime {
    fn from(duration: Duration) -> Self {
        MediaTime((duration.as_nanos() / 100) as i64)
    }
}

impl std::fmt::Display for MediaTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}s", self.as_secs_f64())
    }
}

// =============================================================================
// START PARAMETERS
// =============================================================================

/// Where playback should start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StartPosition {
    /// Resume from wherever the presentation currently is.
    #[default]
    Current,
    /// Start (or seek) to an explicit presentation time.
    At(MediaTime),
}

impl StartPosition {
    pub fn time(self) -> Option<MediaTime> {
        match self {
            StartPosition::Current => None,
            StartPosition::At(time) => Some(time),
        }
    }
}

impl std::fmt::Display for StartPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartPosition::Current => write!(f, "current position"),
            StartPosition::At(time) => write!(f, "{}", time),
        }
    }
}

/// Unit a start position is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TimeFormat {
    /// 100 ns presentation time.
    #[default]
    Default,
    /// Any other format, identified by GUID. Sources decide whether they understand it.
    Other(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_conversions() {
        assert_eq!(MediaTime::from_secs_f64(1.5).0, 15_000_000);
        assert_eq!(MediaTime::from_millis(20).0, 200_000);
        assert_eq!(MediaTime(25_000_000).as_secs_f64(), 2.5);
        assert_eq!(MediaTime(25_000_000).as_millis(), 2500);
    }

    #[test]
    fn test_duration_round_trip() {
        let time = MediaTime::from(Duration::from_millis(40));
        assert_eq!(time, MediaTime::from_millis(40));
        assert_eq!(time.to_duration(), Duration::from_millis(40));
        assert_eq!(MediaTime(-5).to_duration(), Duration::ZERO);
    }

    #[test]
    fn test_long_spans_convert_without_overflow() {
        let half = MediaTime(i64::MAX / 2).to_duration();
        assert_eq!(half.as_secs(), (i64::MAX / 2 / UNITS_PER_SECOND) as u64);
        assert_eq!(half.subsec_nanos(), ((i64::MAX / 2 % UNITS_PER_SECOND) * 100) as u32);

        let max = MediaTime(i64::MAX).to_duration();
        assert!(max > half);
        assert_eq!(MediaTime(15_000_001).to_duration(), Duration::new(1, 500_000_100));
    }

    #[test]
    fn test_system_now_is_monotonic() {
        let a = MediaTime::system_now();
        std::thread::sleep(Duration::from_millis(2));
        let b = MediaTime::system_now();
        assert!(b > a, "{} should be after {}", b, a);
    }

    #[test]
    fn test_start_position_time() {
        assert_eq!(StartPosition::Current.time(), None);
        assert_eq!(StartPosition::At(MediaTime(7)).time(), Some(MediaTime(7)));
    }
}
