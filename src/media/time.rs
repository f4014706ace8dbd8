//! Rational media timestamps
//!
//! A `MediaTime` is a `value / timescale` pair in seconds, the same shape
//! capture frameworks hand out for sample presentation times.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;

/// Timescale used when converting host durations (nanoseconds)
pub const NANOS_TIMESCALE: i32 = 1_000_000_000;

/// A presentation timestamp expressed as `value / timescale` seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaTime {
    pub value: i64,
    pub timescale: i32,
}

impl MediaTime {
    pub const ZERO: MediaTime = MediaTime {
        value: 0,
        timescale: 1,
    };

    /// Create a new timestamp. A non-positive timescale is coerced to 1.
    pub fn new(value: i64, timescale: i32) -> Self {
        Self {
            value,
            timescale: if timescale > 0 { timescale } else { 1 },
        }
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self::new(duration.as_nanos() as i64, NANOS_TIMESCALE)
    }

    pub fn as_seconds(&self) -> f64 {
        self.value as f64 / self.timescale as f64
    }

    /// Convert to another timescale, rounding to the nearest tick
    pub fn rescale(&self, timescale: i32) -> Self {
        let timescale = if timescale > 0 { timescale } else { 1 };
        let scaled = self.value as i128 * timescale as i128;
        let denom = self.timescale as i128;
        let rounded = if scaled >= 0 {
            (scaled + denom / 2) / denom
        } else {
            (scaled - denom / 2) / denom
        };
        Self::new(rounded as i64, timescale)
    }

    /// Offset from `origin` as a host duration; negative offsets clamp to zero
    pub fn duration_since(&self, origin: MediaTime) -> Duration {
        let seconds = self.as_seconds() - origin.as_seconds();
        if seconds <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(seconds)
        }
    }

    fn cross(&self, other: &MediaTime) -> (i128, i128) {
        (
            self.value as i128 * other.timescale as i128,
            other.value as i128 * self.timescale as i128,
        )
    }
}

impl Default for MediaTime {
    fn default() -> Self {
        Self::ZERO
    }
}

impl PartialEq for MediaTime {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = self.cross(other);
        a == b
    }
}

impl Eq for MediaTime {}

impl PartialOrd for MediaTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MediaTime {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = self.cross(other);
        a.cmp(&b)
    }
}

impl std::fmt::Display for MediaTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({:.3}s)", self.value, self.timescale, self.as_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_across_timescales() {
        assert_eq!(MediaTime::new(1, 30), MediaTime::new(1000, 30000));
        assert!(MediaTime::new(1, 30) < MediaTime::new(1, 29));
        assert!(MediaTime::new(10, 600) > MediaTime::new(5, 600));
    }

    #[test]
    fn test_rescale_rounds_to_nearest() {
        let t = MediaTime::new(1001, 30000).rescale(600);
        assert_eq!(t.value, 20);
        assert_eq!(t.timescale, 600);
    }

    #[test]
    fn test_duration_since_clamps_negative() {
        let origin = MediaTime::new(10, 1);
        assert_eq!(MediaTime::new(5, 1).duration_since(origin), Duration::ZERO);
        assert_eq!(
            MediaTime::new(12, 1).duration_since(origin),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_invalid_timescale_is_coerced() {
        let t = MediaTime::new(5, 0);
        assert_eq!(t.timescale, 1);
        assert_eq!(t.as_seconds(), 5.0);
    }
}
