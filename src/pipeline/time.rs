//! Rate-independent time values.
//!
//! A [`TimeStamp`] counts ticks of a fixed master rate. Converting a sample
//! index at any rate to ticks and back is plain integer arithmetic, so
//! buffers running at different rates can be compared on one timeline.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Sub;

/// Ticks per second of the master timebase.
pub const MASTER_RATE: i64 = 1_000_000;

/// A point in time on the master timebase.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TimeStamp(i64);

impl TimeStamp {
    pub const ZERO: TimeStamp = TimeStamp(0);

    #[inline]
    pub const fn zero() -> Self {
        Self::ZERO
    }

    #[inline]
    pub const fn from_ticks(ticks: i64) -> Self {
        Self(ticks)
    }

    #[inline]
    pub const fn ticks(self) -> i64 {
        self.0
    }

    /// Stamp of the sample with index `samples` at `rate` Hz.
    ///
    /// A zero rate maps everything to [`TimeStamp::ZERO`].
    pub fn from_samples(samples: i64, rate: u32) -> Self {
        if rate == 0 {
            return Self::ZERO;
        }
        Self((samples as i128 * MASTER_RATE as i128 / rate as i128) as i64)
    }

    /// Nearest tick to `seconds`.
    pub fn from_seconds(seconds: f64) -> Self {
        Self((seconds * MASTER_RATE as f64).round() as i64)
    }

    pub fn from_millis(ms: f64) -> Self {
        Self((ms * MASTER_RATE as f64 / 1000.0).round() as i64)
    }

    /// Sample index of this stamp at `rate` Hz, truncated.
    pub fn to_rate(self, rate: u32) -> i64 {
        (self.0 as i128 * rate as i128 / MASTER_RATE as i128) as i64
    }

    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / MASTER_RATE as f64
    }

    /// Advance by `samples` at `rate`, snapping to that rate's sample grid.
    pub fn add_samples(self, samples: i64, rate: u32) -> Self {
        Self::from_samples(self.to_rate(rate) + samples, rate)
    }

    pub fn sub_samples(self, samples: i64, rate: u32) -> Self {
        Self::from_samples(self.to_rate(rate) - samples, rate)
    }

    /// Shift by raw ticks.
    pub fn offset(self, ticks: i64) -> Self {
        Self(self.0 + ticks)
    }

    /// Formats as `HH:MM:SS:mmm`.
    pub fn to_short_time_string(self) -> String {
        let total_ms = self.0 / (MASTER_RATE / 1000);
        let hours = total_ms / 3_600_000;
        let minutes = (total_ms / 60_000) % 60;
        let seconds = (total_ms / 1000) % 60;
        let millis = total_ms % 1000;
        format!("{:02}:{:02}:{:02}:{:03}", hours, minutes, seconds, millis)
    }

    /// Parses the `HH:MM:SS:mmm` form written by [`TimeStamp::to_short_time_string`].
    pub fn parse_short_time_string(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 4 {
            return Err(EngineError::InvalidArgument(format!(
                "expected HH:MM:SS:mmm, got '{}'",
                s
            )));
        }
        let mut values = [0i64; 4];
        for (slot, part) in values.iter_mut().zip(&parts) {
            *slot = part.parse::<i64>().map_err(|e| {
                EngineError::InvalidArgument(format!("bad time component '{}': {}", part, e))
            })?;
        }
        let [h, m, sec, ms] = values;
        let total_ms = ((h * 60 + m) * 60 + sec) * 1000 + ms;
        Ok(Self(total_ms * (MASTER_RATE / 1000)))
    }
}

impl Sub for TimeStamp {
    type Output = TimeStamp;

    fn sub(self, rhs: TimeStamp) -> TimeStamp {
        TimeStamp(self.0 - rhs.0)
    }
}

impl fmt::Debug for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimeStamp({})", self.0)
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A span between two stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInterval {
    pub begin: TimeStamp,
    pub end: TimeStamp,
}

impl TimeInterval {
    pub fn new(begin: TimeStamp, end: TimeStamp) -> Self {
        Self { begin, end }
    }

    pub fn as_seconds(&self) -> f64 {
        self.end.as_seconds() - self.begin.as_seconds()
    }

    /// Number of samples the interval spans at `rate`.
    pub fn to_rate(&self, rate: u32) -> i64 {
        (self.as_seconds() * rate as f64) as i64
    }

    pub fn contains(&self, stamp: TimeStamp) -> bool {
        self.begin <= stamp && stamp <= self.end
    }
}

impl PartialOrd for TimeInterval {
    /// Intervals compare by duration.
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        (self.end - self.begin).partial_cmp(&(other.end - other.begin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_from_samples_and_back() {
        let ts = TimeStamp::from_samples(1000, 1000);
        assert_eq!(ts.ticks(), MASTER_RATE);
        assert_eq!(ts.to_rate(1000), 1000);
        assert_eq!(ts.to_rate(44_100), 44_100);
        assert!((ts.as_seconds() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_add_and_sub_samples() {
        let ts = TimeStamp::zero().add_samples(250, 1000);
        assert_eq!(ts, TimeStamp::from_millis(250.0));
        assert_eq!(ts.sub_samples(250, 1000), TimeStamp::ZERO);
    }

    #[test]
    fn test_zero_rate_is_zero() {
        assert_eq!(TimeStamp::from_samples(123, 0), TimeStamp::ZERO);
    }

    #[test]
    fn test_short_time_string() {
        let ts = TimeStamp::from_millis(3_723_456.0);
        assert_eq!(ts.to_short_time_string(), "01:02:03:456");
        let parsed = TimeStamp::parse_short_time_string("01:02:03:456").unwrap();
        assert_eq!(parsed, TimeStamp::from_millis(3_723_456.0));
        assert!(TimeStamp::parse_short_time_string("1:2:3").is_err());
    }

    #[test]
    fn test_interval() {
        let iv = TimeInterval::new(TimeStamp::from_seconds(1.0), TimeStamp::from_seconds(3.0));
        assert_eq!(iv.to_rate(100), 200);
        assert!(iv.contains(TimeStamp::from_seconds(2.0)));
        assert!(!iv.contains(TimeStamp::from_seconds(3.5)));
        let shorter = TimeInterval::new(TimeStamp::ZERO, TimeStamp::from_seconds(1.0));
        assert!(shorter < iv);
    }

    proptest! {
        #[test]
        fn test_round_trip_between_rates(
            samples in 0i64..10_000_000,
            rate_a in 1u32..192_000,
            rate_b in 1u32..192_000,
        ) {
            let stamp = TimeStamp::from_samples(samples, rate_a);
            let at_b = stamp.to_rate(rate_b);
            let back = TimeStamp::from_samples(at_b, rate_b).to_rate(rate_a);

            // Truncation only ever loses time, never adds it.
            prop_assert!(back <= samples);
            let tolerance = (rate_a / rate_b) as i64 + 3;
            prop_assert!(samples - back <= tolerance,
                "samples {} came back as {} (tolerance {})", samples, back, tolerance);
        }

        #[test]
        fn test_zero_is_rate_independent(rate_a in 1u32..1_000_000, rate_b in 1u32..1_000_000) {
            prop_assert_eq!(TimeStamp::from_samples(0, rate_a), TimeStamp::from_samples(0, rate_b));
            prop_assert_eq!(TimeStamp::from_samples(0, rate_a), TimeStamp::zero());
        }
    }
}
