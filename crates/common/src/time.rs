//! Rational media timestamps and half-open time ranges.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Sub};

use crate::error::{CodingError, CodingResult};

/// A timestamp expressed as `value / timescale` seconds.
///
/// Comparison and equality are exact: `1/2` and `300/600` are the same instant.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct MediaTime {
    pub value: i64,
    pub timescale: u32,
}

impl MediaTime {
    pub const ZERO: Self = Self {
        value: 0,
        timescale: 1,
    };

    /// Timescale used by [`MediaTime::from_secs`].
    pub const MICROSECONDS: u32 = 1_000_000;

    /// # Panics
    ///
    /// If `timescale` is zero. Use [`MediaTime::try_new`] for values that
    /// come from outside the program.
    pub fn new(value: i64, timescale: u32) -> Self {
        assert!(timescale > 0, "MediaTime timescale must be > 0");
        Self { value, timescale }
    }

    pub fn try_new(value: i64, timescale: u32) -> CodingResult<Self> {
        Self { value, timescale }.validate()
    }

    pub fn is_valid(self) -> bool {
        self.timescale > 0
    }

    /// Reject a zero timescale, which the public fields cannot prevent.
    pub fn validate(self) -> CodingResult<Self> {
        if !self.is_valid() {
            return Err(CodingError::InvalidParameter(format!(
                "timestamp {} has a zero timescale",
                self.value
            )));
        }
        Ok(self)
    }

    pub fn from_secs(secs: f64) -> Self {
        Self {
            value: (secs * Self::MICROSECONDS as f64).round() as i64,
            timescale: Self::MICROSECONDS,
        }
    }

    pub fn as_secs(self) -> f64 {
        self.value as f64 / self.timescale as f64
    }

    pub fn is_zero(self) -> bool {
        self.value == 0
    }

    pub fn is_positive(self) -> bool {
        self.value > 0
    }

    /// Re-express this time in another timescale, truncating toward zero.
    pub fn convert_scale(self, timescale: u32) -> Self {
        Self::new(rescale(self, timescale), timescale)
    }

    fn reduced(self) -> (i64, u32) {
        let g = gcd(self.value.unsigned_abs(), self.timescale as u64).max(1);
        (self.value / g as i64, (self.timescale as u64 / g) as u32)
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

fn common_timescale(a: u32, b: u32) -> u32 {
    if a == b {
        return a;
    }
    let lcm = (a as u64 / gcd(a as u64, b as u64).max(1)) * b as u64;
    u32::try_from(lcm).unwrap_or(a.max(b))
}

fn rescale(t: MediaTime, timescale: u32) -> i64 {
    if t.timescale == timescale {
        return t.value;
    }
    let v = t.value as i128 * timescale as i128 / t.timescale as i128;
    v.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

impl PartialEq for MediaTime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
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
        let lhs = self.value as i128 * other.timescale as i128;
        let rhs = other.value as i128 * self.timescale as i128;
        lhs.cmp(&rhs)
    }
}

impl Hash for MediaTime {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.reduced().hash(state);
    }
}

impl Add for MediaTime {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        let ts = common_timescale(self.timescale, rhs.timescale);
        Self::new(rescale(self, ts).saturating_add(rescale(rhs, ts)), ts)
    }
}

impl Sub for MediaTime {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        let ts = common_timescale(self.timescale, rhs.timescale);
        Self::new(rescale(self, ts).saturating_sub(rescale(rhs, ts)), ts)
    }
}

impl Default for MediaTime {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for MediaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.timescale)
    }
}

/// Half-open interval `[start, start + duration)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: MediaTime,
    pub duration: MediaTime,
}

impl TimeRange {
    pub fn new(start: MediaTime, duration: MediaTime) -> Self {
        Self { start, duration }
    }

    pub fn from_bounds(start: MediaTime, end: MediaTime) -> Self {
        Self {
            start,
            duration: end - start,
        }
    }

    pub fn end(&self) -> MediaTime {
        self.start + self.duration
    }

    pub fn is_empty(&self) -> bool {
        !self.duration.is_positive()
    }

    pub fn contains(&self, t: MediaTime) -> bool {
        t >= self.start && t < self.end()
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Merge ranges that touch or overlap. Input must be sorted by start.
    pub fn coalesce(ranges: impl IntoIterator<Item = TimeRange>) -> Vec<TimeRange> {
        let mut out: Vec<TimeRange> = Vec::new();
        for range in ranges {
            match out.last_mut() {
                Some(last) if range.start <= last.end() => {
                    if range.end() > last.end() {
                        *last = TimeRange::from_bounds(last.start, range.end());
                    }
                }
                _ => out.push(range),
            }
        }
        out
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:.4}s, {:.4}s)", self.start.as_secs(), self.end().as_secs())
    }
}

/// Check that `ranges` are non-empty, ascending and non-overlapping.
pub fn validate_time_ranges(ranges: &[TimeRange]) -> CodingResult<()> {
    for (i, range) in ranges.iter().enumerate() {
        if !range.start.is_valid() || !range.duration.is_valid() {
            return Err(CodingError::InvalidTimeRange(format!(
                "range {i} has a zero timescale"
            )));
        }
        if range.is_empty() {
            return Err(CodingError::InvalidTimeRange(format!(
                "range {i} {range} is empty"
            )));
        }
        if let Some(prev) = i.checked_sub(1).map(|p| &ranges[p]) {
            if range.start < prev.end() {
                return Err(CodingError::InvalidTimeRange(format!(
                    "range {i} {range} overlaps or precedes {prev}"
                )));
            }
        }
    }
    Ok(())
}

/// Whether `t` falls inside any of `ranges`.
pub fn ranges_contain(ranges: &[TimeRange], t: MediaTime) -> bool {
    ranges.iter().any(|r| r.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(v: i64) -> MediaTime {
        MediaTime::new(v, 30)
    }

    #[test]
    fn equality_across_timescales() {
        assert_eq!(MediaTime::new(1, 2), MediaTime::new(300, 600));
        assert!(MediaTime::new(1, 3) < MediaTime::new(334, 1000));
        assert!(MediaTime::new(-1, 30) < MediaTime::ZERO);
    }

    #[test]
    fn hash_agrees_with_eq() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(MediaTime::new(1, 2));
        assert!(set.contains(&MediaTime::new(300, 600)));
    }

    #[test]
    fn add_and_sub_mixed_scales() {
        let sum = MediaTime::new(1, 2) + MediaTime::new(1, 3);
        assert_eq!(sum, MediaTime::new(5, 6));
        let diff = MediaTime::new(1, 2) - MediaTime::new(1, 3);
        assert_eq!(diff, MediaTime::new(1, 6));
    }

    #[test]
    fn from_secs_roundtrip() {
        let m = MediaTime::from_secs(1.5);
        assert!((m.as_secs() - 1.5).abs() < 1e-9);
        assert_eq!(m.convert_scale(2), MediaTime::new(3, 2));
    }

    #[test]
    #[should_panic(expected = "MediaTime timescale must be > 0")]
    fn zero_timescale_panics() {
        let _ = MediaTime::new(1, 0);
    }

    #[test]
    fn checked_construction() {
        assert_eq!(MediaTime::try_new(3, 30).unwrap(), t(3));
        assert!(matches!(
            MediaTime::try_new(3, 0),
            Err(CodingError::InvalidParameter(_))
        ));
        let raw = MediaTime {
            value: 1,
            timescale: 0,
        };
        assert!(!raw.is_valid());
        assert!(raw.validate().is_err());
        assert!(matches!(
            validate_time_ranges(&[TimeRange::new(raw, t(1))]),
            Err(CodingError::InvalidTimeRange(_))
        ));
    }

    #[test]
    fn range_is_half_open() {
        let r = TimeRange::from_bounds(t(2), t(5));
        assert!(r.contains(t(2)));
        assert!(r.contains(t(4)));
        assert!(!r.contains(t(5)));
        assert!(!r.contains(t(1)));
        assert_eq!(r.end(), t(5));
    }

    #[test]
    fn validate_accepts_ascending_disjoint() {
        let ranges = [
            TimeRange::from_bounds(t(0), t(2)),
            TimeRange::from_bounds(t(2), t(3)),
            TimeRange::from_bounds(t(7), t(9)),
        ];
        assert!(validate_time_ranges(&ranges).is_ok());
        assert!(validate_time_ranges(&[]).is_ok());
    }

    #[test]
    fn validate_rejects_overlap_descending_and_empty() {
        let overlap = [
            TimeRange::from_bounds(t(0), t(3)),
            TimeRange::from_bounds(t(2), t(4)),
        ];
        assert!(matches!(
            validate_time_ranges(&overlap),
            Err(CodingError::InvalidTimeRange(_))
        ));

        let descending = [
            TimeRange::from_bounds(t(5), t(6)),
            TimeRange::from_bounds(t(1), t(2)),
        ];
        assert!(validate_time_ranges(&descending).is_err());

        let empty = [TimeRange::new(t(1), MediaTime::ZERO)];
        assert!(validate_time_ranges(&empty).is_err());
    }

    #[test]
    fn coalesce_merges_touching_ranges() {
        let merged = TimeRange::coalesce([
            TimeRange::from_bounds(t(0), t(1)),
            TimeRange::from_bounds(t(1), t(2)),
            TimeRange::from_bounds(t(4), t(5)),
        ]);
        assert_eq!(
            merged,
            vec![
                TimeRange::from_bounds(t(0), t(2)),
                TimeRange::from_bounds(t(4), t(5)),
            ]
        );
        assert!(ranges_contain(&merged, t(4)));
        assert!(!ranges_contain(&merged, t(3)));
    }
}
