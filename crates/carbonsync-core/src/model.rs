//! Points, metric batches, fetched series and retention metadata.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One sample: seconds since the epoch and a value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub timestamp: u32,
    pub value: f64,
}

impl Point {
    #[must_use]
    pub const fn new(timestamp: u32, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// A named batch of points on its way to or from a store.
///
/// Points may be unordered and may repeat a timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub points: Vec<Point>,
}

impl Metric {
    pub fn new(name: impl Into<String>, points: Vec<Point>) -> Self {
        Self {
            name: name.into(),
            points,
        }
    }
}

/// Dense archive query result.
///
/// `values.len() == is_absent.len() == (stop_time - start_time) / step_time`.
/// Slot `i` covers `[start_time + i*step_time, start_time + (i+1)*step_time)`.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedSeries {
    pub name: String,
    pub start_time: u32,
    pub step_time: u32,
    pub stop_time: u32,
    pub values: Vec<f64>,
    pub is_absent: Vec<bool>,
}

impl FetchedSeries {
    /// Number of slots in the series.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Start of slot `index`.
    #[must_use]
    pub fn timestamp_at(&self, index: usize) -> u32 {
        self.start_time
            .wrapping_add((index as u32).wrapping_mul(self.step_time))
    }

    /// Check the slot-count invariant. Returns a description of the first
    /// violation found.
    pub fn check_shape(&self) -> std::result::Result<(), String> {
        if self.step_time == 0 {
            return Err("stepTime is zero".to_string());
        }
        if self.stop_time < self.start_time {
            return Err(format!(
                "stopTime {} before startTime {}",
                self.stop_time, self.start_time
            ));
        }
        if self.values.len() != self.is_absent.len() {
            return Err(format!(
                "{} values but {} absence flags",
                self.values.len(),
                self.is_absent.len()
            ));
        }
        let slots = ((self.stop_time - self.start_time) / self.step_time) as usize;
        if slots != self.values.len() {
            return Err(format!(
                "expected {slots} slots for [{}, {}) step {}, got {}",
                self.start_time,
                self.stop_time,
                self.step_time,
                self.values.len()
            ));
        }
        Ok(())
    }
}

/// One resolution level of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetentionTier {
    pub seconds_per_point: u32,
    pub number_of_points: u32,
}

impl RetentionTier {
    #[must_use]
    pub const fn new(seconds_per_point: u32, number_of_points: u32) -> Self {
        Self {
            seconds_per_point,
            number_of_points,
        }
    }

    /// Seconds of history this tier covers.
    #[must_use]
    pub const fn span(&self) -> u64 {
        self.seconds_per_point as u64 * self.number_of_points as u64
    }
}

impl fmt::Display for RetentionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.seconds_per_point, self.number_of_points)
    }
}

/// Rollup function applied when a finer tier propagates into a coarser one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    Average,
    Sum,
    Last,
    Max,
    Min,
}

impl AggregationMethod {
    /// On-disk code in the archive header.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Average => 1,
            Self::Sum => 2,
            Self::Last => 3,
            Self::Max => 4,
            Self::Min => 5,
        }
    }

    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Average),
            2 => Some(Self::Sum),
            3 => Some(Self::Last),
            4 => Some(Self::Max),
            5 => Some(Self::Min),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Average => "average",
            Self::Sum => "sum",
            Self::Last => "last",
            Self::Max => "max",
            Self::Min => "min",
        }
    }

    /// Aggregate a non-empty slice of known values. `values` is in
    /// chronological order, which matters for `Last`.
    #[must_use]
    pub fn aggregate(self, values: &[f64]) -> f64 {
        match self {
            Self::Average => values.iter().sum::<f64>() / values.len() as f64,
            Self::Sum => values.iter().sum(),
            Self::Last => values.last().copied().unwrap_or(f64::NAN),
            Self::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        }
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "average" | "avg" => Ok(Self::Average),
            "sum" => Ok(Self::Sum),
            "last" => Ok(Self::Last),
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            other => Err(format!("unknown aggregation method '{other}'")),
        }
    }
}

/// Retention descriptor returned by a store's info call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricInfo {
    pub name: String,
    pub aggregation_method: AggregationMethod,
    pub max_retention: u32,
    pub x_files_factor: f32,
    pub retentions: Vec<RetentionTier>,
}

impl MetricInfo {
    /// Structural equality used to decide whether two stores can be merged:
    /// same name, aggregation, xFilesFactor, max retention and tier list.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        self.name == other.name
            && self.aggregation_method == other.aggregation_method
            && self.max_retention == other.max_retention
            && self.x_files_factor == other.x_files_factor
            && self.retentions == other.retentions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> MetricInfo {
        MetricInfo {
            name: "test.access-count".into(),
            aggregation_method: AggregationMethod::Sum,
            max_retention: 60,
            x_files_factor: 0.0,
            retentions: vec![
                RetentionTier::new(1, 5),
                RetentionTier::new(5, 4),
                RetentionTier::new(20, 3),
            ],
        }
    }

    #[test]
    fn same_info_requires_identical_tiers() {
        let a = info();
        let mut b = info();
        assert!(a.same_as(&b));

        b.retentions[2] = RetentionTier::new(20, 4);
        assert!(!a.same_as(&b));

        let mut c = info();
        c.retentions.pop();
        assert!(!a.same_as(&c));
    }

    #[test]
    fn same_info_compares_aggregation_metadata() {
        let a = info();
        let mut b = info();
        b.aggregation_method = AggregationMethod::Average;
        assert!(!a.same_as(&b));

        let mut c = info();
        c.x_files_factor = 0.5;
        assert!(!a.same_as(&c));

        let mut d = info();
        d.max_retention = 120;
        assert!(!a.same_as(&d));
    }

    #[test]
    fn aggregation_names_and_codes() {
        for method in [
            AggregationMethod::Average,
            AggregationMethod::Sum,
            AggregationMethod::Last,
            AggregationMethod::Max,
            AggregationMethod::Min,
        ] {
            assert_eq!(AggregationMethod::from_code(method.code()), Some(method));
            assert_eq!(method.as_str().parse::<AggregationMethod>(), Ok(method));
        }
        assert_eq!(
            "avg".parse::<AggregationMethod>(),
            Ok(AggregationMethod::Average)
        );
        assert!("median".parse::<AggregationMethod>().is_err());
        assert_eq!(AggregationMethod::from_code(0), None);
    }

    #[test]
    fn aggregate_values() {
        let v = [6.0, 7.0, 4.0, 5.0];
        assert_eq!(AggregationMethod::Sum.aggregate(&v), 22.0);
        assert_eq!(AggregationMethod::Average.aggregate(&v), 5.5);
        assert_eq!(AggregationMethod::Last.aggregate(&v), 5.0);
        assert_eq!(AggregationMethod::Max.aggregate(&v), 7.0);
        assert_eq!(AggregationMethod::Min.aggregate(&v), 4.0);
    }

    #[test]
    fn series_shape_checks() {
        let mut s = FetchedSeries {
            name: "m".into(),
            start_time: 100,
            step_time: 10,
            stop_time: 130,
            values: vec![1.0, 2.0, 3.0],
            is_absent: vec![false, true, false],
        };
        assert!(s.check_shape().is_ok());
        assert_eq!(s.timestamp_at(2), 120);

        s.is_absent.pop();
        assert!(s.check_shape().is_err());

        s.is_absent.push(false);
        s.stop_time = 140;
        assert!(s.check_shape().is_err());

        s.step_time = 0;
        assert!(s.check_shape().is_err());
    }

    #[test]
    fn tier_span_does_not_overflow() {
        let t = RetentionTier::new(u32::MAX, 2);
        assert_eq!(t.span(), u64::from(u32::MAX) * 2);
        assert_eq!(RetentionTier::new(60, 1440).to_string(), "60:1440");
    }
}
