//! Conversion between dense fetched series and sparse point lists.

use crate::model::{FetchedSeries, Metric, Point};

/// Present slots only, in slot (chronological) order.
#[must_use]
pub fn to_sparse_points(series: &FetchedSeries) -> Vec<Point> {
    series
        .values
        .iter()
        .zip(&series.is_absent)
        .enumerate()
        .filter(|(_, (_, absent))| !**absent)
        .map(|(i, (value, _))| Point::new(series.timestamp_at(i), *value))
        .collect()
}

/// One point per slot; absent slots carry `NaN`.
///
/// Keeps index alignment between two series whose absence patterns differ.
#[must_use]
pub fn to_sparse_points_with_nan(series: &FetchedSeries) -> Vec<Point> {
    series
        .values
        .iter()
        .zip(&series.is_absent)
        .enumerate()
        .map(|(i, (value, absent))| {
            let value = if *absent { f64::NAN } else { *value };
            Point::new(series.timestamp_at(i), value)
        })
        .collect()
}

/// Present slots as a metric batch named after the series.
#[must_use]
pub fn to_metric(series: &FetchedSeries) -> Metric {
    Metric::new(series.name.clone(), to_sparse_points(series))
}

/// Re-expand sparse points onto `slots` slots starting at `start_time`.
///
/// Points outside the window are ignored; a point that is not aligned to the
/// step lands in the slot containing it. Slots that receive no point are
/// absent. A later point for the same slot replaces an earlier one.
#[must_use]
pub fn to_series(
    name: &str,
    start_time: u32,
    step_time: u32,
    slots: usize,
    points: &[Point],
) -> FetchedSeries {
    let mut values = vec![0.0; slots];
    let mut is_absent = vec![true; slots];
    if step_time > 0 {
        for p in points {
            if p.timestamp < start_time {
                continue;
            }
            let index = ((p.timestamp - start_time) / step_time) as usize;
            if index < slots {
                values[index] = p.value;
                is_absent[index] = false;
            }
        }
    }
    FetchedSeries {
        name: name.to_string(),
        start_time,
        step_time,
        stop_time: start_time + step_time * slots as u32,
        values,
        is_absent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series() -> FetchedSeries {
        FetchedSeries {
            name: "test.access-count".into(),
            start_time: 60,
            step_time: 60,
            stop_time: 300,
            values: vec![1.0, 0.0, 2.0, 3.0],
            is_absent: vec![false, true, false, false],
        }
    }

    #[test]
    fn sparse_drops_absent_slots() {
        let points = to_sparse_points(&series());
        assert_eq!(
            points,
            vec![
                Point::new(60, 1.0),
                Point::new(180, 2.0),
                Point::new(240, 3.0)
            ]
        );
    }

    #[test]
    fn sparse_with_nan_keeps_every_slot() {
        let points = to_sparse_points_with_nan(&series());
        assert_eq!(points.len(), 4);
        assert_eq!(points[1].timestamp, 120);
        assert!(points[1].value.is_nan());
        assert_eq!(points[3], Point::new(240, 3.0));
    }

    #[test]
    fn present_nan_value_is_still_a_point() {
        let mut s = series();
        s.values[0] = f64::NAN;
        let points = to_sparse_points(&s);
        assert_eq!(points.len(), 3);
        assert!(points[0].value.is_nan());
    }

    #[test]
    fn metric_carries_series_name() {
        let m = to_metric(&series());
        assert_eq!(m.name, "test.access-count");
        assert_eq!(m.points.len(), 3);
    }

    #[test]
    fn to_series_inverts_sparse() {
        let s = series();
        let rebuilt = to_series(&s.name, s.start_time, s.step_time, s.len(), &to_sparse_points(&s));
        assert_eq!(rebuilt.is_absent, s.is_absent);
        assert_eq!(rebuilt.stop_time, s.stop_time);
        for i in 0..s.len() {
            if !s.is_absent[i] {
                assert_eq!(rebuilt.values[i], s.values[i]);
            }
        }
    }

    #[test]
    fn to_series_ignores_out_of_window_points() {
        let rebuilt = to_series("m", 100, 10, 2, &[Point::new(90, 1.0), Point::new(125, 2.0)]);
        assert_eq!(rebuilt.is_absent, vec![true, true]);
    }

    #[test]
    fn empty_series() {
        let s = FetchedSeries {
            name: "m".into(),
            start_time: 10,
            step_time: 10,
            stop_time: 10,
            values: vec![],
            is_absent: vec![],
        };
        assert!(to_sparse_points(&s).is_empty());
        assert!(to_sparse_points_with_nan(&s).is_empty());
    }
}
