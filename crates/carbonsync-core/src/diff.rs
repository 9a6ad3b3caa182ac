//! Slot-by-slot divergence between two stores.

use tracing::debug;

use crate::codec::to_sparse_points_with_nan;
use crate::error::{AlignmentField, Error, Result};
use crate::model::{FetchedSeries, Point};
use crate::store::MetricStore;

/// `[source, destination]` points for every slot where the two disagree.
/// `NaN` marks a side on which the slot is absent.
pub type DivergentPoints = [Vec<Point>; 2];

/// Fail unless both series cover the same slots and each one's values and
/// absence flags match its time range.
pub fn ensure_aligned(metric: &str, src: &FetchedSeries, dest: &FetchedSeries) -> Result<()> {
    let checks = [
        (AlignmentField::StartTime, src.start_time, dest.start_time),
        (AlignmentField::StopTime, src.stop_time, dest.stop_time),
        (AlignmentField::StepTime, src.step_time, dest.step_time),
    ];
    for (field, s, d) in checks {
        if s != d {
            return Err(Error::Alignment {
                metric: metric.to_string(),
                field,
                src: s,
                dest: d,
            });
        }
    }
    for (side, series) in [("src", src), ("dest", dest)] {
        series.check_shape().map_err(|message| Error::MalformedSeries {
            metric: metric.to_string(),
            side,
            message,
        })?;
    }
    Ok(())
}

/// Compare two aligned series.
///
/// A slot is reported unless it is absent on both sides or present on both
/// with bit-identical values.
#[must_use]
pub fn diff_series(src: &FetchedSeries, dest: &FetchedSeries) -> DivergentPoints {
    let src_points = to_sparse_points_with_nan(src);
    let dest_points = to_sparse_points_with_nan(dest);

    let mut out_src = Vec::new();
    let mut out_dest = Vec::new();
    for (i, (s, d)) in src_points.iter().zip(&dest_points).enumerate() {
        let src_absent = src.is_absent[i];
        let dest_absent = dest.is_absent[i];
        if src_absent && dest_absent {
            continue;
        }
        if !src_absent && !dest_absent && s.value.to_bits() == d.value.to_bits() {
            continue;
        }
        out_src.push(*s);
        out_dest.push(*d);
    }
    [out_src, out_dest]
}

/// Diffs one metric between a source and a destination store.
#[derive(Debug, Clone)]
pub struct Differ<S, D> {
    src: S,
    dest: D,
}

impl<S: MetricStore, D: MetricStore> Differ<S, D> {
    pub fn new(src: S, dest: D) -> Self {
        Self { src, dest }
    }

    /// Fetch `[from, until]` from both stores and report divergent slots.
    /// Both fetches complete before either result is inspected.
    pub async fn diff(&self, name: &str, from: u32, until: u32) -> Result<DivergentPoints> {
        let (src, dest) = tokio::join!(
            self.src.fetch_series(name, from, until),
            self.dest.fetch_series(name, from, until)
        );
        let (src, dest) = (src?, dest?);
        ensure_aligned(name, &src, &dest)?;

        let result = diff_series(&src, &dest);
        debug!(metric = name, from, until, divergent = result[0].len(), "Diff complete");
        Ok(result)
    }
}
