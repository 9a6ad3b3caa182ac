//! Tier-by-tier reconciliation of a destination store with a source.
//!
//! For each metric the merger compares retention metadata, then walks the
//! tiers from coarsest to finest. Each tier covers only the time strictly
//! older than the next finer tier's span, so windows never overlap:
//!
//! ```text
//! tier i window: [trunc(now, step_i) - span_i + step_i,
//!                 trunc(now, step_i) - span_{i-1}]        (span_{-1} = 0)
//! ```
//!
//! Source slots selected by the [`MergePolicy`] are forwarded to the
//! destination's sink as one batch per tier.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::diff::ensure_aligned;
use crate::error::{Error, Result};
use crate::model::{FetchedSeries, Metric, MetricInfo, Point, RetentionTier};
use crate::retry::{RetryPolicy, with_retry};
use crate::store::{Clock, MetricSink, MetricStore, SystemClock};

/// Which source slots a merge forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Source present and destination absent.
    #[default]
    GapFill,
    /// Source present and destination absent or holding a different value.
    Overwrite,
}

impl MergePolicy {
    /// Slots to forward. Only the slots both series actually carry are
    /// considered.
    #[must_use]
    pub fn select(self, src: &FetchedSeries, dest: &FetchedSeries) -> Vec<Point> {
        let src_slots = src.values.iter().zip(&src.is_absent);
        let dest_slots = dest.values.iter().zip(&dest.is_absent);
        src_slots
            .zip(dest_slots)
            .enumerate()
            .filter(|(_, ((_, src_absent), _))| !**src_absent)
            .filter(|(_, ((s, _), (d, dest_absent)))| match self {
                Self::GapFill => **dest_absent,
                Self::Overwrite => **dest_absent || d.to_bits() != s.to_bits(),
            })
            .map(|(i, ((s, _), _))| Point::new(src.timestamp_at(i), *s))
            .collect()
    }
}

/// One tier's query window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierWindow {
    /// Index into the finest-first tier list.
    pub index: usize,
    pub tier: RetentionTier,
    pub from: u32,
    pub until: u32,
}

/// Windows for every tier, coarsest first.
#[must_use]
pub fn tier_windows(retentions: &[RetentionTier], now: u32) -> Vec<TierWindow> {
    (0..retentions.len())
        .rev()
        .map(|index| {
            let tier = retentions[index];
            let step = i64::from(tier.seconds_per_point.max(1));
            let from_offset = -(tier.span() as i64);
            let until_offset = if index > 0 {
                -(retentions[index - 1].span() as i64)
            } else {
                0
            };
            let truncated = i64::from(now) - i64::from(now) % step;
            TierWindow {
                index,
                tier,
                from: clamp_u32(truncated + from_offset + step),
                until: clamp_u32(truncated + until_offset),
            }
        })
        .collect()
}

fn clamp_u32(v: i64) -> u32 {
    v.clamp(0, i64::from(u32::MAX)) as u32
}

/// What happened to one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierReport {
    pub window: TierWindow,
    /// The source had nothing for this window.
    pub source_missing: bool,
    pub points_sent: usize,
}

/// What happened to one metric.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeReport {
    pub metric: String,
    /// The source store does not have the metric.
    pub skipped: bool,
    pub tiers: Vec<TierReport>,
}

impl MergeReport {
    #[must_use]
    pub fn points_sent(&self) -> usize {
        self.tiers.iter().map(|t| t.points_sent).sum()
    }
}

/// Merges metrics from `src` into `dest`, writing through `sink`.
pub struct Merger<S, D, K> {
    src: S,
    dest: D,
    sink: K,
    policy: MergePolicy,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl<S, D, K> std::fmt::Debug for Merger<S, D, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Merger")
            .field("policy", &self.policy)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl<S: MetricStore, D: MetricStore, K: MetricSink> Merger<S, D, K> {
    /// Gap-fill merger with the default info retry and the wall clock.
    pub fn new(src: S, dest: D, sink: K) -> Self {
        Self {
            src,
            dest,
            sink,
            policy: MergePolicy::GapFill,
            retry: RetryPolicy::info_lookup(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Merger using the `[merge]` policy and `[retry]` settings of `config`.
    pub fn from_config(src: S, dest: D, sink: K, config: &SyncConfig) -> Self {
        Self::new(src, dest, sink)
            .with_policy(config.merge.policy)
            .with_retry(config.retry.policy())
    }

    #[must_use]
    pub fn with_policy(mut self, policy: MergePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Retry applied to the two info lookups. Series fetches and sends are
    /// never retried.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    pub async fn merge_metric(&self, name: &str) -> Result<MergeReport> {
        self.merge_metric_at(name, self.clock.now()).await
    }

    /// Merge one metric with `now` as the window reference.
    pub async fn merge_metric_at(&self, name: &str, now: u32) -> Result<MergeReport> {
        let mut report = MergeReport {
            metric: name.to_string(),
            ..MergeReport::default()
        };

        let Some(src_info) = self.fetch_infos(name).await? else {
            info!(metric = name, "Metric not found in source, skipping");
            report.skipped = true;
            return Ok(report);
        };

        for window in tier_windows(&src_info.retentions, now) {
            let tier = window.tier.to_string();
            if window.from > window.until {
                debug!(metric = name, tier = %tier, "Empty tier window, skipping");
                report.tiers.push(TierReport {
                    window,
                    source_missing: false,
                    points_sent: 0,
                });
                continue;
            }

            let Some(points) = self.points_for_merge(name, window.from, window.until).await? else {
                info!(
                    metric = name,
                    tier = %tier,
                    from = window.from,
                    until = window.until,
                    "Source window not found, skipping tier"
                );
                report.tiers.push(TierReport {
                    window,
                    source_missing: true,
                    points_sent: 0,
                });
                continue;
            };

            debug!(
                metric = name,
                tier = %tier,
                from = window.from,
                until = window.until,
                points = points.len(),
                "Selected points for tier"
            );
            let points_sent = points.len();
            if !points.is_empty() {
                self.sink.send(&[Metric::new(name, points)]).await?;
            }
            report.tiers.push(TierReport {
                window,
                source_missing: false,
                points_sent,
            });
        }

        debug!(metric = name, points = report.points_sent(), "Metric merged");
        Ok(report)
    }

    /// Merge metrics one at a time, in order, stopping at the first error.
    pub async fn merge_metrics<I, N>(&self, names: I) -> Result<Vec<MergeReport>>
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        let mut reports = Vec::new();
        for name in names {
            reports.push(self.merge_metric(name.as_ref()).await?);
        }
        Ok(reports)
    }

    /// Source slots to forward for `[from, until]`. `None` when the source
    /// has nothing for the window.
    pub async fn points_for_merge(
        &self,
        name: &str,
        from: u32,
        until: u32,
    ) -> Result<Option<Vec<Point>>> {
        let (src, dest) = tokio::join!(
            self.src.fetch_series(name, from, until),
            self.dest.fetch_series(name, from, until)
        );
        let src = match src {
            Ok(series) => series,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let dest = dest?;
        ensure_aligned(name, &src, &dest)?;
        Ok(Some(self.policy.select(&src, &dest)))
    }

    /// Both infos, checked for compatibility. `None` when the source lacks
    /// the metric; a missing destination is an error.
    async fn fetch_infos(&self, name: &str) -> Result<Option<MetricInfo>> {
        let (src, dest) = tokio::join!(
            with_retry(&self.retry, || self.src.get_info(name)),
            with_retry(&self.retry, || self.dest.get_info(name))
        );
        let src = match src {
            Ok(info) => info,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let dest = dest?;
        if !src.same_as(&dest) {
            return Err(Error::UnmatchedInfo {
                metric: name.to_string(),
                src: describe(&src),
                dest: describe(&dest),
            });
        }
        Ok(Some(src))
    }
}

fn describe(info: &MetricInfo) -> String {
    let tiers: Vec<String> = info.retentions.iter().map(ToString::to_string).collect();
    format!(
        "{{name={} aggregation={} xff={} maxRetention={} retentions=[{}]}}",
        info.name,
        info.aggregation_method,
        info.x_files_factor,
        info.max_retention,
        tiers.join(",")
    )
}
