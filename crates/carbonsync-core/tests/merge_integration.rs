//! End-to-end merge, diff and bulk update over local archive directories.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use carbonsync_core::bulk_update::{BulkUpdateOptions, BulkUpdater};
use carbonsync_core::diff::Differ;
use carbonsync_core::local_store::WhisperStore;
use carbonsync_core::merger::{MergePolicy, Merger};
use carbonsync_core::model::{Metric, Point};
use carbonsync_core::retry::RetryPolicy;
use carbonsync_core::schema::{AggregationRules, StorageSchemas};
use carbonsync_core::store::{Clock, FixedClock, MetricSink, MetricStore};
use carbonsync_core::Error;

const NOW: u32 = 1_700_000_000;
const METRIC: &str = "test.access-count";

const SCHEMAS: &str = "\
[access]
pattern = ^test\\.access-
retentions = 1s:5s,5s:20s,20s:60s

[default]
pattern = .*
retentions = 60:1440
";

const AGGREGATION: &str = "\
[access]
pattern = ^test\\.access-
xFilesFactor = 0.0
aggregationMethod = sum
";

fn store(root: &Path, clock: Arc<FixedClock>) -> WhisperStore {
    let updater = BulkUpdater::new(
        root,
        StorageSchemas::parse(SCHEMAS).unwrap(),
        AggregationRules::parse(AGGREGATION).unwrap(),
        BulkUpdateOptions::default(),
    );
    WhisperStore::with_clock(updater, clock)
}

fn scenario_points() -> Vec<Point> {
    [6.0, 7.0, 4.0, 5.0, 2.0, 3.0]
        .iter()
        .enumerate()
        .map(|(i, v)| Point::new(NOW - 5 + i as u32, *v))
        .collect()
}

struct Fixture {
    _src_dir: tempfile::TempDir,
    _dest_dir: tempfile::TempDir,
    clock: Arc<FixedClock>,
    src: WhisperStore,
    dest: WhisperStore,
}

async fn fixture() -> Fixture {
    let src_dir = tempdir().unwrap();
    let dest_dir = tempdir().unwrap();
    let clock = Arc::new(FixedClock::new(NOW));
    let src = store(src_dir.path(), Arc::clone(&clock));
    let dest = store(dest_dir.path(), Arc::clone(&clock));

    src.send(&[Metric::new(METRIC, scenario_points())])
        .await
        .unwrap();
    // destination archive exists but is empty
    dest.send(&[Metric::new(METRIC, Vec::new())]).await.unwrap();

    Fixture {
        _src_dir: src_dir,
        _dest_dir: dest_dir,
        clock,
        src,
        dest,
    }
}

fn merger(f: &Fixture) -> Merger<WhisperStore, WhisperStore, WhisperStore> {
    let clock: Arc<dyn Clock> = f.clock.clone();
    Merger::new(f.src.clone(), f.dest.clone(), f.dest.clone())
        .with_retry(RetryPolicy::fixed(2, Duration::from_millis(1)))
        .with_clock(clock)
}

#[tokio::test]
async fn tier_scenario_rolls_up_with_sum() {
    let f = fixture().await;

    let fine = f.src.fetch_series(METRIC, NOW - 5, NOW).await.unwrap();
    assert_eq!(fine.values, vec![7.0, 4.0, 5.0, 2.0, 3.0]);
    assert!(fine.is_absent.iter().all(|a| !a));

    let coarse = f.src.fetch_series(METRIC, NOW - 10, NOW).await.unwrap();
    assert_eq!(coarse.step_time, 5);
    assert_eq!(coarse.values, vec![18.0, 3.0]);
    assert_eq!(coarse.is_absent, vec![false, false]);
}

#[tokio::test]
async fn gap_fill_merge_copies_every_tier() {
    let f = fixture().await;
    let m = merger(&f);

    let report = m.merge_metric(METRIC).await.unwrap();
    assert!(!report.skipped);
    let per_tier: Vec<usize> = report.tiers.iter().map(|t| t.points_sent).collect();
    // coarsest first: [NOW-20], [NOW-10, NOW-5], [NOW-3 ..= NOW]
    assert_eq!(per_tier, vec![1, 1, 4]);

    let fine = f.dest.fetch_series(METRIC, NOW - 5, NOW).await.unwrap();
    assert_eq!(fine.is_absent, vec![true, false, false, false, false]);
    assert_eq!(&fine.values[1..], &[4.0, 5.0, 2.0, 3.0]);
}

#[tokio::test]
async fn second_merge_sends_nothing() {
    let f = fixture().await;
    let m = merger(&f);

    m.merge_metric(METRIC).await.unwrap();
    let again = m.merge_metric(METRIC).await.unwrap();
    assert_eq!(again.points_sent(), 0);
}

#[tokio::test]
async fn gap_fill_keeps_destination_values() {
    let f = fixture().await;
    f.dest
        .send(&[Metric::new(METRIC, vec![Point::new(NOW - 2, 100.0)])])
        .await
        .unwrap();

    merger(&f).merge_metric(METRIC).await.unwrap();

    let fine = f.dest.fetch_series(METRIC, NOW - 5, NOW).await.unwrap();
    // slots NOW-4 ..= NOW
    assert_eq!(fine.values[2], 100.0);
    assert!(!fine.is_absent[2]);
    assert_eq!(fine.values[1], 4.0);
}

#[tokio::test]
async fn overwrite_policy_replaces_differing_values() {
    let f = fixture().await;
    f.dest
        .send(&[Metric::new(METRIC, vec![Point::new(NOW - 2, 100.0)])])
        .await
        .unwrap();

    let m = merger(&f).with_policy(MergePolicy::Overwrite);
    m.merge_metric(METRIC).await.unwrap();

    let fine = f.dest.fetch_series(METRIC, NOW - 5, NOW).await.unwrap();
    assert_eq!(fine.values[2], 5.0);
}

#[tokio::test]
async fn metric_missing_from_source_is_skipped() {
    let f = fixture().await;
    let report = merger(&f).merge_metric("test.access-other").await.unwrap();
    assert!(report.skipped);
    assert_eq!(report.points_sent(), 0);
}

#[tokio::test]
async fn metric_missing_from_destination_is_fatal() {
    let f = fixture().await;
    f.src
        .send(&[Metric::new("test.access-new", vec![Point::new(NOW, 1.0)])])
        .await
        .unwrap();
    let err = merger(&f).merge_metric("test.access-new").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn differing_schemas_are_unmatched() {
    let f = fixture().await;
    // "other.metric" falls through to the 60:1440 default in the source only
    f.src
        .send(&[Metric::new("other.metric", vec![Point::new(NOW, 1.0)])])
        .await
        .unwrap();

    let dest_dir = tempdir().unwrap();
    let odd = BulkUpdater::new(
        dest_dir.path(),
        StorageSchemas::parse("[all]\npattern = .*\nretentions = 10:100\n").unwrap(),
        AggregationRules::default(),
        BulkUpdateOptions::default(),
    );
    let clock: Arc<dyn Clock> = f.clock.clone();
    let dest = WhisperStore::with_clock(odd, Arc::clone(&clock));
    dest.send(&[Metric::new("other.metric", Vec::new())])
        .await
        .unwrap();

    let m = Merger::new(f.src.clone(), dest.clone(), dest)
        .with_retry(RetryPolicy::fixed(1, Duration::from_millis(1)))
        .with_clock(clock);
    let err = m.merge_metric("other.metric").await.unwrap_err();
    assert!(matches!(err, Error::UnmatchedInfo { .. }));
}

#[tokio::test]
async fn diff_reports_only_divergent_slots() {
    let f = fixture().await;
    let differ = Differ::new(f.src.clone(), f.dest.clone());

    let [src, dest] = differ.diff(METRIC, NOW - 5, NOW).await.unwrap();
    assert_eq!(src.len(), 5);
    assert!(dest.iter().all(|p| p.value.is_nan()));

    merger(&f).merge_metric(METRIC).await.unwrap();
    let [src, dest] = differ.diff(METRIC, NOW - 5, NOW).await.unwrap();
    // NOW-4 lies outside the finest tier's merge window
    assert_eq!(src.len(), 1);
    assert_eq!(src[0].timestamp, NOW - 4);
    assert!(dest[0].value.is_nan());
}

#[tokio::test]
async fn diff_of_identical_stores_is_empty() {
    let f = fixture().await;
    let differ = Differ::new(f.src.clone(), f.src.clone());
    let [src, dest] = differ.diff(METRIC, NOW - 5, NOW).await.unwrap();
    assert!(src.is_empty());
    assert!(dest.is_empty());
}

#[tokio::test]
async fn merge_follows_the_clock() {
    let f = fixture().await;
    f.clock.advance(600);
    // everything in the source has aged out of retention
    let report = merger(&f).merge_metric(METRIC).await.unwrap();
    assert_eq!(report.points_sent(), 0);
    assert!(report.tiers.iter().all(|t| t.points_sent == 0));
}

#[tokio::test]
async fn merge_metrics_runs_in_order() {
    let f = fixture().await;
    let reports = merger(&f)
        .merge_metrics([METRIC, "test.access-other"])
        .await
        .unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].points_sent(), 6);
    assert!(reports[1].skipped);
}
