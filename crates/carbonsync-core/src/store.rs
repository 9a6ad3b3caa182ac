//! Store seams: query, ingestion and the clock.
//!
//! Merge and diff are generic over these traits so the same code runs
//! against carbonserver over HTTP, a local archive directory, or a test
//! double.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::model::{FetchedSeries, Metric, MetricInfo};

/// Read side of a store.
///
/// Both calls return `Error::NotFound` when the store has no such metric;
/// every other failure is a different variant.
#[allow(async_fn_in_trait)]
pub trait MetricStore: Send + Sync {
    /// Dense slots covering `[from, until]` at the resolution the store
    /// picks for that window.
    async fn fetch_series(&self, name: &str, from: u32, until: u32) -> Result<FetchedSeries>;

    async fn get_info(&self, name: &str) -> Result<MetricInfo>;
}

/// Write side of a store.
#[allow(async_fn_in_trait)]
pub trait MetricSink: Send + Sync {
    async fn send(&self, metrics: &[Metric]) -> Result<()>;
}

impl<T: MetricStore> MetricStore for Arc<T> {
    async fn fetch_series(&self, name: &str, from: u32, until: u32) -> Result<FetchedSeries> {
        (**self).fetch_series(name, from, until).await
    }

    async fn get_info(&self, name: &str) -> Result<MetricInfo> {
        (**self).get_info(name).await
    }
}

impl<T: MetricSink> MetricSink for Arc<T> {
    async fn send(&self, metrics: &[Metric]) -> Result<()> {
        (**self).send(metrics).await
    }
}

/// Current time in whole seconds since the epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> u32;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct FixedClock {
    now: AtomicU32,
}

impl FixedClock {
    #[must_use]
    pub fn new(now: u32) -> Self {
        Self {
            now: AtomicU32::new(now),
        }
    }

    pub fn set(&self, now: u32) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: u32) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> u32 {
        (**self).now()
    }
}
