//! Store backed by a directory of archive files.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::bulk_update::BulkUpdater;
use crate::error::{Error, Result, WhisperError};
use crate::model::{FetchedSeries, Metric, MetricInfo};
use crate::store::{Clock, MetricSink, MetricStore, SystemClock};
use crate::whisper::{self, WhisperFile};

/// Reads archives directly and writes through a [`BulkUpdater`].
#[derive(Clone)]
pub struct WhisperStore {
    updater: Arc<BulkUpdater>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WhisperStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperStore")
            .field("root", &self.updater.root())
            .field("now", &self.clock.now())
            .finish()
    }
}

impl WhisperStore {
    pub fn new(updater: BulkUpdater) -> Self {
        Self::with_clock(updater, Arc::new(SystemClock))
    }

    pub fn with_clock(updater: BulkUpdater, clock: Arc<dyn Clock>) -> Self {
        Self {
            updater: Arc::new(updater),
            clock,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        self.updater.root()
    }

    fn open_options(&self) -> whisper::Options {
        whisper::Options {
            flock: self.updater.options().flock,
        }
    }

    async fn with_archive<T, F>(&self, name: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut WhisperFile, u32) -> Result<T> + Send + 'static,
    {
        let path = self.updater.path_for(name);
        let metric = name.to_string();
        let options = self.open_options();
        let now = self.clock.now();

        tokio::task::spawn_blocking(move || {
            let mut file = match WhisperFile::open(&path, options) {
                Ok(file) => file,
                Err(WhisperError::NotExist(_)) => return Err(Error::not_found(metric)),
                Err(e) => return Err(e.into()),
            };
            let result = op(&mut file, now);
            file.close()?;
            result
        })
        .await
        .map_err(|e| Error::Runtime(format!("archive task failed: {e}")))?
    }
}

impl MetricStore for WhisperStore {
    async fn fetch_series(&self, name: &str, from: u32, until: u32) -> Result<FetchedSeries> {
        let metric = name.to_string();
        self.with_archive(name, move |file, now| {
            match file.fetch(from, until, now)? {
                Some(series) => Ok(series.into_fetched(&metric)),
                None => Err(Error::not_found(metric)),
            }
        })
        .await
    }

    async fn get_info(&self, name: &str) -> Result<MetricInfo> {
        let metric = name.to_string();
        self.with_archive(name, move |file, _| Ok(file.info(&metric)))
            .await
    }
}

impl MetricSink for WhisperStore {
    async fn send(&self, metrics: &[Metric]) -> Result<()> {
        let updater = Arc::clone(&self.updater);
        let batch = metrics.to_vec();
        let now = self.clock.now();

        tokio::task::spawn_blocking(move || {
            for metric in &batch {
                updater.update_at(&metric.name, &metric.points, now)?;
                debug!(metric = %metric.name, points = metric.points.len(), "Stored batch");
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Runtime(format!("archive task failed: {e}")))?
    }
}
