//! Apply a batch of points to one metric's archive file, creating it from
//! the storage schemas when it does not exist yet.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::WhisperConfig;
use crate::error::{Error, Result, WhisperError};
use crate::model::Point;
use crate::schema::{AggregationRules, StorageSchemas};
use crate::store::{Clock, SystemClock};
use crate::whisper::{self, WhisperFile};

/// Archive path for `name` under `root`: `a.b.c` becomes `root/a/b/c.wsp`.
#[must_use]
pub fn metric_file_path(root: &Path, name: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for segment in name.split('.').filter(|s| !s.is_empty()) {
        path.push(segment);
    }
    path.as_mut_os_string().push(".wsp");
    path
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkUpdateOptions {
    /// Hold an exclusive file lock while an archive is open.
    pub flock: bool,
    /// Create archives with the built-in aggregation (average, 0.5) when no
    /// aggregation rule matches. When off, such a metric is `NoSchema`.
    pub allow_default_aggregation: bool,
}

impl Default for BulkUpdateOptions {
    fn default() -> Self {
        Self {
            flock: true,
            allow_default_aggregation: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BulkUpdater {
    root: PathBuf,
    schemas: StorageSchemas,
    aggregation: AggregationRules,
    options: BulkUpdateOptions,
}

impl BulkUpdater {
    pub fn new(
        root: impl Into<PathBuf>,
        schemas: StorageSchemas,
        aggregation: AggregationRules,
        options: BulkUpdateOptions,
    ) -> Self {
        Self {
            root: root.into(),
            schemas,
            aggregation,
            options,
        }
    }

    /// Load both schema files.
    pub fn from_paths(
        root: impl Into<PathBuf>,
        schemas_path: &Path,
        aggregation_path: &Path,
        options: BulkUpdateOptions,
    ) -> Result<Self> {
        let schemas = StorageSchemas::load(schemas_path)?;
        let aggregation = AggregationRules::load(aggregation_path)?;
        Ok(Self::new(root, schemas, aggregation, options))
    }

    /// Updater for the `[whisper]` section: its root, both schema files and
    /// the locking flag.
    pub fn from_config(cfg: &WhisperConfig) -> Result<Self> {
        let options = BulkUpdateOptions {
            flock: cfg.flock,
            ..BulkUpdateOptions::default()
        };
        Self::from_paths(&cfg.root, &cfg.schemas_path, &cfg.aggregation_path, options)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn options(&self) -> BulkUpdateOptions {
        self.options
    }

    #[must_use]
    pub fn path_for(&self, name: &str) -> PathBuf {
        metric_file_path(&self.root, name)
    }

    /// Write `points` relative to the wall clock.
    pub fn update(&self, name: &str, points: &[Point]) -> Result<()> {
        self.update_at(name, points, SystemClock.now())
    }

    /// Write `points` with `now` as the retention reference.
    ///
    /// Points are passed through unfiltered; the archive applies its own
    /// retention and rollup rules. The file is closed before returning even
    /// when the write fails.
    pub fn update_at(&self, name: &str, points: &[Point], now: u32) -> Result<()> {
        let path = self.path_for(name);
        let opts = whisper::Options {
            flock: self.options.flock,
        };

        let mut file = match WhisperFile::open(&path, opts) {
            Ok(file) => {
                debug!(metric = name, path = %path.display(), "Opened archive");
                file
            }
            Err(WhisperError::NotExist(_)) => self.create(name, &path, opts)?,
            Err(e) => return Err(e.into()),
        };

        let written = file.update_many(points, now);
        let closed = file.close();
        written?;
        closed?;
        debug!(metric = name, points = points.len(), "Bulk update applied");
        Ok(())
    }

    fn create(&self, name: &str, path: &Path, opts: whisper::Options) -> Result<WhisperFile> {
        let schema = self
            .schemas
            .match_schema(name)
            .ok_or_else(|| Error::NoSchema {
                metric: name.to_string(),
            })?;
        let aggregation = if self.options.allow_default_aggregation {
            self.aggregation.match_aggregation(name)
        } else {
            self.aggregation
                .match_rule(name)
                .ok_or_else(|| Error::NoSchema {
                    metric: name.to_string(),
                })?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = WhisperFile::create(
            path,
            &schema.retentions,
            aggregation.method,
            aggregation.x_files_factor,
            opts,
        )?;
        info!(
            metric = name,
            path = %path.display(),
            schema = %schema.name,
            aggregation = %aggregation.method,
            "Created archive"
        );
        Ok(file)
    }
}
