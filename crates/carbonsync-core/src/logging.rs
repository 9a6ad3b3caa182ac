//! Structured logging for carbonsync
//!
//! `tracing` events with a pretty (stderr, colored) or JSON-lines format and
//! an optional append-only log file in the same format.
//!
//! ```ignore
//! use carbonsync_core::logging::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig::default())?;
//! ```
//!
//! Field names used across the crate: `metric`, `tier`, `from`, `until`,
//! `points`, `path`, `endpoint`, `address`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub use crate::config::LogFormat;

static INSTALLED: OnceLock<()> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level filter (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    pub level: String,

    pub format: LogFormat,

    /// Also append events to this file.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

impl LogConfig {
    /// Filter from `RUST_LOG`, or from `level` when the variable is unset or
    /// unparsable.
    pub fn filter(&self) -> Result<EnvFilter, LogError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        let level = parse_level(&self.level)?;
        Ok(EnvFilter::new(level.as_str().to_ascii_lowercase()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to open log file {}: {source}", path.display())]
    File { path: PathBuf, source: io::Error },

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// `trace` through `error`, case-insensitive.
pub fn parse_level(level: &str) -> Result<Level, LogError> {
    level
        .trim()
        .parse::<Level>()
        .map_err(|_| LogError::InvalidLevel(level.to_string()))
}

fn open_log_file(path: &Path) -> Result<std::fs::File, LogError> {
    let open = || -> io::Result<std::fs::File> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new().create(true).append(true).open(path)
    };
    open().map_err(|source| LogError::File {
        path: path.to_path_buf(),
        source,
    })
}

fn event_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_writer(writer).with_target(true);
    match format {
        LogFormat::Pretty => layer.with_ansi(ansi).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .flatten_event(true)
            .boxed(),
    }
}

/// Install the global subscriber. A second call returns
/// `LogError::AlreadyInitialized`.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if INSTALLED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }
    let filter = config.filter()?;

    let mut layers = vec![event_layer(config.format, io::stderr, true)];
    if let Some(path) = config.file.as_deref() {
        let file = Arc::new(open_log_file(path)?);
        layers.push(event_layer(config.format, file, false));
    }

    let subscriber = tracing_subscriber::registry().with(layers).with(filter);
    tracing::subscriber::set_global_default(subscriber)?;
    let _ = INSTALLED.set(());

    tracing::info!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );
    Ok(())
}

pub fn is_logging_initialized() -> bool {
    INSTALLED.get().is_some()
}
