//! Error types for carbonsync-core

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for carbonsync-core
#[derive(Error, Debug)]
pub enum Error {
    /// Metric does not exist in the queried store
    #[error("metric not found: {metric}")]
    NotFound { metric: String },

    /// Source and destination disagree on retentions or aggregation metadata
    #[error("unmatched info, metric={metric}, srcInfo={src}, destInfo={dest}")]
    UnmatchedInfo {
        metric: String,
        src: String,
        dest: String,
    },

    /// Two fetched series cannot be compared slot for slot
    #[error("unmatched fetch response {field}, metric={metric}, src={src}, dest={dest}")]
    Alignment {
        metric: String,
        field: AlignmentField,
        src: u32,
        dest: u32,
    },

    /// A store returned a series whose slots do not add up
    #[error("malformed {side} series, metric={metric}: {message}")]
    MalformedSeries {
        metric: String,
        side: &'static str,
        message: String,
    },

    /// No retention or aggregation rule covers a metric being created
    #[error("no storage schema defined for metric {metric}")]
    NoSchema { metric: String },

    /// Schema/aggregation file errors
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Archive file errors
    #[error("Whisper error: {0}")]
    Whisper(#[from] WhisperError),

    /// Store transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Logging initialisation errors
    #[error("Logging error: {0}")]
    Logging(#[from] crate::logging::LogError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Runtime errors (blocking task join failures)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Shorthand for a not-found error on `metric`.
    pub fn not_found(metric: impl Into<String>) -> Self {
        Self::NotFound {
            metric: metric.into(),
        }
    }

    /// Whether this is the store's distinct "metric absent" condition.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Which series boundary failed to line up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentField {
    StartTime,
    StopTime,
    StepTime,
}

impl fmt::Display for AlignmentField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StartTime => "StartTime",
            Self::StopTime => "StopTime",
            Self::StepTime => "StepTime",
        };
        f.write_str(name)
    }
}

/// Errors raised while loading storage-schemas / storage-aggregation files.
///
/// Any of these rejects the whole file.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("empty pattern for [{section}]")]
    EmptyPattern { section: String },

    #[error("failed to parse pattern {pattern:?} for [{section}]: {source}")]
    Pattern {
        section: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to parse retentions {spec:?} for [{section}]: {message}")]
    Retentions {
        section: String,
        spec: String,
        message: String,
    },

    #[error("failed to parse priority {value:?} for [{section}]")]
    Priority { section: String, value: String },

    #[error("failed to parse xFilesFactor {value:?} in [{section}]")]
    XFilesFactor { section: String, value: String },

    #[error("unknown aggregation method {value:?} in [{section}]")]
    AggregationMethod { section: String, value: String },
}

/// Archive file errors.
#[derive(Error, Debug)]
pub enum WhisperError {
    /// The archive file does not exist (creation trigger for bulk update)
    #[error("archive does not exist: {}", .0.display())]
    NotExist(PathBuf),

    #[error("archive already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("invalid retentions: {0}")]
    InvalidRetentions(String),

    #[error("invalid xFilesFactor {0}, must be within [0, 1]")]
    InvalidXFilesFactor(f32),

    #[error("unknown aggregation method code {0}")]
    UnknownAggregation(u32),

    #[error("corrupt archive {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("invalid time range, from={from} is after until={until}")]
    InvalidTimeRange { from: u32, until: u32 },

    #[error("archive I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Store transport errors (HTTP query and TCP ingestion).
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {endpoint}")]
    Status { endpoint: String, status: u16 },

    #[error("invalid response from {endpoint}: {message}")]
    InvalidResponse { endpoint: String, message: String },

    #[error("invalid store URL {url:?}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("connection to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("send to {address} failed: {source}")]
    Send {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode batch: {0}")]
    Encode(String),

    #[error("{operation} to {address} timed out after {timeout_ms} ms")]
    Timeout {
        operation: &'static str,
        address: String,
        timeout_ms: u64,
    },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
