//! Configuration management for carbonsync
//!
//! Handles loading and validation of `carbonsync.toml` files. Every section
//! is optional and falls back to its defaults.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::merger::MergePolicy;
use crate::retry::RetryPolicy;
use crate::sender::Encoding;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SyncConfig {
    /// Store the merge reads from
    pub source: StoreConfig,

    /// Store the merge compares against
    pub destination: StoreConfig,

    /// Ingestion endpoint for merged points
    pub sender: SenderConfig,

    /// Retry applied to the info lookups preceding a merge
    pub retry: InfoRetryConfig,

    /// Local archive directory and schema files
    pub whisper: WhisperConfig,

    pub merge: MergeConfig,

    pub logging: LogConfig,
}

/// carbonserver query endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// `host:port` of the carbon receiver
    pub address: String,
    pub encoding: Encoding,
    pub timeout_ms: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:2003".to_string(),
            encoding: Encoding::Text,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl SenderConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoRetryConfig {
    pub attempts: u32,
    pub interval_ms: u64,
}

impl Default for InfoRetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval_ms: 100,
        }
    }
}

impl InfoRetryConfig {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.attempts, Duration::from_millis(self.interval_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhisperConfig {
    pub root: PathBuf,
    pub schemas_path: PathBuf,
    pub aggregation_path: PathBuf,
    /// Lock archive files while they are open
    pub flock: bool,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/carbon/whisper"),
            schemas_path: PathBuf::from("/etc/carbon/storage-schemas.conf"),
            aggregation_path: PathBuf::from("/etc/carbon/storage-aggregation.conf"),
            flock: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MergeConfig {
    pub policy: MergePolicy,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable colored output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

fn default_timeout_ms() -> u64 {
    5000
}

impl SyncConfig {
    /// Load and validate configuration from `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text without validating it
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.attempts must be at least 1".to_string(),
            ));
        }
        for (section, store) in [("source", &self.source), ("destination", &self.destination)] {
            if store.timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{section}.timeout_ms must be positive"
                )));
            }
            let parsed = url::Url::parse(&store.url)
                .map_err(|e| ConfigError::Invalid(format!("{section}.url {:?}: {e}", store.url)))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid(format!(
                    "{section}.url {:?}: scheme must be http or https",
                    store.url
                )));
            }
        }
        if self.sender.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sender.timeout_ms must be positive".to_string(),
            ));
        }
        if self.sender.address.is_empty() {
            return Err(ConfigError::Invalid("sender.address is empty".to_string()));
        }
        crate::logging::parse_level(&self.logging.level)
            .map_err(|e| ConfigError::Invalid(format!("logging.level: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.retry.interval_ms, 100);
        assert_eq!(config.merge.policy, MergePolicy::GapFill);
        assert_eq!(config.sender.encoding, Encoding::Text);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = SyncConfig::parse(
            r#"
[destination]
url = "http://10.0.0.2:8080"

[sender]
encoding = "binary_framed"

[merge]
policy = "overwrite"

[logging]
format = "json"
"#,
        )
        .unwrap();
        assert_eq!(config.destination.url, "http://10.0.0.2:8080");
        assert_eq!(config.destination.timeout_ms, 5000);
        assert_eq!(config.source, StoreConfig::default());
        assert_eq!(config.sender.encoding, Encoding::BinaryFramed);
        assert_eq!(config.merge.policy, MergePolicy::Overwrite);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.whisper.flock);
    }

    #[test]
    fn retry_section_builds_fixed_policy() {
        let config = SyncConfig::parse("[retry]\nattempts = 3\ninterval_ms = 20\n").unwrap();
        let policy = config.retry.policy();
        assert_eq!(policy, RetryPolicy::fixed(3, Duration::from_millis(20)));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = SyncConfig::default();
        config.retry.attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = SyncConfig::default();
        config.logging.level = "loud".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = SyncConfig::default();
        config.source.url = "not a url".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = SyncConfig::default();
        config.destination.url = "ftp://host/".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = SyncConfig::default();
        config.sender.timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_enum_value_is_parse_error() {
        let err = SyncConfig::parse("[merge]\npolicy = \"clobber\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = SyncConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_reads_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carbonsync.toml");
        std::fs::write(&path, "[retry]\nattempts = 0\n").unwrap();
        assert!(matches!(
            SyncConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(&path, "[whisper]\nroot = \"/tmp/wsp\"\nflock = false\n").unwrap();
        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.whisper.root, PathBuf::from("/tmp/wsp"));
        assert!(!config.whisper.flock);
    }
}
