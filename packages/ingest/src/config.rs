//! Run configuration: an optional TOML file plus environment overrides.
//!
//! ```toml
//! [api]
//! base_url = "https://data.elexon.co.uk/bmrs/api/v1/datasets"
//! requests_per_second = 2.0
//!
//! [fetch_retry]
//! max_attempts = 6
//! base_delay_ms = 2000
//! max_delay_ms = 60000
//!
//! [pipeline]
//! data_dir = "data"
//! workers = 4
//! datasets = ["BOD", "FUELINST"]
//! ```
//!
//! Environment variables win over the file:
//!
//! | Variable | Overrides |
//! |---|---|
//! | `GRID_INGEST_API_BASE_URL` | `api.base_url` |
//! | `GRID_INGEST_API_KEY_1` … `GRID_INGEST_API_KEY_20` | `api.api_keys` |
//! | `GRID_INGEST_DATA_DIR` | `pipeline.data_dir` |
//! | `GRID_INGEST_DATASETS` | `pipeline.datasets` (comma-separated) |
//! | `GRID_INGEST_DATASET_DIR` | `pipeline.dataset_dir` |
//! | `GRID_INGEST_WORKERS` | `pipeline.workers` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use grid_ingest_database::paths::{DEFAULT_DATA_DIR, DataPaths};
use grid_ingest_dataset::transform::DEFAULT_MAX_DROP_FRACTION;
use grid_ingest_dataset_models::WindowOrder;
use grid_ingest_source::http::DEFAULT_REQUEST_TIMEOUT;
use grid_ingest_source::retry::RetryPolicy;
use serde::Deserialize;

/// File read when `--config` is not given, if it exists.
pub const DEFAULT_CONFIG_FILE: &str = "grid_ingest.toml";

/// Dataset API root used when none is configured.
pub const DEFAULT_BASE_URL: &str = "https://data.elexon.co.uk/bmrs/api/v1/datasets";

/// Highest `GRID_INGEST_API_KEY_<n>` consulted.
pub const MAX_API_KEYS: usize = 20;

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config {path}: {message}")]
    Read {
        /// File path.
        path: PathBuf,
        /// I/O message.
        message: String,
    },

    /// The configuration file is not valid TOML for [`IngestConfig`].
    #[error("Failed to parse config {path}: {message}")]
    Parse {
        /// File path (or `<inline>`).
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// A value is out of range.
    #[error("Invalid configuration: {message}")]
    Invalid {
        /// What is wrong.
        message: String,
    },
}

/// Remote API settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    /// API root; dataset endpoints are appended to it.
    pub base_url: String,
    /// Keys rotated round-robin. Empty sends no key.
    pub api_keys: Vec<String>,
    /// Global request-start rate shared by every dataset.
    pub requests_per_second: f64,
    /// Per-attempt timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_keys: Vec::new(),
            requests_per_second: 2.0,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
        }
    }
}

impl ApiConfig {
    /// Per-attempt timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Retry schedule for one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on a single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl RetryConfig {
    /// Schedule used for fetches when `[fetch_retry]` is absent.
    #[must_use]
    pub const fn fetch_default() -> Self {
        Self {
            max_attempts: 6,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
        }
    }

    /// Schedule used for warehouse loads when `[load_retry]` is absent.
    #[must_use]
    pub const fn load_default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }

    /// Builds the retry policy (with the default jitter).
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                message: format!("{section}.max_attempts must be at least 1"),
            });
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid {
                message: format!("{section}.base_delay_ms exceeds {section}.max_delay_ms"),
            });
        }
        Ok(())
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Root for state, warehouse and raw archive files.
    pub data_dir: PathBuf,
    /// Concurrent window workers.
    pub workers: usize,
    /// Datasets run when none are named on the command line. Empty means
    /// every dataset not flagged as likely offline.
    pub datasets: Vec<String>,
    /// Extra dataset definitions (`*.toml`), overriding built-ins by name.
    pub dataset_dir: Option<PathBuf>,
    /// Default fraction of records a window may drop in validation.
    pub max_drop_fraction: f64,
    /// Default window order.
    pub order: WindowOrder,
    /// Archive raw payloads under `<data_dir>/raw`.
    pub archive_raw: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            workers: 2,
            datasets: Vec::new(),
            dataset_dir: None,
            max_drop_fraction: DEFAULT_MAX_DROP_FRACTION,
            order: WindowOrder::OldestFirst,
            archive_raw: false,
        }
    }
}

/// Complete run configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    /// `[api]`
    #[serde(default)]
    pub api: ApiConfig,
    /// `[fetch_retry]`
    #[serde(default = "RetryConfig::fetch_default")]
    pub fetch_retry: RetryConfig,
    /// `[load_retry]`
    #[serde(default = "RetryConfig::load_default")]
    pub load_retry: RetryConfig,
    /// `[pipeline]`
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            fetch_retry: RetryConfig::fetch_default(),
            load_retry: RetryConfig::load_default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl IngestConfig {
    /// Loads configuration for a run.
    ///
    /// Reads `path` if given (it must exist), otherwise
    /// [`DEFAULT_CONFIG_FILE`] if present, otherwise starts from defaults.
    /// Environment overrides are applied and the result validated.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, an
    /// override is malformed, or a value is out of range.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a configuration file without applying overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        log::debug!("Loaded config from {}", path.display());
        Self::parse(&contents, path)
    }

    /// Parses TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the text is not a valid config.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Self::parse(contents, Path::new("<inline>"))
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Applies `GRID_INGEST_*` overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `GRID_INGEST_WORKERS` is not a
    /// number.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = lookup("GRID_INGEST_API_BASE_URL") {
            self.api.base_url = url.trim().to_string();
        }

        let keys: Vec<String> = (1..=MAX_API_KEYS)
            .filter_map(|i| lookup(&format!("GRID_INGEST_API_KEY_{i}")))
            .map(|k| k.trim().to_string())
            .collect();
        if !keys.is_empty() {
            log::debug!("Using {} API key(s) from the environment", keys.len());
            self.api.api_keys = keys;
        }

        if let Some(dir) = lookup("GRID_INGEST_DATA_DIR") {
            self.pipeline.data_dir = PathBuf::from(dir);
        }
        if let Some(datasets) = lookup("GRID_INGEST_DATASETS") {
            self.pipeline.datasets = split_list(&datasets);
        }
        if let Some(dir) = lookup("GRID_INGEST_DATASET_DIR") {
            self.pipeline.dataset_dir = Some(PathBuf::from(dir));
        }
        if let Some(workers) = lookup("GRID_INGEST_WORKERS") {
            self.pipeline.workers = workers.trim().parse().map_err(|_| ConfigError::Invalid {
                message: format!("GRID_INGEST_WORKERS must be a positive integer, got {workers:?}"),
            })?;
        }
        Ok(())
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };

        if !(self.api.base_url.starts_with("http://") || self.api.base_url.starts_with("https://"))
        {
            return invalid("api.base_url must be an http(s) URL");
        }
        if !(self.api.requests_per_second.is_finite() && self.api.requests_per_second > 0.0) {
            return invalid("api.requests_per_second must be positive");
        }
        if self.api.request_timeout_secs == 0 {
            return invalid("api.request_timeout_secs must be positive");
        }
        self.fetch_retry.validate("fetch_retry")?;
        self.load_retry.validate("load_retry")?;
        if self.pipeline.workers == 0 {
            return invalid("pipeline.workers must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.pipeline.max_drop_fraction) {
            return invalid("pipeline.max_drop_fraction must be between 0 and 1");
        }
        Ok(())
    }

    /// File layout under the data directory.
    #[must_use]
    pub fn data_paths(&self) -> DataPaths {
        DataPaths::new(&self.pipeline.data_dir)
    }
}

/// Splits a comma-separated list, dropping blanks.
#[must_use]
pub fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config = IngestConfig::from_toml_str("").unwrap();
        assert_eq!(config, IngestConfig::default());
        assert_eq!(config.api.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.fetch_retry.max_attempts, 6);
        assert_eq!(config.load_retry, RetryConfig::load_default());
        config.validate().unwrap();
    }

    #[test]
    fn sections_override_defaults() {
        let config = IngestConfig::from_toml_str(
            r#"
            [api]
            requests_per_second = 0.5
            api_keys = ["a", "b"]

            [fetch_retry]
            max_attempts = 3
            base_delay_ms = 100
            max_delay_ms = 1000

            [pipeline]
            workers = 8
            order = "newest-first"
            datasets = ["BOD"]
            "#,
        )
        .unwrap();

        assert!((config.api.requests_per_second - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.api.api_keys, vec!["a", "b"]);
        assert_eq!(config.fetch_retry.policy().backoff(2), Duration::from_millis(200));
        assert_eq!(config.pipeline.workers, 8);
        assert_eq!(config.pipeline.order, WindowOrder::NewestFirst);
        assert_eq!(config.pipeline.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = IngestConfig::from_toml_str("[pipeline]\nworkerz = 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = IngestConfig::from_toml_str("[api]\napi_keys = [\"file\"]\n").unwrap();
        config
            .apply_overrides(env(&[
                ("GRID_INGEST_API_BASE_URL", "http://localhost:8080/api"),
                ("GRID_INGEST_API_KEY_1", "k1"),
                ("GRID_INGEST_API_KEY_3", "k3"),
                ("GRID_INGEST_DATA_DIR", "/srv/grid"),
                ("GRID_INGEST_DATASETS", "BOD, FREQ,,"),
                ("GRID_INGEST_WORKERS", "3"),
            ]))
            .unwrap();

        assert_eq!(config.api.base_url, "http://localhost:8080/api");
        assert_eq!(config.api.api_keys, vec!["k1", "k3"]);
        assert_eq!(config.pipeline.data_dir, PathBuf::from("/srv/grid"));
        assert_eq!(config.pipeline.datasets, vec!["BOD", "FREQ"]);
        assert_eq!(config.pipeline.workers, 3);
        assert_eq!(
            config.data_paths().progress_db_path(),
            PathBuf::from("/srv/grid/state/progress.duckdb")
        );
    }

    #[test]
    fn blank_overrides_are_ignored() {
        let mut config = IngestConfig::default();
        config
            .apply_overrides(env(&[("GRID_INGEST_DATA_DIR", "  ")]))
            .unwrap();
        assert_eq!(config.pipeline.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
    }

    #[test]
    fn malformed_worker_override_is_an_error() {
        let mut config = IngestConfig::default();
        let err = config
            .apply_overrides(env(&[("GRID_INGEST_WORKERS", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let mut config = IngestConfig::default();
        config.pipeline.workers = 0;
        assert!(config.validate().is_err());

        let mut config = IngestConfig::default();
        config.pipeline.max_drop_fraction = 1.5;
        assert!(config.validate().is_err());

        let mut config = IngestConfig::default();
        config.api.base_url = "ftp://example".to_string();
        assert!(config.validate().is_err());

        let mut config = IngestConfig::default();
        config.load_retry.base_delay_ms = config.load_retry.max_delay_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_explicit_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = IngestConfig::from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
