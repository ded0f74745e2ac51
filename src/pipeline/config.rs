//! Run configuration for the orchestrator.
//!
//! `RunConfig` is assembled in layers, lowest precedence first:
//!
//! 1. `RunConfig::default()`
//! 2. a YAML file (`RunConfig::from_file`)
//! 3. `RELAY_*` environment variables (`RunConfig::apply_env`)
//! 4. command-line flags, applied by the CLI through the `with_*` builders
//!
//! `validate()` runs last and rejects values the orchestrator cannot honor.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::scheduler::{WorkerConfig, DEFAULT_MAX_RETRIES};

/// Largest cohort a single identity may run.
pub const MAX_WORKERS_LIMIT: usize = 64;

/// Default result file name.
pub const DEFAULT_OUTPUT_PATH: &str = "final_result.json";

/// Default summary file name, placed next to the result file.
pub const DEFAULT_SUMMARY_FILE: &str = "run_metrics.json";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A setting has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for this schema.
    #[error("Invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration for one relay run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    // Sessions
    /// Session endpoints, consumed in order on exhaustion.
    pub identities: Vec<String>,
    /// Upper bound on workers per cohort.
    pub max_workers: usize,
    /// Extra headroom added to the queue length when sizing a cohort.
    pub cohort_slack: usize,

    // Retry policy
    /// Retries granted to each task after its first attempt.
    pub max_retries: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,

    // Pacing
    /// Queue poll timeout.
    pub poll_interval: Duration,
    /// Pause a worker takes after each task.
    pub inter_task_delay: Duration,
    /// Limit on a single driver call.
    pub task_timeout: Option<Duration>,
    /// Driver calls allowed per minute across a cohort.
    pub requests_per_minute: Option<u32>,

    // Output
    pub output_path: PathBuf,
    /// Summary file; defaults to `run_metrics.json` next to the output.
    pub summary_path: Option<PathBuf>,
    /// Whether to fsync after each result.
    pub sync_writes: bool,
    pub backup_output: bool,
    pub max_backups: usize,

    /// How often to log progress; `None` disables the monitor.
    pub progress_interval: Option<Duration>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            identities: Vec::new(),
            max_workers: 1,
            cohort_slack: 5,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_max: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            inter_task_delay: Duration::from_secs(1),
            task_timeout: None,
            requests_per_minute: None,
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            summary_path: None,
            sync_writes: true,
            backup_output: true,
            max_backups: 5,
            progress_interval: None,
        }
    }
}

/// On-disk shape of a configuration file. Every field is optional and
/// durations are given in seconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub identities: Option<Vec<String>>,
    pub max_workers: Option<usize>,
    pub cohort_slack: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_backoff_base_secs: Option<f64>,
    pub retry_backoff_max_secs: Option<f64>,
    pub poll_interval_secs: Option<f64>,
    pub inter_task_delay_secs: Option<f64>,
    pub task_timeout_secs: Option<f64>,
    pub requests_per_minute: Option<u32>,
    pub output_path: Option<PathBuf>,
    pub summary_path: Option<PathBuf>,
    pub sync_writes: Option<bool>,
    pub backup_output: Option<bool>,
    pub max_backups: Option<usize>,
    pub progress_interval_secs: Option<f64>,
}

impl RunConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a YAML configuration file on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, or holds
    /// an invalid duration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let file: FileConfig = serde_yaml::from_str(&content)?;
        let mut config = Self::default();
        config.apply_file(file)?;
        Ok(config)
    }

    /// Overlays the values present in a parsed configuration file.
    pub fn apply_file(&mut self, file: FileConfig) -> Result<(), ConfigError> {
        if let Some(v) = file.identities {
            self.identities = v;
        }
        if let Some(v) = file.max_workers {
            self.max_workers = v;
        }
        if let Some(v) = file.cohort_slack {
            self.cohort_slack = v;
        }
        if let Some(v) = file.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = file.retry_backoff_base_secs {
            self.retry_backoff_base = secs_to_duration(v, "retry_backoff_base_secs")?;
        }
        if let Some(v) = file.retry_backoff_max_secs {
            self.retry_backoff_max = secs_to_duration(v, "retry_backoff_max_secs")?;
        }
        if let Some(v) = file.poll_interval_secs {
            self.poll_interval = secs_to_duration(v, "poll_interval_secs")?;
        }
        if let Some(v) = file.inter_task_delay_secs {
            self.inter_task_delay = secs_to_duration(v, "inter_task_delay_secs")?;
        }
        if let Some(v) = file.task_timeout_secs {
            self.task_timeout = Some(secs_to_duration(v, "task_timeout_secs")?);
        }
        if let Some(v) = file.requests_per_minute {
            self.requests_per_minute = Some(v);
        }
        if let Some(v) = file.output_path {
            self.output_path = v;
        }
        if let Some(v) = file.summary_path {
            self.summary_path = Some(v);
        }
        if let Some(v) = file.sync_writes {
            self.sync_writes = v;
        }
        if let Some(v) = file.backup_output {
            self.backup_output = v;
        }
        if let Some(v) = file.max_backups {
            self.max_backups = v;
        }
        if let Some(v) = file.progress_interval_secs {
            self.progress_interval = Some(secs_to_duration(v, "progress_interval_secs")?);
        }
        Ok(())
    }

    /// Overlays values from `RELAY_*` environment variables.
    ///
    /// Recognized variables:
    /// - `RELAY_IDENTITIES`: Comma-separated session endpoints
    /// - `RELAY_MAX_WORKERS`: Workers per cohort (default: 1)
    /// - `RELAY_COHORT_SLACK`: Cohort sizing headroom (default: 5)
    /// - `RELAY_MAX_RETRIES`: Retries per task (default: 3)
    /// - `RELAY_RETRY_BACKOFF_SECS`: First retry backoff (default: 1)
    /// - `RELAY_RETRY_BACKOFF_MAX_SECS`: Backoff cap (default: 60)
    /// - `RELAY_POLL_INTERVAL_SECS`: Queue poll timeout (default: 1)
    /// - `RELAY_INTER_TASK_DELAY_SECS`: Pause after each task (default: 1)
    /// - `RELAY_TASK_TIMEOUT_SECS`: Driver call limit (default: none)
    /// - `RELAY_REQUESTS_PER_MINUTE`: Cohort rate limit (default: none)
    /// - `RELAY_OUTPUT`: Result file (default: final_result.json)
    /// - `RELAY_SUMMARY`: Summary file
    /// - `RELAY_SYNC_WRITES`: fsync every append (default: true)
    /// - `RELAY_BACKUP_OUTPUT`: Back up the result file before a run (default: true)
    /// - `RELAY_MAX_BACKUPS`: Backups kept (default: 5)
    /// - `RELAY_PROGRESS_INTERVAL_SECS`: Progress log interval (default: off)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable cannot be parsed.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Same as [`RunConfig::apply_env`] with a custom variable lookup.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("RELAY_IDENTITIES") {
            self.identities = split_list(&val);
        }

        if let Some(val) = lookup("RELAY_MAX_WORKERS") {
            self.max_workers = parse_env_value(&val, "RELAY_MAX_WORKERS")?;
        }

        if let Some(val) = lookup("RELAY_COHORT_SLACK") {
            self.cohort_slack = parse_env_value(&val, "RELAY_COHORT_SLACK")?;
        }

        if let Some(val) = lookup("RELAY_MAX_RETRIES") {
            self.max_retries = parse_env_value(&val, "RELAY_MAX_RETRIES")?;
        }

        if let Some(val) = lookup("RELAY_RETRY_BACKOFF_SECS") {
            self.retry_backoff_base = parse_env_secs(&val, "RELAY_RETRY_BACKOFF_SECS")?;
        }

        if let Some(val) = lookup("RELAY_RETRY_BACKOFF_MAX_SECS") {
            self.retry_backoff_max = parse_env_secs(&val, "RELAY_RETRY_BACKOFF_MAX_SECS")?;
        }

        if let Some(val) = lookup("RELAY_POLL_INTERVAL_SECS") {
            self.poll_interval = parse_env_secs(&val, "RELAY_POLL_INTERVAL_SECS")?;
        }

        if let Some(val) = lookup("RELAY_INTER_TASK_DELAY_SECS") {
            self.inter_task_delay = parse_env_secs(&val, "RELAY_INTER_TASK_DELAY_SECS")?;
        }

        if let Some(val) = lookup("RELAY_TASK_TIMEOUT_SECS") {
            self.task_timeout = Some(parse_env_secs(&val, "RELAY_TASK_TIMEOUT_SECS")?);
        }

        if let Some(val) = lookup("RELAY_REQUESTS_PER_MINUTE") {
            self.requests_per_minute = Some(parse_env_value(&val, "RELAY_REQUESTS_PER_MINUTE")?);
        }

        if let Some(val) = lookup("RELAY_OUTPUT") {
            self.output_path = PathBuf::from(val);
        }

        if let Some(val) = lookup("RELAY_SUMMARY") {
            self.summary_path = Some(PathBuf::from(val));
        }

        if let Some(val) = lookup("RELAY_SYNC_WRITES") {
            self.sync_writes = parse_env_bool(&val, "RELAY_SYNC_WRITES")?;
        }

        if let Some(val) = lookup("RELAY_BACKUP_OUTPUT") {
            self.backup_output = parse_env_bool(&val, "RELAY_BACKUP_OUTPUT")?;
        }

        if let Some(val) = lookup("RELAY_MAX_BACKUPS") {
            self.max_backups = parse_env_value(&val, "RELAY_MAX_BACKUPS")?;
        }

        if let Some(val) = lookup("RELAY_PROGRESS_INTERVAL_SECS") {
            self.progress_interval = Some(parse_env_secs(&val, "RELAY_PROGRESS_INTERVAL_SECS")?);
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identities.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one session identity is required".to_string(),
            ));
        }

        if self.identities.iter().any(|i| i.trim().is_empty()) {
            return Err(ConfigError::ValidationFailed(
                "session identities cannot be empty".to_string(),
            ));
        }

        if !(1..=MAX_WORKERS_LIMIT).contains(&self.max_workers) {
            return Err(ConfigError::ValidationFailed(format!(
                "max_workers must be between 1 and {}",
                MAX_WORKERS_LIMIT
            )));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.retry_backoff_base > self.retry_backoff_max {
            return Err(ConfigError::ValidationFailed(
                "retry_backoff_base cannot exceed retry_backoff_max".to_string(),
            ));
        }

        if self.task_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ValidationFailed(
                "task_timeout must be greater than 0".to_string(),
            ));
        }

        if self.requests_per_minute == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "requests_per_minute must be greater than 0".to_string(),
            ));
        }

        if self.progress_interval.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ValidationFailed(
                "progress_interval must be greater than 0".to_string(),
            ));
        }

        if self.output_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "output_path cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Returns the summary path, defaulting to `run_metrics.json` next to
    /// the output file.
    pub fn resolved_summary_path(&self) -> PathBuf {
        match self.summary_path {
            Some(ref path) => path.clone(),
            None => self.output_path.with_file_name(DEFAULT_SUMMARY_FILE),
        }
    }

    /// Returns the per-worker timing configuration.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
            retry_backoff_base: self.retry_backoff_base,
            retry_backoff_max: self.retry_backoff_max,
            inter_task_delay: self.inter_task_delay,
            task_timeout: self.task_timeout,
        }
    }

    /// Builder method to set the session identities.
    pub fn with_identities<I, S>(mut self, identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identities = identities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    pub fn with_cohort_slack(mut self, slack: usize) -> Self {
        self.cohort_slack = slack;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Builder method to set the retry backoff base and cap.
    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff_base = base;
        self.retry_backoff_max = max;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_inter_task_delay(mut self, delay: Duration) -> Self {
        self.inter_task_delay = delay;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_requests_per_minute(mut self, rpm: Option<u32>) -> Self {
        self.requests_per_minute = rpm;
        self
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = path.into();
        self
    }

    pub fn with_summary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.summary_path = Some(path.into());
        self
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Builder method to configure output backups.
    pub fn with_backups(mut self, enabled: bool, max_backups: usize) -> Self {
        self.backup_output = enabled;
        self.max_backups = max_backups;
        self
    }

    pub fn with_progress_interval(mut self, interval: Option<Duration>) -> Self {
        self.progress_interval = interval;
        self
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn secs_to_duration(secs: f64, key: &str) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected a non-negative number of seconds, got {}", secs),
    })
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable holding (possibly fractional) seconds.
fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse_env_value(value, key)?;
    secs_to_duration(secs, key)
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
