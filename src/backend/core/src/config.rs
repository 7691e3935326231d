//! Configuration management.
//!
//! Sources are layered: an optional file, then `JOBFORGE_`-prefixed environment
//! variables with `__` between nested keys (`JOBFORGE_QUEUE__WORKERS=8`).

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{JobforgeError, Result};
use crate::jobs::{JobConfig, JobPriority};
use crate::telemetry::{LoggingConfig, MetricsConfig, TelemetryConfig};

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "JOBFORGE_CONFIG";

const ENV_PREFIX: &str = "JOBFORGE";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Queue runtime settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Job policy applied when a caller does not pass one
    #[serde(default)]
    pub defaults: JobDefaults,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Settings for one [`JobQueue`](crate::jobs::JobQueue).
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Queue name, used as a log field and metrics label
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Number of worker tasks
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Scheduler tick period
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Longest a worker waits before polling again when nothing is pending
    #[serde(default = "default_idle_interval", with = "humantime_serde")]
    pub idle_interval: Duration,

    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            workers: default_workers(),
            tick_interval: default_tick_interval(),
            idle_interval: default_idle_interval(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl QueueConfig {
    /// Set the queue name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the scheduler tick period.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the idle poll period.
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    /// Set the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(JobforgeError::configuration("queue.workers must be at least 1"));
        }
        if self.tick_interval.is_zero() {
            return Err(JobforgeError::configuration("queue.tick_interval must be non-zero"));
        }
        if self.idle_interval.is_zero() {
            return Err(JobforgeError::configuration("queue.idle_interval must be non-zero"));
        }
        if self.event_capacity == 0 {
            return Err(JobforgeError::configuration("queue.event_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Default job policy.
#[derive(Debug, Clone, Deserialize)]
pub struct JobDefaults {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,

    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default)]
    pub priority: JobPriority,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            timeout: default_timeout(),
            priority: JobPriority::default(),
        }
    }
}

impl JobDefaults {
    /// Build the per-job config these defaults describe.
    pub fn to_job_config(&self) -> JobConfig {
        JobConfig::default()
            .with_max_retries(self.max_retries)
            .with_retry_delay(self.retry_delay)
            .with_timeout(self.timeout)
            .with_priority(self.priority)
    }
}

// Default value functions
fn default_queue_name() -> String { "default".to_string() }
fn default_workers() -> usize { 4 }
fn default_tick_interval() -> Duration { Duration::from_millis(100) }
fn default_idle_interval() -> Duration { Duration::from_millis(100) }
fn default_event_capacity() -> usize { 1024 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_delay() -> Duration { Duration::from_secs(1) }
fn default_timeout() -> Duration { Duration::from_secs(30) }

impl Config {
    /// Load configuration from `JOBFORGE_CONFIG` (if set) and the environment.
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path),
            Err(_) => Self::build(None, environment()),
        }
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(Some(path.as_ref()), environment())
    }

    fn build(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let cfg: Config = builder.add_source(env).build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the queue cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        self.defaults.to_job_config().validate()?;
        Ok(())
    }

    /// Telemetry settings for this process.
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: format!("jobforge-{}", self.queue.name),
            logging: self.logging.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::io::Write;

    fn env_from(pairs: &[(&str, &str)]) -> config::Environment {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        environment().source(Some(map))
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.queue.workers, 4);
        assert_eq!(config.queue.tick_interval, Duration::from_millis(100));
        assert_eq!(config.queue.idle_interval, Duration::from_millis(100));
        assert_eq!(config.queue.event_capacity, 1024);
        assert!(config.validate().is_ok());

        let job = config.defaults.to_job_config();
        assert_eq!(job, JobConfig::default());
    }

    #[test]
    fn test_environment_overrides() {
        let env = env_from(&[
            ("JOBFORGE_QUEUE__WORKERS", "8"),
            ("JOBFORGE_QUEUE__TICK_INTERVAL", "250ms"),
            ("JOBFORGE_DEFAULTS__PRIORITY", "high"),
        ]);
        let config = Config::build(None, env).unwrap();
        assert_eq!(config.queue.workers, 8);
        assert_eq!(config.queue.tick_interval, Duration::from_millis(250));
        assert_eq!(config.defaults.priority, JobPriority::High);
    }

    #[test]
    fn test_file_then_environment() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[queue]
name = "mail"
workers = 2
idle_interval = "50ms"

[defaults]
max_retries = 0
timeout = "5s"
"#
        )
        .unwrap();

        let env = env_from(&[("JOBFORGE_QUEUE__WORKERS", "6")]);
        let config = Config::build(Some(file.path()), env).unwrap();
        assert_eq!(config.queue.name, "mail");
        assert_eq!(config.queue.workers, 6);
        assert_eq!(config.queue.idle_interval, Duration::from_millis(50));
        assert_eq!(config.defaults.max_retries, 0);
        assert_eq!(config.defaults.to_job_config().timeout_ms, 5000);
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let env = env_from(&[("JOBFORGE_QUEUE__WORKERS", "0")]);
        let err = Config::build(None, env).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let mut config = Config::default();
        config.defaults.timeout = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);

        let queue = QueueConfig::default().with_event_capacity(0);
        assert!(queue.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        let err = Config::from_file("/nonexistent/jobforge.toml").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }
}
