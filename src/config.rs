//! Configuration types for taskrelay.
//!
//! This module contains the configuration surfaces of the worker, the
//! scheduler and the client, together with the broker connection settings
//! they share. Every struct deserializes with defaults for missing fields, so
//! a host application can load them from whatever format it prefers.

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::level_filters::LevelFilter;

/// Worker configuration.
///
/// # Examples
///
/// ```rust
/// use taskrelay::config::{BrokerConfig, WorkerConfig};
///
/// let config = WorkerConfig {
///     concurrency: 4,
///     strict_priority: true,
///     broker: BrokerConfig::InMemory,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum number of tasks inside a handler at the same time
    pub concurrency: usize,

    /// Serve lower queues only when higher ones are empty
    pub strict_priority: bool,

    /// Time to wait for in-flight tasks on shutdown (in seconds)
    pub shutdown_timeout_secs: u64,

    /// Interval between broker health checks (in seconds)
    pub health_check_interval_secs: u64,

    /// Interval between promotions of due scheduled and retry tasks (in seconds)
    pub delayed_task_check_interval_secs: u64,

    /// Grace period before a task group is flushed (in seconds)
    pub group_grace_period_secs: u64,

    /// Maximum delay before a task group is flushed (in seconds)
    pub group_max_delay_secs: u64,

    /// Maximum number of tasks in one group (0 = unlimited)
    pub group_max_size: usize,

    /// Log level: debug, info, warn or error (empty = info)
    pub log_level: String,

    /// Broker connection
    pub broker: BrokerConfig,

    /// Prometheus endpoint
    pub metrics: MetricsConfig,

    /// Default retry policy for tasks that do not set their own budget
    pub retry: RetryPolicy,

    /// Sleep between lease attempts when every queue is empty (in milliseconds)
    pub poll_interval_ms: u64,

    /// Delay before a rate-limited task becomes visible again (in milliseconds)
    pub rate_limit_backoff_ms: u64,

    /// Interval between sweeps of expired terminal tasks (in seconds)
    pub janitor_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().max(1),
            strict_priority: false,
            shutdown_timeout_secs: 8,
            health_check_interval_secs: 15,
            delayed_task_check_interval_secs: 5,
            group_grace_period_secs: 60,
            group_max_delay_secs: 0,
            group_max_size: 0,
            log_level: String::new(),
            broker: BrokerConfig::default(),
            metrics: MetricsConfig::default(),
            retry: RetryPolicy::default(),
            poll_interval_ms: 1000,
            rate_limit_backoff_ms: 500,
            janitor_interval_secs: 8,
        }
    }
}

impl WorkerConfig {
    /// Create a worker configuration with a specific concurrency.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Set the broker connection.
    pub fn with_broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = broker;
        self
    }

    /// Enable or disable strict priority.
    pub fn with_strict_priority(mut self, strict: bool) -> Self {
        self.strict_priority = strict;
        self
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout_secs: u64) -> Self {
        self.shutdown_timeout_secs = timeout_secs;
        self
    }

    /// Set the log level.
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Set the default retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Create a configuration for local development.
    pub fn development() -> Self {
        Self {
            concurrency: 2,
            health_check_interval_secs: 10,
            delayed_task_check_interval_secs: 1,
            log_level: "debug".to_string(),
            poll_interval_ms: 200,
            ..Default::default()
        }
    }

    /// Create a configuration for tests: tight intervals, no metrics listener.
    pub fn testing() -> Self {
        Self {
            concurrency: 1,
            shutdown_timeout_secs: 2,
            health_check_interval_secs: 1,
            delayed_task_check_interval_secs: 1,
            log_level: "debug".to_string(),
            broker: BrokerConfig::InMemory,
            metrics: MetricsConfig {
                enabled: false,
                ..Default::default()
            },
            retry: RetryPolicy::fixed(3, 10),
            poll_interval_ms: 10,
            rate_limit_backoff_ms: 50,
            janitor_interval_secs: 1,
            ..Default::default()
        }
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.concurrency == 0 {
            errors.push("Concurrency must be greater than 0".to_string());
        }

        if self.health_check_interval_secs == 0 {
            errors.push("Health check interval must be greater than 0".to_string());
        }

        if self.delayed_task_check_interval_secs == 0 {
            errors.push("Delayed task check interval must be greater than 0".to_string());
        }

        if self.janitor_interval_secs == 0 {
            errors.push("Janitor interval must be greater than 0".to_string());
        }

        if self.group_max_delay_secs > 0 && self.group_grace_period_secs > self.group_max_delay_secs
        {
            errors.push("Group grace period must not exceed group max delay".to_string());
        }

        if let Err(e) = LogLevel::parse(&self.log_level) {
            errors.push(e.to_string());
        }

        errors.extend(self.broker.validate());
        errors.extend(self.metrics.validate());
        errors.extend(self.retry.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Shutdown timeout as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout_secs.secs()
    }
}

/// Scheduler configuration: the broker connection plus a log level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Broker connection
    pub broker: BrokerConfig,

    /// Log level: debug, info, warn or error (empty = info)
    pub log_level: String,
}

impl SchedulerConfig {
    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = self.broker.validate();
        if let Err(e) = LogLevel::parse(&self.log_level) {
            errors.push(e.to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker connection
    pub broker: BrokerConfig,

    /// Sleep between task-info polls while pinging (in milliseconds)
    pub ping_poll_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            ping_poll_interval_ms: 10,
        }
    }
}

impl ClientConfig {
    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let errors = self.broker.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Broker backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BrokerConfig {
    /// Process-local broker (default)
    #[default]
    InMemory,

    /// Redis-backed broker
    Redis(RedisConfig),
}

impl BrokerConfig {
    /// Create a Redis broker configuration for the given address.
    pub fn redis(address: impl Into<String>) -> Self {
        Self::Redis(RedisConfig {
            address: address.into(),
            ..Default::default()
        })
    }

    fn validate(&self) -> Vec<String> {
        match self {
            Self::InMemory => Vec::new(),
            Self::Redis(redis) => redis.validate(),
        }
    }
}

/// Redis connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// `host:port` of the Redis server
    pub address: String,

    /// ACL username
    pub username: Option<String>,

    /// Password
    pub password: Option<String>,

    /// Database number
    pub database: i64,

    /// Connect timeout (in seconds)
    pub dial_timeout_secs: u64,

    /// Read timeout (in seconds)
    pub read_timeout_secs: u64,

    /// Write timeout (in seconds)
    pub write_timeout_secs: u64,

    /// Number of pooled connections
    pub pool_size: usize,

    /// Prefix for every key the broker writes
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6379".to_string(),
            username: None,
            password: None,
            database: 0,
            dial_timeout_secs: 5,
            read_timeout_secs: 3,
            write_timeout_secs: 3,
            pool_size: 10,
            key_prefix: "taskrelay".to_string(),
        }
    }
}

impl RedisConfig {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.address.trim().is_empty() {
            errors.push("Redis address must not be empty".to_string());
        }
        if self.pool_size == 0 {
            errors.push("Redis pool size must be greater than 0".to_string());
        }
        if self.database < 0 {
            errors.push("Redis database must not be negative".to_string());
        }
        errors
    }
}

/// Prometheus endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve the metrics endpoint while the worker runs
    pub enabled: bool,

    /// Listen address of the metrics router
    pub listen_addr: String,

    /// Route of the scrape endpoint
    pub path: String,

    /// CORS policy applied to the metrics router
    pub cors: CorsConfig,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:9090".to_string(),
            path: "/metrics/".to_string(),
            cors: CorsConfig::default(),
        }
    }
}

impl MetricsConfig {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.enabled {
            if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
                errors.push(format!(
                    "Metrics listen address '{}' is not a socket address",
                    self.listen_addr
                ));
            }
            if !self.path.starts_with('/') {
                errors.push("Metrics path must start with '/'".to_string());
            }
        }
        errors
    }
}

/// CORS policy for the metrics router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Apply the CORS layer at all
    pub enabled: bool,

    /// Allowed origins; a single `*` allows any origin
    pub allowed_origins: Vec<String>,

    /// Allowed methods; `*` allows any method
    pub allowed_methods: Vec<String>,

    /// Allowed request headers; `*` allows any header
    pub allowed_headers: Vec<String>,

    /// Allow credentials; ignored when any list is `*`
    pub allow_credentials: bool,

    /// Preflight cache duration (in seconds)
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_origins: Vec::new(),
            allowed_methods: vec!["GET".to_string(), "OPTIONS".to_string()],
            allowed_headers: Vec::new(),
            allow_credentials: false,
            max_age_secs: 600,
        }
    }
}

/// Retry policy for failed attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_attempts: u32,

    /// Base delay between retries (in milliseconds)
    pub base_delay_ms: u64,

    /// Maximum delay between retries (in milliseconds)
    pub max_delay_ms: u64,

    /// Backoff strategy
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            base_delay_ms: 1000,
            max_delay_ms: 600_000,
            backoff_strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy with exponential backoff.
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
            ..Default::default()
        }
    }

    /// Create a retry policy with linear backoff.
    pub fn linear(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_strategy: BackoffStrategy::Linear { increment_ms: 1000 },
            ..Default::default()
        }
    }

    /// Create a retry policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_strategy: BackoffStrategy::Fixed,
        }
    }

    /// Disable retries completely.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let step = attempt.saturating_sub(1);
        let raw_ms = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay_ms as f64,
            BackoffStrategy::Linear { increment_ms } => {
                self.base_delay_ms as f64 + f64::from(step) * increment_ms as f64
            }
            BackoffStrategy::Exponential { multiplier } => {
                self.base_delay_ms as f64 * multiplier.powi(step.min(64) as i32)
            }
        };
        let capped = raw_ms.min(self.max_delay_ms as f64).max(0.0);
        (capped as u64).millis()
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_delay_ms < self.base_delay_ms {
            errors.push("Retry max delay must be greater than or equal to base delay".to_string());
        }
        if let BackoffStrategy::Exponential { multiplier } = self.backoff_strategy {
            if multiplier < 1.0 {
                errors.push("Exponential backoff multiplier must be at least 1.0".to_string());
            }
        }
        errors
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,

    /// Linear backoff (base + attempt * increment)
    Linear {
        /// Increment per attempt (in milliseconds)
        increment_ms: u64,
    },

    /// Exponential backoff (base * multiplier^attempt)
    Exponential {
        /// Multiplier for exponential growth
        multiplier: f64,
    },
}

/// Logging configuration for [`crate::telemetry::init_tracing`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level string, parsed with [`LogLevel::parse`]
    pub level: String,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::new(),
            json_format: false,
            colored: true,
            include_targets: false,
        }
    }
}

/// Log level accepted by the worker and scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Parse a configured level; empty means info.
    pub fn parse(level: &str) -> RelayResult<Self> {
        match level.trim().to_ascii_lowercase().as_str() {
            "" | "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(RelayError::InvalidLogLevel {
                level: level.to_string(),
            }),
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Helper trait for converting durations in configuration.
pub trait DurationExt {
    /// Convert seconds to Duration
    fn secs(self) -> Duration;
    /// Convert milliseconds to Duration
    fn millis(self) -> Duration;
}

impl DurationExt for u64 {
    fn secs(self) -> Duration {
        Duration::from_secs(self)
    }

    fn millis(self) -> Duration {
        Duration::from_millis(self)
    }
}

/// Join validation messages into a single configuration error.
pub(crate) fn validation_error(errors: Vec<String>) -> RelayError {
    RelayError::config(errors.join("; "))
}
