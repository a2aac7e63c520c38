//! Configuration types for Scrooge.
//!
//! This module contains all configuration structures used throughout Scrooge:
//! engine policy, storage backend selection, consumer runtime settings and
//! logging.

use crate::error::{ScroogeError, ScroogeResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Main configuration for Scrooge.
///
/// # Examples
///
/// ```rust
/// use scrooge::config::{ConsumerConfig, ScroogeConfig, WorkerType};
///
/// // Use default configuration
/// let config = ScroogeConfig::default();
///
/// // Custom configuration
/// let config = ScroogeConfig {
///     name: "billing".to_string(),
///     consumer: ConsumerConfig::with_workers(4).with_worker_type(WorkerType::Greenlet),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScroogeConfig {
    /// Queue name, used to namespace storage keys
    pub name: String,

    /// Engine-level policy
    pub engine: EngineConfig,

    /// Storage backend configuration
    pub storage: StorageConfig,

    /// Consumer runtime configuration
    pub consumer: ConsumerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for ScroogeConfig {
    fn default() -> Self {
        Self {
            name: "scrooge".to_string(),
            engine: EngineConfig::default(),
            storage: StorageConfig::Memory,
            consumer: ConsumerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Engine policy shared by producers and consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Execute tasks synchronously at enqueue time instead of persisting them
    pub immediate: bool,

    /// Store task return values in the result store
    pub results: bool,

    /// Also store null return values
    pub store_none: bool,

    /// Evaluate periodic schedules against UTC instead of local time
    pub utc: bool,

    /// Time-to-live for stored results (None = keep until popped)
    pub result_expire_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            immediate: false,
            results: true,
            store_none: false,
            utc: true,
            result_expire_secs: None,
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// In-process storage (default)
    #[default]
    Memory,

    /// Discards everything
    BlackHole,

    /// Files in a local directory, shareable between processes on one host
    File(FileConfig),

    /// Redis storage
    #[cfg(feature = "redis-storage")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-storage")))]
    Redis(RedisConfig),

    /// SQLite storage
    #[cfg(feature = "sql-storage")]
    #[cfg_attr(docsrs, doc(cfg(feature = "sql-storage")))]
    Sql(SqlConfig),
}

impl StorageConfig {
    /// Create configuration for file storage rooted at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(FileConfig {
            path: path.into(),
            ..Default::default()
        })
    }

    /// Create configuration for Redis storage.
    #[cfg(feature = "redis-storage")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-storage")))]
    pub fn redis(connection_string: impl Into<String>) -> Self {
        Self::Redis(RedisConfig {
            connection_string: connection_string.into(),
            ..Default::default()
        })
    }

    /// Create configuration for SQLite storage.
    #[cfg(feature = "sql-storage")]
    #[cfg_attr(docsrs, doc(cfg(feature = "sql-storage")))]
    pub fn sql(database_url: impl Into<String>) -> Self {
        Self::Sql(SqlConfig {
            database_url: database_url.into(),
            ..Default::default()
        })
    }
}

/// File storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Directory holding every queue's files; each queue gets a subdirectory
    pub path: PathBuf,

    /// Seconds after which a leftover lock file is considered abandoned
    pub stale_lock_secs: u64,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scrooge-data"),
            stale_lock_secs: 30,
        }
    }
}

/// Redis storage configuration.
#[cfg(feature = "redis-storage")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-storage")))]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection string (e.g., "redis://localhost:6379")
    pub connection_string: String,

    /// Key prefix for Redis keys
    pub key_prefix: String,

    /// Timeout for establishing the connection (in seconds)
    pub connect_timeout_secs: u64,
}

#[cfg(feature = "redis-storage")]
impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            connection_string: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "scrooge".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

/// SQLite storage configuration.
#[cfg(feature = "sql-storage")]
#[cfg_attr(docsrs, doc(cfg(feature = "sql-storage")))]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    /// Database URL (e.g., "sqlite://scrooge.db?mode=rwc")
    pub database_url: String,

    /// Maximum pool connections
    pub max_connections: u32,
}

#[cfg(feature = "sql-storage")]
impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://scrooge.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

/// Worker execution model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    /// One OS thread per worker
    #[default]
    Thread,
    /// One child process per worker
    Process,
    /// Many cooperative workers sharing one thread
    Greenlet,
}

impl WorkerType {
    /// Name used on the command line and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::Thread => "thread",
            WorkerType::Process => "process",
            WorkerType::Greenlet => "greenlet",
        }
    }
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "thread" => Ok(WorkerType::Thread),
            "process" => Ok(WorkerType::Process),
            "greenlet" => Ok(WorkerType::Greenlet),
            other => Err(format!(
                "unknown worker type '{}' (expected thread, process or greenlet)",
                other
            )),
        }
    }
}

/// Consumer runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Number of workers
    pub workers: usize,

    /// Worker execution model
    pub worker_type: WorkerType,

    /// Delay after the first empty dequeue (in milliseconds)
    pub initial_delay_ms: u64,

    /// Multiplier applied to the delay after every further empty dequeue
    pub backoff: f64,

    /// Upper bound for the polling delay (in milliseconds)
    pub max_delay_ms: u64,

    /// Scheduler tick interval (in milliseconds)
    pub scheduler_interval_ms: u64,

    /// Enqueue periodic tasks
    pub periodic: bool,

    /// Periodically verify workers are alive
    pub check_worker_health: bool,

    /// Health check interval (in seconds)
    pub health_check_interval_secs: u64,

    /// Respawn workers found dead by the health check
    pub restart_dead_workers: bool,

    /// Time to wait for in-flight tasks on graceful shutdown (in seconds)
    pub shutdown_timeout_secs: u64,

    /// Delete every known lock at startup
    pub flush_locks: bool,

    /// Additional lock names to delete at startup
    pub extra_locks: Vec<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            worker_type: WorkerType::Thread,
            initial_delay_ms: 100,
            backoff: 1.15,
            max_delay_ms: 10_000,
            scheduler_interval_ms: 500,
            periodic: true,
            check_worker_health: true,
            health_check_interval_secs: 10,
            restart_dead_workers: true,
            shutdown_timeout_secs: 30,
            flush_locks: false,
            extra_locks: Vec::new(),
        }
    }
}

impl ConsumerConfig {
    /// Create a new consumer configuration with a specific number of workers.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    /// Set the worker execution model.
    pub fn with_worker_type(mut self, worker_type: WorkerType) -> Self {
        self.worker_type = worker_type;
        self
    }

    /// Set the polling backoff bounds.
    pub fn with_backoff(mut self, initial_delay_ms: u64, backoff: f64, max_delay_ms: u64) -> Self {
        self.initial_delay_ms = initial_delay_ms;
        self.backoff = backoff;
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Set the scheduler tick interval.
    pub fn with_scheduler_interval(mut self, interval_ms: u64) -> Self {
        self.scheduler_interval_ms = interval_ms;
        self
    }

    /// Enable or disable periodic tasks.
    pub fn with_periodic(mut self, enabled: bool) -> Self {
        self.periodic = enabled;
        self
    }

    /// Enable or disable the health check.
    pub fn with_health_check(mut self, enabled: bool) -> Self {
        self.check_worker_health = enabled;
        self
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout_secs: u64) -> Self {
        self.shutdown_timeout_secs = timeout_secs;
        self
    }

    /// Polling delay after the first empty dequeue.
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay_ms.millis()
    }

    /// Upper bound for the polling delay.
    pub fn max_delay(&self) -> Duration {
        self.max_delay_ms.millis()
    }

    /// Scheduler tick interval.
    pub fn scheduler_interval(&self) -> Duration {
        self.scheduler_interval_ms.millis()
    }

    /// Health check interval.
    pub fn health_check_interval(&self) -> Duration {
        self.health_check_interval_secs.secs()
    }

    /// Graceful shutdown bound.
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout_secs.secs()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include timestamps in logs
    pub include_timestamps: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_timestamps: true,
            include_targets: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
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

impl ScroogeConfig {
    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            consumer: ConsumerConfig {
                workers: 2,
                health_check_interval_secs: 5,
                shutdown_timeout_secs: 10,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: true,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a new configuration optimized for production.
    pub fn production() -> Self {
        Self {
            engine: EngineConfig {
                result_expire_secs: Some(86_400),
                ..Default::default()
            },
            consumer: ConsumerConfig {
                workers: num_cpus::get().max(1) * 2,
                max_delay_ms: 5_000,
                health_check_interval_secs: 30,
                shutdown_timeout_secs: 60,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                colored: false,
                include_timestamps: true,
                include_targets: false,
            },
            ..Default::default()
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            engine: EngineConfig {
                immediate: true,
                ..Default::default()
            },
            consumer: ConsumerConfig {
                workers: 1,
                initial_delay_ms: 10,
                max_delay_ms: 50,
                scheduler_interval_ms: 50,
                periodic: false,
                health_check_interval_secs: 1,
                shutdown_timeout_secs: 5,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_timestamps: false,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> ScroogeResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: ScroogeConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("Queue name must not be empty".to_string());
        }

        if let Err(consumer_errors) = self.consumer.validate() {
            errors.extend(consumer_errors);
        }

        if self.engine.result_expire_secs == Some(0) {
            errors.push("Result expiry must be greater than 0 when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate, folding every problem into a single configuration error.
    pub fn ensure_valid(&self) -> ScroogeResult<()> {
        self.validate()
            .map_err(|errors| ScroogeError::config(errors.join("; ")))
    }
}

impl ConsumerConfig {
    /// Validate the consumer section and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.workers == 0 {
            errors.push("Number of workers must be greater than 0".to_string());
        }

        if self.workers > 1000 {
            errors.push("Number of workers should not exceed 1000".to_string());
        }

        if self.backoff < 1.0 {
            errors.push("Backoff multiplier must be at least 1.0".to_string());
        }

        if self.max_delay_ms < self.initial_delay_ms {
            errors.push("Max delay must be greater than or equal to initial delay".to_string());
        }

        if self.scheduler_interval_ms == 0 {
            errors.push("Scheduler interval must be greater than 0".to_string());
        }

        if self.scheduler_interval_ms > 60_000 {
            errors.push("Scheduler interval must not exceed one minute".to_string());
        }

        if self.check_worker_health && self.health_check_interval_secs == 0 {
            errors.push("Health check interval must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
