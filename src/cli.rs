//! Command-line surface of a consumer process.
//!
//! [`ConsumerArgs`] parses the consumer flags and folds them into a
//! [`ScroogeConfig`]; [`run_consumer`] runs a consumer until it is told to
//! stop and maps the outcome to a process exit code.

use crate::config::{LogLevel, ScroogeConfig, WorkerType};
use crate::core::{Consumer, Scrooge, worker};
use crate::error::ScroogeResult;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

/// Run a Scrooge consumer.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "scrooge_consumer")]
#[command(about = "Run a Scrooge consumer: workers, scheduler and health monitor")]
#[command(version)]
pub struct ConsumerArgs {
    /// JSON configuration file; flags override its values.
    #[arg(long, env = "SCROOGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of workers.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Worker model: thread, process or greenlet.
    #[arg(short = 'k', long = "worker-type")]
    pub worker_type: Option<WorkerType>,

    /// Do not enqueue periodic tasks.
    #[arg(short = 'n', long = "no-periodic")]
    pub no_periodic: bool,

    /// Seconds to wait after the first empty dequeue.
    #[arg(short = 'd', long)]
    pub delay: Option<f64>,

    /// Upper bound, in seconds, for the polling delay.
    #[arg(short = 'm', long = "max-delay")]
    pub max_delay: Option<f64>,

    /// Multiplier applied to the polling delay after every empty dequeue.
    #[arg(short = 'b', long)]
    pub backoff: Option<f64>,

    /// Scheduler tick interval, in seconds.
    #[arg(short = 's', long = "scheduler-interval")]
    pub scheduler_interval: Option<f64>,

    /// Seconds between worker health checks.
    #[arg(short = 'c', long = "health-check-interval")]
    pub health_check_interval: Option<u64>,

    /// Do not monitor worker health.
    #[arg(short = 'C', long = "disable-health-check")]
    pub disable_health_check: bool,

    /// Delete known locks at startup.
    #[arg(short = 'f', long = "flush-locks")]
    pub flush_locks: bool,

    /// Additional lock names to delete at startup, comma separated.
    #[arg(short = 'L', long = "extra-locks", value_delimiter = ',')]
    pub extra_locks: Vec<String>,

    /// Evaluate periodic schedules in UTC.
    #[arg(short = 'u', long, conflicts_with = "localtime")]
    pub utc: bool,

    /// Evaluate periodic schedules in local time.
    #[arg(long)]
    pub localtime: bool,

    /// Log debug output.
    #[arg(short = 'v', long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log warnings and errors.
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Log as JSON.
    #[arg(long)]
    pub json: bool,
}

fn seconds_to_ms(seconds: f64) -> u64 {
    (seconds.max(0.0) * 1000.0).round() as u64
}

impl ConsumerArgs {
    /// Build the effective configuration: the config file (or defaults),
    /// then the flags on top.
    pub fn load_config(&self) -> ScroogeResult<ScroogeConfig> {
        let mut config = match &self.config {
            Some(path) => ScroogeConfig::from_json_file(path)?,
            None => ScroogeConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    /// Apply the flags that were given to `config`.
    pub fn apply(&self, config: &mut ScroogeConfig) {
        let consumer = &mut config.consumer;
        if let Some(workers) = self.workers {
            consumer.workers = workers;
        }
        if let Some(worker_type) = self.worker_type {
            consumer.worker_type = worker_type;
        }
        if self.no_periodic {
            consumer.periodic = false;
        }
        if let Some(delay) = self.delay {
            consumer.initial_delay_ms = seconds_to_ms(delay);
        }
        if let Some(max_delay) = self.max_delay {
            consumer.max_delay_ms = seconds_to_ms(max_delay);
        }
        if let Some(backoff) = self.backoff {
            consumer.backoff = backoff;
        }
        if let Some(interval) = self.scheduler_interval {
            consumer.scheduler_interval_ms = seconds_to_ms(interval);
        }
        if let Some(interval) = self.health_check_interval {
            consumer.health_check_interval_secs = interval;
        }
        if self.disable_health_check {
            consumer.check_worker_health = false;
        }
        if self.flush_locks {
            consumer.flush_locks = true;
        }
        if !self.extra_locks.is_empty() {
            consumer.extra_locks.extend(
                self.extra_locks
                    .iter()
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty()),
            );
            // Extra locks imply flushing.
            consumer.flush_locks = true;
        }

        if self.utc {
            config.engine.utc = true;
        } else if self.localtime {
            config.engine.utc = false;
        }

        if self.verbose {
            config.logging.level = LogLevel::Debug;
        } else if self.quiet {
            config.logging.level = LogLevel::Warn;
        }
        if self.json {
            config.logging.json_format = true;
        }
    }
}

/// Run a consumer for `scrooge` until SIGINT or SIGTERM.
///
/// Inside a process spawned as a process worker this runs that single
/// worker instead. Returns success on a clean shutdown and failure when the
/// consumer could not start.
pub async fn run_consumer(scrooge: Scrooge, config: &ScroogeConfig) -> ExitCode {
    if let Err(errors) = config.validate() {
        for e in errors {
            error!("Invalid configuration: {}", e);
        }
        return ExitCode::FAILURE;
    }

    let consumer = Consumer::new(scrooge, config.consumer.clone());
    let outcome = match worker::worker_id_from_env() {
        Some(worker_id) => consumer.run_as_worker(worker_id).await,
        None => {
            info!(
                "🔧 Queue '{}' on {} storage, {} periodic schedules in {}",
                config.name,
                consumer.scrooge().storage().name(),
                if config.consumer.periodic { "with" } else { "without" },
                if config.engine.utc { "UTC" } else { "local time" }
            );
            consumer.run().await
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Consumer failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerConfig;

    fn parse(args: &[&str]) -> ConsumerArgs {
        ConsumerArgs::try_parse_from(std::iter::once("scrooge_consumer").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = parse(&[
            "-w", "4", "-k", "greenlet", "-n", "-d", "0.25", "-m", "2", "-b", "2.0", "-s", "0.5",
            "-C", "--localtime", "-v",
        ]);
        let config = args.load_config().unwrap();

        assert_eq!(config.consumer.workers, 4);
        assert_eq!(config.consumer.worker_type, WorkerType::Greenlet);
        assert!(!config.consumer.periodic);
        assert_eq!(config.consumer.initial_delay_ms, 250);
        assert_eq!(config.consumer.max_delay_ms, 2_000);
        assert_eq!(config.consumer.backoff, 2.0);
        assert_eq!(config.consumer.scheduler_interval_ms, 500);
        assert!(!config.consumer.check_worker_health);
        assert!(!config.engine.utc);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_no_flags_keep_config() {
        let mut config = ScroogeConfig {
            consumer: ConsumerConfig::with_workers(3),
            ..Default::default()
        };
        parse(&[]).apply(&mut config);
        assert_eq!(config.consumer.workers, 3);
        assert!(config.consumer.periodic);
        assert!(config.engine.utc);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_extra_locks_imply_flush() {
        let config = parse(&["-L", "reports, billing"]).load_config().unwrap();
        assert!(config.consumer.flush_locks);
        assert_eq!(config.consumer.extra_locks, vec!["reports", "billing"]);
    }

    #[test]
    fn test_conflicting_flags_rejected() {
        let from = |args: &[&str]| {
            ConsumerArgs::try_parse_from(std::iter::once("scrooge_consumer").chain(args.iter().copied()))
        };
        assert!(from(&["--utc", "--localtime"]).is_err());
        assert!(from(&["-v", "-q"]).is_err());
        assert!(from(&["-k", "fiber"]).is_err());
    }

    #[test]
    fn test_config_file_then_flags() {
        let path = std::env::temp_dir().join(format!("scrooge-cli-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"name": "mail", "consumer": {"workers": 6}}"#).unwrap();

        let path_arg = path.to_string_lossy().to_string();
        let config = parse(&["--config", &path_arg, "-q"]).load_config().unwrap();
        assert_eq!(config.name, "mail");
        assert_eq!(config.consumer.workers, 6);
        assert_eq!(config.logging.level, LogLevel::Warn);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_invalid_config_exits_with_failure() {
        let mut config = ScroogeConfig::default();
        config.consumer.workers = 0;
        let code = run_consumer(Scrooge::memory("cli-test"), &config).await;
        assert_eq!(code, ExitCode::FAILURE);
    }
}
