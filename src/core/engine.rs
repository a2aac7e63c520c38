//! The consumer: runs workers, the scheduler and the health monitor for one
//! [`Scrooge`] instance.
//!
//! The consumer is responsible for coordinating all the moving parts:
//! - Worker pool management
//! - Scheduled and periodic task promotion
//! - Worker health monitoring and recovery
//! - Startup, shutdown and OS signal handling

use crate::config::{ConsumerConfig, WorkerType};
use crate::core::Scrooge;
use crate::core::scheduler::Scheduler;
use crate::core::worker::{
    ShutdownMode, WorkerCounters, WorkerPool, WorkerStats, run_worker_process,
};
use crate::error::{ScroogeError, ScroogeResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// Snapshot of a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Whether the consumer is running
    pub running: bool,
    /// Execution model
    pub worker_type: WorkerType,
    /// Configured worker count
    pub expected_workers: usize,
    /// Worker counters
    pub workers: WorkerStats,
    /// Time since start
    pub uptime: Option<Duration>,
}

struct RunningState {
    pool: Arc<Mutex<WorkerPool>>,
    scheduler: JoinHandle<()>,
    monitor: Option<JoinHandle<()>>,
    started_at: Instant,
}

/// Runs tasks for one [`Scrooge`] instance.
///
/// ```rust,no_run
/// use scrooge::prelude::*;
///
/// # async fn example() -> ScroogeResult<()> {
/// let scrooge = Scrooge::memory("jobs");
/// scrooge.task(TaskOptions::new("add"), |(a, b): (i64, i64)| async move {
///     Ok::<_, TaskError>(a + b)
/// })?;
///
/// let consumer = Consumer::new(scrooge, ConsumerConfig::with_workers(4));
/// consumer.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Consumer {
    scrooge: Scrooge,
    config: ConsumerConfig,
    shutdown_tx: watch::Sender<ShutdownMode>,
    counters: Arc<WorkerCounters>,
    state: Mutex<Option<RunningState>>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.scrooge.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Consumer {
    /// Create a consumer. Nothing runs until [`Consumer::start`].
    pub fn new(scrooge: Scrooge, config: ConsumerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(ShutdownMode::Running);
        Self {
            scrooge,
            config,
            shutdown_tx,
            counters: Arc::new(WorkerCounters::default()),
            state: Mutex::new(None),
        }
    }

    /// The instance whose tasks this consumer runs.
    pub fn scrooge(&self) -> &Scrooge {
        &self.scrooge
    }

    /// Consumer configuration.
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Whether [`Consumer::start`] succeeded and [`Consumer::stop`] has not
    /// been called since.
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Start workers, the scheduler and the health monitor.
    pub async fn start(&self) -> ScroogeResult<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(ScroogeError::AlreadyRunning);
        }

        self.config
            .validate()
            .map_err(|errors| ScroogeError::config(errors.join("; ")))?;
        if self.config.worker_type == WorkerType::Process
            && !self.scrooge.storage().shares_across_processes()
        {
            return Err(ScroogeError::config(format!(
                "process workers need storage shared across processes, '{}' is in-process",
                self.scrooge.storage().name()
            )));
        }

        tracing::info!(
            "🔨 Starting consumer for '{}' with {} {} workers",
            self.scrooge.name(),
            self.config.workers,
            self.config.worker_type
        );
        self.log_registered_tasks();

        if self.config.flush_locks {
            self.scrooge.flush_locks(&self.config.extra_locks).await?;
        }

        self.shutdown_tx.send_replace(ShutdownMode::Running);
        self.scrooge.hooks().run_startup();

        let mut pool = WorkerPool::new(
            self.scrooge.clone(),
            self.config.clone(),
            self.shutdown_tx.subscribe(),
            Arc::clone(&self.counters),
        );
        if let Err(e) = pool.spawn_all() {
            self.shutdown_tx.send_replace(ShutdownMode::Immediate);
            pool.stop(ShutdownMode::Immediate, self.config.shutdown_timeout())
                .await;
            return Err(e);
        }
        let pool = Arc::new(Mutex::new(pool));

        let scheduler = Scheduler::new(
            self.scrooge.clone(),
            self.config.scheduler_interval(),
            self.config.periodic,
        );
        let scheduler = tokio::spawn(scheduler.run(self.shutdown_tx.subscribe()));

        let monitor = self
            .config
            .check_worker_health
            .then(|| self.start_monitor(Arc::clone(&pool)));

        *state = Some(RunningState {
            pool,
            scheduler,
            monitor,
            started_at: Instant::now(),
        });

        tracing::info!("✅ Consumer started");
        Ok(())
    }

    fn log_registered_tasks(&self) {
        let registry = self.scrooge.registry();
        let mut names = registry.names();
        names.sort();
        tracing::info!("Registered tasks: {}", names.join(", "));
        for task in registry.periodic() {
            tracing::debug!("Periodic task {} registered", task.options.name);
        }
    }

    fn start_monitor(&self, pool: Arc<Mutex<WorkerPool>>) -> JoinHandle<()> {
        let every = self.config.health_check_interval();
        let restart = self.config.restart_dead_workers;
        let expected = self.config.workers;
        let scrooge = self.scrooge.clone();

        tokio::spawn(async move {
            tracing::info!("Health monitor started");
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; workers were just spawned.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let (dead, stats) = {
                    let mut pool = pool.lock().await;
                    let dead = pool.check_health(restart);
                    (dead, pool.stats())
                };

                let status = if stats.active_workers == expected {
                    "HEALTHY"
                } else if stats.active_workers > 0 {
                    "DEGRADED"
                } else {
                    "CRITICAL"
                };

                let pending = scrooge.pending_count().await.unwrap_or_default();
                let scheduled = scrooge.scheduled_count().await.unwrap_or_default();
                tracing::debug!(
                    "HEALTH CHECK - Status: {} | Workers: {}/{} | Dead: {} | Pending: {} | Scheduled: {}",
                    status,
                    stats.active_workers,
                    expected,
                    dead,
                    pending,
                    scheduled
                );

                if stats.active_workers == 0 {
                    tracing::error!("CRITICAL: All workers are dead!");
                }
                if let Err(e) = scrooge.health_check().await {
                    tracing::warn!("Storage health check failed: {}", e);
                }
            }
        })
    }

    /// Stop the consumer.
    ///
    /// Graceful: workers finish their current task, bounded by the
    /// configured shutdown timeout. Otherwise in-flight tasks are dropped and
    /// reported through [`crate::signals::Signal::Interrupted`].
    pub async fn stop(&self, graceful: bool) -> ScroogeResult<()> {
        let Some(running) = self.state.lock().await.take() else {
            return Err(ScroogeError::NotRunning);
        };

        let mode = if graceful {
            ShutdownMode::Graceful
        } else {
            ShutdownMode::Immediate
        };
        tracing::info!("🔨 Shutting down consumer ({:?})...", mode);
        self.shutdown_tx.send_replace(mode);

        if let Some(monitor) = running.monitor {
            monitor.abort();
        }
        if let Err(e) = running.scheduler.await {
            tracing::error!("Scheduler ended abnormally: {}", e);
        }

        let stragglers = running
            .pool
            .lock()
            .await
            .stop(mode, self.config.shutdown_timeout())
            .await;
        if stragglers > 0 {
            tracing::warn!("{} workers were still busy at shutdown", stragglers);
        }

        self.scrooge.hooks().run_shutdown();
        tracing::info!(
            "✅ Consumer stopped after {:?}",
            running.started_at.elapsed()
        );
        Ok(())
    }

    /// Start, wait for SIGINT (graceful) or SIGTERM (immediate), then stop.
    pub async fn run(&self) -> ScroogeResult<()> {
        self.start().await?;
        let graceful = wait_for_shutdown_signal().await;
        self.stop(graceful).await
    }

    /// Body of a process worker spawned by a consumer in another process.
    /// Runs a single worker until stdin closes.
    pub async fn run_as_worker(&self, worker_id: usize) -> ScroogeResult<()> {
        run_worker_process(self.scrooge.clone(), &self.config, worker_id).await
    }

    /// Current statistics.
    pub async fn stats(&self) -> ConsumerStats {
        let state = self.state.lock().await;
        let (workers, uptime) = match state.as_ref() {
            Some(running) => (
                running.pool.lock().await.stats(),
                Some(running.started_at.elapsed()),
            ),
            None => (self.counters.snapshot(0), None),
        };
        ConsumerStats {
            running: state.is_some(),
            worker_type: self.config.worker_type,
            expected_workers: self.config.workers,
            workers,
            uptime,
        }
    }
}

/// Wait for an OS shutdown request. Returns whether to stop gracefully.
async fn wait_for_shutdown_signal() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return true;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown...");
                true
            }
            _ = terminate.recv() => {
                tracing::info!("Received SIGTERM, shutting down immediately...");
                false
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::signals::{Signal, SignalEvent};
    use crate::task::{ScheduleOptions, TaskOptions};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config(worker_type: WorkerType) -> ConsumerConfig {
        ConsumerConfig::with_workers(2)
            .with_worker_type(worker_type)
            .with_backoff(5, 1.5, 20)
            .with_scheduler_interval(20)
            .with_shutdown_timeout(2)
    }

    async fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
        for _ in 0..300 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_consumer_lifecycle() {
        for worker_type in [WorkerType::Thread, WorkerType::Greenlet] {
            let scrooge = Scrooge::memory("consumer-test");
            let started = Arc::new(AtomicUsize::new(0));
            let stopped = Arc::new(AtomicUsize::new(0));
            let s = Arc::clone(&started);
            let t = Arc::clone(&stopped);
            scrooge.on_startup("count", move || {
                s.fetch_add(1, Ordering::SeqCst);
            });
            scrooge.on_shutdown("count", move || {
                t.fetch_add(1, Ordering::SeqCst);
            });

            let add = scrooge
                .task(TaskOptions::new("add"), |(a, b): (i64, i64)| async move {
                    Ok::<_, TaskError>(a + b)
                })
                .unwrap();

            let consumer = Consumer::new(scrooge.clone(), test_config(worker_type));
            consumer.start().await.unwrap();
            assert!(consumer.is_running().await);
            assert!(matches!(
                consumer.start().await,
                Err(ScroogeError::AlreadyRunning)
            ));

            let handle = add.call((2, 3)).await.unwrap();
            assert_eq!(
                handle.get_blocking(Some(Duration::from_secs(3))).await.unwrap(),
                5
            );

            let stats = consumer.stats().await;
            assert!(stats.running);
            assert_eq!(stats.expected_workers, 2);
            assert_eq!(stats.workers.active_workers, 2);

            consumer.stop(true).await.unwrap();
            assert!(!consumer.is_running().await);
            assert!(matches!(
                consumer.stop(true).await,
                Err(ScroogeError::NotRunning)
            ));
            assert_eq!(started.load(Ordering::SeqCst), 1);
            assert_eq!(stopped.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_scheduled_task_runs_when_due() {
        let scrooge = Scrooge::memory("consumer-test");
        let echo = scrooge
            .task(TaskOptions::new("echo"), |n: i64| async move { Ok::<_, TaskError>(n) })
            .unwrap();

        let consumer = Consumer::new(scrooge.clone(), test_config(WorkerType::Greenlet));
        consumer.start().await.unwrap();

        let handle = echo
            .schedule(7, ScheduleOptions::delay(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(scrooge.scheduled_count().await.unwrap(), 1);
        assert_eq!(
            handle.get_blocking(Some(Duration::from_secs(3))).await.unwrap(),
            7
        );

        consumer.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_immediate_stop_interrupts_running_task() {
        let scrooge = Scrooge::memory("consumer-test");
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        scrooge.signal(&[Signal::Executing, Signal::Interrupted], move |event: &SignalEvent<'_>| {
            sink.lock().unwrap().push(event.signal)
        });
        let slow = scrooge
            .task(TaskOptions::new("slow"), |_: ()| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, TaskError>(())
            })
            .unwrap();
        slow.call(()).await.unwrap();

        let consumer = Consumer::new(scrooge.clone(), test_config(WorkerType::Thread));
        consumer.start().await.unwrap();
        assert!(wait_until(|| seen.lock().unwrap().contains(&Signal::Executing)).await);

        let began = Instant::now();
        consumer.stop(false).await.unwrap();
        assert!(began.elapsed() < Duration::from_secs(2));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Signal::Executing, Signal::Interrupted]
        );
        assert_eq!(consumer.stats().await.workers.tasks_interrupted, 1);
    }

    #[tokio::test]
    async fn test_graceful_stop_finishes_running_task() {
        for worker_type in [WorkerType::Thread, WorkerType::Greenlet] {
            let scrooge = Scrooge::memory("consumer-test");
            let executing = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&executing);
            scrooge.signal(&[Signal::Executing], move |_: &SignalEvent<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            let slow = scrooge
                .task(TaskOptions::new("slow"), |n: i64| async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok::<_, TaskError>(n)
                })
                .unwrap();
            let handle = slow.call(11).await.unwrap();

            let consumer = Consumer::new(scrooge.clone(), test_config(worker_type));
            consumer.start().await.unwrap();
            assert!(wait_until(|| executing.load(Ordering::SeqCst) == 1).await);

            consumer.stop(true).await.unwrap();
            assert_eq!(handle.get().await.unwrap(), Some(11));
            assert_eq!(consumer.stats().await.workers.tasks_interrupted, 0);
        }
    }

    #[tokio::test]
    async fn test_process_workers_need_shared_storage() {
        let scrooge = Scrooge::memory("consumer-test");
        let consumer = Consumer::new(scrooge, test_config(WorkerType::Process));
        let err = consumer.start().await.unwrap_err();
        assert!(matches!(err, ScroogeError::Config { .. }));
        assert!(!consumer.is_running().await);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let scrooge = Scrooge::memory("consumer-test");
        let consumer = Consumer::new(scrooge, ConsumerConfig::with_workers(0));
        assert!(matches!(
            consumer.start().await,
            Err(ScroogeError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_flush_locks_at_startup() {
        let scrooge = Scrooge::memory("consumer-test");
        let lock = scrooge.lock_task("reports");
        let guard = lock.acquire().await.unwrap().unwrap();
        std::mem::forget(guard);
        assert!(lock.is_locked().await.unwrap());

        let mut config = test_config(WorkerType::Greenlet);
        config.flush_locks = true;
        let consumer = Consumer::new(scrooge, config);
        consumer.start().await.unwrap();
        assert!(!lock.is_locked().await.unwrap());
        consumer.stop(true).await.unwrap();
    }
}
