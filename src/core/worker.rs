//! Workers and the pool that runs them.
//!
//! A worker pulls tasks from storage and executes them until told to stop.
//! The pool hosts workers in one of three execution models: a thread per
//! worker, a child process per worker, or every worker cooperatively on a
//! single thread ("greenlets").

use crate::config::{ConsumerConfig, WorkerType};
use crate::core::Scrooge;
use crate::error::{ScroogeError, ScroogeResult};
use crate::signals::{Signal, SignalEvent};
use crate::task::Task;
use crate::utils::calculate_backoff;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep, timeout_at};

/// Environment variable that marks a child process as worker number N.
pub const WORKER_ID_ENV: &str = "SCROOGE_WORKER_ID";

/// What workers should be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Keep pulling tasks
    Running,
    /// Finish the current task, then stop
    Graceful,
    /// Drop the current task and stop now
    Immediate,
}

/// Counters shared by every worker of a pool.
#[derive(Debug, Default)]
pub(crate) struct WorkerCounters {
    spawned: AtomicU64,
    restarts: AtomicU64,
    processed: AtomicU64,
    completed: AtomicU64,
    engine_errors: AtomicU64,
    storage_errors: AtomicU64,
    interrupted: AtomicU64,
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Workers currently alive
    pub active_workers: usize,
    /// Workers spawned since start, restarts included
    pub total_workers: u64,
    /// Workers respawned by the health check
    pub worker_restarts: u64,
    /// Tasks taken off the queue
    pub tasks_processed: u64,
    /// Tasks whose body returned a value
    pub tasks_completed: u64,
    /// Executions that failed inside the engine (unknown name, storage)
    pub engine_errors: u64,
    /// Failed dequeues
    pub storage_errors: u64,
    /// Executions dropped by an immediate shutdown
    pub tasks_interrupted: u64,
}

impl WorkerCounters {
    pub(crate) fn snapshot(&self, active_workers: usize) -> WorkerStats {
        WorkerStats {
            active_workers,
            total_workers: self.spawned.load(Ordering::Relaxed),
            worker_restarts: self.restarts.load(Ordering::Relaxed),
            tasks_processed: self.processed.load(Ordering::Relaxed),
            tasks_completed: self.completed.load(Ordering::Relaxed),
            engine_errors: self.engine_errors.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            tasks_interrupted: self.interrupted.load(Ordering::Relaxed),
        }
    }
}

/// Clears the alive flag however the worker exits.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A single dequeue/execute loop.
pub(crate) struct Worker {
    id: usize,
    scrooge: Scrooge,
    initial_delay: Duration,
    backoff: f64,
    max_delay: Duration,
    counters: Arc<WorkerCounters>,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        scrooge: Scrooge,
        config: &ConsumerConfig,
        counters: Arc<WorkerCounters>,
    ) -> Self {
        Self {
            id,
            scrooge,
            initial_delay: config.initial_delay(),
            backoff: config.backoff,
            max_delay: config.max_delay(),
            counters,
        }
    }

    /// Pull and execute tasks until `shutdown` leaves [`ShutdownMode::Running`].
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<ShutdownMode>) {
        tracing::info!("🔨 Worker {} started", self.id);
        let mut empty_count = 0u32;

        loop {
            if *shutdown.borrow() != ShutdownMode::Running {
                break;
            }

            match self.scrooge.dequeue().await {
                Ok(Some(task)) => {
                    empty_count = 0;
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                    self.process(task, &mut shutdown).await;
                }
                Ok(None) => {
                    empty_count = empty_count.saturating_add(1);
                    if !self.idle(empty_count, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    self.counters.storage_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("🔨 Worker {} failed to dequeue: {}", self.id, e);
                    empty_count = empty_count.saturating_add(1);
                    if !self.idle(empty_count, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        tracing::info!("🔨 Worker {} stopped", self.id);
    }

    async fn process(&self, task: Task, shutdown: &mut watch::Receiver<ShutdownMode>) {
        let task_id = task.id.clone();
        tokio::select! {
            biased;
            result = self.scrooge.execute(task.clone(), None) => match result {
                Ok(Some(_)) => {
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => {}
                Err(e) => {
                    self.counters.engine_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        "🔨 Worker {} could not execute task {} ({}): {}",
                        self.id,
                        task_id,
                        task.name,
                        e
                    );
                }
            },
            _ = wait_for_immediate(shutdown) => {
                self.counters.interrupted.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("🔨 Worker {} interrupted task {} ({})", self.id, task_id, task.name);
                self.scrooge
                    .signals()
                    .send(&SignalEvent::new(Signal::Interrupted, &task));
            }
        }
    }

    /// Back off after an empty or failed dequeue. Returns whether to keep
    /// running.
    async fn idle(&self, attempt: u32, shutdown: &mut watch::Receiver<ShutdownMode>) -> bool {
        let delay = calculate_backoff(attempt, self.initial_delay, self.backoff, self.max_delay);
        tracing::trace!("🔨 Worker {} idle, backing off {:?}", self.id, delay);
        tokio::select! {
            _ = sleep(delay) => true,
            changed = shutdown.changed() => {
                changed.is_ok() && *shutdown.borrow() == ShutdownMode::Running
            }
        }
    }
}

async fn wait_for_immediate(shutdown: &mut watch::Receiver<ShutdownMode>) {
    loop {
        if *shutdown.borrow_and_update() == ShutdownMode::Immediate {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

struct GreenletSpawn {
    worker: Worker,
    alive: Arc<AtomicBool>,
}

/// The thread every greenlet worker runs on.
struct GreenletHost {
    spawn_tx: mpsc::UnboundedSender<GreenletSpawn>,
    thread: std::thread::JoinHandle<()>,
}

impl GreenletHost {
    fn start(shutdown: watch::Receiver<ShutdownMode>) -> ScroogeResult<Self> {
        let (spawn_tx, mut spawn_rx) = mpsc::unbounded_channel::<GreenletSpawn>();
        let thread = std::thread::Builder::new()
            .name("scrooge-greenlets".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!("Failed to build the greenlet runtime: {}", e);
                        return;
                    }
                };
                let local = tokio::task::LocalSet::new();
                local.block_on(&runtime, async move {
                    let mut running = Vec::new();
                    while let Some(GreenletSpawn { worker, alive }) = spawn_rx.recv().await {
                        let shutdown = shutdown.clone();
                        running.push(tokio::task::spawn_local(async move {
                            let _guard = AliveGuard(alive);
                            worker.run(shutdown).await;
                        }));
                    }
                    for handle in running {
                        let _ = handle.await;
                    }
                });
            })?;
        Ok(Self { spawn_tx, thread })
    }
}

enum SlotKind {
    Thread(std::thread::JoinHandle<()>),
    Greenlet,
    Process {
        child: Child,
        stdin: Option<ChildStdin>,
    },
}

struct WorkerSlot {
    id: usize,
    alive: Arc<AtomicBool>,
    kind: SlotKind,
}

impl WorkerSlot {
    fn is_alive(&mut self) -> bool {
        match &mut self.kind {
            SlotKind::Thread(handle) => !handle.is_finished(),
            SlotKind::Greenlet => self.alive.load(Ordering::Acquire),
            SlotKind::Process { child, .. } => matches!(child.try_wait(), Ok(None)),
        }
    }
}

/// Spawns, supervises and stops the workers of one consumer.
pub(crate) struct WorkerPool {
    scrooge: Scrooge,
    config: ConsumerConfig,
    shutdown: watch::Receiver<ShutdownMode>,
    counters: Arc<WorkerCounters>,
    slots: Vec<WorkerSlot>,
    greenlets: Option<GreenletHost>,
}

impl WorkerPool {
    pub(crate) fn new(
        scrooge: Scrooge,
        config: ConsumerConfig,
        shutdown: watch::Receiver<ShutdownMode>,
        counters: Arc<WorkerCounters>,
    ) -> Self {
        Self {
            scrooge,
            config,
            shutdown,
            counters,
            slots: Vec::new(),
            greenlets: None,
        }
    }

    /// Spawn every configured worker.
    pub(crate) fn spawn_all(&mut self) -> ScroogeResult<()> {
        if self.config.worker_type == WorkerType::Greenlet && self.greenlets.is_none() {
            self.greenlets = Some(GreenletHost::start(self.shutdown.clone())?);
        }
        for id in 0..self.config.workers {
            let slot = self.spawn_worker(id)?;
            self.slots.push(slot);
        }
        Ok(())
    }

    fn spawn_worker(&self, id: usize) -> ScroogeResult<WorkerSlot> {
        let alive = Arc::new(AtomicBool::new(true));
        let kind = match self.config.worker_type {
            WorkerType::Thread => self.spawn_thread(id, Arc::clone(&alive))?,
            WorkerType::Greenlet => self.spawn_greenlet(id, Arc::clone(&alive))?,
            WorkerType::Process => self.spawn_process(id)?,
        };
        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("🔨 Spawned {} worker {}", self.config.worker_type, id);
        Ok(WorkerSlot { id, alive, kind })
    }

    fn worker(&self, id: usize) -> Worker {
        Worker::new(
            id,
            self.scrooge.clone(),
            &self.config,
            Arc::clone(&self.counters),
        )
    }

    fn spawn_thread(&self, id: usize, alive: Arc<AtomicBool>) -> ScroogeResult<SlotKind> {
        let worker = self.worker(id);
        let shutdown = self.shutdown.clone();
        let handle = std::thread::Builder::new()
            .name(format!("scrooge-worker-{}", id))
            .spawn(move || {
                let _guard = AliveGuard(alive);
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(worker.run(shutdown)),
                    Err(e) => tracing::error!("Worker {} could not build its runtime: {}", id, e),
                }
            })?;
        Ok(SlotKind::Thread(handle))
    }

    fn spawn_greenlet(&self, id: usize, alive: Arc<AtomicBool>) -> ScroogeResult<SlotKind> {
        let host = self.greenlets.as_ref().ok_or_else(|| {
            ScroogeError::config("greenlet host is not running")
        })?;
        host.spawn_tx
            .send(GreenletSpawn {
                worker: self.worker(id),
                alive,
            })
            .map_err(|_| ScroogeError::config("greenlet host has stopped"))?;
        Ok(SlotKind::Greenlet)
    }

    fn spawn_process(&self, id: usize) -> ScroogeResult<SlotKind> {
        let exe = std::env::current_exe()?;
        let mut child = Command::new(exe)
            .args(std::env::args_os().skip(1))
            .env(WORKER_ID_ENV, id.to_string())
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take();
        tracing::debug!("🔨 Worker {} running as pid {:?}", id, child.id());
        Ok(SlotKind::Process { child, stdin })
    }

    /// Workers currently alive.
    pub(crate) fn active_count(&mut self) -> usize {
        self.slots.iter_mut().filter_map(|slot| slot.is_alive().then_some(())).count()
    }

    pub(crate) fn stats(&mut self) -> WorkerStats {
        let active = self.active_count();
        self.counters.snapshot(active)
    }

    /// Find dead workers and, when `restart` is set, replace them. Returns
    /// how many were dead.
    pub(crate) fn check_health(&mut self, restart: bool) -> usize {
        if *self.shutdown.borrow() != ShutdownMode::Running {
            return 0;
        }

        let mut dead = 0;
        for index in 0..self.slots.len() {
            if self.slots[index].is_alive() {
                continue;
            }
            dead += 1;
            let id = self.slots[index].id;
            tracing::warn!("🔨 Worker {} is dead", id);
            if !restart {
                continue;
            }
            match self.spawn_worker(id) {
                Ok(slot) => {
                    self.counters.restarts.fetch_add(1, Ordering::Relaxed);
                    self.slots[index] = slot;
                    tracing::info!("🔨 Worker {} restarted", id);
                }
                Err(e) => tracing::error!("Failed to restart worker {}: {}", id, e),
            }
        }
        dead
    }

    /// Wait for every worker to stop, up to `timeout`. The shutdown mode
    /// must already have been broadcast. Returns how many workers did not
    /// stop in time.
    pub(crate) async fn stop(&mut self, mode: ShutdownMode, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut stragglers = 0;
        tracing::info!(
            "🔨 Stopping {} workers ({:?}, timeout {:?})",
            self.slots.len(),
            mode,
            timeout
        );

        // Closing the spawn channel lets the host thread exit once its
        // workers are done.
        let greenlets = self.greenlets.take();

        for slot in self.slots.drain(..) {
            match slot.kind {
                SlotKind::Thread(handle) => {
                    let join = tokio::task::spawn_blocking(move || handle.join());
                    match timeout_at(deadline, join).await {
                        Ok(Ok(Ok(()))) => {}
                        Ok(Ok(Err(_))) => tracing::error!("🔨 Worker {} panicked", slot.id),
                        Ok(Err(e)) => tracing::error!("🔨 Worker {} join failed: {}", slot.id, e),
                        Err(_) => {
                            stragglers += 1;
                            tracing::warn!("🔨 Worker {} did not stop in time", slot.id);
                        }
                    }
                }
                SlotKind::Greenlet => {}
                SlotKind::Process { mut child, stdin } => {
                    // A closed stdin asks the child to stop gracefully.
                    drop(stdin);
                    if mode == ShutdownMode::Immediate {
                        if let Err(e) = child.start_kill() {
                            tracing::warn!("🔨 Failed to kill worker {}: {}", slot.id, e);
                        }
                    }
                    match timeout_at(deadline, child.wait()).await {
                        Ok(Ok(status)) => {
                            tracing::debug!("🔨 Worker {} exited with {}", slot.id, status)
                        }
                        Ok(Err(e)) => tracing::error!("🔨 Worker {} wait failed: {}", slot.id, e),
                        Err(_) => {
                            stragglers += 1;
                            tracing::warn!("🔨 Worker {} did not stop in time, killing", slot.id);
                            let _ = child.kill().await;
                        }
                    }
                }
            }
        }

        if let Some(GreenletHost { spawn_tx, thread }) = greenlets {
            drop(spawn_tx);
            let join = tokio::task::spawn_blocking(move || thread.join());
            if timeout_at(deadline, join).await.is_err() {
                stragglers += 1;
                tracing::warn!("🔨 Greenlet workers did not stop in time");
            }
        }

        tracing::info!("🔨 Worker shutdown complete ({} stragglers)", stragglers);
        stragglers
    }
}

/// Worker number of this process when it was spawned as a process worker.
pub fn worker_id_from_env() -> Option<usize> {
    std::env::var(WORKER_ID_ENV).ok()?.parse().ok()
}

/// Body of a process worker: run one worker loop until stdin closes (stop
/// gracefully) or the parent kills the process.
pub(crate) async fn run_worker_process(
    scrooge: Scrooge,
    config: &ConsumerConfig,
    worker_id: usize,
) -> ScroogeResult<()> {
    use tokio::io::AsyncReadExt;

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMode::Running);
    let counters = Arc::new(WorkerCounters::default());

    // Ctrl-C reaches the whole foreground process group. The parent turns
    // it into a graceful stop and closes our stdin, so the child must not
    // die from it.
    ignore_interrupts()?;

    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 64];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        shutdown_tx.send_replace(ShutdownMode::Graceful);
    });

    scrooge.hooks().run_startup();
    tracing::info!("🔨 Process worker {} (pid {}) started", worker_id, std::process::id());
    Worker::new(worker_id, scrooge.clone(), config, counters)
        .run(shutdown_rx)
        .await;
    scrooge.hooks().run_shutdown();
    Ok(())
}

/// Swallow SIGINT for the rest of the process. Returns how many were
/// received.
#[cfg(unix)]
fn ignore_interrupts() -> ScroogeResult<Arc<AtomicU64>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupts = signal(SignalKind::interrupt())?;
    let received = Arc::new(AtomicU64::new(0));
    let count = Arc::clone(&received);
    tokio::spawn(async move {
        while interrupts.recv().await.is_some() {
            count.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("🔨 Ignoring SIGINT, waiting for the parent to stop us");
        }
    });
    Ok(received)
}

#[cfg(not(unix))]
fn ignore_interrupts() -> ScroogeResult<Arc<AtomicU64>> {
    Ok(Arc::new(AtomicU64::new(0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::task::TaskOptions;
    use std::sync::Mutex;

    fn fast_config(worker_type: WorkerType, workers: usize) -> ConsumerConfig {
        ConsumerConfig::with_workers(workers)
            .with_worker_type(worker_type)
            .with_backoff(5, 1.5, 20)
    }

    async fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
        for _ in 0..300 {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_worker_drains_queue_and_stops() {
        let scrooge = Scrooge::memory("worker-test");
        let done = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&done);
        let record = scrooge
            .task(TaskOptions::new("record"), move |n: i64| {
                sink.lock().unwrap().push(n);
                async { Ok::<_, TaskError>(()) }
            })
            .unwrap();
        for n in 0..3 {
            record.call(n).await.unwrap();
        }

        let counters = Arc::new(WorkerCounters::default());
        let (tx, rx) = watch::channel(ShutdownMode::Running);
        let worker = Worker::new(
            0,
            scrooge.clone(),
            &fast_config(WorkerType::Thread, 1),
            Arc::clone(&counters),
        );
        let handle = tokio::spawn(worker.run(rx));

        assert!(wait_until(|| done.lock().unwrap().len() == 3).await);
        tx.send(ShutdownMode::Graceful).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*done.lock().unwrap(), vec![0, 1, 2]);
        let stats = counters.snapshot(0);
        assert_eq!(stats.tasks_processed, 3);
        assert_eq!(stats.tasks_completed, 3);
    }

    #[tokio::test]
    async fn test_immediate_shutdown_interrupts() {
        let scrooge = Scrooge::memory("worker-test");
        let signals = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&signals);
        scrooge.signal(&[], move |event: &SignalEvent<'_>| {
            sink.lock().unwrap().push(event.signal)
        });
        let slow = scrooge
            .task(TaskOptions::new("slow"), |_: ()| async {
                sleep(Duration::from_secs(30)).await;
                Ok::<_, TaskError>(())
            })
            .unwrap();
        slow.call(()).await.unwrap();

        let counters = Arc::new(WorkerCounters::default());
        let (tx, rx) = watch::channel(ShutdownMode::Running);
        let worker = Worker::new(
            0,
            scrooge.clone(),
            &fast_config(WorkerType::Thread, 1),
            Arc::clone(&counters),
        );
        let handle = tokio::spawn(worker.run(rx));

        assert!(wait_until(|| signals.lock().unwrap().contains(&Signal::Executing)).await);
        tx.send(ShutdownMode::Immediate).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            *signals.lock().unwrap(),
            vec![Signal::Executing, Signal::Interrupted]
        );
        assert_eq!(counters.snapshot(0).tasks_interrupted, 1);
    }

    #[tokio::test]
    async fn test_pool_models_run_tasks() {
        for worker_type in [WorkerType::Thread, WorkerType::Greenlet] {
            let scrooge = Scrooge::memory("worker-test");
            let double = scrooge
                .task(TaskOptions::new("double"), |n: i64| async move {
                    Ok::<_, TaskError>(n * 2)
                })
                .unwrap();
            let handles: Vec<_> = futures::future::try_join_all((0..6).map(|n| double.call(n)))
                .await
                .unwrap();

            let (tx, rx) = watch::channel(ShutdownMode::Running);
            let counters = Arc::new(WorkerCounters::default());
            let mut pool = WorkerPool::new(
                scrooge.clone(),
                fast_config(worker_type, 3),
                rx,
                Arc::clone(&counters),
            );
            pool.spawn_all().unwrap();
            assert!(wait_until(|| counters.snapshot(0).tasks_completed == 6).await);
            assert_eq!(pool.active_count(), 3);

            tx.send(ShutdownMode::Graceful).unwrap();
            assert_eq!(pool.stop(ShutdownMode::Graceful, Duration::from_secs(2)).await, 0);

            for (n, handle) in handles.iter().enumerate() {
                assert_eq!(handle.get().await.unwrap(), Some(n as i64 * 2));
            }
        }
    }

    #[tokio::test]
    async fn test_health_check_replaces_dead_workers() {
        let scrooge = Scrooge::memory("worker-test");
        let (tx, rx) = watch::channel(ShutdownMode::Running);
        let counters = Arc::new(WorkerCounters::default());
        let mut pool = WorkerPool::new(
            scrooge,
            fast_config(WorkerType::Thread, 1),
            rx,
            Arc::clone(&counters),
        );
        pool.spawn_all().unwrap();

        let finished = std::thread::spawn(|| {});
        assert!(wait_until(|| finished.is_finished()).await);
        pool.slots.push(WorkerSlot {
            id: 1,
            alive: Arc::new(AtomicBool::new(false)),
            kind: SlotKind::Thread(finished),
        });

        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.check_health(false), 1);
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.check_health(true), 1);
        assert_eq!(pool.active_count(), 2);
        assert_eq!(pool.stats().worker_restarts, 1);

        tx.send(ShutdownMode::Graceful).unwrap();
        assert_eq!(pool.stop(ShutdownMode::Graceful, Duration::from_secs(2)).await, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_worker_survives_sigint() {
        let received = ignore_interrupts().unwrap();

        let status = Command::new("kill")
            .arg("-INT")
            .arg(std::process::id().to_string())
            .status()
            .await
            .unwrap();
        assert!(status.success());

        // Still running, and the interrupt was consumed instead of acted on.
        assert!(wait_until(|| received.load(Ordering::Relaxed) == 1).await);
    }

    #[test]
    fn test_worker_id_env_parsing() {
        // Only read here; never set, so parallel tests are unaffected.
        if std::env::var(WORKER_ID_ENV).is_err() {
            assert_eq!(worker_id_from_env(), None);
        }
    }
}
