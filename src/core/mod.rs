//! The Scrooge queue engine.
//!
//! [`Scrooge`] ties a storage backend to a task registry, a signal bus and
//! the lifecycle hooks. Producers use it to enqueue work; the consumer uses
//! it to dequeue and execute.

use crate::config::{EngineConfig, ScroogeConfig, StorageConfig};
use crate::crontab::Crontab;
use crate::error::{ScroogeError, ScroogeResult, TaskError, TaskFailure};
use crate::result::{ResultHandle, StoredResult};
use crate::signals::{HandlerId, Signal, SignalBus, SignalEvent};
use crate::storage::{MemoryStorage, Storage, StorageFactory};
use crate::task::{ScheduleOptions, Task, build_task, revoke_key_for_id, revoke_key_for_name};
use crate::utils::{add_delay, panic_message};
use chrono::{DateTime, Local, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

pub mod engine;
pub mod hooks;
pub mod lock;
pub mod registry;
pub mod scheduler;
pub mod worker;

pub use engine::{Consumer, ConsumerStats};
pub use hooks::Hooks;
pub use lock::{LockGuard, TaskLock};
pub use registry::{
    HandlerFn, Invocable, RegisteredTask, RegistrySummary, TaskCall, TaskRegistry, TaskTypeStats,
    TaskWrapper, handler_fn,
};
pub use scheduler::{Scheduler, TickReport};
pub use worker::{ShutdownMode, WorkerStats};

/// How a revocation applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevokeOptions {
    /// Revoked until this time; `None` means until restored
    pub revoke_until: Option<DateTime<Utc>>,
    /// Skip exactly one execution, then clear the marker
    pub revoke_once: bool,
}

impl RevokeOptions {
    /// Skip the next execution only.
    pub fn once() -> Self {
        Self {
            revoke_until: None,
            revoke_once: true,
        }
    }

    /// Revoked until `until`.
    pub fn until(until: DateTime<Utc>) -> Self {
        Self {
            revoke_until: Some(until),
            revoke_once: false,
        }
    }
}

/// Revocation marker as kept in the result store.
#[derive(Debug, Serialize, Deserialize)]
struct Revocation {
    until: Option<DateTime<Utc>>,
    once: bool,
}

struct Inner {
    name: String,
    storage: Arc<dyn Storage>,
    registry: TaskRegistry,
    signals: SignalBus,
    hooks: Hooks,
    locks: Mutex<BTreeSet<String>>,
    config: EngineConfig,
    immediate: AtomicBool,
}

/// The queue engine. Cheap to clone; every clone shares the same storage,
/// registry, signal handlers and hooks.
///
/// # Examples
///
/// ```rust,no_run
/// use scrooge::prelude::*;
///
/// #[tokio::main]
/// async fn main() -> ScroogeResult<()> {
///     let scrooge = Scrooge::memory("mail");
///     let send = scrooge.task(TaskOptions::new("send").retries(3), |to: String| async move {
///         Ok::<_, TaskError>(format!("sent to {}", to))
///     })?;
///
///     let handle = send.call("user@example.com".to_string()).await?;
///     println!("Task enqueued: {}", handle.id());
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Scrooge {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scrooge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scrooge")
            .field("name", &self.inner.name)
            .field("storage", &self.inner.storage)
            .field("registry", &self.inner.registry)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Scrooge {
    /// Create an engine named `name` over `storage`.
    pub fn new(name: impl Into<String>, storage: Arc<dyn Storage>, config: EngineConfig) -> Self {
        let immediate = config.immediate;
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                storage,
                registry: TaskRegistry::new(),
                signals: SignalBus::new(),
                hooks: Hooks::new(),
                locks: Mutex::new(BTreeSet::new()),
                config,
                immediate: AtomicBool::new(immediate),
            }),
        }
    }

    /// Engine over in-process memory storage with default policy.
    pub fn memory(name: impl Into<String>) -> Self {
        let name = name.into();
        let storage = Arc::new(MemoryStorage::new(name.clone()));
        Self::new(name, storage, EngineConfig::default())
    }

    /// Engine over `storage`, named after it.
    pub fn with_storage<S: Storage + 'static>(storage: S, config: EngineConfig) -> Self {
        let name = storage.name().to_string();
        Self::new(name, Arc::new(storage), config)
    }

    /// Build the engine and its storage backend from a full configuration.
    pub async fn from_config(config: &ScroogeConfig) -> ScroogeResult<Self> {
        config.ensure_valid()?;
        let storage = StorageFactory::from_config(&config.name, &config.storage).await?;
        tracing::info!(
            "🔧 Scrooge '{}' created with {} storage",
            config.name,
            storage_kind(&config.storage)
        );
        Ok(Self::new(config.name.clone(), storage, config.engine.clone()))
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Storage backend.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    /// Engine policy.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Task registry.
    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    /// Registered hooks.
    pub fn hooks(&self) -> &Hooks {
        &self.inner.hooks
    }

    /// Signal bus.
    pub fn signals(&self) -> &SignalBus {
        &self.inner.signals
    }

    /// Whether tasks run inline at enqueue time.
    pub fn is_immediate(&self) -> bool {
        self.inner.immediate.load(Ordering::Acquire)
    }

    /// Switch immediate mode on or off.
    pub fn set_immediate(&self, immediate: bool) {
        self.inner.immediate.store(immediate, Ordering::Release);
        tracing::debug!("Immediate mode for '{}' set to {}", self.inner.name, immediate);
    }

    /// Connect a handler to `signals`; an empty slice means every signal.
    pub fn signal<F>(&self, signals: &[Signal], handler: F) -> HandlerId
    where
        F: Fn(&SignalEvent<'_>) + Send + Sync + 'static,
    {
        self.inner.signals.connect(signals, handler)
    }

    /// Disconnect a handler from one signal or from all of them.
    pub fn disconnect_signal(&self, id: HandlerId, signal: Option<Signal>) -> bool {
        self.inner.signals.disconnect(id, signal)
    }

    /// Run `f` when a consumer starts.
    pub fn on_startup<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.hooks.add_startup(name.into(), Arc::new(f));
    }

    /// Run `f` when a consumer stops.
    pub fn on_shutdown<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.hooks.add_shutdown(name.into(), Arc::new(f));
    }

    /// Run `f` before every task body. Returning [`TaskError::Cancel`]
    /// cancels the execution.
    pub fn pre_execute<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&Task) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.inner.hooks.add_pre_execute(name.into(), Arc::new(f));
    }

    /// Run `f` after every task body with its value or error.
    pub fn post_execute<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&Task, Option<&Value>, Option<&TaskError>) + Send + Sync + 'static,
    {
        self.inner.hooks.add_post_execute(name.into(), Arc::new(f));
    }

    /// Remove a pre-execute hook.
    pub fn unregister_pre_execute(&self, name: &str) -> bool {
        self.inner.hooks.remove_pre_execute(name)
    }

    /// Remove a post-execute hook.
    pub fn unregister_post_execute(&self, name: &str) -> bool {
        self.inner.hooks.remove_post_execute(name)
    }

    fn emit(&self, signal: Signal, task: &Task) {
        self.inner.signals.send(&SignalEvent::new(signal, task));
    }

    /// Enqueue `task`, or move it to the schedule when its eta is in the
    /// future. In immediate mode the task runs before this returns.
    pub async fn enqueue(&self, task: Task) -> ScroogeResult<ResultHandle> {
        self.enqueue_inner(task.clone()).await?;
        Ok(ResultHandle::new(self.clone(), task))
    }

    async fn enqueue_inner(&self, task: Task) -> ScroogeResult<()> {
        if task.is_deferred(Utc::now()) {
            return self.add_schedule(&task).await;
        }

        if self.is_immediate() {
            self.execute(task, None).await?;
            return Ok(());
        }

        self.enqueue_ready(&task).await
    }

    /// Push `task` onto the ready queue whatever its eta.
    pub(crate) async fn enqueue_ready(&self, task: &Task) -> ScroogeResult<()> {
        self.inner
            .storage
            .enqueue(task.serialize()?, task.priority)
            .await?;
        tracing::debug!(
            "🔨 Task enqueued: {} (name: {}, priority: {})",
            task.id,
            task.name,
            task.priority
        );
        Ok(())
    }

    /// Pull the next ready task.
    pub async fn dequeue(&self) -> ScroogeResult<Option<Task>> {
        match self.inner.storage.dequeue().await? {
            Some(data) => Ok(Some(Task::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// Put `task` in the schedule at its eta (now when it has none).
    pub async fn add_schedule(&self, task: &Task) -> ScroogeResult<()> {
        let eta = task.eta.unwrap_or_else(Utc::now);
        self.inner
            .storage
            .schedule_add(task.serialize()?, eta, task.priority)
            .await?;
        tracing::debug!("Task {} scheduled for {}", task.id, eta);
        self.emit(Signal::Scheduled, task);
        Ok(())
    }

    /// Execute `task` as of `timestamp` (now by default).
    ///
    /// Returns the body's value when it completed, `None` when the task was
    /// dropped, deferred, cancelled or failed. Storage errors and unknown task
    /// names come back as errors; failures of the body never do.
    pub fn execute(
        &self,
        task: Task,
        timestamp: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, ScroogeResult<Option<Value>>> {
        Box::pin(async move {
            let now = timestamp.unwrap_or_else(Utc::now);

            if task.is_expired(now) {
                tracing::info!("Task {} ({}) expired, dropping", task.id, task.name);
                self.emit(Signal::Expired, &task);
                return Ok(None);
            }

            if self.is_revoked(&task, now, false).await? {
                tracing::info!("Task {} ({}) revoked, dropping", task.id, task.name);
                self.emit(Signal::Revoked, &task);
                return Ok(None);
            }

            if task.is_deferred(now) {
                self.add_schedule(&task).await?;
                return Ok(None);
            }

            let registered = self.inner.registry.get(&task.name).ok_or_else(|| {
                ScroogeError::TaskNotFound {
                    name: task.name.clone(),
                }
            })?;
            let periodic = registered.is_periodic();

            if let Err(cancel) = self.inner.hooks.run_pre_execute(&task) {
                self.emit(Signal::Canceled, &task);
                if matches!(cancel, TaskError::Cancel { retry: true }) && task.retries > 0 {
                    self.requeue(task, now, None).await?;
                }
                return Ok(None);
            }

            self.emit(Signal::Executing, &task);
            tracing::info!("Executing {} ({})", task.name, task.id);

            let call = TaskCall {
                task_id: task.id.clone(),
                args: task.args.clone(),
                kwargs: task.kwargs.clone(),
            };
            let started = Instant::now();
            let outcome = match AssertUnwindSafe(registered.invocable.invoke(call))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => Err(TaskError::Failed(format!(
                    "task panicked: {}",
                    panic_message(&*panic)
                ))),
            };
            let duration = started.elapsed();
            self.inner.registry.record(&task.name, &outcome, duration);

            let mut task = task;
            let mut retry = false;
            let mut retry_eta = None;
            let mut store_error = None;

            match &outcome {
                Ok(value) => {
                    tracing::info!(
                        "✅ {} ({}) executed in {:.3}s",
                        task.name,
                        task.id,
                        duration.as_secs_f64()
                    );
                    if self.should_store(value, periodic) {
                        self.put_result(&task.id, &StoredResult::Value(value.clone()))
                            .await?;
                    }
                    self.inner.signals.send(&SignalEvent {
                        signal: Signal::Complete,
                        task: &task,
                        value: Some(value),
                        error: None,
                    });
                }
                Err(error @ TaskError::Locked(_)) => {
                    tracing::warn!("Task {} ({}) not run: {}", task.name, task.id, error);
                    self.inner.signals.send(&SignalEvent {
                        signal: Signal::Locked,
                        task: &task,
                        value: None,
                        error: Some(error),
                    });
                }
                Err(TaskError::Cancel { retry: retry_requested }) => {
                    tracing::info!("Task {} ({}) canceled itself", task.name, task.id);
                    self.emit(Signal::Canceled, &task);
                    retry = *retry_requested && task.retries > 0;
                }
                Err(TaskError::Retry {
                    message,
                    delay,
                    eta,
                }) => {
                    tracing::info!(
                        "Task {} ({}) asked to be retried: {}",
                        task.name,
                        task.id,
                        message
                    );
                    // Forced retry: the requeue below takes one back off.
                    task.retries = task.retries.saturating_add(1);
                    retry = true;
                    retry_eta = eta.or_else(|| {
                        delay
                            .filter(|delay| !delay.is_zero())
                            .map(|delay| add_delay(now, delay))
                    });
                }
                Err(error @ TaskError::Failed(_)) => {
                    tracing::error!(
                        "Task {} ({}) failed after {:.3}s: {}",
                        task.name,
                        task.id,
                        duration.as_secs_f64(),
                        error
                    );
                    if self.inner.config.results && !periodic {
                        let failure = TaskFailure {
                            task_id: task.id.clone(),
                            name: task.name.clone(),
                            error: error.to_string(),
                            retries: task.retries,
                        };
                        // Signals, hooks and the retry still happen when the
                        // error cannot be stored.
                        if let Err(e) = self
                            .put_result(&task.id, &StoredResult::Error(failure))
                            .await
                        {
                            tracing::error!(
                                "Failed to store error of {} ({}): {}",
                                task.name,
                                task.id,
                                e
                            );
                            store_error = Some(e);
                        }
                    }
                    self.inner.signals.send(&SignalEvent {
                        signal: Signal::Error,
                        task: &task,
                        value: None,
                        error: Some(error),
                    });
                    retry = task.retries > 0;
                }
            }

            match &outcome {
                Ok(value) => self.inner.hooks.run_post_execute(&task, Some(value), None),
                Err(error) => self.inner.hooks.run_post_execute(&task, None, Some(error)),
            }

            if retry {
                self.requeue(task, now, retry_eta).await?;
            }

            if let Some(e) = store_error {
                return Err(e);
            }

            Ok(outcome.ok())
        })
    }

    async fn requeue(
        &self,
        mut task: Task,
        now: DateTime<Utc>,
        eta_override: Option<DateTime<Utc>>,
    ) -> ScroogeResult<()> {
        task.retries = task.retries.saturating_sub(1);
        tracing::info!("Requeueing {}, {} retries left", task.id, task.retries);
        self.emit(Signal::Retrying, &task);

        if eta_override.is_some() || task.retry_delay > 0 {
            task.eta = Some(eta_override.unwrap_or_else(|| {
                add_delay(now, Duration::from_secs(task.retry_delay))
            }));
            self.add_schedule(&task).await
        } else {
            self.enqueue_inner(task).await
        }
    }

    fn should_store(&self, value: &Value, periodic: bool) -> bool {
        self.inner.config.results
            && !periodic
            && (!value.is_null() || self.inner.config.store_none)
    }

    async fn put_result(&self, key: &str, result: &StoredResult) -> ScroogeResult<()> {
        let expire = self.inner.config.result_expire_secs.map(Duration::from_secs);
        self.inner
            .storage
            .put_result(key, result.to_bytes()?, expire)
            .await
    }

    /// Read the result of task `id`.
    ///
    /// `Ok(None)` when there is none, [`ScroogeError::TaskException`] when the
    /// task failed. Unless `preserve` is set the result is removed.
    pub async fn result(&self, id: &str, preserve: bool) -> ScroogeResult<Option<Value>> {
        let data = if preserve {
            self.inner.storage.peek_result(id).await?
        } else {
            self.inner.storage.pop_result(id).await?
        };
        match data {
            Some(data) => StoredResult::from_bytes(&data)?.into_result().map(Some),
            None => Ok(None),
        }
    }

    /// Store an arbitrary value in the result store.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> ScroogeResult<()> {
        self.inner
            .storage
            .put_result(key, serde_json::to_vec(value)?, None)
            .await
    }

    /// Read a value written with [`Scrooge::put`]. Removed unless `peek`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, peek: bool) -> ScroogeResult<Option<T>> {
        let data = if peek {
            self.inner.storage.peek_result(key).await?
        } else {
            self.inner.storage.pop_result(key).await?
        };
        match data {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Remove a key from the result store.
    pub async fn delete(&self, key: &str) -> ScroogeResult<bool> {
        self.inner.storage.delete(key).await
    }

    /// Revoke a single task.
    pub async fn revoke(&self, task: &Task, options: RevokeOptions) -> ScroogeResult<()> {
        self.write_revocation(&task.revoke_id(), options).await
    }

    /// Revoke a single task by id.
    pub async fn revoke_by_id(&self, id: &str, options: RevokeOptions) -> ScroogeResult<()> {
        self.write_revocation(&revoke_key_for_id(id), options).await
    }

    /// Revoke every task named `name`.
    pub async fn revoke_all(&self, name: &str, options: RevokeOptions) -> ScroogeResult<()> {
        self.write_revocation(&revoke_key_for_name(name), options).await
    }

    /// Undo [`Scrooge::revoke`].
    pub async fn restore(&self, task: &Task) -> ScroogeResult<bool> {
        self.inner.storage.delete(&task.revoke_id()).await
    }

    /// Undo [`Scrooge::revoke_by_id`].
    pub async fn restore_by_id(&self, id: &str) -> ScroogeResult<bool> {
        self.inner.storage.delete(&revoke_key_for_id(id)).await
    }

    /// Undo [`Scrooge::revoke_all`].
    pub async fn restore_all(&self, name: &str) -> ScroogeResult<bool> {
        self.inner.storage.delete(&revoke_key_for_name(name)).await
    }

    /// Whether `task` is revoked at `timestamp`, either by id or by name.
    /// Unless `peek` is set, a one-shot marker that matches is consumed.
    pub async fn is_revoked(
        &self,
        task: &Task,
        timestamp: DateTime<Utc>,
        peek: bool,
    ) -> ScroogeResult<bool> {
        if self
            .check_revocation(&task.revoke_id(), timestamp, peek)
            .await?
        {
            return Ok(true);
        }
        self.check_revocation(&task.revoke_name_id(), timestamp, peek)
            .await
    }

    /// Whether the task `id` has its own revocation marker.
    pub async fn is_revoked_by_id(
        &self,
        id: &str,
        timestamp: DateTime<Utc>,
        peek: bool,
    ) -> ScroogeResult<bool> {
        self.check_revocation(&revoke_key_for_id(id), timestamp, peek)
            .await
    }

    /// Whether every task named `name` is revoked.
    pub async fn is_revoked_all(
        &self,
        name: &str,
        timestamp: DateTime<Utc>,
        peek: bool,
    ) -> ScroogeResult<bool> {
        self.check_revocation(&revoke_key_for_name(name), timestamp, peek)
            .await
    }

    async fn write_revocation(&self, key: &str, options: RevokeOptions) -> ScroogeResult<()> {
        let revocation = Revocation {
            until: options.revoke_until,
            once: options.revoke_once,
        };
        self.inner
            .storage
            .put_result(key, serde_json::to_vec(&revocation)?, None)
            .await?;
        tracing::debug!("Revocation marker '{}' written: {:?}", key, revocation);
        Ok(())
    }

    async fn check_revocation(
        &self,
        key: &str,
        timestamp: DateTime<Utc>,
        peek: bool,
    ) -> ScroogeResult<bool> {
        let Some(data) = self.inner.storage.peek_result(key).await? else {
            return Ok(false);
        };
        let revocation: Revocation = serde_json::from_slice(&data)?;

        if revocation.once {
            if !peek {
                self.inner.storage.delete(key).await?;
            }
            return Ok(true);
        }
        Ok(revocation.until.is_none_or(|until| until > timestamp))
    }

    /// Ready tasks, in dequeue order.
    pub async fn pending(&self, limit: Option<usize>) -> ScroogeResult<Vec<Task>> {
        let items = self.inner.storage.enqueued_items(limit).await?;
        Ok(decode_tasks(items, "queue"))
    }

    /// Number of ready tasks.
    pub async fn pending_count(&self) -> ScroogeResult<usize> {
        self.inner.storage.queue_size().await
    }

    /// Scheduled tasks, soonest first.
    pub async fn scheduled(&self, limit: Option<usize>) -> ScroogeResult<Vec<Task>> {
        let items = self.inner.storage.scheduled_items(limit).await?;
        Ok(decode_tasks(items, "schedule"))
    }

    /// Number of scheduled tasks.
    pub async fn scheduled_count(&self) -> ScroogeResult<usize> {
        self.inner.storage.schedule_size().await
    }

    /// Number of keys in the result store (results, markers and locks).
    pub async fn result_count(&self) -> ScroogeResult<usize> {
        self.inner.storage.result_count().await
    }

    /// Raw contents of the result store.
    pub async fn all_results(&self) -> ScroogeResult<HashMap<String, Vec<u8>>> {
        self.inner.storage.result_items().await
    }

    /// Empty the queue, the schedule and the result store.
    pub async fn flush(&self) -> ScroogeResult<()> {
        self.inner.storage.flush_all().await?;
        tracing::info!("Flushed all data for '{}'", self.inner.name);
        Ok(())
    }

    /// Check the storage backend.
    pub async fn health_check(&self) -> ScroogeResult<()> {
        self.inner.storage.health_check().await
    }

    /// Remove and return every scheduled task due at `timestamp`.
    pub async fn read_schedule(&self, timestamp: DateTime<Utc>) -> ScroogeResult<Vec<Task>> {
        let items = self.inner.storage.schedule_read(timestamp).await?;
        Ok(decode_tasks(items, "schedule"))
    }

    /// Fresh tasks for every periodic registration whose crontab matches the
    /// minute of `timestamp`.
    pub fn read_periodic(&self, timestamp: DateTime<Utc>) -> ScroogeResult<Vec<Task>> {
        let mut tasks = Vec::new();
        for registered in self.inner.registry.periodic() {
            let Some(crontab) = registered.crontab.as_ref() else {
                continue;
            };
            if self.crontab_matches(crontab, timestamp) {
                tasks.push(build_task(
                    &registered.options,
                    Value::Null,
                    ScheduleOptions::default(),
                )?);
            }
        }
        Ok(tasks)
    }

    fn crontab_matches(&self, crontab: &Crontab, timestamp: DateTime<Utc>) -> bool {
        if self.inner.config.utc {
            crontab.matches(&timestamp)
        } else {
            crontab.matches(&timestamp.with_timezone(&Local))
        }
    }

    /// A storage-backed lock named `name` on this queue.
    pub fn lock_task(&self, name: &str) -> TaskLock {
        self.inner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
        TaskLock::new(Arc::clone(&self.inner.storage), &self.inner.name, name)
    }

    /// A lock on this queue that up to `value` holders can take at once.
    /// Only Redis storage supports it. Like [`Scrooge::lock_task`], the name
    /// is released by [`Scrooge::flush_locks`].
    #[cfg(feature = "redis-storage")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-storage")))]
    pub fn lock_task_semaphore(
        &self,
        name: &str,
        value: usize,
        timeout: Option<Duration>,
    ) -> ScroogeResult<crate::storage::RedisSemaphore> {
        let redis = self.inner.storage.as_redis().ok_or_else(|| {
            ScroogeError::config(format!(
                "semaphore '{}' needs Redis storage, not {}",
                name,
                self.inner.storage.name()
            ))
        })?;
        self.inner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
        Ok(redis.semaphore(name, &lock::lock_key(&self.inner.name, name), value, timeout))
    }

    /// Release every lock created through [`Scrooge::lock_task`] plus
    /// `extra`. Returns the names that were actually held.
    pub async fn flush_locks(&self, extra: &[String]) -> ScroogeResult<Vec<String>> {
        let mut names = self
            .inner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        names.extend(extra.iter().cloned());

        let mut flushed = Vec::new();
        for name in names {
            if self
                .inner
                .storage
                .delete(&lock::lock_key(&self.inner.name, &name))
                .await?
            {
                flushed.push(name);
            }
        }
        if !flushed.is_empty() {
            tracing::info!("Flushed locks: {}", flushed.join(", "));
        }
        Ok(flushed)
    }
}

fn decode_tasks(items: Vec<Vec<u8>>, source: &str) -> Vec<Task> {
    items
        .into_iter()
        .filter_map(|data| match Task::deserialize(&data) {
            Ok(task) => Some(task),
            Err(e) => {
                tracing::warn!("Skipping undecodable entry in {}: {}", source, e);
                None
            }
        })
        .collect()
}

fn storage_kind(config: &StorageConfig) -> &'static str {
    match config {
        StorageConfig::Memory => "memory",
        StorageConfig::BlackHole => "black hole",
        StorageConfig::File(_) => "file",
        #[cfg(feature = "redis-storage")]
        StorageConfig::Redis(_) => "redis",
        #[cfg(feature = "sql-storage")]
        StorageConfig::Sql(_) => "sql",
    }
}
