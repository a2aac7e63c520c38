//! Task registry for Scrooge.
//!
//! The registry maps task names to [`Invocable`]s. Every [`Scrooge`] owns its
//! own registry; workers resolve names against it at execute time, so tasks
//! must be registered before the consumer starts pulling.
//!
//! # Overview
//!
//! - [`Invocable`]: runs a task body from its JSON payload
//! - [`handler_fn`]: adapts a raw `Fn(TaskCall) -> Future` into an `Invocable`
//! - [`TaskRegistry`]: name → invocable, plus per-name execution statistics
//! - [`TaskWrapper`]: what [`Scrooge::task`] hands back; schedule, revoke and
//!   call the registered task through it
//!
//! # Examples
//!
//! ```rust,no_run
//! use scrooge::prelude::*;
//!
//! # async fn example() -> ScroogeResult<()> {
//! let scrooge = Scrooge::memory("jobs");
//! let add = scrooge.task(TaskOptions::new("add"), |(a, b): (i64, i64)| async move {
//!     Ok::<_, TaskError>(a + b)
//! })?;
//!
//! let handle = add.call((1, 2)).await?;
//! # let _ = handle;
//! # Ok(())
//! # }
//! ```

use crate::core::{RevokeOptions, Scrooge};
use crate::crontab::Crontab;
use crate::error::{ScroogeError, ScroogeResult, TaskError};
use crate::result::ResultHandle;
use crate::task::{ScheduleOptions, Task, TaskId, TaskOptions, build_task};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// What a task body receives.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCall {
    /// Id of the task being executed
    pub task_id: TaskId,
    /// Positional payload
    pub args: Value,
    /// Keyword payload
    pub kwargs: Map<String, Value>,
}

/// Runs a task body from its serialized payload.
#[async_trait]
pub trait Invocable: Send + Sync {
    /// Execute the body. The returned value is what gets stored as the result.
    async fn invoke(&self, call: TaskCall) -> Result<Value, TaskError>;
}

/// An [`Invocable`] backed by a closure over the raw [`TaskCall`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap `f` as an [`Invocable`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(TaskCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Invocable for HandlerFn<F>
where
    F: Fn(TaskCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    async fn invoke(&self, call: TaskCall) -> Result<Value, TaskError> {
        (self.f)(call).await
    }
}

/// Decodes `args` into `A`, runs the body and encodes its output.
struct TypedInvocable<A, R, F> {
    f: F,
    _marker: PhantomData<fn(A) -> R>,
}

#[async_trait]
impl<A, R, F, Fut> Invocable for TypedInvocable<A, R, F>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, TaskError>> + Send + 'static,
{
    async fn invoke(&self, call: TaskCall) -> Result<Value, TaskError> {
        let args: A = serde_json::from_value(call.args)?;
        let output = (self.f)(args).await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// A registered task: its defaults, its body and, for periodic tasks, when
/// to run it.
pub struct RegisteredTask {
    /// Registered defaults
    pub options: TaskOptions,
    /// The body
    pub invocable: Arc<dyn Invocable>,
    /// Schedule for periodic tasks
    pub crontab: Option<Crontab>,
}

impl RegisteredTask {
    /// Whether the scheduler enqueues this task on its own.
    pub fn is_periodic(&self) -> bool {
        self.crontab.is_some()
    }
}

impl std::fmt::Debug for RegisteredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("options", &self.options)
            .field("crontab", &self.crontab)
            .finish_non_exhaustive()
    }
}

/// Statistics for a registered task name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskTypeStats {
    /// Total number of body runs
    pub total_executed: u64,
    /// Runs that returned a value
    pub successful: u64,
    /// Runs that failed (including panics)
    pub failed: u64,
    /// Runs that could not take a lock
    pub locked: u64,
    /// Runs that asked to be retried or were cancelled
    pub deferred: u64,
    /// Average run time
    pub avg_duration: Option<Duration>,
    /// Last run
    pub last_executed: Option<DateTime<Utc>>,
}

/// Summary of the registry state.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrySummary {
    /// Registered names, sorted
    pub registered: Vec<String>,
    /// Names that run on a crontab
    pub periodic: usize,
    /// Total body runs
    pub total_executed: u64,
    /// Total successful runs
    pub total_successful: u64,
    /// Total failed runs
    pub total_failed: u64,
}

/// Maps task names to their bodies.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<RegisteredTask>>>,
    stats: RwLock<HashMap<String, TaskTypeStats>>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("registered", &self.names())
            .finish()
    }
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `invocable` under `options.name`. Names are unique.
    pub fn register(
        &self,
        options: TaskOptions,
        invocable: Arc<dyn Invocable>,
        crontab: Option<Crontab>,
    ) -> ScroogeResult<()> {
        let name = options.name.clone();
        if name.is_empty() {
            return Err(ScroogeError::config("task name must not be empty"));
        }

        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        if tasks.contains_key(&name) {
            return Err(ScroogeError::config(format!(
                "a task named '{}' is already registered",
                name
            )));
        }

        tracing::info!(
            "Registering task '{}'{}",
            name,
            crontab
                .as_ref()
                .map(|c| format!(" (periodic: {})", c))
                .unwrap_or_default()
        );

        tasks.insert(
            name.clone(),
            Arc::new(RegisteredTask {
                options,
                invocable,
                crontab,
            }),
        );
        self.stats
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name)
            .or_default();
        Ok(())
    }

    /// Remove a registration. Returns whether it existed.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            tracing::debug!("Unregistered task '{}'", name);
        }
        removed
    }

    /// Look up a registration.
    pub fn get(&self, name: &str) -> Option<Arc<RegisteredTask>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Whether `name` is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = tasks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every periodic registration, sorted by name.
    pub fn periodic(&self) -> Vec<Arc<RegisteredTask>> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        let mut periodic: Vec<Arc<RegisteredTask>> = tasks
            .values()
            .filter(|task| task.is_periodic())
            .cloned()
            .collect();
        periodic.sort_by(|a, b| a.options.name.cmp(&b.options.name));
        periodic
    }

    /// Record one body run.
    pub(crate) fn record(&self, name: &str, outcome: &Result<Value, TaskError>, duration: Duration) {
        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        let entry = stats.entry(name.to_string()).or_default();

        entry.total_executed += 1;
        entry.last_executed = Some(Utc::now());
        match outcome {
            Ok(_) => entry.successful += 1,
            Err(TaskError::Locked(_)) => entry.locked += 1,
            Err(TaskError::Retry { .. }) | Err(TaskError::Cancel { .. }) => entry.deferred += 1,
            Err(TaskError::Failed(_)) => entry.failed += 1,
        }

        // Exponential moving average
        entry.avg_duration = Some(match entry.avg_duration {
            Some(avg) => {
                let alpha = 0.1;
                let nanos =
                    alpha * duration.as_nanos() as f64 + (1.0 - alpha) * avg.as_nanos() as f64;
                Duration::from_nanos(nanos as u64)
            }
            None => duration,
        });
    }

    /// Statistics for `name`.
    pub fn stats(&self, name: &str) -> Option<TaskTypeStats> {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Statistics for every name that ever ran or was registered.
    pub fn all_stats(&self) -> HashMap<String, TaskTypeStats> {
        self.stats.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Reset every counter.
    pub fn reset_stats(&self) {
        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        for entry in stats.values_mut() {
            *entry = TaskTypeStats::default();
        }
        tracing::info!("Task registry statistics reset");
    }

    /// Summary of the registry state.
    pub fn summary(&self) -> RegistrySummary {
        let all_stats = self.all_stats();
        RegistrySummary {
            registered: self.names(),
            periodic: self.periodic().len(),
            total_executed: all_stats.values().map(|s| s.total_executed).sum(),
            total_successful: all_stats.values().map(|s| s.successful).sum(),
            total_failed: all_stats.values().map(|s| s.failed).sum(),
        }
    }
}

/// Handle to a registered task. Built once by [`Scrooge::task`] and kept by
/// the application.
pub struct TaskWrapper<A, R> {
    scrooge: Scrooge,
    options: TaskOptions,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for TaskWrapper<A, R> {
    fn clone(&self) -> Self {
        Self {
            scrooge: self.scrooge.clone(),
            options: self.options.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, R> std::fmt::Debug for TaskWrapper<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskWrapper")
            .field("queue", &self.scrooge.name())
            .field("options", &self.options)
            .finish()
    }
}

impl<A, R> TaskWrapper<A, R>
where
    A: Serialize,
    R: DeserializeOwned,
{
    pub(crate) fn new(scrooge: Scrooge, options: TaskOptions) -> Self {
        Self {
            scrooge,
            options,
            _marker: PhantomData,
        }
    }

    /// Registered name.
    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Registered defaults.
    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    /// Build a task without enqueueing it.
    pub fn s(&self, args: A) -> ScroogeResult<Task> {
        self.s_with(args, ScheduleOptions::default())
    }

    /// Build a task with overrides, without enqueueing it.
    pub fn s_with(&self, args: A, options: ScheduleOptions) -> ScroogeResult<Task> {
        build_task(&self.options, serde_json::to_value(args)?, options)
    }

    /// Enqueue a run with the registered defaults.
    pub async fn call(&self, args: A) -> ScroogeResult<ResultHandle<R>> {
        self.schedule(args, ScheduleOptions::default()).await
    }

    /// Enqueue a run with per-call overrides.
    pub async fn schedule(&self, args: A, options: ScheduleOptions) -> ScroogeResult<ResultHandle<R>> {
        let task = self.s_with(args, options)?;
        let handle = self.scrooge.enqueue(task).await?;
        Ok(handle.typed())
    }

    /// Revoke every task of this name.
    pub async fn revoke(&self, options: RevokeOptions) -> ScroogeResult<()> {
        self.scrooge.revoke_all(&self.options.name, options).await
    }

    /// Undo [`TaskWrapper::revoke`]. Returns whether a marker was removed.
    pub async fn restore(&self) -> ScroogeResult<bool> {
        self.scrooge.restore_all(&self.options.name).await
    }

    /// Whether tasks of this name are currently revoked. Never consumes a
    /// one-shot marker.
    pub async fn is_revoked(&self, timestamp: Option<DateTime<Utc>>) -> ScroogeResult<bool> {
        self.scrooge
            .is_revoked_all(&self.options.name, timestamp.unwrap_or_else(Utc::now), true)
            .await
    }

    /// Run the body in place, bypassing storage, signals and hooks.
    pub async fn call_local(&self, args: A) -> Result<R, TaskError> {
        let registered = self
            .scrooge
            .registry()
            .get(&self.options.name)
            .ok_or_else(|| TaskError::failed(format!("task '{}' is not registered", self.options.name)))?;

        let call = TaskCall {
            task_id: uuid::Uuid::new_v4().to_string(),
            args: serde_json::to_value(args)?,
            kwargs: Map::new(),
        };
        let value = registered.invocable.invoke(call).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Scrooge {
    /// Register a typed task body. `A` is decoded from the task's args and the
    /// body's output becomes the stored result.
    pub fn task<A, R, F, Fut>(&self, options: TaskOptions, f: F) -> ScroogeResult<TaskWrapper<A, R>>
    where
        A: Serialize + DeserializeOwned + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, TaskError>> + Send + 'static,
    {
        let invocable = Arc::new(TypedInvocable {
            f,
            _marker: PhantomData,
        });
        self.registry().register(options.clone(), invocable, None)?;
        Ok(TaskWrapper::new(self.clone(), options))
    }

    /// Register a task that the scheduler enqueues whenever `crontab` matches.
    /// Periodic tasks take no arguments and never store results.
    pub fn periodic_task<R, F, Fut>(
        &self,
        crontab: Crontab,
        options: TaskOptions,
        f: F,
    ) -> ScroogeResult<TaskWrapper<(), R>>
    where
        R: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, TaskError>> + Send + 'static,
    {
        let invocable = Arc::new(TypedInvocable {
            f: move |_: ()| f(),
            _marker: PhantomData,
        });
        self.registry()
            .register(options.clone(), invocable, Some(crontab))?;
        Ok(TaskWrapper::new(self.clone(), options))
    }

    /// Register any [`Invocable`] under `options.name`.
    pub fn register(
        &self,
        options: TaskOptions,
        invocable: Arc<dyn Invocable>,
    ) -> ScroogeResult<TaskWrapper<Value, Value>> {
        self.registry().register(options.clone(), invocable, None)?;
        Ok(TaskWrapper::new(self.clone(), options))
    }
}
