//! Result handles and the stored result format.
//!
//! Enqueueing hands back a [`ResultHandle`]: the task id plus a reference to
//! the engine. The handle owns no result data; it reads the result store when
//! asked.

use crate::core::{RevokeOptions, Scrooge};
use crate::error::{ScroogeError, ScroogeResult, TaskFailure};
use crate::task::{Expiry, ScheduleOptions, Task, TaskId, TaskOptions, build_task};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::time::Duration;
use tokio::time::Instant;

/// What the result store holds for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StoredResult {
    /// The body's return value
    Value(Value),
    /// The body failed
    Error(TaskFailure),
}

impl StoredResult {
    /// Serialize for storage.
    pub fn to_bytes(&self) -> ScroogeResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from storage.
    pub fn from_bytes(data: &[u8]) -> ScroogeResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// The value, or the stored failure as [`ScroogeError::TaskException`].
    pub fn into_result(self) -> ScroogeResult<Value> {
        match self {
            StoredResult::Value(value) => Ok(value),
            StoredResult::Error(failure) => Err(ScroogeError::TaskException(failure)),
        }
    }
}

/// How [`ResultHandle::get_with`] reads the result.
#[derive(Debug, Clone, PartialEq)]
pub struct GetOptions {
    /// Poll until the result shows up
    pub blocking: bool,
    /// Give up after this long; `None` waits forever
    pub timeout: Option<Duration>,
    /// Leave the result in the store
    pub preserve: bool,
    /// Polling delay multiplier
    pub backoff: f64,
    /// Upper bound for the polling delay
    pub max_delay: Duration,
    /// First polling delay
    pub initial_delay: Duration,
    /// Revoke the task when the wait times out
    pub revoke_on_timeout: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            blocking: false,
            timeout: None,
            preserve: false,
            backoff: 1.15,
            max_delay: Duration::from_secs(1),
            initial_delay: Duration::from_millis(100),
            revoke_on_timeout: false,
        }
    }
}

impl GetOptions {
    /// Block until the result arrives or `timeout` passes.
    pub fn blocking(timeout: Option<Duration>) -> Self {
        Self {
            blocking: true,
            timeout,
            ..Default::default()
        }
    }

    /// Keep the result in the store after reading it.
    pub fn preserve(mut self) -> Self {
        self.preserve = true;
        self
    }

    /// Revoke the task if the blocking read times out.
    pub fn revoke_on_timeout(mut self) -> Self {
        self.revoke_on_timeout = true;
        self
    }
}

/// Caller-held reference to a task's eventual outcome.
pub struct ResultHandle<R = Value> {
    scrooge: Scrooge,
    task: Task,
    _marker: PhantomData<fn() -> R>,
}

impl<R> Clone for ResultHandle<R> {
    fn clone(&self) -> Self {
        Self {
            scrooge: self.scrooge.clone(),
            task: self.task.clone(),
            _marker: PhantomData,
        }
    }
}

impl<R> std::fmt::Debug for ResultHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultHandle")
            .field("queue", &self.scrooge.name())
            .field("task_id", &self.task.id)
            .field("name", &self.task.name)
            .finish()
    }
}

impl ResultHandle<Value> {
    pub(crate) fn new(scrooge: Scrooge, task: Task) -> Self {
        Self {
            scrooge,
            task,
            _marker: PhantomData,
        }
    }
}

impl<R> ResultHandle<R> {
    /// Reinterpret the result type.
    pub fn typed<R2>(self) -> ResultHandle<R2> {
        ResultHandle {
            scrooge: self.scrooge,
            task: self.task,
            _marker: PhantomData,
        }
    }

    /// Id of the task.
    pub fn id(&self) -> &TaskId {
        &self.task.id
    }

    /// The task as it was enqueued.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// When the task is due, if it was scheduled.
    pub fn eta(&self) -> Option<DateTime<Utc>> {
        self.task.eta
    }

    /// Revoke this task.
    pub async fn revoke(&self, options: RevokeOptions) -> ScroogeResult<()> {
        self.scrooge.revoke(&self.task, options).await
    }

    /// Undo [`ResultHandle::revoke`]. Returns whether a marker was removed.
    pub async fn restore(&self) -> ScroogeResult<bool> {
        self.scrooge.restore(&self.task).await
    }

    /// Whether the task is revoked right now. Never consumes a one-shot
    /// marker.
    pub async fn is_revoked(&self) -> ScroogeResult<bool> {
        self.scrooge.is_revoked(&self.task, Utc::now(), true).await
    }

    /// Enqueue the same call again under a new id, revoking this one once so
    /// a copy still waiting in storage does not run as well.
    pub async fn reschedule(&self, options: ScheduleOptions) -> ScroogeResult<ResultHandle<R>> {
        self.scrooge.revoke(&self.task, RevokeOptions::once()).await?;

        let mut defaults = TaskOptions::new(self.task.name.clone())
            .priority(self.task.priority)
            .retries(self.task.retries)
            .retry_delay(self.task.retry_delay);
        if let Some(expires) = self.task.expires {
            defaults = defaults.expires(Expiry::At(expires));
        }

        let mut options = options;
        if options.kwargs.is_empty() {
            options.kwargs = self.task.kwargs.clone();
        }

        let task = build_task(&defaults, self.task.args.clone(), options)?;
        tracing::debug!("Rescheduling task {} as {}", self.task.id, task.id);
        let handle = self.scrooge.enqueue(task).await?;
        Ok(handle.typed())
    }
}

impl<R: DeserializeOwned> ResultHandle<R> {
    /// Non-blocking read that removes the result from the store.
    ///
    /// `Ok(None)` means there is no result yet. A stored failure comes back
    /// as [`ScroogeError::TaskException`].
    pub async fn get(&self) -> ScroogeResult<Option<R>> {
        self.get_with(GetOptions::default()).await
    }

    /// Block until the result is available or `timeout` passes.
    pub async fn get_blocking(&self, timeout: Option<Duration>) -> ScroogeResult<R> {
        match self.get_with(GetOptions::blocking(timeout)).await? {
            Some(value) => Ok(value),
            None => Err(ScroogeError::ResultTimeout {
                task_id: self.task.id.clone(),
                timeout: timeout.unwrap_or_default(),
            }),
        }
    }

    /// Read the result with explicit options.
    pub async fn get_with(&self, options: GetOptions) -> ScroogeResult<Option<R>> {
        if !options.blocking {
            return self.read_once(options.preserve).await;
        }

        let started = Instant::now();
        let mut delay = options.initial_delay;
        loop {
            if let Some(value) = self.read_once(options.preserve).await? {
                return Ok(Some(value));
            }

            if let Some(timeout) = options.timeout {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    if options.revoke_on_timeout {
                        self.revoke(RevokeOptions::default()).await?;
                    }
                    return Err(ScroogeError::ResultTimeout {
                        task_id: self.task.id.clone(),
                        timeout,
                    });
                }
                delay = delay.min(timeout - elapsed);
            }

            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(options.backoff.max(1.0)).min(options.max_delay);
        }
    }

    async fn read_once(&self, preserve: bool) -> ScroogeResult<Option<R>> {
        match self.scrooge.result(&self.task.id, preserve).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}
