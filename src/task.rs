//! Task definition and scheduling options.
//!
//! A [`Task`] is the persisted unit of work: a registered name, a JSON
//! payload and the execution policy that travels with it. Tasks are built by
//! [`TaskWrapper`](crate::core::registry::TaskWrapper)s from the registered
//! [`TaskOptions`] plus per-call [`ScheduleOptions`].

use crate::error::{ScroogeError, ScroogeResult};
use crate::utils::add_delay;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Unique identifier for a task
pub type TaskId = String;

/// A single unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier, preserved across retries
    pub id: TaskId,
    /// Registered task name
    pub name: String,
    /// Positional payload
    #[serde(default)]
    pub args: Value,
    /// Keyword payload
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Higher runs first
    #[serde(default)]
    pub priority: i32,
    /// Remaining retries
    #[serde(default)]
    pub retries: u32,
    /// Seconds to wait before a retry
    #[serde(default)]
    pub retry_delay: u64,
    /// Do not run before this time
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
    /// Do not run after this time
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a task with default policy and a fresh id.
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            args,
            kwargs: Map::new(),
            priority: 0,
            retries: 0,
            retry_delay: 0,
            eta: None,
            expires: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry policy.
    pub fn with_retries(mut self, retries: u32, retry_delay: u64) -> Self {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Set the earliest execution time.
    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    /// Set the expiry time.
    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Set the keyword payload.
    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Whether the task may not run yet at `now`.
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.eta.is_some_and(|eta| eta > now)
    }

    /// Whether the task must not run anymore at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| now > expires)
    }

    /// Storage key of the per-task revocation marker.
    pub(crate) fn revoke_id(&self) -> String {
        revoke_key_for_id(&self.id)
    }

    /// Storage key of the revocation marker shared by every task of this name.
    pub(crate) fn revoke_name_id(&self) -> String {
        revoke_key_for_name(&self.name)
    }

    /// Serialize for storage.
    pub fn serialize(&self) -> ScroogeResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from storage.
    pub fn deserialize(data: &[u8]) -> ScroogeResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

pub(crate) fn revoke_key_for_id(id: &str) -> String {
    format!("r:{}", id)
}

pub(crate) fn revoke_key_for_name(name: &str) -> String {
    format!("rt:{}", name)
}

/// When a task stops being runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Relative to the moment the task is created
    After(Duration),
    /// Absolute point in time
    At(DateTime<Utc>),
}

impl Expiry {
    /// Resolve against the creation time.
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Expiry::After(delay) => add_delay(now, *delay),
            Expiry::At(at) => *at,
        }
    }
}

/// Registered defaults for a task name.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOptions {
    /// Registered name
    pub name: String,
    /// Default priority
    pub priority: i32,
    /// Default retries
    pub retries: u32,
    /// Default retry delay in seconds
    pub retry_delay: u64,
    /// Default expiry
    pub expires: Option<Expiry>,
}

impl TaskOptions {
    /// Options with default policy for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            retries: 0,
            retry_delay: 0,
            expires: None,
        }
    }

    /// Set the default priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the default retries.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the default retry delay in seconds.
    pub fn retry_delay(mut self, seconds: u64) -> Self {
        self.retry_delay = seconds;
        self
    }

    /// Set the default expiry.
    pub fn expires(mut self, expires: Expiry) -> Self {
        self.expires = Some(expires);
        self
    }
}

/// Per-call overrides. Anything left unset falls back to the registered
/// [`TaskOptions`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleOptions {
    /// Absolute earliest execution time
    pub eta: Option<DateTime<Utc>>,
    /// Earliest execution time relative to now
    pub delay: Option<Duration>,
    /// Priority override
    pub priority: Option<i32>,
    /// Retries override
    pub retries: Option<u32>,
    /// Retry delay override in seconds
    pub retry_delay: Option<u64>,
    /// Expiry override
    pub expires: Option<Expiry>,
    /// Keyword payload
    pub kwargs: Map<String, Value>,
}

impl ScheduleOptions {
    /// Run no earlier than `eta`.
    pub fn eta(eta: DateTime<Utc>) -> Self {
        Self {
            eta: Some(eta),
            ..Default::default()
        }
    }

    /// Run no earlier than `delay` from now.
    pub fn delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Override the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Override the retries.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Override the retry delay.
    pub fn with_retry_delay(mut self, seconds: u64) -> Self {
        self.retry_delay = Some(seconds);
        self
    }

    /// Override the expiry.
    pub fn with_expires(mut self, expires: Expiry) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Attach a keyword argument.
    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    /// Resolve `eta`/`delay` into an absolute time.
    pub fn resolve_eta(&self, now: DateTime<Utc>) -> ScroogeResult<Option<DateTime<Utc>>> {
        match (self.eta, self.delay) {
            (Some(_), Some(_)) => Err(ScroogeError::config(
                "both an eta and a delay were specified; pick one",
            )),
            (Some(eta), None) => Ok(Some(eta)),
            (None, Some(delay)) => Ok(Some(add_delay(now, delay))),
            (None, None) => Ok(None),
        }
    }
}

/// Build a task for `defaults`, applying `overrides`.
pub(crate) fn build_task(
    defaults: &TaskOptions,
    args: Value,
    overrides: ScheduleOptions,
) -> ScroogeResult<Task> {
    let now = Utc::now();
    let eta = overrides.resolve_eta(now)?;
    let expires = overrides
        .expires
        .or(defaults.expires)
        .map(|expiry| expiry.resolve(now));

    Ok(Task {
        id: uuid::Uuid::new_v4().to_string(),
        name: defaults.name.clone(),
        args,
        kwargs: overrides.kwargs,
        priority: overrides.priority.unwrap_or(defaults.priority),
        retries: overrides.retries.unwrap_or(defaults.retries),
        retry_delay: overrides.retry_delay.unwrap_or(defaults.retry_delay),
        eta,
        expires,
    })
}
