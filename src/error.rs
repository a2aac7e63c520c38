//! Error types for Scrooge operations.
//!
//! Two families live here. [`ScroogeError`] covers everything the engine,
//! storage backends and the consumer can fail with. [`TaskError`] is what a
//! task body returns; the engine turns it into signals, stored failures and
//! retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type used throughout Scrooge.
pub type ScroogeResult<T> = Result<T, ScroogeError>;

/// Description of a failed task execution, as kept in the result store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Id of the task that failed
    pub task_id: String,
    /// Registered task name
    pub name: String,
    /// Description of the original error
    pub error: String,
    /// Retries that were left when the failure was recorded
    pub retries: u32,
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.name, self.task_id, self.error)
    }
}

/// Main error type for Scrooge operations.
#[derive(Error, Debug)]
pub enum ScroogeError {
    /// Storage backend failure (unreachable, corrupt, rejected command)
    #[error("Storage error: {message}")]
    Storage {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Task name not found in registry
    #[error("Task '{name}' not found in registry")]
    TaskNotFound {
        /// The task name that wasn't found
        name: String,
    },

    /// The task behind a result handle failed
    #[error("Task failed: {0}")]
    TaskException(TaskFailure),

    /// A blocking result read gave up
    #[error("Timed out after {timeout:?} waiting for the result of task {task_id}")]
    ResultTimeout {
        /// Task whose result was awaited
        task_id: String,
        /// How long we waited
        timeout: Duration,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// Consumer is already running
    #[error("Consumer is already running")]
    AlreadyRunning,

    /// Consumer is not running
    #[error("Consumer is not running")]
    NotRunning,

    /// I/O error (spawning workers, reading config files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScroogeError {
    /// Create a new storage error
    pub fn storage<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether this is a connection-class storage failure.
    pub fn is_storage_error(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}

/// Outcome of a task body that did not complete normally.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// The body failed; eligible for retry
    #[error("{0}")]
    Failed(String),

    /// A lock needed by the body is held elsewhere; never retried
    #[error("unable to acquire lock '{0}'")]
    Locked(String),

    /// The body asks to be retried, even when no retries are left
    #[error("retry requested: {message}")]
    Retry {
        /// Why the body asked for a retry
        message: String,
        /// Overrides the task's retry delay
        delay: Option<Duration>,
        /// Overrides the task's retry delay with an absolute time
        eta: Option<DateTime<Utc>>,
    },

    /// Execution was cancelled
    #[error("execution canceled")]
    Cancel {
        /// Retry the task if it has retries left
        retry: bool,
    },
}

impl TaskError {
    /// A plain failure.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }

    /// Ask for an immediate retry.
    pub fn retry(message: impl Into<String>) -> Self {
        Self::Retry {
            message: message.into(),
            delay: None,
            eta: None,
        }
    }

    /// Ask for a retry after `delay`.
    pub fn retry_after(message: impl Into<String>, delay: Duration) -> Self {
        Self::Retry {
            message: message.into(),
            delay: Some(delay),
            eta: None,
        }
    }

    /// Cancel the execution without retrying.
    pub fn cancel() -> Self {
        Self::Cancel { retry: false }
    }
}

impl From<ScroogeError> for TaskError {
    fn from(error: ScroogeError) -> Self {
        Self::Failed(error.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(error: serde_json::Error) -> Self {
        Self::Failed(format!("serialization error: {}", error))
    }
}

impl From<std::io::Error> for TaskError {
    fn from(error: std::io::Error) -> Self {
        Self::Failed(error.to_string())
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::Failed(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::Failed(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_failure_display() {
        let failure = TaskFailure {
            task_id: "abc".to_string(),
            name: "add".to_string(),
            error: "boom".to_string(),
            retries: 0,
        };
        let error = ScroogeError::TaskException(failure);
        assert_eq!(error.to_string(), "Task failed: add (abc): boom");
    }

    #[test]
    fn test_task_error_conversions() {
        let error: TaskError = "boom".into();
        assert_eq!(error, TaskError::Failed("boom".to_string()));

        let error: TaskError = ScroogeError::config("bad").into();
        assert!(matches!(error, TaskError::Failed(msg) if msg.contains("bad")));

        assert!(matches!(
            TaskError::retry_after("later", Duration::from_secs(5)),
            TaskError::Retry { delay: Some(_), eta: None, .. }
        ));
    }

    #[test]
    fn test_storage_error_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(ScroogeError::storage("connect", io).is_storage_error());
        assert!(!ScroogeError::config("nope").is_storage_error());
    }
}
