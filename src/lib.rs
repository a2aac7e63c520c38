//! # Scrooge
//!
//! A lightweight task queue with pluggable storage.
//!
//! ## Features
//!
//! - **Pluggable Storage**: in-memory, file, Redis and SQLite backends behind one trait
//! - **Typed Tasks**: register async closures, enqueue with typed arguments
//! - **Scheduling**: priorities, delays, ETAs, expiry and crontab periodic tasks
//! - **Retries and Locks**: retry policies, storage-backed named locks, revocation
//! - **Signals and Hooks**: observe every step of a task's life
//! - **Consumer**: thread, process or greenlet workers with health checks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scrooge::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> ScroogeResult<()> {
//!     let scrooge = Scrooge::memory("jobs");
//!
//!     let add = scrooge.task(
//!         TaskOptions::new("add").retries(2),
//!         |(a, b): (i64, i64)| async move { Ok::<_, TaskError>(a + b) },
//!     )?;
//!
//!     let consumer = Consumer::new(scrooge.clone(), ConsumerConfig::with_workers(2));
//!     consumer.start().await?;
//!
//!     let result = add.call((1, 2)).await?;
//!     assert_eq!(result.get_blocking(Some(Duration::from_secs(5))).await?, 3);
//!
//!     consumer.stop(true).await
//! }
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod crontab;
pub mod error;
pub mod logging;
pub mod result;
pub mod signals;
pub mod storage;
pub mod task;
pub mod utils;

pub mod prelude {
    pub use crate::config::{
        ConsumerConfig, EngineConfig, ScroogeConfig, StorageConfig, WorkerType,
    };
    pub use crate::core::{
        Consumer, Invocable, RevokeOptions, Scrooge, TaskCall, TaskLock, TaskWrapper, handler_fn,
    };
    pub use crate::crontab::Crontab;
    pub use crate::error::{ScroogeError, ScroogeResult, TaskError, TaskFailure};
    pub use crate::result::{GetOptions, ResultHandle};
    pub use crate::signals::{Signal, SignalEvent};
    pub use crate::storage::Storage;
    pub use crate::task::{Expiry, ScheduleOptions, Task, TaskId, TaskOptions};
    pub use async_trait::async_trait;
}

pub use crate::config::{ConsumerConfig, ScroogeConfig, WorkerType};
pub use crate::core::{Consumer, RevokeOptions, Scrooge};
pub use crate::error::{ScroogeError, ScroogeResult, TaskError};
pub use crate::result::ResultHandle;
pub use crate::task::{ScheduleOptions, Task, TaskOptions};
