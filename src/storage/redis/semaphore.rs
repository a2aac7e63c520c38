//! Counting locks on Redis.
//!
//! Holders are members of a sorted set scored by acquisition time. A holder
//! is admitted when its rank is below the semaphore's value; members older
//! than the timeout are pruned first, so a holder that died without
//! releasing eventually frees its slot.

use super::{RedisStorage, redis_error};
use crate::error::{ScroogeResult, TaskError};
use crate::utils::panic_message;
use futures::FutureExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use uuid::Uuid;

/// How long a holder may keep its slot before it is presumed dead.
pub const DEFAULT_SEMAPHORE_TIMEOUT: Duration = Duration::from_secs(86_400);

/// A lock that up to `value` holders can take at once.
///
/// There is no blocking or waiting: [`RedisSemaphore::acquire`] either gets a
/// slot or returns `None`.
#[derive(Clone)]
pub struct RedisSemaphore {
    conn: ConnectionManager,
    name: String,
    key: String,
    value: usize,
    timeout: Duration,
}

impl std::fmt::Debug for RedisSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSemaphore")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("value", &self.value)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl RedisStorage {
    /// Semaphore `name` admitting `value` holders, stored under the result
    /// key `key` so flushing that key clears it.
    pub fn semaphore(
        &self,
        name: &str,
        key: &str,
        value: usize,
        timeout: Option<Duration>,
    ) -> RedisSemaphore {
        RedisSemaphore {
            conn: self.conn.clone(),
            name: name.to_string(),
            key: self.result_key(key),
            value: value.max(1),
            timeout: timeout.unwrap_or(DEFAULT_SEMAPHORE_TIMEOUT),
        }
    }
}

impl RedisSemaphore {
    /// Semaphore name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many holders are admitted at once.
    pub fn value(&self) -> usize {
        self.value
    }

    /// Take a slot as `holder` (a fresh id when `None`). Returns the holder
    /// id on success. Acquiring again with an id that already holds a slot
    /// keeps it.
    pub async fn acquire(&self, holder: Option<&str>) -> ScroogeResult<Option<String>> {
        let holder = holder
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = now_seconds();
        let mut conn = self.conn.clone();

        let (rank,): (Option<usize>,) = redis::pipe()
            .atomic()
            .zrembyscore(&self.key, "-inf", now - self.timeout.as_secs_f64())
            .ignore()
            .zadd(&self.key, &holder, now)
            .ignore()
            .zrank(&self.key, &holder)
            .query_async(&mut conn)
            .await
            .map_err(redis_error("Failed to acquire semaphore"))?;

        if rank.is_some_and(|rank| rank < self.value) {
            tracing::debug!("Acquired semaphore '{}' as {}", self.name, holder);
            return Ok(Some(holder));
        }

        let _: u64 = conn
            .zrem(&self.key, &holder)
            .await
            .map_err(redis_error("Failed to back out of semaphore"))?;
        tracing::debug!("Semaphore '{}' is full", self.name);
        Ok(None)
    }

    /// Give back `holder`'s slot. Returns whether it held one.
    pub async fn release(&self, holder: &str) -> ScroogeResult<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn
            .zrem(&self.key, holder)
            .await
            .map_err(redis_error("Failed to release semaphore"))?;
        Ok(removed > 0)
    }

    /// Run `body` while holding a slot.
    ///
    /// When no slot is free the body never runs and [`TaskError::Locked`] is
    /// returned, which a task with retries turns into a retry.
    pub async fn run<F, T>(&self, body: F) -> Result<T, TaskError>
    where
        F: Future<Output = Result<T, TaskError>>,
    {
        let Some(holder) = self.acquire(None).await? else {
            return Err(TaskError::Locked(self.name.clone()));
        };

        let outcome = AssertUnwindSafe(body).catch_unwind().await;
        if let Err(e) = self.release(&holder).await {
            tracing::error!("Failed to release semaphore '{}': {}", self.name, e);
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                tracing::warn!(
                    "Body holding semaphore '{}' panicked: {}",
                    self.name,
                    panic_message(&*panic)
                );
                std::panic::resume_unwind(panic)
            }
        }
    }
}
