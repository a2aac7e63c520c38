//! Storage-backed named locks.
//!
//! A lock is a key in the result store written with
//! [`Storage::put_if_empty`]; whoever writes it holds the lock until the key
//! is deleted. Because the key lives in storage, a lock taken by one process
//! is visible to every other process sharing that storage.

use crate::error::{ScroogeResult, TaskError};
use crate::storage::Storage;
use crate::utils::panic_message;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

const LOCK_VALUE: &[u8] = b"1";

/// A named lock scoped to one queue.
///
/// ```rust,no_run
/// use scrooge::prelude::*;
///
/// # async fn example(scrooge: Scrooge) -> Result<(), TaskError> {
/// let lock = scrooge.lock_task("reports");
/// let total = lock.run(async { Ok::<_, TaskError>(42) }).await?;
/// # let _ = total;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TaskLock {
    storage: Arc<dyn Storage>,
    name: String,
    key: String,
}

impl std::fmt::Debug for TaskLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLock")
            .field("name", &self.name)
            .field("key", &self.key)
            .finish()
    }
}

/// Storage key of the lock `name` on queue `queue`.
pub(crate) fn lock_key(queue: &str, name: &str) -> String {
    format!("{}.lock.{}", queue, name)
}

impl TaskLock {
    pub(crate) fn new(storage: Arc<dyn Storage>, queue: &str, name: &str) -> Self {
        Self {
            storage,
            name: name.to_string(),
            key: lock_key(queue, name),
        }
    }

    /// Lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage key holding the lock.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Run `body` while holding the lock.
    ///
    /// When the lock is taken the body never runs and
    /// [`TaskError::Locked`] is returned. The lock is released whatever the
    /// body does, including panicking; the panic is then resumed.
    pub async fn run<F, T>(&self, body: F) -> Result<T, TaskError>
    where
        F: Future<Output = Result<T, TaskError>>,
    {
        let Some(guard) = self.acquire().await? else {
            return Err(TaskError::Locked(self.name.clone()));
        };

        let outcome = AssertUnwindSafe(body).catch_unwind().await;
        if let Err(e) = guard.release().await {
            tracing::error!("Failed to release lock '{}': {}", self.name, e);
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                tracing::warn!(
                    "Body holding lock '{}' panicked: {}",
                    self.name,
                    panic_message(&*panic)
                );
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Take the lock if it is free. The returned guard releases it.
    pub async fn acquire(&self) -> ScroogeResult<Option<LockGuard>> {
        if self
            .storage
            .put_if_empty(&self.key, LOCK_VALUE.to_vec())
            .await?
        {
            tracing::debug!("Acquired lock '{}'", self.name);
            Ok(Some(LockGuard {
                storage: Arc::clone(&self.storage),
                key: self.key.clone(),
                released: false,
            }))
        } else {
            tracing::debug!("Lock '{}' is already held", self.name);
            Ok(None)
        }
    }

    /// Whether someone holds the lock.
    pub async fn is_locked(&self) -> ScroogeResult<bool> {
        self.storage.has(&self.key).await
    }

    /// Force-release the lock. Returns whether it was held.
    pub async fn clear(&self) -> ScroogeResult<bool> {
        self.storage.delete(&self.key).await
    }
}

/// Held lock. Call [`LockGuard::release`]; dropping the guard releases it on
/// the current tokio runtime as a fallback.
#[must_use = "the lock is released when the guard is dropped"]
pub struct LockGuard {
    storage: Arc<dyn Storage>,
    key: String,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    /// Release the lock.
    pub async fn release(mut self) -> ScroogeResult<()> {
        self.released = true;
        self.storage.delete(&self.key).await?;
        tracing::debug!("Released lock '{}'", self.key);
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let storage = Arc::clone(&self.storage);
                let key = std::mem::take(&mut self.key);
                handle.spawn(async move {
                    if let Err(e) = storage.delete(&key).await {
                        tracing::error!("Failed to release lock '{}' on drop: {}", key, e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    "Lock '{}' dropped outside a runtime and was not released",
                    self.key
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn lock(storage: &Arc<dyn Storage>) -> TaskLock {
        TaskLock::new(Arc::clone(storage), "jobs", "report")
    }

    #[tokio::test]
    async fn test_second_holder_is_locked_out() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new("jobs"));
        let first = lock(&storage);
        let second = lock(&storage);
        assert_eq!(first.key(), "jobs.lock.report");

        let guard = first.acquire().await.unwrap().unwrap();
        assert!(second.is_locked().await.unwrap());
        assert!(second.acquire().await.unwrap().is_none());

        let ran = second.run(async { Ok::<_, TaskError>(1) }).await;
        assert_eq!(ran, Err(TaskError::Locked("report".to_string())));

        guard.release().await.unwrap();
        assert!(!second.is_locked().await.unwrap());
        assert_eq!(second.run(async { Ok::<_, TaskError>(1) }).await, Ok(1));
    }

    #[tokio::test]
    async fn test_released_after_error() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new("jobs"));
        let lock = lock(&storage);

        let result: Result<(), TaskError> = lock.run(async { Err(TaskError::failed("boom")) }).await;
        assert_eq!(result, Err(TaskError::failed("boom")));
        assert!(!lock.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_released_after_panic() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new("jobs"));
        let lock = lock(&storage);

        let panicked = AssertUnwindSafe(lock.run(async {
            if lock.name() == "report" {
                panic!("body exploded");
            }
            Ok::<_, TaskError>(())
        }))
        .catch_unwind()
        .await;
        assert!(panicked.is_err());
        assert!(!lock.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_guard_drop_and_clear() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new("jobs"));
        let lock = lock(&storage);

        {
            let _guard = lock.acquire().await.unwrap().unwrap();
        }
        // The drop spawns the release; let it run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!lock.is_locked().await.unwrap());

        let _guard = lock.acquire().await.unwrap().unwrap();
        assert!(lock.clear().await.unwrap());
        assert!(!lock.clear().await.unwrap());
    }
}
