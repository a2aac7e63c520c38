//! Memory storage whose writes can be made to fail on demand.

use super::{MemoryStorage, Storage};
use crate::error::{ScroogeError, ScroogeResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub(crate) struct FlakyStorage {
    inner: MemoryStorage,
    pub(crate) fail_enqueue: AtomicBool,
    pub(crate) fail_put_result: AtomicBool,
    pub(crate) schedule_adds: AtomicUsize,
}

impl FlakyStorage {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            inner: MemoryStorage::new(name),
            fail_enqueue: AtomicBool::new(false),
            fail_put_result: AtomicBool::new(false),
            schedule_adds: AtomicUsize::new(0),
        }
    }

    fn refuse(what: &str) -> ScroogeError {
        ScroogeError::storage(
            format!("{} refused", what),
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "storage is down"),
        )
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn enqueue(&self, data: Vec<u8>, priority: i32) -> ScroogeResult<()> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(Self::refuse("enqueue"));
        }
        self.inner.enqueue(data, priority).await
    }

    async fn dequeue(&self) -> ScroogeResult<Option<Vec<u8>>> {
        self.inner.dequeue().await
    }

    async fn queue_size(&self) -> ScroogeResult<usize> {
        self.inner.queue_size().await
    }

    async fn enqueued_items(&self, limit: Option<usize>) -> ScroogeResult<Vec<Vec<u8>>> {
        self.inner.enqueued_items(limit).await
    }

    async fn flush_queue(&self) -> ScroogeResult<()> {
        self.inner.flush_queue().await
    }

    async fn schedule_add(
        &self,
        data: Vec<u8>,
        eta: DateTime<Utc>,
        priority: i32,
    ) -> ScroogeResult<()> {
        self.schedule_adds.fetch_add(1, Ordering::SeqCst);
        self.inner.schedule_add(data, eta, priority).await
    }

    async fn schedule_read(&self, timestamp: DateTime<Utc>) -> ScroogeResult<Vec<Vec<u8>>> {
        self.inner.schedule_read(timestamp).await
    }

    async fn schedule_size(&self) -> ScroogeResult<usize> {
        self.inner.schedule_size().await
    }

    async fn scheduled_items(&self, limit: Option<usize>) -> ScroogeResult<Vec<Vec<u8>>> {
        self.inner.scheduled_items(limit).await
    }

    async fn flush_schedule(&self) -> ScroogeResult<()> {
        self.inner.flush_schedule().await
    }

    async fn put_result(
        &self,
        key: &str,
        value: Vec<u8>,
        expire: Option<Duration>,
    ) -> ScroogeResult<()> {
        if self.fail_put_result.load(Ordering::SeqCst) {
            return Err(Self::refuse("put_result"));
        }
        self.inner.put_result(key, value, expire).await
    }

    async fn peek_result(&self, key: &str) -> ScroogeResult<Option<Vec<u8>>> {
        self.inner.peek_result(key).await
    }

    async fn pop_result(&self, key: &str) -> ScroogeResult<Option<Vec<u8>>> {
        self.inner.pop_result(key).await
    }

    async fn put_if_empty(&self, key: &str, value: Vec<u8>) -> ScroogeResult<bool> {
        self.inner.put_if_empty(key, value).await
    }

    async fn has(&self, key: &str) -> ScroogeResult<bool> {
        self.inner.has(key).await
    }

    async fn delete(&self, key: &str) -> ScroogeResult<bool> {
        self.inner.delete(key).await
    }

    async fn result_count(&self) -> ScroogeResult<usize> {
        self.inner.result_count().await
    }

    async fn result_items(&self) -> ScroogeResult<HashMap<String, Vec<u8>>> {
        self.inner.result_items().await
    }

    async fn flush_results(&self) -> ScroogeResult<()> {
        self.inner.flush_results().await
    }
}
