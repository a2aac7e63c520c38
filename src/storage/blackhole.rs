//! Storage that accepts every write and keeps nothing.
//!
//! Useful for benchmarking the enqueue path or for producers that must not
//! leave anything behind. Reads always come back empty.

use super::Storage;
use crate::error::ScroogeResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Storage backend that discards everything
#[derive(Debug, Clone)]
pub struct BlackHoleStorage {
    name: String,
}

impl BlackHoleStorage {
    /// Create a black hole bound to queue `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Storage for BlackHoleStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn shares_across_processes(&self) -> bool {
        false
    }

    async fn enqueue(&self, _data: Vec<u8>, _priority: i32) -> ScroogeResult<()> {
        Ok(())
    }

    async fn dequeue(&self) -> ScroogeResult<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn queue_size(&self) -> ScroogeResult<usize> {
        Ok(0)
    }

    async fn enqueued_items(&self, _limit: Option<usize>) -> ScroogeResult<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }

    async fn flush_queue(&self) -> ScroogeResult<()> {
        Ok(())
    }

    async fn schedule_add(
        &self,
        _data: Vec<u8>,
        _eta: DateTime<Utc>,
        _priority: i32,
    ) -> ScroogeResult<()> {
        Ok(())
    }

    async fn schedule_read(&self, _timestamp: DateTime<Utc>) -> ScroogeResult<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }

    async fn schedule_size(&self) -> ScroogeResult<usize> {
        Ok(0)
    }

    async fn scheduled_items(&self, _limit: Option<usize>) -> ScroogeResult<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }

    async fn flush_schedule(&self) -> ScroogeResult<()> {
        Ok(())
    }

    async fn put_result(
        &self,
        _key: &str,
        _value: Vec<u8>,
        _expire: Option<Duration>,
    ) -> ScroogeResult<()> {
        Ok(())
    }

    async fn peek_result(&self, _key: &str) -> ScroogeResult<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn pop_result(&self, _key: &str) -> ScroogeResult<Option<Vec<u8>>> {
        Ok(None)
    }

    // Every write "succeeds", so locks built on this never contend.
    async fn put_if_empty(&self, _key: &str, _value: Vec<u8>) -> ScroogeResult<bool> {
        Ok(true)
    }

    async fn has(&self, _key: &str) -> ScroogeResult<bool> {
        Ok(false)
    }

    async fn delete(&self, _key: &str) -> ScroogeResult<bool> {
        Ok(false)
    }

    async fn result_count(&self) -> ScroogeResult<usize> {
        Ok(0)
    }

    async fn result_items(&self) -> ScroogeResult<HashMap<String, Vec<u8>>> {
        Ok(HashMap::new())
    }

    async fn flush_results(&self) -> ScroogeResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_everything_disappears() {
        let storage = BlackHoleStorage::new("void");
        storage.enqueue(b"a".to_vec(), 1).await.unwrap();
        storage.schedule_add(b"b".to_vec(), Utc::now(), 0).await.unwrap();
        storage.put_result("k", b"v".to_vec(), None).await.unwrap();

        assert_eq!(storage.dequeue().await.unwrap(), None);
        assert!(storage.schedule_read(Utc::now()).await.unwrap().is_empty());
        assert_eq!(storage.pop_result("k").await.unwrap(), None);
        assert!(storage.put_if_empty("k", b"v".to_vec()).await.unwrap());
        assert_eq!(storage.result_count().await.unwrap(), 0);
    }
}
