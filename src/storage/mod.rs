//! Storage backends for Scrooge.
//!
//! Every backend persists four things: the ready queue, the schedule store,
//! the result store and the generic key space used for locks and revocation
//! markers. Queue semantics never depend on the backend chosen:
//! - **Memory**: single process, used for development, tests and immediate mode
//! - **BlackHole**: accepts everything, keeps nothing
//! - **File**: one file per item in a local directory, shared by processes on one host
//! - **Redis**: distributed, shared by many consumers and processes
//! - **Sql**: SQLite through `sqlx`
//!
//! The one property the engine depends on is atomic read-and-remove for the
//! ready queue ([`Storage::dequeue`]) and the schedule store
//! ([`Storage::schedule_read`]): two consumers never receive the same item.
//!
//! # Examples
//!
//! ```rust,no_run
//! use scrooge::storage::{MemoryStorage, Storage};
//!
//! # async fn example() -> scrooge::ScroogeResult<()> {
//! let storage = MemoryStorage::new("jobs");
//! storage.enqueue(b"payload".to_vec(), 0).await?;
//! assert_eq!(storage.dequeue().await?, Some(b"payload".to_vec()));
//!
//! // Redis storage (requires the redis-storage feature)
//! # #[cfg(feature = "redis-storage")]
//! let storage = scrooge::storage::RedisStorage::connect(
//!     "jobs",
//!     scrooge::config::RedisConfig::default(),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::StorageConfig;
use crate::error::ScroogeResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod blackhole;
pub mod file;
#[cfg(test)]
pub(crate) mod flaky;
pub mod memory;

pub use blackhole::BlackHoleStorage;
pub use file::FileStorage;
pub use memory::MemoryStorage;

#[cfg(feature = "redis-storage")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-storage")))]
pub mod redis;

#[cfg(feature = "redis-storage")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-storage")))]
pub use self::redis::{RedisSemaphore, RedisStorage};

#[cfg(feature = "sql-storage")]
#[cfg_attr(docsrs, doc(cfg(feature = "sql-storage")))]
pub mod sql;

#[cfg(feature = "sql-storage")]
#[cfg_attr(docsrs, doc(cfg(feature = "sql-storage")))]
pub use sql::SqlStorage;

/// Trait that all storage backends must implement.
///
/// Items are opaque bytes; the engine owns (de)serialization. Priorities and
/// etas are passed alongside so backends can order without decoding.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Queue name this storage is bound to.
    fn name(&self) -> &str;

    /// Whether separate processes opening the same configuration see the same
    /// data. Process workers require it.
    fn shares_across_processes(&self) -> bool {
        true
    }

    /// This backend as Redis storage, for Redis-only helpers such as
    /// [`RedisSemaphore`].
    #[cfg(feature = "redis-storage")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-storage")))]
    fn as_redis(&self) -> Option<&RedisStorage> {
        None
    }

    /// Append to the ready queue. Higher priority dequeues first; equal
    /// priorities dequeue in insertion order.
    async fn enqueue(&self, data: Vec<u8>, priority: i32) -> ScroogeResult<()>;

    /// Atomically remove and return the next ready item, `None` when empty.
    async fn dequeue(&self) -> ScroogeResult<Option<Vec<u8>>>;

    /// Number of ready items.
    async fn queue_size(&self) -> ScroogeResult<usize>;

    /// Ready items in dequeue order, without removing them.
    async fn enqueued_items(&self, limit: Option<usize>) -> ScroogeResult<Vec<Vec<u8>>>;

    /// Drop every ready item.
    async fn flush_queue(&self) -> ScroogeResult<()>;

    /// Add an item to the schedule store.
    async fn schedule_add(&self, data: Vec<u8>, eta: DateTime<Utc>, priority: i32)
    -> ScroogeResult<()>;

    /// Atomically remove and return every scheduled item with `eta <= timestamp`,
    /// ordered by eta then priority.
    async fn schedule_read(&self, timestamp: DateTime<Utc>) -> ScroogeResult<Vec<Vec<u8>>>;

    /// Number of scheduled items.
    async fn schedule_size(&self) -> ScroogeResult<usize>;

    /// Scheduled items ordered by eta, without removing them.
    async fn scheduled_items(&self, limit: Option<usize>) -> ScroogeResult<Vec<Vec<u8>>>;

    /// Drop every scheduled item.
    async fn flush_schedule(&self) -> ScroogeResult<()>;

    /// Store `value` under `key`, optionally expiring after `expire`.
    async fn put_result(&self, key: &str, value: Vec<u8>, expire: Option<Duration>)
    -> ScroogeResult<()>;

    /// Read `key` without removing it.
    async fn peek_result(&self, key: &str) -> ScroogeResult<Option<Vec<u8>>>;

    /// Atomically read and remove `key`.
    async fn pop_result(&self, key: &str) -> ScroogeResult<Option<Vec<u8>>>;

    /// Store `value` only if `key` is absent. Returns whether it was written.
    async fn put_if_empty(&self, key: &str, value: Vec<u8>) -> ScroogeResult<bool>;

    /// Whether `key` holds a value.
    async fn has(&self, key: &str) -> ScroogeResult<bool>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> ScroogeResult<bool>;

    /// Number of keys in the result store.
    async fn result_count(&self) -> ScroogeResult<usize>;

    /// Every key/value in the result store.
    async fn result_items(&self) -> ScroogeResult<HashMap<String, Vec<u8>>>;

    /// Drop every key in the result store.
    async fn flush_results(&self) -> ScroogeResult<()>;

    /// Drop everything.
    async fn flush_all(&self) -> ScroogeResult<()> {
        self.flush_queue().await?;
        self.flush_schedule().await?;
        self.flush_results().await
    }

    /// Health check for the storage backend
    async fn health_check(&self) -> ScroogeResult<()> {
        Ok(())
    }
}

/// Factory methods for creating storage backends
pub struct StorageFactory;

impl StorageFactory {
    /// Build the backend selected by `config` for queue `name`.
    pub async fn from_config(name: &str, config: &StorageConfig) -> ScroogeResult<Arc<dyn Storage>> {
        match config {
            StorageConfig::Memory => Ok(Arc::new(MemoryStorage::new(name))),
            StorageConfig::BlackHole => Ok(Arc::new(BlackHoleStorage::new(name))),
            StorageConfig::File(file_config) => {
                let storage = FileStorage::open(name, file_config.clone()).await?;
                Ok(Arc::new(storage))
            }
            #[cfg(feature = "redis-storage")]
            StorageConfig::Redis(redis_config) => {
                let storage = RedisStorage::connect(name, redis_config.clone()).await?;
                Ok(Arc::new(storage))
            }
            #[cfg(feature = "sql-storage")]
            StorageConfig::Sql(sql_config) => {
                let storage = SqlStorage::connect(name, sql_config.clone()).await?;
                Ok(Arc::new(storage))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_storage_factory() {
        let storage = StorageFactory::from_config("jobs", &StorageConfig::Memory)
            .await
            .unwrap();
        assert_eq!(storage.name(), "jobs");
        assert!(!storage.shares_across_processes());
        assert!(storage.health_check().await.is_ok());

        let storage = StorageFactory::from_config("jobs", &StorageConfig::BlackHole)
            .await
            .unwrap();
        storage.enqueue(b"x".to_vec(), 0).await.unwrap();
        assert_eq!(storage.queue_size().await.unwrap(), 0);

        let dir = std::env::temp_dir().join(format!("scrooge-factory-{}", uuid::Uuid::new_v4()));
        let storage = StorageFactory::from_config("jobs", &StorageConfig::file(&dir))
            .await
            .unwrap();
        assert!(storage.shares_across_processes());
        assert!(storage.health_check().await.is_ok());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_flush_all_default() {
        let storage = MemoryStorage::new("jobs");
        storage.enqueue(b"a".to_vec(), 0).await.unwrap();
        storage
            .schedule_add(b"b".to_vec(), Utc::now(), 0)
            .await
            .unwrap();
        storage.put_result("k", b"v".to_vec(), None).await.unwrap();

        storage.flush_all().await.unwrap();
        assert_eq!(storage.queue_size().await.unwrap(), 0);
        assert_eq!(storage.schedule_size().await.unwrap(), 0);
        assert_eq!(storage.result_count().await.unwrap(), 0);
    }
}
