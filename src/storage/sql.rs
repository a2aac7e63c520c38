//! SQLite storage implementation for Scrooge, built on `sqlx`.
//!
//! Three tables hold every queue that shares the database file; each row
//! carries the queue name. Atomic read-and-remove relies on single-statement
//! `DELETE ... RETURNING`, which SQLite serializes.

use super::Storage;
use crate::config::SqlConfig;
use crate::error::{ScroogeError, ScroogeResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS task (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue TEXT NOT NULL,
        data BLOB NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS task_priority_idx ON task(queue, priority DESC, id)",
    "CREATE TABLE IF NOT EXISTS schedule (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue TEXT NOT NULL,
        data BLOB NOT NULL,
        timestamp INTEGER NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS schedule_timestamp_idx ON schedule(queue, timestamp)",
    "CREATE TABLE IF NOT EXISTS kv (
        queue TEXT NOT NULL,
        key TEXT NOT NULL,
        value BLOB NOT NULL,
        expires_at INTEGER,
        PRIMARY KEY (queue, key)
    )",
];

fn sql_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> ScroogeError {
    move |e| ScroogeError::storage(format!("{}: {}", context, e), e)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(expire: Option<Duration>) -> Option<i64> {
    expire.map(|ttl| {
        let ttl = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        now_millis().saturating_add(ttl)
    })
}

fn is_live(expires_at: Option<i64>, now: i64) -> bool {
    expires_at.is_none_or(|deadline| now < deadline)
}

/// SQLite storage backend implementation
#[derive(Debug, Clone)]
pub struct SqlStorage {
    name: String,
    pool: Pool<Sqlite>,
}

impl SqlStorage {
    /// Open (creating if needed) the database and bind to queue `name`.
    pub async fn connect(name: impl Into<String>, config: SqlConfig) -> ScroogeResult<Self> {
        let name = name.into();
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&config.database_url)
            .await
            .map_err(sql_error("Failed to open SQLite database"))?;

        let storage = Self { name, pool };
        storage.setup().await?;
        info!(
            "✅ Opened SQLite storage '{}' at {}",
            storage.name, config.database_url
        );
        Ok(storage)
    }

    /// Create tables and indexes.
    pub async fn setup(&self) -> ScroogeResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(sql_error("Failed to create schema"))?;
        }
        sqlx::query("PRAGMA journal_mode = 'WAL';")
            .execute(&self.pool)
            .await
            .map_err(sql_error("Failed to enable WAL"))?;
        debug!("SQLite schema ready for queue '{}'", self.name);
        Ok(())
    }

    async fn purge_expired(&self) -> ScroogeResult<()> {
        sqlx::query("DELETE FROM kv WHERE queue = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2")
            .bind(&self.name)
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .map_err(sql_error("Failed to purge expired results"))?;
        Ok(())
    }
}

#[async_trait]
impl Storage for SqlStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, data: Vec<u8>, priority: i32) -> ScroogeResult<()> {
        sqlx::query("INSERT INTO task (queue, data, priority) VALUES (?1, ?2, ?3)")
            .bind(&self.name)
            .bind(data)
            .bind(priority)
            .execute(&self.pool)
            .await
            .map_err(sql_error("Failed to enqueue"))?;
        Ok(())
    }

    async fn dequeue(&self) -> ScroogeResult<Option<Vec<u8>>> {
        sqlx::query_scalar::<_, Vec<u8>>(
            "DELETE FROM task WHERE id = (
                SELECT id FROM task WHERE queue = ?1 ORDER BY priority DESC, id ASC LIMIT 1
            ) RETURNING data",
        )
        .bind(&self.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_error("Failed to dequeue"))
    }

    async fn queue_size(&self) -> ScroogeResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task WHERE queue = ?1")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await
            .map_err(sql_error("Failed to read queue size"))?;
        Ok(count as usize)
    }

    async fn enqueued_items(&self, limit: Option<usize>) -> ScroogeResult<Vec<Vec<u8>>> {
        let limit = limit.map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));
        sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT data FROM task WHERE queue = ?1 ORDER BY priority DESC, id ASC LIMIT ?2",
        )
        .bind(&self.name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_error("Failed to read enqueued items"))
    }

    async fn flush_queue(&self) -> ScroogeResult<()> {
        sqlx::query("DELETE FROM task WHERE queue = ?1")
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .map_err(sql_error("Failed to flush queue"))?;
        Ok(())
    }

    async fn schedule_add(
        &self,
        data: Vec<u8>,
        eta: DateTime<Utc>,
        priority: i32,
    ) -> ScroogeResult<()> {
        sqlx::query(
            "INSERT INTO schedule (queue, data, timestamp, priority) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&self.name)
        .bind(data)
        .bind(eta.timestamp_millis())
        .bind(priority)
        .execute(&self.pool)
        .await
        .map_err(sql_error("Failed to add to schedule"))?;
        Ok(())
    }

    async fn schedule_read(&self, timestamp: DateTime<Utc>) -> ScroogeResult<Vec<Vec<u8>>> {
        let mut rows = sqlx::query_as::<_, (i64, Vec<u8>, i64, i32)>(
            "DELETE FROM schedule WHERE queue = ?1 AND timestamp <= ?2
             RETURNING id, data, timestamp, priority",
        )
        .bind(&self.name)
        .bind(timestamp.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(sql_error("Failed to read schedule"))?;

        // RETURNING gives no ordering guarantee.
        rows.sort_by(|a, b| {
            a.2.cmp(&b.2)
                .then_with(|| b.3.cmp(&a.3))
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(rows.into_iter().map(|(_, data, _, _)| data).collect())
    }

    async fn schedule_size(&self) -> ScroogeResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schedule WHERE queue = ?1")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await
            .map_err(sql_error("Failed to read schedule size"))?;
        Ok(count as usize)
    }

    async fn scheduled_items(&self, limit: Option<usize>) -> ScroogeResult<Vec<Vec<u8>>> {
        let limit = limit.map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));
        sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT data FROM schedule WHERE queue = ?1
             ORDER BY timestamp ASC, priority DESC, id ASC LIMIT ?2",
        )
        .bind(&self.name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_error("Failed to read scheduled items"))
    }

    async fn flush_schedule(&self) -> ScroogeResult<()> {
        sqlx::query("DELETE FROM schedule WHERE queue = ?1")
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .map_err(sql_error("Failed to flush schedule"))?;
        Ok(())
    }

    async fn put_result(
        &self,
        key: &str,
        value: Vec<u8>,
        expire: Option<Duration>,
    ) -> ScroogeResult<()> {
        sqlx::query(
            "INSERT INTO kv (queue, key, value, expires_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(queue, key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(&self.name)
        .bind(key)
        .bind(value)
        .bind(expiry_millis(expire))
        .execute(&self.pool)
        .await
        .map_err(sql_error("Failed to store result"))?;
        Ok(())
    }

    async fn peek_result(&self, key: &str) -> ScroogeResult<Option<Vec<u8>>> {
        sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT value FROM kv WHERE queue = ?1 AND key = ?2
             AND (expires_at IS NULL OR expires_at > ?3)",
        )
        .bind(&self.name)
        .bind(key)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_error("Failed to read result"))
    }

    async fn pop_result(&self, key: &str) -> ScroogeResult<Option<Vec<u8>>> {
        let row = sqlx::query_as::<_, (Vec<u8>, Option<i64>)>(
            "DELETE FROM kv WHERE queue = ?1 AND key = ?2 RETURNING value, expires_at",
        )
        .bind(&self.name)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_error("Failed to pop result"))?;

        let now = now_millis();
        Ok(row.and_then(|(value, expires_at)| is_live(expires_at, now).then_some(value)))
    }

    async fn put_if_empty(&self, key: &str, value: Vec<u8>) -> ScroogeResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(sql_error("Failed to begin transaction"))?;

        sqlx::query(
            "DELETE FROM kv WHERE queue = ?1 AND key = ?2
             AND expires_at IS NOT NULL AND expires_at <= ?3",
        )
        .bind(&self.name)
        .bind(key)
        .bind(now_millis())
        .execute(&mut *tx)
        .await
        .map_err(sql_error("Failed to clear expired key"))?;

        let inserted = sqlx::query(
            "INSERT INTO kv (queue, key, value, expires_at) VALUES (?1, ?2, ?3, NULL)
             ON CONFLICT(queue, key) DO NOTHING",
        )
        .bind(&self.name)
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await
        .map_err(sql_error("Failed to conditionally store result"))?
        .rows_affected();

        tx.commit()
            .await
            .map_err(sql_error("Failed to commit transaction"))?;
        Ok(inserted == 1)
    }

    async fn has(&self, key: &str) -> ScroogeResult<bool> {
        Ok(self.peek_result(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> ScroogeResult<bool> {
        let row = sqlx::query_scalar::<_, Option<i64>>(
            "DELETE FROM kv WHERE queue = ?1 AND key = ?2 RETURNING expires_at",
        )
        .bind(&self.name)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_error("Failed to delete result"))?;

        let now = now_millis();
        Ok(row.is_some_and(|expires_at| is_live(expires_at, now)))
    }

    async fn result_count(&self) -> ScroogeResult<usize> {
        self.purge_expired().await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kv WHERE queue = ?1")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await
            .map_err(sql_error("Failed to count results"))?;
        Ok(count as usize)
    }

    async fn result_items(&self) -> ScroogeResult<HashMap<String, Vec<u8>>> {
        let rows = sqlx::query_as::<_, (String, Vec<u8>)>(
            "SELECT key, value FROM kv WHERE queue = ?1
             AND (expires_at IS NULL OR expires_at > ?2)",
        )
        .bind(&self.name)
        .bind(now_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(sql_error("Failed to read results"))?;
        Ok(rows.into_iter().collect())
    }

    async fn flush_results(&self) -> ScroogeResult<()> {
        sqlx::query("DELETE FROM kv WHERE queue = ?1")
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .map_err(sql_error("Failed to flush results"))?;
        Ok(())
    }

    async fn health_check(&self) -> ScroogeResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(sql_error("SQLite health check failed"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_storage(name: &str) -> SqlStorage {
        SqlStorage::connect(
            name,
            SqlConfig {
                database_url: "sqlite::memory:".to_string(),
                max_connections: 1,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_sql_priority_order() {
        let storage = memory_storage("jobs").await;
        for (label, priority) in [("a", 0), ("b", 1), ("c", 0), ("d", 1)] {
            storage.enqueue(label.as_bytes().to_vec(), priority).await.unwrap();
        }

        assert_eq!(storage.queue_size().await.unwrap(), 4);
        assert_eq!(
            storage.enqueued_items(Some(2)).await.unwrap(),
            vec![b"b".to_vec(), b"d".to_vec()]
        );

        let mut order = Vec::new();
        while let Some(data) = storage.dequeue().await.unwrap() {
            order.push(String::from_utf8(data).unwrap());
        }
        assert_eq!(order, vec!["b", "d", "a", "c"]);
    }

    #[tokio::test]
    async fn test_sql_schedule_read() {
        let storage = memory_storage("jobs").await;
        let now = Utc::now();
        storage
            .schedule_add(b"later".to_vec(), now + chrono::Duration::seconds(30), 0)
            .await
            .unwrap();
        storage.schedule_add(b"low".to_vec(), now, 0).await.unwrap();
        storage.schedule_add(b"high".to_vec(), now, 9).await.unwrap();

        let due = storage.schedule_read(now).await.unwrap();
        assert_eq!(due, vec![b"high".to_vec(), b"low".to_vec()]);
        assert_eq!(storage.schedule_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sql_results_and_locks() {
        let storage = memory_storage("jobs").await;
        storage.put_result("r", b"v".to_vec(), None).await.unwrap();
        assert!(storage.has("r").await.unwrap());
        assert_eq!(storage.pop_result("r").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(storage.pop_result("r").await.unwrap(), None);

        assert!(storage.put_if_empty("lock", b"1".to_vec()).await.unwrap());
        assert!(!storage.put_if_empty("lock", b"1".to_vec()).await.unwrap());
        assert!(storage.delete("lock").await.unwrap());
        assert!(!storage.delete("lock").await.unwrap());

        storage
            .put_result("ttl", b"v".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(storage.peek_result("ttl").await.unwrap(), None);
        assert_eq!(storage.result_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sql_queues_are_isolated() {
        let storage = memory_storage("one").await;
        let other = SqlStorage {
            name: "two".to_string(),
            pool: storage.pool.clone(),
        };
        storage.enqueue(b"x".to_vec(), 0).await.unwrap();
        assert_eq!(other.queue_size().await.unwrap(), 0);
        assert_eq!(other.dequeue().await.unwrap(), None);
        assert_eq!(storage.dequeue().await.unwrap(), Some(b"x".to_vec()));
    }
}
