//! Redis storage implementation for Scrooge.
//!
//! This backend keeps every store in Redis, so any number of consumer
//! processes and producers on any number of hosts can share a queue.
//!
//! # Layout
//!
//! - `{prefix}:{name}:queue`: sorted set scored by negated priority. Members
//!   carry a 20-digit sequence prefix so equal priorities pop in insertion
//!   order.
//! - `{prefix}:{name}:schedule`: sorted set scored by eta (epoch millis).
//!   Members carry an inverted-priority and sequence prefix.
//! - `{prefix}:{name}:seq`: the sequence counter.
//! - `{prefix}:{name}:result:{key}`: one string key per result, lock or
//!   revocation marker.
//!
//! Compound operations run as Lua scripts so they are atomic. Counting locks
//! ([`RedisSemaphore`]) are sorted sets stored under a result key.

use super::Storage;
use crate::config::RedisConfig;
use crate::error::{ScroogeError, ScroogeResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client, RedisError, Script, aio::ConnectionManager};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

mod semaphore;

pub use semaphore::{DEFAULT_SEMAPHORE_TIMEOUT, RedisSemaphore};

const QUEUE_PREFIX_LEN: usize = 20;
const SCHEDULE_PREFIX_LEN: usize = 30;
const SCAN_BATCH: usize = 500;

/// Pre-compiled Lua scripts for atomic Redis operations
#[derive(Debug)]
struct RedisScripts {
    enqueue: Script,
    dequeue: Script,
    schedule_add: Script,
    schedule_read: Script,
    pop_result: Script,
}

impl RedisScripts {
    fn new() -> Self {
        Self {
            enqueue: Script::new(include_str!("scripts/enqueue.lua")),
            dequeue: Script::new(include_str!("scripts/dequeue.lua")),
            schedule_add: Script::new(include_str!("scripts/schedule_add.lua")),
            schedule_read: Script::new(include_str!("scripts/schedule_read.lua")),
            pop_result: Script::new(include_str!("scripts/pop_result.lua")),
        }
    }
}

fn redis_error(context: &'static str) -> impl FnOnce(RedisError) -> ScroogeError {
    move |e| ScroogeError::storage(format!("{}: {}", context, e), e)
}

/// Sortable prefix so that, within one eta, higher priorities read first.
fn inverted_priority(priority: i32) -> String {
    let inverted = i64::from(i32::MAX) - i64::from(priority);
    format!("{:010}", inverted)
}

fn strip_prefix(mut member: Vec<u8>, len: usize) -> Vec<u8> {
    if member.len() <= len {
        return Vec::new();
    }
    member.drain(..len);
    member
}

/// Redis storage backend implementation
pub struct RedisStorage {
    name: String,
    conn: ConnectionManager,
    config: RedisConfig,
    scripts: RedisScripts,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("scripts", &self.scripts)
            .finish_non_exhaustive()
    }
}

impl RedisStorage {
    /// Connect to Redis and bind to queue `name`.
    pub async fn connect(name: impl Into<String>, config: RedisConfig) -> ScroogeResult<Self> {
        let name = name.into();
        let client = Client::open(config.connection_string.as_str())
            .map_err(redis_error("Failed to create Redis client"))?;

        debug!(
            "🔧 Configuring Redis storage '{}' with prefix: {}",
            name, config.key_prefix
        );

        let conn = timeout(
            Duration::from_secs(config.connect_timeout_secs),
            client.get_connection_manager(),
        )
        .await
        .map_err(|e| ScroogeError::storage("Timed out connecting to Redis", e))?
        .map_err(redis_error("Failed to create Redis connection manager"))?;

        info!("✅ Connected to Redis for queue '{}'", name);

        Ok(Self {
            name,
            conn,
            config,
            scripts: RedisScripts::new(),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}:{}", self.config.key_prefix, self.name, suffix)
    }

    fn queue_key(&self) -> String {
        self.key("queue")
    }

    fn schedule_key(&self) -> String {
        self.key("schedule")
    }

    fn sequence_key(&self) -> String {
        self.key("seq")
    }

    fn result_key(&self, key: &str) -> String {
        format!("{}:{}:result:{}", self.config.key_prefix, self.name, key)
    }

    fn result_prefix(&self) -> String {
        self.result_key("")
    }

    /// Every result key, found by cursor so large keyspaces never block Redis.
    async fn scan_result_keys(&self) -> ScroogeResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", self.result_prefix());
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(redis_error("Failed to scan result keys"))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }
}

#[async_trait]
impl Storage for RedisStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_redis(&self) -> Option<&RedisStorage> {
        Some(self)
    }

    async fn enqueue(&self, data: Vec<u8>, priority: i32) -> ScroogeResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .scripts
            .enqueue
            .key(self.queue_key())
            .key(self.sequence_key())
            .arg(-i64::from(priority))
            .arg(data)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error("Failed to enqueue"))?;
        Ok(())
    }

    async fn dequeue(&self) -> ScroogeResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        self.scripts
            .dequeue
            .key(self.queue_key())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error("Failed to dequeue"))
    }

    async fn queue_size(&self) -> ScroogeResult<usize> {
        let mut conn = self.conn.clone();
        conn.zcard(self.queue_key())
            .await
            .map_err(redis_error("Failed to read queue size"))
    }

    async fn enqueued_items(&self, limit: Option<usize>) -> ScroogeResult<Vec<Vec<u8>>> {
        if limit == Some(0) {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let stop = limit.map_or(-1, |limit| limit as isize - 1);
        let members: Vec<Vec<u8>> = conn
            .zrange(self.queue_key(), 0, stop)
            .await
            .map_err(redis_error("Failed to read enqueued items"))?;
        Ok(members
            .into_iter()
            .map(|member| strip_prefix(member, QUEUE_PREFIX_LEN))
            .collect())
    }

    async fn flush_queue(&self) -> ScroogeResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(self.queue_key())
            .await
            .map_err(redis_error("Failed to flush queue"))?;
        Ok(())
    }

    async fn schedule_add(
        &self,
        data: Vec<u8>,
        eta: DateTime<Utc>,
        priority: i32,
    ) -> ScroogeResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .scripts
            .schedule_add
            .key(self.schedule_key())
            .key(self.sequence_key())
            .arg(eta.timestamp_millis())
            .arg(inverted_priority(priority))
            .arg(data)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error("Failed to add to schedule"))?;
        Ok(())
    }

    async fn schedule_read(&self, timestamp: DateTime<Utc>) -> ScroogeResult<Vec<Vec<u8>>> {
        let mut conn = self.conn.clone();
        self.scripts
            .schedule_read
            .key(self.schedule_key())
            .arg(timestamp.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error("Failed to read schedule"))
    }

    async fn schedule_size(&self) -> ScroogeResult<usize> {
        let mut conn = self.conn.clone();
        conn.zcard(self.schedule_key())
            .await
            .map_err(redis_error("Failed to read schedule size"))
    }

    async fn scheduled_items(&self, limit: Option<usize>) -> ScroogeResult<Vec<Vec<u8>>> {
        if limit == Some(0) {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let stop = limit.map_or(-1, |limit| limit as isize - 1);
        let members: Vec<Vec<u8>> = conn
            .zrange(self.schedule_key(), 0, stop)
            .await
            .map_err(redis_error("Failed to read scheduled items"))?;
        Ok(members
            .into_iter()
            .map(|member| strip_prefix(member, SCHEDULE_PREFIX_LEN))
            .collect())
    }

    async fn flush_schedule(&self) -> ScroogeResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(self.schedule_key())
            .await
            .map_err(redis_error("Failed to flush schedule"))?;
        Ok(())
    }

    async fn put_result(
        &self,
        key: &str,
        value: Vec<u8>,
        expire: Option<Duration>,
    ) -> ScroogeResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.result_key(key)).arg(value);
        if let Some(ttl) = expire {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(redis_error("Failed to store result"))?;
        Ok(())
    }

    async fn peek_result(&self, key: &str) -> ScroogeResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get(self.result_key(key))
            .await
            .map_err(redis_error("Failed to read result"))
    }

    async fn pop_result(&self, key: &str) -> ScroogeResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        self.scripts
            .pop_result
            .key(self.result_key(key))
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error("Failed to pop result"))
    }

    async fn put_if_empty(&self, key: &str, value: Vec<u8>) -> ScroogeResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.result_key(key))
            .arg(value)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(redis_error("Failed to conditionally store result"))?;
        Ok(reply.is_some())
    }

    async fn has(&self, key: &str) -> ScroogeResult<bool> {
        let mut conn = self.conn.clone();
        conn.exists(self.result_key(key))
            .await
            .map_err(redis_error("Failed to check result"))
    }

    async fn delete(&self, key: &str) -> ScroogeResult<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn
            .del(self.result_key(key))
            .await
            .map_err(redis_error("Failed to delete result"))?;
        Ok(removed > 0)
    }

    async fn result_count(&self) -> ScroogeResult<usize> {
        Ok(self.scan_result_keys().await?.len())
    }

    async fn result_items(&self) -> ScroogeResult<HashMap<String, Vec<u8>>> {
        let keys = self.scan_result_keys().await?;
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut conn = self.conn.clone();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(redis_error("Failed to read results"))?;

        let prefix = self.result_prefix();
        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| {
                let value = value?;
                let short = key.strip_prefix(&prefix).unwrap_or(&key).to_string();
                Some((short, value))
            })
            .collect())
    }

    async fn flush_results(&self) -> ScroogeResult<()> {
        let keys = self.scan_result_keys().await?;
        let mut conn = self.conn.clone();
        for chunk in keys.chunks(SCAN_BATCH) {
            let _: u64 = conn
                .del(chunk)
                .await
                .map_err(redis_error("Failed to flush results"))?;
        }
        if !keys.is_empty() {
            warn!("Flushed {} results from Redis storage '{}'", keys.len(), self.name);
        }
        Ok(())
    }

    async fn flush_all(&self) -> ScroogeResult<()> {
        self.flush_results().await?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(vec![self.queue_key(), self.schedule_key(), self.sequence_key()])
            .await
            .map_err(redis_error("Failed to flush storage"))?;
        Ok(())
    }

    async fn health_check(&self) -> ScroogeResult<()> {
        let mut conn = self.conn.clone();

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(redis_error("Redis health check failed"))?;

        if pong != "PONG" {
            return Err(ScroogeError::Storage {
                message: "Redis health check failed: unexpected response".to_string(),
                source: None,
            });
        }

        let (queued, scheduled): (u64, u64) = redis::pipe()
            .zcard(self.queue_key())
            .zcard(self.schedule_key())
            .query_async(&mut conn)
            .await
            .map_err(redis_error("Failed to check storage integrity"))?;

        debug!(
            "Redis storage health check passed: {} queued, {} scheduled",
            queued, scheduled
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_prefixes() {
        assert_eq!(inverted_priority(i32::MAX), "0000000000");
        assert_eq!(inverted_priority(0).len(), 10);
        assert!(inverted_priority(5) < inverted_priority(1));
        assert!(inverted_priority(-1) > inverted_priority(0));
        assert_eq!(inverted_priority(i32::MIN), "4294967295");

        let member = format!("{:020}payload", 7).into_bytes();
        assert_eq!(strip_prefix(member, QUEUE_PREFIX_LEN), b"payload".to_vec());
        assert!(strip_prefix(b"short".to_vec(), QUEUE_PREFIX_LEN).is_empty());
    }

    // These tests need a running Redis instance:
    // cargo test --features redis-storage -- --ignored

    async fn connect(name: &str) -> RedisStorage {
        let storage = RedisStorage::connect(name, RedisConfig::default())
            .await
            .expect("Failed to connect to Redis");
        storage.flush_all().await.unwrap();
        storage
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_priority_order() {
        let storage = connect("test-priority").await;
        for (label, priority) in [("a", 0), ("b", 2), ("c", 0), ("d", 2), ("e", -1)] {
            storage.enqueue(label.as_bytes().to_vec(), priority).await.unwrap();
        }

        assert_eq!(storage.queue_size().await.unwrap(), 5);
        assert_eq!(
            storage.enqueued_items(Some(1)).await.unwrap(),
            vec![b"b".to_vec()]
        );

        let mut order = Vec::new();
        while let Some(data) = storage.dequeue().await.unwrap() {
            order.push(String::from_utf8(data).unwrap());
        }
        assert_eq!(order, vec!["b", "d", "a", "c", "e"]);
        storage.flush_all().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_schedule_and_results() {
        let storage = connect("test-schedule").await;
        let now = Utc::now();
        storage
            .schedule_add(b"later".to_vec(), now + chrono::Duration::seconds(60), 0)
            .await
            .unwrap();
        storage.schedule_add(b"low".to_vec(), now, 0).await.unwrap();
        storage.schedule_add(b"high".to_vec(), now, 3).await.unwrap();

        let due = storage.schedule_read(now).await.unwrap();
        assert_eq!(due, vec![b"high".to_vec(), b"low".to_vec()]);
        assert_eq!(storage.schedule_size().await.unwrap(), 1);

        assert!(storage.put_if_empty("lock", b"1".to_vec()).await.unwrap());
        assert!(!storage.put_if_empty("lock", b"1".to_vec()).await.unwrap());
        storage.put_result("r", b"v".to_vec(), None).await.unwrap();
        assert_eq!(storage.result_count().await.unwrap(), 2);
        assert!(storage.result_items().await.unwrap().contains_key("r"));
        assert_eq!(storage.pop_result("r").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(storage.pop_result("r").await.unwrap(), None);

        storage.flush_all().await.unwrap();
        assert_eq!(storage.result_count().await.unwrap(), 0);
    }
}
