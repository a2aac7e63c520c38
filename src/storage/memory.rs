//! In-memory storage implementation for Scrooge.
//!
//! All four stores live behind one async mutex, so every operation
//! (including the compound read-and-remove ones) is atomic with respect to
//! every other caller in the process. Nothing is shared across processes.
//!
//! # Features
//!
//! - **Priority heap**: ready items ordered by priority, then insertion sequence
//! - **Schedule heap**: earliest eta first, then priority, then insertion
//! - **Expiring results**: optional per-key time-to-live

use super::Storage;
use crate::error::ScroogeResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Ready queue entry. The heap pops the greatest entry: highest priority,
/// then lowest sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    sequence: u64,
    data: Vec<u8>,
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Schedule entry. Reverse ordering on eta so the heap pops the earliest.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledEntry {
    eta: DateTime<Utc>,
    priority: i32,
    sequence: u64,
    data: Vec<u8>,
}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .eta
            .cmp(&self.eta)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    ready: BinaryHeap<ReadyEntry>,
    schedule: BinaryHeap<ScheduledEntry>,
    results: HashMap<String, StoredValue>,
    sequence: u64,
}

impl MemoryState {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.results.retain(|_, value| value.is_live(now));
    }

    fn live_result(&mut self, key: &str) -> Option<&StoredValue> {
        let now = Instant::now();
        if self.results.get(key).is_some_and(|value| !value.is_live(now)) {
            self.results.remove(key);
        }
        self.results.get(key)
    }
}

/// In-memory storage backend implementation
#[derive(Debug)]
pub struct MemoryStorage {
    name: String,
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    /// Create a new, empty in-memory storage for queue `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn shares_across_processes(&self) -> bool {
        false
    }

    async fn enqueue(&self, data: Vec<u8>, priority: i32) -> ScroogeResult<()> {
        let mut state = self.state.lock().await;
        let sequence = state.next_sequence();
        state.ready.push(ReadyEntry {
            priority,
            sequence,
            data,
        });
        Ok(())
    }

    async fn dequeue(&self) -> ScroogeResult<Option<Vec<u8>>> {
        let mut state = self.state.lock().await;
        Ok(state.ready.pop().map(|entry| entry.data))
    }

    async fn queue_size(&self) -> ScroogeResult<usize> {
        Ok(self.state.lock().await.ready.len())
    }

    async fn enqueued_items(&self, limit: Option<usize>) -> ScroogeResult<Vec<Vec<u8>>> {
        let state = self.state.lock().await;
        let mut entries: Vec<&ReadyEntry> = state.ready.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        Ok(entries
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|entry| entry.data.clone())
            .collect())
    }

    async fn flush_queue(&self) -> ScroogeResult<()> {
        self.state.lock().await.ready.clear();
        Ok(())
    }

    async fn schedule_add(
        &self,
        data: Vec<u8>,
        eta: DateTime<Utc>,
        priority: i32,
    ) -> ScroogeResult<()> {
        let mut state = self.state.lock().await;
        let sequence = state.next_sequence();
        state.schedule.push(ScheduledEntry {
            eta,
            priority,
            sequence,
            data,
        });
        Ok(())
    }

    async fn schedule_read(&self, timestamp: DateTime<Utc>) -> ScroogeResult<Vec<Vec<u8>>> {
        let mut state = self.state.lock().await;
        let mut due = Vec::new();
        while state
            .schedule
            .peek()
            .is_some_and(|entry| entry.eta <= timestamp)
        {
            if let Some(entry) = state.schedule.pop() {
                due.push(entry.data);
            }
        }
        Ok(due)
    }

    async fn schedule_size(&self) -> ScroogeResult<usize> {
        Ok(self.state.lock().await.schedule.len())
    }

    async fn scheduled_items(&self, limit: Option<usize>) -> ScroogeResult<Vec<Vec<u8>>> {
        let state = self.state.lock().await;
        let mut entries: Vec<&ScheduledEntry> = state.schedule.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        Ok(entries
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|entry| entry.data.clone())
            .collect())
    }

    async fn flush_schedule(&self) -> ScroogeResult<()> {
        self.state.lock().await.schedule.clear();
        Ok(())
    }

    async fn put_result(
        &self,
        key: &str,
        value: Vec<u8>,
        expire: Option<Duration>,
    ) -> ScroogeResult<()> {
        let expires_at = expire.and_then(|ttl| Instant::now().checked_add(ttl));
        self.state.lock().await.results.insert(
            key.to_string(),
            StoredValue {
                data: value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn peek_result(&self, key: &str) -> ScroogeResult<Option<Vec<u8>>> {
        let mut state = self.state.lock().await;
        Ok(state.live_result(key).map(|value| value.data.clone()))
    }

    async fn pop_result(&self, key: &str) -> ScroogeResult<Option<Vec<u8>>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        Ok(state
            .results
            .remove(key)
            .filter(|value| value.is_live(now))
            .map(|value| value.data))
    }

    async fn put_if_empty(&self, key: &str, value: Vec<u8>) -> ScroogeResult<bool> {
        let mut state = self.state.lock().await;
        if state.live_result(key).is_some() {
            return Ok(false);
        }
        state.results.insert(
            key.to_string(),
            StoredValue {
                data: value,
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn has(&self, key: &str) -> ScroogeResult<bool> {
        let mut state = self.state.lock().await;
        Ok(state.live_result(key).is_some())
    }

    async fn delete(&self, key: &str) -> ScroogeResult<bool> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        Ok(state
            .results
            .remove(key)
            .is_some_and(|value| value.is_live(now)))
    }

    async fn result_count(&self) -> ScroogeResult<usize> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        Ok(state.results.len())
    }

    async fn result_items(&self) -> ScroogeResult<HashMap<String, Vec<u8>>> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        Ok(state
            .results
            .iter()
            .map(|(key, value)| (key.clone(), value.data.clone()))
            .collect())
    }

    async fn flush_results(&self) -> ScroogeResult<()> {
        self.state.lock().await.results.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    fn item(label: &str) -> Vec<u8> {
        label.as_bytes().to_vec()
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let storage = MemoryStorage::new("test");
        for (label, priority) in [("a0", 0), ("b1", 1), ("c2", 2), ("d0", 0), ("e1", 1), ("f2", 2)] {
            storage.enqueue(item(label), priority).await.unwrap();
        }

        let peeked = storage.enqueued_items(Some(2)).await.unwrap();
        assert_eq!(peeked, vec![item("c2"), item("f2")]);

        let mut order = Vec::new();
        while let Some(data) = storage.dequeue().await.unwrap() {
            order.push(String::from_utf8(data).unwrap());
        }
        assert_eq!(order, vec!["c2", "f2", "b1", "e1", "a0", "d0"]);
        assert_eq!(storage.queue_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_negative_priorities_sort_last() {
        let storage = MemoryStorage::new("test");
        storage.enqueue(item("low"), -5).await.unwrap();
        storage.enqueue(item("normal"), 0).await.unwrap();
        assert_eq!(storage.dequeue().await.unwrap(), Some(item("normal")));
        assert_eq!(storage.dequeue().await.unwrap(), Some(item("low")));
        assert_eq!(storage.dequeue().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_schedule_read_drains_due_entries_only() {
        let storage = MemoryStorage::new("test");
        let now = Utc::now();
        storage
            .schedule_add(item("later"), now + ChronoDuration::seconds(60), 0)
            .await
            .unwrap();
        storage.schedule_add(item("low"), now, 0).await.unwrap();
        storage.schedule_add(item("high"), now, 5).await.unwrap();
        storage
            .schedule_add(item("earliest"), now - ChronoDuration::seconds(5), 0)
            .await
            .unwrap();

        let due = storage.schedule_read(now).await.unwrap();
        assert_eq!(due, vec![item("earliest"), item("high"), item("low")]);
        assert_eq!(storage.schedule_size().await.unwrap(), 1);
        assert!(storage.schedule_read(now).await.unwrap().is_empty());

        let due = storage
            .schedule_read(now + ChronoDuration::seconds(60))
            .await
            .unwrap();
        assert_eq!(due, vec![item("later")]);
    }

    #[tokio::test]
    async fn test_results_pop_once() {
        let storage = MemoryStorage::new("test");
        storage.put_result("k", item("v"), None).await.unwrap();

        assert_eq!(storage.peek_result("k").await.unwrap(), Some(item("v")));
        assert_eq!(storage.result_count().await.unwrap(), 1);
        assert_eq!(storage.pop_result("k").await.unwrap(), Some(item("v")));
        assert_eq!(storage.pop_result("k").await.unwrap(), None);
        assert_eq!(storage.result_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_put_if_empty_and_delete() {
        let storage = MemoryStorage::new("test");
        assert!(storage.put_if_empty("lock", item("1")).await.unwrap());
        assert!(!storage.put_if_empty("lock", item("2")).await.unwrap());
        assert!(storage.has("lock").await.unwrap());
        assert_eq!(storage.peek_result("lock").await.unwrap(), Some(item("1")));

        assert!(storage.delete("lock").await.unwrap());
        assert!(!storage.delete("lock").await.unwrap());
        assert!(!storage.has("lock").await.unwrap());
        assert!(storage.put_if_empty("lock", item("3")).await.unwrap());
    }

    #[tokio::test]
    async fn test_result_expiry() {
        let storage = MemoryStorage::new("test");
        storage
            .put_result("short", item("v"), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        storage.put_result("long", item("v"), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(storage.peek_result("short").await.unwrap(), None);
        assert!(!storage.has("short").await.unwrap());
        let items = storage.result_items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert!(items.contains_key("long"));
    }

    #[tokio::test]
    async fn test_concurrent_dequeuers_never_share_items() {
        let storage = Arc::new(MemoryStorage::new("test"));
        for i in 0..200 {
            storage.enqueue(format!("{}", i).into_bytes(), 0).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                let mut taken = Vec::new();
                while let Some(data) = storage.dequeue().await.unwrap() {
                    taken.push(data);
                    tokio::task::yield_now().await;
                }
                taken
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200);
    }
}
