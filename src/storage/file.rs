//! File storage implementation for Scrooge.
//!
//! Every queue lives in its own directory with one file per item:
//!
//! ```text
//! <path>/<queue>/queue/      ready items, named so that sorting by name
//!                            gives priority (highest first), then FIFO
//! <path>/<queue>/schedule/   scheduled items, named by eta then priority
//! <path>/<queue>/results/    one file per key, hex-encoded
//! <path>/<queue>/tmp/        staging area for writes and claimed items
//! <path>/<queue>/.lock       held while a compound operation runs
//! ```
//!
//! New files are written to `tmp/` and renamed into place, so readers never
//! see a partial item. Compound operations (dequeue, schedule reads, pops,
//! put-if-empty) hold the lock file, which is created exclusively and
//! removed on release; a lock file older than `stale_lock_secs` is assumed
//! abandoned by a dead process and broken. Dequeue renames the winning file
//! into `tmp/` under the lock, so two processes never receive the same item.

use super::Storage;
use crate::config::FileConfig;
use crate::error::{ScroogeError, ScroogeResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

const LOCK_POLL: Duration = Duration::from_millis(5);
const LOCK_WAIT: Duration = Duration::from_secs(10);

fn io_error(context: &'static str) -> impl FnOnce(std::io::Error) -> ScroogeError {
    move |e| ScroogeError::storage(format!("{}: {}", context, e), e)
}

/// Sorts ascending as priority descends.
fn priority_key(priority: i32) -> i64 {
    i64::from(i32::MAX) - i64::from(priority)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn encode_key(key: &str) -> String {
    key.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn decode_key(name: &str) -> Option<String> {
    if name.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..name.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(name.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

/// Result files start with the expiry in epoch milliseconds, 0 for never.
fn encode_result(value: &[u8], expire: Option<Duration>) -> Vec<u8> {
    let deadline = expire
        .map(|ttl| {
            let ttl = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            now_millis().saturating_add(ttl)
        })
        .unwrap_or(0);
    let mut bytes = deadline.to_be_bytes().to_vec();
    bytes.extend_from_slice(value);
    bytes
}

fn decode_result(bytes: &[u8]) -> Option<Vec<u8>> {
    let (header, value) = bytes.split_at_checked(8)?;
    let deadline = i64::from_be_bytes(header.try_into().ok()?);
    if deadline != 0 && now_millis() >= deadline {
        return None;
    }
    Some(value.to_vec())
}

/// Held while a compound operation runs; removes the lock file on drop.
struct DirLock<'a> {
    _local: MutexGuard<'a, ()>,
    path: PathBuf,
}

impl Drop for DirLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release lock file {}: {}", self.path.display(), e);
        }
    }
}

/// Directory-backed storage, shareable between processes on one host.
#[derive(Debug)]
pub struct FileStorage {
    name: String,
    root: PathBuf,
    stale_lock: Duration,
    /// Serializes lock-file attempts within this process
    local: Mutex<()>,
    sequence: AtomicU64,
}

impl FileStorage {
    /// Open (creating if needed) the directories for queue `name`.
    pub async fn open(name: impl Into<String>, config: FileConfig) -> ScroogeResult<Self> {
        let name = name.into();
        let root = config.path.join(&name);
        for dir in ["queue", "schedule", "results", "tmp"] {
            fs::create_dir_all(root.join(dir))
                .await
                .map_err(io_error("Failed to create storage directory"))?;
        }

        info!("✅ Opened file storage '{}' at {}", name, root.display());
        Ok(Self {
            name,
            root,
            stale_lock: Duration::from_secs(config.stale_lock_secs.max(1)),
            local: Mutex::new(()),
            sequence: AtomicU64::new(0),
        })
    }

    fn dir(&self, which: &str) -> PathBuf {
        self.root.join(which)
    }

    fn result_path(&self, key: &str) -> PathBuf {
        self.dir("results").join(encode_key(key))
    }

    /// `<nanos>-<process sequence>-<uuid>`: FIFO within a process, unique
    /// across processes.
    fn unique_suffix(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{:024}-{:010}-{}", nanos, sequence, Uuid::new_v4().simple())
    }

    async fn lock(&self) -> ScroogeResult<DirLock<'_>> {
        let local = self.local.lock().await;
        let path = self.root.join(".lock");
        let deadline = tokio::time::Instant::now() + LOCK_WAIT;

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(DirLock { _local: local, path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.lock_is_stale(&path).await {
                        warn!("🔧 Breaking stale lock {}", path.display());
                        let _ = fs::remove_file(&path).await;
                        continue;
                    }
                }
                Err(e) => return Err(io_error("Failed to create lock file")(e)),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ScroogeError::storage(
                    format!("Timed out waiting for {}", path.display()),
                    std::io::Error::from(ErrorKind::TimedOut),
                ));
            }
            tokio::time::sleep(LOCK_POLL).await;
        }
    }

    async fn lock_is_stale(&self, path: &Path) -> bool {
        match fs::metadata(path).await.and_then(|meta| meta.modified()) {
            Ok(modified) => modified
                .elapsed()
                .is_ok_and(|age| age > self.stale_lock),
            Err(_) => false,
        }
    }

    /// Write `data` to `tmp/` then rename it to `target`.
    async fn write_atomic(&self, target: PathBuf, data: &[u8]) -> ScroogeResult<()> {
        let staging = self.dir("tmp").join(Uuid::new_v4().simple().to_string());
        fs::write(&staging, data)
            .await
            .map_err(io_error("Failed to write item"))?;
        fs::rename(&staging, &target)
            .await
            .map_err(io_error("Failed to publish item"))?;
        Ok(())
    }

    /// File names in `which`, sorted.
    async fn list(&self, which: &str) -> ScroogeResult<Vec<String>> {
        let mut entries = fs::read_dir(self.dir(which))
            .await
            .map_err(io_error("Failed to list directory"))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error("Failed to list directory"))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Read the files named `names` in `which`, skipping ones that vanished.
    async fn read_all(&self, which: &str, names: &[String]) -> ScroogeResult<Vec<Vec<u8>>> {
        let mut items = Vec::with_capacity(names.len());
        for name in names {
            match fs::read(self.dir(which).join(name)).await {
                Ok(data) => items.push(data),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("Failed to read item")(e)),
            }
        }
        Ok(items)
    }

    /// Move `name` out of `which` into `tmp/`, then read and delete it.
    async fn claim(&self, which: &str, name: &str) -> ScroogeResult<Option<Vec<u8>>> {
        let claimed = self.dir("tmp").join(format!("claimed-{}", Uuid::new_v4().simple()));
        match fs::rename(self.dir(which).join(name), &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("Failed to claim item")(e)),
        }
        let data = fs::read(&claimed)
            .await
            .map_err(io_error("Failed to read claimed item"))?;
        fs::remove_file(&claimed)
            .await
            .map_err(io_error("Failed to remove claimed item"))?;
        Ok(Some(data))
    }

    async fn clear(&self, which: &str) -> ScroogeResult<()> {
        for name in self.list(which).await? {
            match fs::remove_file(self.dir(which).join(&name)).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("Failed to remove item")(e)),
            }
        }
        Ok(())
    }

    /// Live value of `key`; an expired file is removed.
    async fn read_result(&self, key: &str) -> ScroogeResult<Option<Vec<u8>>> {
        let path = self.result_path(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("Failed to read result")(e)),
        };
        match decode_result(&bytes) {
            Some(value) => Ok(Some(value)),
            None => {
                let _ = fs::remove_file(&path).await;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Storage for FileStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn shares_across_processes(&self) -> bool {
        true
    }

    async fn enqueue(&self, data: Vec<u8>, priority: i32) -> ScroogeResult<()> {
        let name = format!("{:010}-{}", priority_key(priority), self.unique_suffix());
        self.write_atomic(self.dir("queue").join(name), &data).await
    }

    async fn dequeue(&self) -> ScroogeResult<Option<Vec<u8>>> {
        let _lock = self.lock().await?;
        let Some(first) = self.list("queue").await?.into_iter().next() else {
            return Ok(None);
        };
        self.claim("queue", &first).await
    }

    async fn queue_size(&self) -> ScroogeResult<usize> {
        Ok(self.list("queue").await?.len())
    }

    async fn enqueued_items(&self, limit: Option<usize>) -> ScroogeResult<Vec<Vec<u8>>> {
        let mut names = self.list("queue").await?;
        names.truncate(limit.unwrap_or(usize::MAX));
        self.read_all("queue", &names).await
    }

    async fn flush_queue(&self) -> ScroogeResult<()> {
        let _lock = self.lock().await?;
        self.clear("queue").await
    }

    async fn schedule_add(
        &self,
        data: Vec<u8>,
        eta: DateTime<Utc>,
        priority: i32,
    ) -> ScroogeResult<()> {
        let name = format!(
            "{:020}-{:010}-{}",
            eta.timestamp_millis().max(0),
            priority_key(priority),
            self.unique_suffix()
        );
        self.write_atomic(self.dir("schedule").join(name), &data).await
    }

    async fn schedule_read(&self, timestamp: DateTime<Utc>) -> ScroogeResult<Vec<Vec<u8>>> {
        let cutoff = timestamp.timestamp_millis().max(0);
        let _lock = self.lock().await?;
        let mut items = Vec::new();
        for name in self.list("schedule").await? {
            let due = name
                .split('-')
                .next()
                .and_then(|eta| eta.parse::<i64>().ok())
                .is_some_and(|eta| eta <= cutoff);
            if !due {
                break;
            }
            if let Some(data) = self.claim("schedule", &name).await? {
                items.push(data);
            }
        }
        if !items.is_empty() {
            debug!("Read {} due items from '{}'", items.len(), self.name);
        }
        Ok(items)
    }

    async fn schedule_size(&self) -> ScroogeResult<usize> {
        Ok(self.list("schedule").await?.len())
    }

    async fn scheduled_items(&self, limit: Option<usize>) -> ScroogeResult<Vec<Vec<u8>>> {
        let mut names = self.list("schedule").await?;
        names.truncate(limit.unwrap_or(usize::MAX));
        self.read_all("schedule", &names).await
    }

    async fn flush_schedule(&self) -> ScroogeResult<()> {
        let _lock = self.lock().await?;
        self.clear("schedule").await
    }

    async fn put_result(
        &self,
        key: &str,
        value: Vec<u8>,
        expire: Option<Duration>,
    ) -> ScroogeResult<()> {
        self.write_atomic(self.result_path(key), &encode_result(&value, expire))
            .await
    }

    async fn peek_result(&self, key: &str) -> ScroogeResult<Option<Vec<u8>>> {
        self.read_result(key).await
    }

    async fn pop_result(&self, key: &str) -> ScroogeResult<Option<Vec<u8>>> {
        let _lock = self.lock().await?;
        let value = self.read_result(key).await?;
        if value.is_some() {
            match fs::remove_file(self.result_path(key)).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(io_error("Failed to remove result")(e)),
            }
        }
        Ok(value)
    }

    async fn put_if_empty(&self, key: &str, value: Vec<u8>) -> ScroogeResult<bool> {
        let _lock = self.lock().await?;
        if self.read_result(key).await?.is_some() {
            return Ok(false);
        }
        self.write_atomic(self.result_path(key), &encode_result(&value, None))
            .await?;
        Ok(true)
    }

    async fn has(&self, key: &str) -> ScroogeResult<bool> {
        Ok(self.read_result(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> ScroogeResult<bool> {
        let _lock = self.lock().await?;
        let live = self.read_result(key).await?.is_some();
        match fs::remove_file(self.result_path(key)).await {
            Ok(()) => Ok(live),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error("Failed to remove result")(e)),
        }
    }

    async fn result_count(&self) -> ScroogeResult<usize> {
        Ok(self.result_items().await?.len())
    }

    async fn result_items(&self) -> ScroogeResult<HashMap<String, Vec<u8>>> {
        let mut items = HashMap::new();
        for name in self.list("results").await? {
            let Some(key) = decode_key(&name) else {
                continue;
            };
            if let Some(value) = self.read_result(&key).await? {
                items.insert(key, value);
            }
        }
        Ok(items)
    }

    async fn flush_results(&self) -> ScroogeResult<()> {
        let _lock = self.lock().await?;
        self.clear("results").await
    }

    async fn health_check(&self) -> ScroogeResult<()> {
        fs::metadata(&self.root)
            .await
            .map_err(io_error("Storage directory is unavailable"))?;
        Ok(())
    }
}
