//! Bounded, expiring archive of undeliverable units.
//!
//! Units that exhaust their retries (or are refused by an open breaker) land
//! here for inspection and manual replay. The store is in-memory and
//! best-effort: it holds at most `max_size` records, evicting the oldest
//! insertion first, and a periodic sweep drops records older than `ttl`.
//! When a persistence path is configured the sweep also snapshots the store
//! to disk on a detached task.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use herald_core::{time::unix_nanos, Clock};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{DeliveryError, Result},
    sweeper::spawn_sweeper,
};

/// Dead-letter store settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterConfig {
    /// When false, `add` is a no-op.
    pub enabled: bool,
    /// Maximum records held.
    pub max_size: usize,
    /// Age (from dead time) after which a record is purged.
    pub ttl: Duration,
    /// Sweep cadence.
    pub flush_interval: Duration,
    /// Snapshot file written on each sweep.
    pub persist_path: Option<PathBuf>,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 1000,
            ttl: Duration::from_secs(24 * 60 * 60),
            flush_interval: Duration::from_secs(5 * 60),
            persist_path: None,
        }
    }
}

/// A unit that could not be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Record id. Assigned by the store when empty.
    #[serde(default)]
    pub id: String,
    /// Destination name.
    pub destination: String,
    /// Transformed payload that was being sent.
    pub payload: serde_json::Value,
    /// When work on the unit began.
    pub started_at: DateTime<Utc>,
    /// When the unit was declared dead. Assigned by the store when absent.
    #[serde(default)]
    pub dead_at: Option<DateTime<Utc>>,
    /// Attempts made.
    pub attempts: u32,
    /// Text of the final error.
    pub last_error: String,
    /// Every error encountered, in order.
    #[serde(default)]
    pub error_history: Vec<String>,
    /// Free-form context (unit index, fingerprints, content type).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl DeadLetterRecord {
    /// Creates a record without an id or dead time.
    pub fn new(
        destination: impl Into<String>,
        payload: serde_json::Value,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: String::new(),
            destination: destination.into(),
            payload,
            started_at,
            dead_at: None,
            attempts: 0,
            last_error: String::new(),
            error_history: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        self.dead_at
            .and_then(|dead_at| (now - dead_at).to_std().ok())
            .unwrap_or_default()
    }
}

/// Aggregate view of the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterStats {
    /// Whether the store accepts records.
    pub enabled: bool,
    /// Records held.
    pub total: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// Records per destination.
    pub by_destination: BTreeMap<String, usize>,
    /// Mean attempts across records; 0.0 when empty.
    pub average_attempts: f64,
    /// Age of the oldest record in seconds.
    pub oldest_age_secs: Option<u64>,
    /// Age of the newest record in seconds.
    pub newest_age_secs: Option<u64>,
}

#[derive(Debug, Default)]
struct StoreInner {
    records: HashMap<String, DeadLetterRecord>,
    order: VecDeque<String>,
}

impl StoreInner {
    fn remove(&mut self, id: &str) -> Option<DeadLetterRecord> {
        let record = self.records.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(record)
    }

    fn ordered(&self) -> impl Iterator<Item = &DeadLetterRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }
}

/// In-memory dead-letter archive.
#[derive(Debug)]
pub struct DeadLetterStore {
    config: DeadLetterConfig,
    clock: Arc<dyn Clock>,
    inner: RwLock<StoreInner>,
    sequence: AtomicU64,
    persist_lock: Arc<Mutex<()>>,
}

impl DeadLetterStore {
    /// Creates an empty store.
    pub fn new(config: DeadLetterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: RwLock::new(StoreInner::default()),
            sequence: AtomicU64::new(0),
            persist_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Store settings.
    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    /// Archives a record and returns its id.
    ///
    /// Assigns an id and dead time when missing. At capacity the oldest
    /// insertion is evicted first. A disabled store discards the record and
    /// returns the id it would have used.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the store was created
    /// with `max_size = 0` while enabled.
    pub async fn add(&self, mut record: DeadLetterRecord) -> Result<String> {
        if record.id.is_empty() {
            record.id = self.next_id(&record.destination);
        }
        if record.dead_at.is_none() {
            record.dead_at = Some(self.clock.now_utc());
        }

        if !self.config.enabled {
            return Ok(record.id);
        }
        if self.config.max_size == 0 {
            return Err(DeliveryError::configuration("dead-letter max_size must be greater than 0"));
        }

        let id = record.id.clone();
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.records.get_mut(&id) {
            *existing = record;
            return Ok(id);
        }

        while inner.records.len() >= self.config.max_size {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.records.remove(&oldest) {
                warn!(
                    record_id = %evicted.id,
                    destination = %evicted.destination,
                    max_size = self.config.max_size,
                    "dead-letter store full, evicting oldest record"
                );
            }
        }

        inner.order.push_back(id.clone());
        inner.records.insert(id.clone(), record);
        debug!(record_id = %id, size = inner.records.len(), "dead-letter record stored");
        Ok(id)
    }

    /// Returns the record with `id`.
    pub async fn get(&self, id: &str) -> Option<DeadLetterRecord> {
        self.inner.read().await.records.get(id).cloned()
    }

    /// Removes and returns the record with `id`.
    pub async fn remove(&self, id: &str) -> Option<DeadLetterRecord> {
        self.inner.write().await.remove(id)
    }

    /// All records in insertion order.
    pub async fn list(&self) -> Vec<DeadLetterRecord> {
        self.inner.read().await.ordered().cloned().collect()
    }

    /// Records for one destination in insertion order.
    pub async fn list_by_destination(&self, destination: &str) -> Vec<DeadLetterRecord> {
        self.inner
            .read()
            .await
            .ordered()
            .filter(|record| record.destination == destination)
            .cloned()
            .collect()
    }

    /// Number of records held.
    pub async fn size(&self) -> usize {
        self.inner.read().await.records.len()
    }

    /// Drops every record. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut inner = self.inner.write().await;
        let removed = inner.records.len();
        inner.records.clear();
        inner.order.clear();
        removed
    }

    /// Counts, per-destination breakdown, mean attempts and age range.
    pub async fn stats(&self) -> DeadLetterStats {
        let now = self.clock.now_utc();
        let inner = self.inner.read().await;

        let mut by_destination = BTreeMap::new();
        let mut attempts_sum = 0_u64;
        for record in inner.records.values() {
            *by_destination.entry(record.destination.clone()).or_insert(0) += 1;
            attempts_sum += u64::from(record.attempts);
        }

        let total = inner.records.len();
        let average_attempts = if total == 0 { 0.0 } else { attempts_sum as f64 / total as f64 };
        let ages = inner.records.values().map(|record| record.age(now).as_secs());

        DeadLetterStats {
            enabled: self.config.enabled,
            total,
            max_size: self.config.max_size,
            by_destination,
            average_attempts,
            oldest_age_secs: ages.clone().max(),
            newest_age_secs: ages.min(),
        }
    }

    /// Purges expired records and, when configured, starts a snapshot write.
    /// Returns how many records were purged.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now_utc();
        let purged = {
            let mut inner = self.inner.write().await;
            let expired: Vec<String> = inner
                .records
                .values()
                .filter(|record| record.age(now) > self.config.ttl)
                .map(|record| record.id.clone())
                .collect();
            for id in &expired {
                inner.remove(id);
            }
            expired.len()
        };

        if purged > 0 {
            info!(purged, "expired dead-letter records removed");
        }

        if let Some(path) = &self.config.persist_path {
            self.spawn_persist(path.clone()).await;
        }

        purged
    }

    /// Starts the periodic sweep.
    pub fn start_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        spawn_sweeper("dead_letter", self.config.flush_interval, token, move || {
            let store = store.clone();
            async move {
                store.sweep().await;
            }
        })
    }

    /// Loads records from a snapshot written by an earlier process.
    /// Returns how many were restored. A missing file restores nothing.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InternalError` if the file cannot be read or
    /// parsed.
    pub async fn restore(&self, path: &Path) -> Result<usize> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(DeliveryError::internal(format!(
                    "failed to read dead-letter snapshot {}: {e}",
                    path.display()
                )));
            },
        };

        let records: Vec<DeadLetterRecord> = serde_json::from_slice(&bytes).map_err(|e| {
            DeliveryError::internal(format!("invalid dead-letter snapshot {}: {e}", path.display()))
        })?;

        let count = records.len();
        for record in records {
            self.add(record).await?;
        }
        info!(count, path = %path.display(), "dead-letter records restored");
        Ok(count)
    }

    /// Writes the snapshot and waits for it, after any write already in
    /// flight. Does nothing without a persistence path.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InternalError` if the snapshot cannot be
    /// written.
    pub async fn persist_now(&self) -> Result<()> {
        let Some(path) = &self.config.persist_path else {
            return Ok(());
        };

        let _guard = self.persist_lock.lock().await;
        let snapshot = self.list().await;
        let bytes = write_snapshot(path, &snapshot).await.map_err(|e| {
            DeliveryError::internal(format!("failed to write dead-letter snapshot {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), records = snapshot.len(), bytes, "dead-letter snapshot written");
        Ok(())
    }

    async fn spawn_persist(&self, path: PathBuf) {
        let Ok(guard) = self.persist_lock.clone().try_lock_owned() else {
            debug!(path = %path.display(), "dead-letter snapshot already in flight, skipping");
            return;
        };

        let snapshot = self.list().await;
        tokio::spawn(async move {
            let _guard = guard;
            match write_snapshot(&path, &snapshot).await {
                Ok(bytes) => {
                    debug!(path = %path.display(), records = snapshot.len(), bytes, "dead-letter snapshot written");
                },
                Err(e) => warn!(path = %path.display(), error = %e, "dead-letter snapshot failed"),
            }
        });
    }

    fn next_id(&self, destination: &str) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{destination}-{}-{sequence}", unix_nanos(self.clock.as_ref()))
    }
}

/// Writes `records` as JSON to `<path>.tmp` and renames it over `path`.
async fn write_snapshot(path: &Path, records: &[DeadLetterRecord]) -> std::io::Result<usize> {
    let json = serde_json::to_vec_pretty(records)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(json.len())
}

#[cfg(test)]
mod tests {
    use herald_core::TestClock;
    use serde_json::json;

    use super::*;

    fn store(max_size: usize) -> (DeadLetterStore, TestClock) {
        let clock = TestClock::new();
        let config = DeadLetterConfig { max_size, ttl: Duration::from_secs(3600), ..Default::default() };
        (DeadLetterStore::new(config, Arc::new(clock.clone())), clock)
    }

    fn record(destination: &str, attempts: u32) -> DeadLetterRecord {
        let mut record = DeadLetterRecord::new(destination, json!({"text": "disk full"}), Utc::now());
        record.attempts = attempts;
        record.last_error = "server error: HTTP 503".to_string();
        record
    }

    #[tokio::test]
    async fn add_assigns_id_and_dead_time() {
        let (store, _clock) = store(10);

        let id = store.add(record("slack", 3)).await.unwrap();

        assert!(id.starts_with("slack-"));
        let stored = store.get(&id).await.unwrap();
        assert_eq!(stored.id, id);
        assert!(stored.dead_at.is_some());
    }

    #[tokio::test]
    async fn ids_are_unique_for_same_instant() {
        let (store, _clock) = store(10);

        let first = store.add(record("slack", 1)).await.unwrap();
        let second = store.add(record("slack", 1)).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(store.size().await, 2);
    }

    #[tokio::test]
    async fn evicts_oldest_when_full() {
        let (store, _clock) = store(3);

        let mut ids = Vec::new();
        for n in 0..4 {
            ids.push(store.add(record(&format!("dest-{n}"), 1)).await.unwrap());
        }

        assert_eq!(store.size().await, 3);
        assert!(store.get(&ids[0]).await.is_none());
        let listed: Vec<String> = store.list().await.into_iter().map(|r| r.id).collect();
        assert_eq!(listed, ids[1..].to_vec());
    }

    #[tokio::test]
    async fn disabled_store_ignores_adds() {
        let clock = TestClock::new();
        let config = DeadLetterConfig { enabled: false, ..Default::default() };
        let store = DeadLetterStore::new(config, Arc::new(clock));

        let id = store.add(record("slack", 3)).await.unwrap();

        assert!(!id.is_empty());
        assert_eq!(store.size().await, 0);
        assert!(!store.stats().await.enabled);
    }

    #[tokio::test]
    async fn filter_remove_and_clear() {
        let (store, _clock) = store(10);
        let slack = store.add(record("slack", 1)).await.unwrap();
        store.add(record("jira", 2)).await.unwrap();
        store.add(record("slack", 3)).await.unwrap();

        let slack_records = store.list_by_destination("slack").await;
        assert_eq!(slack_records.len(), 2);
        assert_eq!(slack_records[0].id, slack);

        assert_eq!(store.remove(&slack).await.map(|r| r.attempts), Some(1));
        assert!(store.remove(&slack).await.is_none());
        assert_eq!(store.list().await.len(), 2);

        assert_eq!(store.clear().await, 2);
        assert_eq!(store.size().await, 0);
    }

    #[tokio::test]
    async fn sweep_purges_expired_records() {
        let (store, clock) = store(10);
        let old = store.add(record("slack", 1)).await.unwrap();
        clock.advance(Duration::from_secs(3000));
        let fresh = store.add(record("slack", 1)).await.unwrap();
        clock.advance(Duration::from_secs(601));

        assert_eq!(store.sweep().await, 1);
        assert!(store.get(&old).await.is_none());
        assert!(store.get(&fresh).await.is_some());
    }

    #[tokio::test]
    async fn stats_report_breakdown_and_ages() {
        let (store, clock) = store(10);
        store.add(record("slack", 2)).await.unwrap();
        clock.advance(Duration::from_secs(100));
        store.add(record("jira", 4)).await.unwrap();
        store.add(record("slack", 3)).await.unwrap();
        clock.advance(Duration::from_secs(10));

        let stats = store.stats().await;

        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_destination.get("slack"), Some(&2));
        assert_eq!(stats.by_destination.get("jira"), Some(&1));
        assert!((stats.average_attempts - 3.0).abs() < f64::EPSILON);
        assert_eq!(stats.oldest_age_secs, Some(110));
        assert_eq!(stats.newest_age_secs, Some(10));
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead-letters.json");
        let clock = TestClock::new();
        let config = DeadLetterConfig { persist_path: Some(path.clone()), ..Default::default() };
        let store = DeadLetterStore::new(config, Arc::new(clock.clone()));
        let id = store.add(record("slack", 3)).await.unwrap();

        store.sweep().await;
        for _ in 0..200 {
            if path.exists() && store.persist_lock.try_lock().is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let restored = DeadLetterStore::new(DeadLetterConfig::default(), Arc::new(clock));
        assert_eq!(restored.restore(&path).await.unwrap(), 1);
        assert_eq!(restored.get(&id).await.unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn persist_now_writes_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead-letters.json");
        let clock = TestClock::new();
        let config = DeadLetterConfig { persist_path: Some(path.clone()), ..Default::default() };
        let store = DeadLetterStore::new(config, Arc::new(clock.clone()));
        store.add(record("slack", 2)).await.unwrap();

        store.sweep().await;
        store.add(record("jira", 1)).await.unwrap();
        store.persist_now().await.unwrap();

        let restored = DeadLetterStore::new(DeadLetterConfig::default(), Arc::new(clock));
        assert_eq!(restored.restore(&path).await.unwrap(), 2);
        assert!(!dir.path().join("dead-letters.json.tmp").exists());
    }

    #[tokio::test]
    async fn persist_now_without_path_is_noop() {
        let (store, _clock) = store(10);
        store.add(record("slack", 1)).await.unwrap();
        assert!(store.persist_now().await.is_ok());
    }

    #[tokio::test]
    async fn restore_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _clock) = store(10);
        assert_eq!(store.restore(&dir.path().join("absent.json")).await.unwrap(), 0);
    }
}
