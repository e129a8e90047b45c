//! Bounded, expiring LRU cache of compiled transform engines.
//!
//! Keys are the SHA-256 of the engine kind and spec text, so identical specs
//! configured on different destinations share one compiled engine. Entries
//! expire a fixed `ttl` after creation regardless of use; an expired entry is
//! a miss and gets recompiled.

use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use herald_core::{events::emit_detached, Clock, DispatchEvent, EventHandler};
use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::{DeliveryError, Result},
    sweeper::spawn_sweeper,
    transform::{EngineFactory, SharedEngine},
};

/// Template cache settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateCacheConfig {
    /// Maximum entries held.
    pub max_size: usize,
    /// Entry lifetime measured from creation.
    pub ttl: Duration,
    /// Background sweep cadence.
    pub sweep_interval: Duration,
}

impl Default for TemplateCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug)]
struct CacheEntry<E> {
    kind: String,
    value: E,
    created_at: Instant,
    last_used: Instant,
    hits: u64,
}

/// Per-entry view for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntryStats {
    /// Cache key (hex digest).
    pub key: String,
    /// Engine kind.
    pub kind: String,
    /// Hits served by this entry.
    pub hits: u64,
    /// Seconds since creation.
    pub age_secs: u64,
    /// Seconds since last use.
    pub idle_secs: u64,
}

/// Cache counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateCacheStats {
    /// Lookups served from cache.
    pub hits: u64,
    /// Lookups that compiled.
    pub misses: u64,
    /// Entries removed for capacity.
    pub evictions: u64,
    /// Entries currently held.
    pub size: usize,
    /// Capacity.
    pub max_size: usize,
    /// Entries, most recently used first.
    pub entries: Vec<CacheEntryStats>,
}

/// Deterministic cache key for `(kind, spec)`.
pub fn cache_key(kind: &str, spec: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0_u8]);
    hasher.update(spec.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// LRU + TTL cache over cloneable compiled values.
pub struct TemplateCache<E> {
    config: TemplateCacheConfig,
    clock: Arc<dyn Clock>,
    entries: Mutex<LruCache<String, CacheEntry<E>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    events: Option<Arc<dyn EventHandler>>,
}

impl<E> std::fmt::Debug for TemplateCache<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateCache")
            .field("config", &self.config)
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<E: Clone + Send + 'static> TemplateCache<E> {
    /// Creates an empty cache.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` when `max_size` is zero.
    pub fn new(config: TemplateCacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.max_size)
            .ok_or_else(|| DeliveryError::configuration("template cache max_size must be greater than 0"))?;

        Ok(Self {
            config,
            clock,
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            events: None,
        })
    }

    /// Reports each lookup as a `DispatchEvent::CacheLookup`.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry<E>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the value for `(kind, spec)`, calling `compile` on a miss.
    ///
    /// Compilation runs outside the lock; concurrent misses for one key may
    /// both compile, the later insert wins.
    ///
    /// # Errors
    ///
    /// Propagates the error from `compile`. Failed compilations are not
    /// cached.
    pub fn get_or_compile<F>(&self, kind: &str, spec: &str, compile: F) -> Result<E>
    where
        F: FnOnce() -> Result<E>,
    {
        let key = cache_key(kind, spec);
        let now = self.clock.now();

        if let Some(value) = self.lookup(&key, now) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.report(true);
            return Ok(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.report(false);

        let value = compile()?;
        let entry = CacheEntry {
            kind: kind.to_string(),
            value: value.clone(),
            created_at: now,
            last_used: now,
            hits: 0,
        };

        if let Some((evicted_key, _)) = self.lock().push(key.clone(), entry) {
            if evicted_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %evicted_key, "template cache evicted least recently used entry");
            }
        }

        Ok(value)
    }

    fn lookup(&self, key: &str, now: Instant) -> Option<E> {
        let mut entries = self.lock();
        let entry = entries.get_mut(key)?;
        if !self.is_expired(entry, now) {
            entry.last_used = now;
            entry.hits += 1;
            return Some(entry.value.clone());
        }

        entries.pop(key);
        None
    }

    fn is_expired(&self, entry: &CacheEntry<E>, now: Instant) -> bool {
        now.saturating_duration_since(entry.created_at) > self.config.ttl
    }

    fn report(&self, hit: bool) {
        if let Some(events) = &self.events {
            emit_detached(events, DispatchEvent::CacheLookup { hit });
        }
    }

    /// Whether a live entry exists for `(kind, spec)`. Does not touch recency.
    pub fn contains(&self, kind: &str, spec: &str) -> bool {
        let now = self.clock.now();
        self.lock()
            .peek(&cache_key(kind, spec))
            .is_some_and(|entry| !self.is_expired(entry, now))
    }

    /// Entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops every entry. Counters are kept.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Removes expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "template cache sweep removed expired entries");
        }
        expired.len()
    }

    /// Counters and per-entry data.
    pub fn stats(&self) -> TemplateCacheStats {
        let now = self.clock.now();
        let entries = self.lock();

        TemplateCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: entries.len(),
            max_size: self.config.max_size,
            entries: entries
                .iter()
                .map(|(key, entry)| CacheEntryStats {
                    key: key.clone(),
                    kind: entry.kind.clone(),
                    hits: entry.hits,
                    age_secs: now.saturating_duration_since(entry.created_at).as_secs(),
                    idle_secs: now.saturating_duration_since(entry.last_used).as_secs(),
                })
                .collect(),
        }
    }

    /// Starts the periodic expiry sweep.
    pub fn start_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()>
    where
        E: Sync,
    {
        let cache = Arc::clone(self);
        spawn_sweeper("template_cache", self.config.sweep_interval, token, move || {
            let cache = cache.clone();
            async move {
                cache.sweep();
            }
        })
    }
}

/// Cache of compiled transform engines.
pub type EngineCache = TemplateCache<SharedEngine>;

impl EngineCache {
    /// Returns the engine for `(kind, spec)`, compiling through `factory` on
    /// a miss.
    ///
    /// # Errors
    ///
    /// Propagates compilation errors from the factory.
    pub fn get(&self, factory: &dyn EngineFactory, kind: &str, spec: &str) -> Result<SharedEngine> {
        self.get_or_compile(kind, spec, || factory.compile(kind, spec))
    }
}
