//! Failed-authentication throttling per source address.
//!
//! Each source key gets a window of failed attempts. Reaching
//! `max_attempts` inside the window bans the key for `ban_duration`; while
//! banned every request from it is refused, whatever its credentials. A
//! successful authentication forgets the key. A periodic sweep drops stale,
//! unbanned records so memory stays bounded by the set of recently active
//! sources.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use axum::http::HeaderMap;
use herald_core::Clock;
use herald_delivery::sweeper::spawn_sweeper;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Rate limiter settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Failed attempts that trigger a ban.
    pub max_attempts: u32,
    /// Window over which failures are counted.
    pub window: Duration,
    /// How long a ban lasts.
    pub ban_duration: Duration,
    /// Sweep cadence.
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::from_secs(60),
            ban_duration: Duration::from_secs(15 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AttemptRecord {
    attempts: u32,
    first_attempt: Instant,
    banned_until: Option<Instant>,
}

impl AttemptRecord {
    fn fresh(now: Instant) -> Self {
        Self { attempts: 0, first_attempt: now, banned_until: None }
    }

    fn is_banned(&self, now: Instant) -> bool {
        self.banned_until.is_some_and(|until| now < until)
    }

    fn ban_expired(&self, now: Instant) -> bool {
        self.banned_until.is_some_and(|until| now >= until)
    }
}

/// Snapshot of limiter state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimiterStats {
    /// Keys with a live record.
    pub tracked_keys: usize,
    /// Keys currently banned.
    pub banned_keys: usize,
    /// Failed attempts that trigger a ban.
    pub max_attempts: u32,
    /// Counting window in seconds.
    pub window_secs: u64,
    /// Ban length in seconds.
    pub ban_duration_secs: u64,
}

/// Per-source failed-attempt counter with temporary bans.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    records: Mutex<HashMap<String, AttemptRecord>>,
}

impl RateLimiter {
    /// Creates an empty limiter.
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, records: Mutex::new(HashMap::new()) }
    }

    /// Settings in use.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AttemptRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `source` may attempt authentication.
    ///
    /// An expired ban, or a counting window that has run out, resets the
    /// key's record.
    pub fn is_allowed(&self, source: &str) -> bool {
        let now = self.clock.now();
        let mut records = self.lock();
        let Some(record) = records.get_mut(source) else {
            return true;
        };

        if record.is_banned(now) {
            return false;
        }

        if record.ban_expired(now) || now.saturating_duration_since(record.first_attempt) > self.config.window {
            *record = AttemptRecord::fresh(now);
        }
        true
    }

    /// Counts a failed attempt. Returns true if `source` is banned
    /// afterwards.
    pub fn record_failed_attempt(&self, source: &str) -> bool {
        let now = self.clock.now();
        let mut records = self.lock();
        let record = records.entry(source.to_string()).or_insert_with(|| AttemptRecord::fresh(now));

        if record.is_banned(now) {
            return true;
        }

        if record.ban_expired(now) || now.saturating_duration_since(record.first_attempt) > self.config.window {
            *record = AttemptRecord::fresh(now);
        }

        record.attempts = record.attempts.saturating_add(1);
        if record.attempts >= self.config.max_attempts {
            record.banned_until = Some(now + self.config.ban_duration);
            warn!(
                source,
                attempts = record.attempts,
                ban_secs = self.config.ban_duration.as_secs(),
                "source banned after repeated authentication failures"
            );
            return true;
        }

        debug!(source, attempts = record.attempts, "failed authentication attempt recorded");
        false
    }

    /// Forgets `source`: clears its counter and any ban.
    pub fn record_successful_attempt(&self, source: &str) {
        self.lock().remove(source);
    }

    /// Current counters.
    pub fn stats(&self) -> RateLimiterStats {
        let now = self.clock.now();
        let records = self.lock();
        RateLimiterStats {
            tracked_keys: records.len(),
            banned_keys: records.values().filter(|record| record.is_banned(now)).count(),
            max_attempts: self.config.max_attempts,
            window_secs: self.config.window.as_secs(),
            ban_duration_secs: self.config.ban_duration.as_secs(),
        }
    }

    /// Drops unbanned records older than the ban duration. Returns how many
    /// were dropped.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let ban_duration = self.config.ban_duration;
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, record| {
            record.is_banned(now) || now.saturating_duration_since(record.first_attempt) <= ban_duration
        });
        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, remaining = records.len(), "rate limiter records swept");
        }
        removed
    }

    /// Starts the periodic sweep.
    pub fn start_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        spawn_sweeper("rate_limiter", self.config.cleanup_interval, token, move || {
            let limiter = limiter.clone();
            async move {
                limiter.sweep();
            }
        })
    }
}

/// Resolves the key a request is throttled by: the forwarded-for header,
/// then the real-ip header, then the socket address. The first non-empty
/// value wins and is used verbatim.
pub fn source_key(headers: &HeaderMap, remote: Option<&str>) -> String {
    ["x-forwarded-for", "x-real-ip"]
        .iter()
        .filter_map(|name| headers.get(*name).and_then(|value| value.to_str().ok()))
        .map(str::trim)
        .find(|value| !value.is_empty())
        .or(remote)
        .unwrap_or("unknown")
        .to_string()
}
