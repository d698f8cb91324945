//! Read-through record cache using [`moka`].
//!
//! The gateway keeps recently read records in a [`RecordCache`] keyed by
//! `backend/model:key`: the same key can name different records on
//! different backends, so an entry only answers reads routed to the backend
//! it was read from.  Each entry carries its own time-to-live (the TTL of the
//! intent it was read under), enforced by a per-entry [`Expiry`] policy.
//! Values are the opened (plaintext) JSON documents.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::future::Cache;
use serde_json::Value;
use tracing::debug;

// ── cache stats ──────────────────────────────────────────────────────

/// Counters tracking cache effectiveness.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// Hit rate in `[0.0, 1.0]`; 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} rate={:.2}%",
            self.hits(),
            self.misses(),
            self.hit_rate() * 100.0,
        )
    }
}

// ── per-entry expiry ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct CachedRecord {
    value: Value,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, CachedRecord> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedRecord,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedRecord,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

// ── record cache ─────────────────────────────────────────────────────

/// Bounded cache of JSON records with per-entry TTL.
///
/// Cheaply cloneable; clones share entries and statistics.
#[derive(Clone)]
pub struct RecordCache {
    inner: Cache<String, CachedRecord>,
    stats: Arc<CacheStats>,
}

impl RecordCache {
    pub fn new(max_capacity: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        debug!(max_capacity, "record cache created");
        Self {
            inner,
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn key(backend: &str, model: &str, key: &str) -> String {
        format!("{backend}/{model}:{key}")
    }

    pub async fn get(&self, backend: &str, model: &str, key: &str) -> Option<Value> {
        let cache_key = Self::key(backend, model, key);
        match self.inner.get(&cache_key).await {
            Some(record) => {
                self.stats.record_hit();
                debug!(key = %cache_key, "cache hit");
                Some(record.value)
            }
            None => {
                self.stats.record_miss();
                debug!(key = %cache_key, "cache miss");
                None
            }
        }
    }

    /// Insert a record.  A zero `ttl` means the entry is not cached.
    pub async fn insert(&self, backend: &str, model: &str, key: &str, value: Value, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        self.inner
            .insert(Self::key(backend, model, key), CachedRecord { value, ttl })
            .await;
    }

    pub async fn invalidate(&self, backend: &str, model: &str, key: &str) {
        self.inner.invalidate(&Self::key(backend, model, key)).await;
    }

    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Approximate entry count (moka applies writes lazily).
    pub async fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks().await;
        self.inner.entry_count()
    }
}

// ── tests ────────────────────────────────────────────────────────────
