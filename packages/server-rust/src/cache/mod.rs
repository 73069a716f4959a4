//! Bounded LRU+TTL cache backing the read-through layer.
//!
//! The cache is bounded by both entry count and byte budget. Reads promote
//! entries to most-recently-used; capacity pressure evicts from the LRU
//! end; expired entries are evicted lazily on access and by a periodic
//! sweep. Every removal fans out an eviction event to the registered
//! observers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use nosq_core::{DbError, DbResult, Document};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// TTL elapsed (lazy access eviction or the periodic sweep).
    Expired,
    /// Capacity pressure pushed the entry out of the LRU end.
    Capacity,
    /// An explicit `remove` call.
    Removed,
    /// An explicit `clear` call.
    Cleared,
}

/// Observer for cache evictions.
///
/// Used as `Arc<dyn EvictionObserver<V>>`; notifications are delivered
/// outside the cache lock.
pub trait EvictionObserver<V>: Send + Sync {
    /// Called once per evicted entry.
    fn on_evicted(&self, key: &str, value: &V, reason: EvictionReason);
}

/// Byte-cost estimate for cached values, used when `set` gets no explicit
/// size.
pub trait CacheWeight {
    /// Approximate heap footprint in bytes.
    fn weight(&self) -> u64;
}

impl CacheWeight for Document {
    fn weight(&self) -> u64 {
        serde_json::to_string(self).map_or(64, |s| s.len() as u64)
    }
}

impl CacheWeight for String {
    fn weight(&self) -> u64 {
        self.len() as u64
    }
}

impl CacheWeight for Vec<u8> {
    fn weight(&self) -> u64 {
        self.len() as u64
    }
}

/// Cache capacity parameters. All three must be positive.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries.
    pub max_items: usize,
    /// Maximum total byte cost.
    pub max_bytes: u64,
    /// TTL applied when `set` passes none.
    pub default_ttl: Duration,
}

/// Monotonic counters and current occupancy.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Successful, non-expired reads.
    pub hits: u64,
    /// Absent or expired reads.
    pub misses: u64,
    /// Capacity-driven removals only.
    pub evictions: u64,
    /// Current total byte cost.
    pub bytes: u64,
    /// Current entry count.
    pub items: u64,
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
    cost: u64,
}

struct Inner<V> {
    entries: LruCache<String, Entry<V>>,
    bytes: u64,
}

/// The bounded LRU+TTL cache.
///
/// All operations fail with `CACHE_CLOSED` once [`close`](Self::close)
/// has run.
pub struct LruTtlCache<V> {
    config: CacheConfig,
    inner: Mutex<Inner<V>>,
    observers: RwLock<Vec<Arc<dyn EvictionObserver<V>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    closed: AtomicBool,
}

impl<V: Clone + CacheWeight + Send + Sync + 'static> LruTtlCache<V> {
    /// Creates a cache with the given bounds.
    ///
    /// # Panics
    ///
    /// Panics when any bound is zero; bounds come from validated
    /// configuration.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        assert!(config.max_items > 0, "max_items must be positive");
        assert!(config.max_bytes > 0, "max_bytes must be positive");
        assert!(!config.default_ttl.is_zero(), "default_ttl must be positive");
        Self {
            config,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
            observers: RwLock::new(Vec::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Registers an eviction observer.
    pub fn add_observer(&self, observer: Arc<dyn EvictionObserver<V>>) {
        self.observers.write().push(observer);
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(DbError::CacheClosed)
        } else {
            Ok(())
        }
    }

    fn notify(&self, evicted: Vec<(String, Entry<V>, EvictionReason)>) {
        if evicted.is_empty() {
            return;
        }
        let observers = self.observers.read();
        for (key, entry, reason) in &evicted {
            for observer in observers.iter() {
                observer.on_evicted(key, &entry.value, *reason);
            }
        }
    }

    /// Reads a value, promoting it to most-recently-used on a hit.
    ///
    /// An expired entry is evicted, counted as a miss, and reported as
    /// `Expired` to observers.
    ///
    /// # Errors
    ///
    /// Returns `CACHE_CLOSED` after `close`.
    pub fn get(&self, key: &str) -> DbResult<Option<V>> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut evicted = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            let state = inner.entries.peek(key).map(|e| e.expires_at <= now);
            match state {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Some(true) => {
                    if let Some(entry) = inner.entries.pop(key) {
                        inner.bytes -= entry.cost;
                        evicted.push((key.to_string(), entry, EvictionReason::Expired));
                    }
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Some(false) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    inner.entries.get(key).map(|entry| entry.value.clone())
                }
            }
        };
        self.notify(evicted);
        Ok(result)
    }

    /// Inserts or replaces an entry as most-recently-used, then evicts
    /// from the LRU end until both capacity invariants hold.
    ///
    /// # Errors
    ///
    /// Returns `CACHE_CLOSED` after `close`.
    pub fn set(
        &self,
        key: &str,
        value: V,
        ttl: Option<Duration>,
        cost: Option<u64>,
    ) -> DbResult<()> {
        self.ensure_open()?;
        let cost = cost.unwrap_or_else(|| value.weight());
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl.unwrap_or(self.config.default_ttl),
            cost,
        };
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock();
            if let Some(old) = inner.entries.put(key.to_string(), entry) {
                inner.bytes -= old.cost;
            }
            inner.bytes += cost;
            while inner.entries.len() > self.config.max_items
                || inner.bytes > self.config.max_bytes
            {
                let Some((old_key, old_entry)) = inner.entries.pop_lru() else {
                    break;
                };
                inner.bytes -= old_entry.cost;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                evicted.push((old_key, old_entry, EvictionReason::Capacity));
            }
        }
        self.notify(evicted);
        Ok(())
    }

    /// Removes an entry, reporting `Removed` to observers.
    ///
    /// # Errors
    ///
    /// Returns `CACHE_CLOSED` after `close`.
    pub fn remove(&self, key: &str) -> DbResult<bool> {
        self.ensure_open()?;
        let mut evicted = Vec::new();
        let removed = {
            let mut inner = self.inner.lock();
            match inner.entries.pop(key) {
                Some(entry) => {
                    inner.bytes -= entry.cost;
                    evicted.push((key.to_string(), entry, EvictionReason::Removed));
                    true
                }
                None => false,
            }
        };
        self.notify(evicted);
        Ok(removed)
    }

    /// Drops every entry, reporting `Cleared` per entry.
    ///
    /// # Errors
    ///
    /// Returns `CACHE_CLOSED` after `close`.
    pub fn clear(&self) -> DbResult<()> {
        self.ensure_open()?;
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock();
            while let Some((key, entry)) = inner.entries.pop_lru() {
                evicted.push((key, entry, EvictionReason::Cleared));
            }
            inner.bytes = 0;
        }
        self.notify(evicted);
        Ok(())
    }

    /// Membership probe with the same lazy-expiry behavior as `get`, but
    /// without recency promotion or hit/miss accounting.
    ///
    /// # Errors
    ///
    /// Returns `CACHE_CLOSED` after `close`.
    pub fn contains(&self, key: &str) -> DbResult<bool> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut evicted = Vec::new();
        let present = {
            let mut inner = self.inner.lock();
            let state = inner.entries.peek(key).map(|e| e.expires_at <= now);
            match state {
                None => false,
                Some(true) => {
                    if let Some(entry) = inner.entries.pop(key) {
                        inner.bytes -= entry.cost;
                        evicted.push((key.to_string(), entry, EvictionReason::Expired));
                    }
                    false
                }
                Some(false) => true,
            }
        };
        self.notify(evicted);
        Ok(present)
    }

    /// Evicts every expired entry, returning how many were removed.
    /// Invoked by the background sweeper; harmless to call directly.
    pub fn sweep(&self) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock();
            let expired: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                if let Some(entry) = inner.entries.pop(&key) {
                    inner.bytes -= entry.cost;
                    evicted.push((key, entry, EvictionReason::Expired));
                }
            }
        }
        let count = evicted.len();
        self.notify(evicted);
        count
    }

    /// Current counters and occupancy.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bytes: inner.bytes,
            items: inner.entries.len() as u64,
        }
    }

    /// Closes the cache. Every subsequent operation fails with
    /// `CACHE_CLOSED`; held entries are dropped without events.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.bytes = 0;
    }

    /// Spawns the 60-second expiry sweeper. The task exits once the cache
    /// is closed.
    pub fn spawn_sweeper(
        cache: Arc<Self>,
        period: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if cache.closed.load(Ordering::Acquire) {
                    break;
                }
                let swept = cache.sweep();
                if swept > 0 {
                    tracing::debug!(swept, "cache sweep evicted expired entries");
                }
            }
        })
    }
}
