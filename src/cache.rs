//! Bounded cache combining LRU eviction with absolute expiry
//!
//! Entries live until their TTL elapses, an explicit delete, or eviction
//! when the cache is at capacity — the least-recently-used entry goes
//! first, where "used" means read via `get`, not merely present. Expired
//! entries are deleted lazily on read and count as misses.
//!
//! # Example
//!
//! ```
//! use beacon_core_resilience::cache::{BoundedCache, CacheConfig};
//! use std::time::Duration;
//!
//! let cache: BoundedCache<String> = BoundedCache::new(CacheConfig {
//!     max_entries: 100,
//!     ttl: Duration::from_secs(300),
//! });
//!
//! cache.insert("fingerprint", "cached response".to_string());
//! assert_eq!(cache.get("fingerprint").as_deref(), Some("cached response"));
//! assert!(cache.get("unknown").is_none());
//! ```

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Capacity and lifetime for one cache instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of live entries
    pub max_entries: usize,
    /// Absolute lifetime of each entry, refreshed on every insert
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    created_at: Instant,
    hits: u64,
    /// Monotonic use sequence; the entry with the smallest value is the
    /// least recently used
    last_used: u64,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    use_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

/// Lifetime statistics for a cache instance.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses) over the cache's entire lifetime
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
}

/// Fixed-capacity cache with LRU eviction and per-entry TTL.
///
/// Thread-safe; values are cloned out on read, so `V` is typically a cheap
/// clone (a response struct behind the scenes, or an `Arc`).
#[derive(Debug)]
pub struct BoundedCache<V> {
    config: CacheConfig,
    inner: Mutex<CacheInner<V>>,
}

impl<V: Clone> BoundedCache<V> {
    /// Create an empty cache
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                use_seq: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up `key`. An expired entry is deleted and reported as a miss.
    /// A hit promotes the entry to most-recently-used.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();
        let expired = inner.entries.get(key).map(|entry| now > entry.expires_at);
        match expired {
            None => {
                inner.misses += 1;
                None
            }
            Some(true) => {
                inner.entries.remove(key);
                inner.expirations += 1;
                inner.misses += 1;
                None
            }
            Some(false) => {
                inner.use_seq += 1;
                inner.hits += 1;
                let seq = inner.use_seq;
                let entry = inner.entries.get_mut(key).expect("entry checked above");
                entry.last_used = seq;
                entry.hits += 1;
                Some(entry.value.clone())
            }
        }
    }

    /// Insert or replace `key`. Every insert establishes a fresh expiry,
    /// regardless of any prior entry for the key. Evicts least-recently-used
    /// entries until the cache is within capacity.
    pub fn insert(&self, key: &str, value: V) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();
        inner.use_seq += 1;
        let seq = inner.use_seq;
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: now + self.config.ttl,
                created_at: now,
                hits: 0,
                last_used: seq,
            },
        );

        while inner.entries.len() > self.config.max_entries {
            let lru_key = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(k, _)| k.clone());
            match lru_key {
                Some(k) => {
                    inner.entries.remove(&k);
                    inner.evictions += 1;
                    debug!(key = %k, "evicted least-recently-used cache entry");
                }
                None => break,
            }
        }
    }

    /// Whether a live entry exists for `key`. Deletes an expired entry but
    /// never promotes recency or touches hit statistics.
    pub fn contains(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();
        let expired = inner.entries.get(key).map(|entry| now > entry.expires_at);
        match expired {
            None => false,
            Some(true) => {
                inner.entries.remove(key);
                inner.expirations += 1;
                false
            }
            Some(false) => true,
        }
    }

    /// Remove `key`, returning its value if it was live
    pub fn remove(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();
        let entry = inner.entries.remove(key)?;
        if now > entry.expires_at {
            inner.expirations += 1;
            None
        } else {
            Some(entry.value)
        }
    }

    /// Drop every entry. Lifetime statistics are preserved.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.clear();
    }

    /// Delete every expired entry; returns the number removed
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| now <= entry.expires_at);
        let removed = before - inner.entries.len();
        inner.expirations += removed as u64;
        removed
    }

    /// Lifetime statistics. Sweeps expired entries first so the reported
    /// size is accurate.
    pub fn stats(&self) -> CacheStats {
        self.purge_expired();
        let inner = self.inner.lock().expect("cache lock poisoned");
        let lookups = inner.hits + inner.misses;
        CacheStats {
            entries: inner.entries.len(),
            capacity: self.config.max_entries,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
            evictions: inner.evictions,
            expirations: inner.expirations,
        }
    }

    /// Number of entries currently stored (including any not yet swept)
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Age of the entry for `key`, if live. Mainly for diagnostics.
    pub fn entry_age(&self, key: &str) -> Option<Duration> {
        let inner = self.inner.lock().expect("cache lock poisoned");
        let entry = inner.entries.get(key)?;
        if Instant::now() > entry.expires_at {
            None
        } else {
            Some(entry.created_at.elapsed())
        }
    }
}
