//! Bounded, time-expiring cache store.
//!
//! [`CacheStore`] maps canonical keys to byte payloads with per-entry TTLs.
//! Stale entries are discovered lazily on read (and proactively by the
//! [`Reaper`](crate::reaper::Reaper)); capacity pressure is relieved by a
//! batched LFU/LRU-hybrid eviction:
//!
//! - entries are ranked ascending by `(access_count, last_accessed_at)` —
//!   least-used first, least-recently-used as the tie break — and the lowest
//!   10 % are removed in one pass, amortizing the sort cost;
//! - pure LRU would evict a rarely-requested-but-just-inserted entry ahead of
//!   a hot entry that happens to be momentarily stale in access time, which is
//!   why the access count ranks first.
//!
//! All operations are synchronous map work under a single `RwLock`; the only
//! slow path is the eviction sort, which runs inside the same `set` call that
//! crossed the capacity ceiling.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single cached value with its bookkeeping metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    value: Bytes,
    etag: String,
    stored_at: Instant,
    ttl: Duration,
    access_count: u64,
    last_accessed_at: Instant,
}

impl CacheEntry {
    fn new(value: Bytes, ttl: Duration, now: Instant) -> Self {
        let etag = compute_etag(&value);
        Self {
            value,
            etag,
            stored_at: now,
            ttl,
            access_count: 0,
            last_accessed_at: now,
        }
    }

    /// An entry past its TTL is logically absent even while physically present.
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) > self.ttl
    }
}

/// Point-in-time snapshot of store contents and traffic counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries physically present, including not-yet-purged expired ones.
    pub total: usize,
    /// Entries within their TTL.
    pub active: usize,
    /// Entries past their TTL awaiting lazy or reaper purge.
    pub expired: usize,
    /// Approximate memory held by keys and values, in bytes.
    pub approx_bytes: usize,
    /// Successful reads since construction.
    pub hits: u64,
    /// Failed reads (absent or expired) since construction.
    pub misses: u64,
    /// Entries removed by capacity eviction since construction.
    pub evictions: u64,
}

/// Bounded map of canonical key → [`CacheEntry`] with TTL and capacity eviction.
///
/// Construct one instance at process start and share it explicitly (an `Arc`
/// works); there is deliberately no global singleton, so tests can run against
/// isolated stores.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use bytes::Bytes;
/// use recache::store::CacheStore;
///
/// let store = CacheStore::new(1000);
/// let etag = store.set("jobs:id=1", Bytes::from_static(b"[]"), Duration::from_secs(60));
/// let (value, cached_etag) = store.get("jobs:id=1").unwrap();
/// assert_eq!(value.as_ref(), b"[]");
/// assert_eq!(etag, cached_etag);
/// ```
#[derive(Debug)]
pub struct CacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStore {
    /// Creates an empty store that evicts once more than `max_size` entries
    /// are present.
    ///
    /// `max_size` is a soft ceiling: `set` inserts first and evicts after, so
    /// the store may transiently hold `max_size + 1` entries inside a single
    /// `set` call.
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Looks up `key`, returning its value and etag on a hit.
    ///
    /// Returns `None` when the key is absent or its TTL has elapsed; an
    /// expired entry is deleted as a side effect of the failed read (lazy
    /// expiry). A hit bumps the entry's access count and timestamp, which
    /// feed the eviction ranking.
    pub fn get(&self, key: &str) -> Option<(Bytes, String)> {
        let now = Instant::now();
        let mut entries = self.write_entries();

        let hit = match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.access_count += 1;
                entry.last_accessed_at = now;
                Some((entry.value.clone(), entry.etag.clone()))
            }
            // Expired: logically absent, purged below once the borrow ends.
            Some(_) => None,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match hit {
            Some(found) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(found)
            }
            None => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts or overwrites `key` with `value` and the given TTL, returning
    /// the entry's etag.
    ///
    /// A zero TTL means "never cache": nothing is stored and the returned
    /// etag is empty. If the insertion pushes the store past its capacity,
    /// a 10 % eviction batch runs synchronously before returning.
    pub fn set(&self, key: &str, value: Bytes, ttl: Duration) -> String {
        if ttl.is_zero() {
            return String::new();
        }

        let entry = CacheEntry::new(value, ttl, Instant::now());
        let etag = entry.etag.clone();

        let mut entries = self.write_entries();
        entries.insert(key.to_string(), entry);
        if entries.len() > self.max_size {
            self.evict_batch(&mut entries);
        }
        etag
    }

    /// Removes `key`, returning whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.write_entries().remove(key).is_some()
    }

    /// Removes every key under the given namespace prefix, returning the count.
    ///
    /// A bare namespace is normalized to `namespace:` before matching, so
    /// `invalidate_by_prefix("ns1")` cannot sweep `ns10:*` by accident. Used
    /// when an underlying entity changes and all cached derivations of it must
    /// be dropped.
    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        let needle = if prefix.ends_with(crate::key::NAMESPACE_SEPARATOR) {
            prefix.to_string()
        } else {
            format!("{prefix}{}", crate::key::NAMESPACE_SEPARATOR)
        };

        let mut entries = self.write_entries();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(&needle));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(prefix = %needle, removed, "invalidated namespace");
        }
        removed
    }

    /// Returns a snapshot of entry counts, approximate memory, and traffic
    /// counters.
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.read_entries();

        let mut active = 0;
        let mut expired = 0;
        let mut approx_bytes = 0;
        for (key, entry) in entries.iter() {
            if entry.is_expired(now) {
                expired += 1;
            } else {
                active += 1;
            }
            approx_bytes += key.len() + entry.value.len();
        }

        CacheStats {
            total: entries.len(),
            active,
            expired,
            approx_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Collects the keys of currently expired entries without removing them.
    ///
    /// Used by the reaper to plan a sweep while holding only the read lock.
    pub fn expired_keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.read_entries()
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Removes the given keys, skipping any that are no longer expired.
    ///
    /// Expiry is re-checked under the write lock: a key overwritten by a fresh
    /// `set` between sweep planning and this call is left alone.
    pub fn remove_if_expired(&self, keys: &[String]) -> usize {
        let now = Instant::now();
        let mut entries = self.write_entries();
        let mut removed = 0;
        for key in keys {
            if entries.get(key).is_some_and(|e| e.is_expired(now)) {
                entries.remove(key);
                removed += 1;
            }
        }
        removed
    }

    // Rank entries ascending by (access_count, last_accessed_at) and drop the
    // lowest ceil(10%). Called with the write lock held, so the batch is
    // atomic from the perspective of concurrent readers.
    fn evict_batch(&self, entries: &mut HashMap<String, CacheEntry>) {
        let batch = entries.len().div_ceil(10);
        let mut ranked: Vec<(String, u64, Instant)> = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.access_count, entry.last_accessed_at))
            .collect();
        ranked.sort_unstable_by(|a, b| (a.1, a.2).cmp(&(b.1, b.2)));

        for (key, _, _) in ranked.into_iter().take(batch) {
            entries.remove(&key);
        }
        self.evictions.fetch_add(batch as u64, Ordering::Relaxed);
        debug!(evicted = batch, remaining = entries.len(), "capacity eviction");
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, CacheEntry>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, CacheEntry>> {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Derives the etag for a payload: `<len>-<content hash>`.
///
/// Stable for identical content, changed whenever content changes. This is a
/// cache validator, not a security token, so a non-cryptographic hash is
/// sufficient.
fn compute_etag(value: &Bytes) -> String {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    format!("{:x}-{:016x}", value.len(), hasher.finish())
}
