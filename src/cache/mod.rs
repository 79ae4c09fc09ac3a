//! The cache facade — the one entry point consumers call.
//!
//! [`Cache::fetch_or_compute`] composes the whole pipeline: build the
//! canonical key, check the store, coalesce concurrent misses onto a single
//! producer run, store the fresh result, and hand every caller the value with
//! its etag. It guarantees that
//!
//! - at most one producer executes per key at a time, and
//! - a populated cache entry is never the product of a failed computation.
//!
//! From the outer system's perspective the cache is fail-transparent: a miss
//! plus a producer failure looks exactly like calling the uncached producer
//! directly.
//!
//! A `Cache` is built once at process start and passed explicitly (dependency
//! injection, not a global), so tests can instantiate isolated caches.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::config::CacheConfig;
use crate::flight::InFlightRegistry;
use crate::key::{KeyError, build_key};
use crate::reaper::{Reaper, ReaperHandle};
use crate::store::{CacheStats, CacheStore};

/// A cached payload together with its etag.
///
/// The etag is stable for identical content and changes whenever the content
/// changes; an HTTP layer can surface it as a response header for conditional
/// requests. It is empty when the entry was produced under a zero ("never
/// cache") TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue {
    /// The producer's opaque result.
    pub value: Bytes,
    /// Content validator for the value.
    pub etag: String,
}

/// Errors surfaced by the facade.
///
/// Producer failures are the only error class that reaches callers from the
/// cache pipeline itself; internal housekeeping faults are logged and
/// swallowed. Key errors fail fast before any cache work happens.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The caller supplied a namespace or parameters that cannot form a
    /// collision-free key.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The wrapped computation failed; every coalesced waiter receives the
    /// same rejection, and nothing is cached.
    #[error("producer failed: {0}")]
    Producer(Arc<anyhow::Error>),

    /// A typed payload could not be encoded to or decoded from its cached
    /// byte form.
    #[error("cached value codec: {0}")]
    Codec(Arc<serde_json::Error>),
}

impl CacheError {
    fn producer(err: anyhow::Error) -> Self {
        Self::Producer(Arc::new(err))
    }
}

/// Bounded TTL cache with single-flight request coalescing.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use bytes::Bytes;
/// use recache::{Cache, CacheConfig};
///
/// # async fn demo() -> Result<(), recache::CacheError> {
/// let cache = Cache::new(CacheConfig::default());
///
/// let fetched = cache
///     .fetch_or_compute("latest_jobs", &[("region", "eu")], None, || async {
///         // e.g. a database query
///         Ok(Bytes::from_static(b"[]"))
///     })
///     .await?;
///
/// assert_eq!(fetched.value.as_ref(), b"[]");
/// # Ok(())
/// # }
/// ```
pub struct Cache {
    config: CacheConfig,
    store: Arc<CacheStore>,
    flights: Arc<InFlightRegistry<CachedValue, CacheError>>,
    reaper: Option<ReaperHandle>,
}

impl Cache {
    /// Creates a cache from the given configuration.
    ///
    /// No background task is spawned here; call
    /// [`start_reaper`](Self::start_reaper) from within a Tokio runtime to
    /// enable proactive expiry.
    pub fn new(config: CacheConfig) -> Self {
        let store = Arc::new(CacheStore::new(config.max_size));
        let flights = Arc::new(InFlightRegistry::new(config.max_pending));
        Self {
            config,
            store,
            flights,
            reaper: None,
        }
    }

    /// Starts the periodic reaper sweep; a previous sweep task, if any, is
    /// replaced. Must be called from within a Tokio runtime.
    pub fn start_reaper(&mut self) {
        let handle = Reaper::new(self.config.sweep_interval)
            .spawn(Arc::clone(&self.store), Arc::clone(&self.flights));
        self.reaper = Some(handle);
    }

    /// Returns the cached value for (`namespace`, `params`), computing it via
    /// `producer` on a miss.
    ///
    /// On a miss, concurrent callers for the same key are coalesced onto one
    /// producer execution; the fresh result is stored with `ttl` (falling
    /// back to the namespace default from the config when `None`) and every
    /// waiter receives the same value and etag.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Key`] when the inputs cannot form a collision-free key.
    /// - [`CacheError::Producer`] when the computation fails; the store is
    ///   left untouched and the very next call retries from scratch.
    pub async fn fetch_or_compute<F, Fut>(
        &self,
        namespace: &str,
        params: &[(&str, &str)],
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<CachedValue, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        let key = build_key(namespace, params)?;

        if let Some((value, etag)) = self.store.get(&key) {
            return Ok(CachedValue { value, etag });
        }
        debug!(key = %key, "cache miss");

        let ttl = ttl.unwrap_or_else(|| self.config.ttl_for(namespace));
        let store = Arc::clone(&self.store);
        let producer_key = key.clone();

        self.flights
            .coalesce(&key, move || async move {
                match producer().await {
                    Ok(value) => {
                        // Stored before the flight is released, so the write
                        // and the registry removal form one logical step and
                        // every waiter sees the stored etag.
                        let etag = store.set(&producer_key, value.clone(), ttl);
                        Ok(CachedValue { value, etag })
                    }
                    Err(err) => Err(CacheError::producer(err)),
                }
            })
            .await
    }

    /// Typed variant of [`fetch_or_compute`](Self::fetch_or_compute): the
    /// producer returns any serde-serializable value, cached as its JSON byte
    /// form.
    ///
    /// Returns the value alongside its etag.
    ///
    /// # Errors
    ///
    /// As [`fetch_or_compute`](Self::fetch_or_compute), plus
    /// [`CacheError::Codec`] when a cached byte form cannot be decoded as
    /// `T` — e.g. when a namespace is reused across incompatible payload
    /// types.
    pub async fn fetch_or_compute_json<T, F, Fut>(
        &self,
        namespace: &str,
        params: &[(&str, &str)],
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<(T, String), CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let fetched = self
            .fetch_or_compute(namespace, params, ttl, move || async move {
                let value = producer().await?;
                let encoded = serde_json::to_vec(&value)?;
                Ok(Bytes::from(encoded))
            })
            .await?;

        let decoded = serde_json::from_slice(&fetched.value)
            .map_err(|e| CacheError::Codec(Arc::new(e)))?;
        Ok((decoded, fetched.etag))
    }

    /// Drops every cached derivation of `namespace`, returning the count.
    ///
    /// The data layer calls this after a successful mutation of the
    /// underlying entity.
    pub fn invalidate_namespace(&self, namespace: &str) -> usize {
        self.store.invalidate_by_prefix(namespace)
    }

    /// Removes the single entry for (`namespace`, `params`), returning
    /// whether it was present.
    ///
    /// # Errors
    ///
    /// [`CacheError::Key`] when the inputs cannot form a valid key.
    pub fn delete(&self, namespace: &str, params: &[(&str, &str)]) -> Result<bool, CacheError> {
        let key = build_key(namespace, params)?;
        Ok(self.store.delete(&key))
    }

    /// Read-only operational snapshot of the underlying store.
    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    /// Number of computations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Returns `true` while a reaper sweep task is attached to this cache.
    pub fn reaper_running(&self) -> bool {
        self.reaper.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> Cache {
        Cache::new(CacheConfig::default())
    }

    fn body(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    // ── hit / miss flow ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn miss_computes_then_hit_skips_producer() {
        let cache = cache();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let runs = Arc::clone(&runs);
            let fetched = cache
                .fetch_or_compute("ns", &[("id", "1")], None, move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(body("value"))
                })
                .await
                .unwrap();
            assert_eq!(fetched.value, body("value"));
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
    }

    #[tokio::test]
    async fn etag_is_stable_across_hits() {
        let cache = cache();
        let first = cache
            .fetch_or_compute("ns", &[], None, || async { Ok(body("x")) })
            .await
            .unwrap();
        let second = cache
            .fetch_or_compute("ns", &[], None, || async { Ok(body("other")) })
            .await
            .unwrap();
        assert_eq!(first.etag, second.etag);
        assert!(!first.etag.is_empty());
    }

    #[tokio::test]
    async fn param_order_does_not_change_the_entry() {
        let cache = cache();
        cache
            .fetch_or_compute("ns", &[("a", "1"), ("b", "2")], None, || async {
                Ok(body("v"))
            })
            .await
            .unwrap();

        // Reversed params must hit the same entry, not recompute.
        let fetched = cache
            .fetch_or_compute("ns", &[("b", "2"), ("a", "1")], None, || async {
                Ok(body("different"))
            })
            .await
            .unwrap();
        assert_eq!(fetched.value, body("v"));
    }

    #[tokio::test]
    async fn invalid_key_fails_fast() {
        let cache = cache();
        let result = cache
            .fetch_or_compute("bad:ns", &[], None, || async { Ok(body("v")) })
            .await;
        assert!(matches!(result, Err(CacheError::Key(_))));
    }

    // ── TTL ───────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn expired_entry_recomputes() {
        let cache = cache();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let runs = Arc::clone(&runs);
            cache
                .fetch_or_compute(
                    "ns",
                    &[],
                    Some(Duration::from_millis(20)),
                    move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(body("v"))
                    },
                )
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn namespace_ttl_table_is_used_when_no_override() {
        let config = CacheConfig::default().namespace_ttl("volatile", Duration::ZERO);
        let cache = Cache::new(config);

        // Zero TTL from the table means never-cache: empty etag, no entry.
        let fetched = cache
            .fetch_or_compute("volatile", &[], None, || async { Ok(body("v")) })
            .await
            .unwrap();
        assert!(fetched.etag.is_empty());
        assert_eq!(cache.stats().total, 0);
    }

    // ── coalescing ────────────────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_producer_run() {
        let cache = Arc::new(cache());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let cache = Arc::clone(&cache);
            let runs = Arc::clone(&runs);
            tasks.push(tokio::spawn(async move {
                cache
                    .fetch_or_compute(
                        "ns",
                        &[("id", "1")],
                        Some(Duration::from_secs(1)),
                        move || async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            Ok(body("shared"))
                        },
                    )
                    .await
            }));
        }

        for task in tasks {
            let fetched = task.await.unwrap().unwrap();
            assert_eq!(fetched.value, body("shared"));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight(), 0);
    }

    // ── failure semantics ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = cache();
        let runs = Arc::new(AtomicUsize::new(0));

        let first = {
            let runs = Arc::clone(&runs);
            cache
                .fetch_or_compute("ns", &[], None, move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow!("db unavailable"))
                })
                .await
        };
        assert!(matches!(first, Err(CacheError::Producer(_))));
        assert_eq!(cache.stats().total, 0);

        let second = {
            let runs = Arc::clone(&runs);
            cache
                .fetch_or_compute("ns", &[], None, move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(body("recovered"))
                })
                .await
                .unwrap()
        };
        assert_eq!(second.value, body("recovered"));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn producer_error_message_is_preserved() {
        let cache = cache();
        let err = cache
            .fetch_or_compute("ns", &[], None, || async { Err(anyhow!("boom 42")) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom 42"));
    }

    // ── invalidation ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn invalidate_namespace_drops_all_its_entries() {
        let cache = cache();
        for id in ["1", "2"] {
            cache
                .fetch_or_compute("profiles", &[("id", id)], None, || async { Ok(body("p")) })
                .await
                .unwrap();
        }
        cache
            .fetch_or_compute("jobs", &[("id", "1")], None, || async { Ok(body("j")) })
            .await
            .unwrap();

        assert_eq!(cache.invalidate_namespace("profiles"), 2);
        let stats = cache.stats();
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn delete_removes_a_single_entry() {
        let cache = cache();
        cache
            .fetch_or_compute("ns", &[("id", "1")], None, || async { Ok(body("v")) })
            .await
            .unwrap();

        assert!(cache.delete("ns", &[("id", "1")]).unwrap());
        assert!(!cache.delete("ns", &[("id", "1")]).unwrap());
    }

    // ── JSON layer ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn json_layer_round_trips_typed_values() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Plan {
            name: String,
            price_cents: u32,
        }

        let cache = cache();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let runs = Arc::clone(&runs);
            let (plan, etag): (Plan, String) = cache
                .fetch_or_compute_json("plans", &[("tier", "pro")], None, move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(Plan {
                        name: "pro".into(),
                        price_cents: 900,
                    })
                })
                .await
                .unwrap();
            assert_eq!(plan.price_cents, 900);
            assert_eq!(plan.name, "pro");
            assert!(!etag.is_empty());
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    // ── reaper integration ────────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reaper_reclaims_write_only_entries() {
        let config = CacheConfig::default().sweep_interval(Duration::from_millis(30));
        let mut cache = Cache::new(config);
        assert!(!cache.reaper_running());
        cache.start_reaper();
        assert!(cache.reaper_running());

        cache
            .fetch_or_compute("ns", &[], Some(Duration::from_millis(10)), || async {
                Ok(body("v"))
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.stats().total, 0);
    }
}
