//! Cache configuration.
//!
//! [`CacheConfig`] bundles the store capacity, the reaper interval, the
//! stuck-flight ceiling, and a per-namespace TTL table. A web layer typically
//! loads it from its settings file (the serde derives are there for exactly
//! that) and hands it to [`Cache::new`](crate::cache::Cache::new) once at
//! process start.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for a [`Cache`](crate::cache::Cache) instance.
///
/// Build one with [`CacheConfig::default`] and refine it with the chained
/// setters:
///
/// ```
/// use std::time::Duration;
/// use recache::CacheConfig;
///
/// let config = CacheConfig::default()
///     .max_size(5_000)
///     .namespace_ttl("featured_profiles", Duration::from_secs(5 * 60))
///     .namespace_ttl("subscription_plans", Duration::from_secs(30 * 60));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Soft ceiling on stored entries; exceeding it triggers batch eviction.
    pub max_size: usize,
    /// TTL applied when the caller passes no override and the namespace has
    /// no table entry.
    pub default_ttl: Duration,
    /// How often the reaper sweeps expired entries and stuck flights.
    pub sweep_interval: Duration,
    /// How long a flight may stay pending before the watchdog purges it.
    pub max_pending: Duration,
    /// Per-namespace TTL defaults, e.g. `featured_profiles → 5 min`.
    pub namespace_ttls: HashMap<String, Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            default_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
            max_pending: crate::flight::DEFAULT_MAX_PENDING,
            namespace_ttls: HashMap::new(),
        }
    }
}

impl CacheConfig {
    /// Sets the store capacity.
    #[must_use]
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the fallback TTL for namespaces without a table entry.
    #[must_use]
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sets the reaper sweep interval.
    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the stuck-flight ceiling.
    #[must_use]
    pub fn max_pending(mut self, max_pending: Duration) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Adds a per-namespace default TTL.
    #[must_use]
    pub fn namespace_ttl(mut self, namespace: impl Into<String>, ttl: Duration) -> Self {
        self.namespace_ttls.insert(namespace.into(), ttl);
        self
    }

    /// Resolves the default TTL for `namespace`.
    pub fn ttl_for(&self, namespace: &str) -> Duration {
        self.namespace_ttls
            .get(namespace)
            .copied()
            .unwrap_or(self.default_ttl)
    }
}
