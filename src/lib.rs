//! # recache
//!
//! An in-process TTL cache with single-flight request coalescing, built for
//! async services that need to shield a data layer from redundant and
//! duplicate work under concurrent load.
//!
//! One facade composes the pipeline: a canonical key builder, a bounded
//! LFU/LRU-hybrid store with lazy expiry, an in-flight registry that collapses
//! concurrent identical misses into a single producer execution, and a
//! background reaper for entries that would otherwise leak.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use bytes::Bytes;
//! use recache::{Cache, CacheConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), recache::CacheError> {
//!     let mut cache = Cache::new(
//!         CacheConfig::default()
//!             .max_size(10_000)
//!             .namespace_ttl("latest_jobs", Duration::from_secs(3 * 60)),
//!     );
//!     cache.start_reaper();
//!
//!     let fetched = cache
//!         .fetch_or_compute("latest_jobs", &[("region", "eu")], None, || async {
//!             // Fifty concurrent callers here mean one database query.
//!             Ok(Bytes::from_static(b"[]"))
//!         })
//!         .await?;
//!
//!     println!("etag: {}", fetched.etag);
//!     Ok(())
//! }
//! ```

// ── Pipeline modules, leaf-first ──────────────────────────────────────────────
pub mod key;
pub mod store;
pub mod flight;
pub mod reaper;

// ── Configuration and facade ──────────────────────────────────────────────────
pub mod cache;
pub mod config;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{Cache, CacheError, CachedValue};
pub use config::CacheConfig;
pub use key::{KeyError, build_key};
pub use store::{CacheStats, CacheStore};
