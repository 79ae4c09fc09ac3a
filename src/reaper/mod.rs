//! Background sweep of expired entries and stuck flights.
//!
//! Lazy expiry only purges an entry when it is next read; a key that is
//! written once and never read again would leak forever. The reaper exists to
//! bound that: a periodic task walks the store, deletes entries past their
//! TTL, and purges stuck in-flight computations.
//!
//! The sweep is deliberately gentle with the store lock: expired keys are
//! planned under the read lock, then removed in bounded batches with a yield
//! between batches, so concurrent `get`/`set` calls never wait for more than
//! one batch. Expiry is re-checked under the write lock, so an entry refreshed
//! mid-sweep is left alone.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::flight::InFlightRegistry;
use crate::store::CacheStore;

/// Keys removed per write-lock acquisition during a sweep.
const SWEEP_BATCH_SIZE: usize = 256;

/// Spawns and configures the periodic sweep task.
pub struct Reaper {
    interval: Duration,
}

impl Reaper {
    /// Creates a reaper that sweeps every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Spawns the sweep loop on the current Tokio runtime.
    ///
    /// Each tick removes expired store entries in yielding batches and purges
    /// stuck flights from the registry. Sweep faults are logged and never
    /// propagate — housekeeping must not crash a caller's request. The loop
    /// runs until the returned [`ReaperHandle`] is dropped.
    pub fn spawn<V, E>(
        self,
        store: Arc<CacheStore>,
        flights: Arc<InFlightRegistry<V, E>>,
    ) -> ReaperHandle
    where
        V: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick fires immediately; skip it so a freshly started
            // cache is not swept before it has served anything.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                sweep(&store, &flights).await;
            }
        });
        ReaperHandle { task }
    }
}

/// Owner handle for the sweep task; dropping it aborts the loop.
#[derive(Debug)]
pub struct ReaperHandle {
    task: JoinHandle<()>,
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One full sweep pass over the store and the in-flight registry.
async fn sweep<V, E>(store: &CacheStore, flights: &InFlightRegistry<V, E>)
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let expired = store.expired_keys();
    if !expired.is_empty() {
        let mut removed = 0;
        for batch in expired.chunks(SWEEP_BATCH_SIZE) {
            removed += store.remove_if_expired(batch);
            // Yield between batches so readers and writers can interleave
            // with a long sweep on a very large store.
            tokio::task::yield_now().await;
        }
        debug!(planned = expired.len(), removed, "reaper sweep");
    }

    let purged = flights.purge_stuck();
    if purged > 0 {
        warn!(purged, "reaper purged stuck in-flight computations");
    }
}
