//! Single-flight coordination for concurrent identical computations.
//!
//! [`InFlightRegistry`] tracks at most one pending computation per key. The
//! first caller to miss becomes the *runner* and its producer is executed in a
//! detached task; every concurrent caller for the same key becomes a *waiter*
//! and awaits the runner's shared result instead of starting a duplicate
//! computation.
//!
//! ## Guarantees
//!
//! - Check-and-insert is one mutex-protected critical section, closing the
//!   race where two callers both observe "absent" and both start a producer.
//! - The registry entry is removed **before** the shared result is fulfilled,
//!   so a caller racing with cleanup starts fresh rather than joining a
//!   just-settled flight.
//! - The producer runs in its own task: cancelling any caller — including the
//!   one that started the flight — never cancels the shared computation, and
//!   remaining waiters still receive the eventual result.
//! - A rejected producer delivers the same (cloned) error to every waiter and
//!   releases the slot immediately; failures are never latched.
//! - A watchdog force-removes entries older than `max_pending`, so one stuck
//!   producer cannot hang every future caller for its key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default ceiling on how long a flight may stay pending before the watchdog
/// declares it stuck.
pub const DEFAULT_MAX_PENDING: Duration = Duration::from_secs(30);

type FlightMap<V, E> = HashMap<String, Flight<V, E>>;

// One pending computation. The broadcast channel carries the single settled
// result to every subscriber; capacity 1 suffices because exactly one message
// is ever sent per flight.
struct Flight<V, E> {
    tx: broadcast::Sender<Result<V, E>>,
    generation: u64,
    started_at: Instant,
    waiter_count: u32,
}

// Outcome of the atomic check-and-insert.
enum Role<V, E> {
    // Another caller already owns the flight; await its broadcast.
    Waiter(broadcast::Receiver<Result<V, E>>),
    // This caller claimed the slot and must run the producer.
    Runner {
        tx: broadcast::Sender<Result<V, E>>,
        generation: u64,
    },
}

/// Coalesces concurrent computations so each key runs at most one producer at
/// a time.
///
/// Generic over the (clonable) value and error so it can coordinate any
/// computation; the crate [`Cache`](crate::cache::Cache) instantiates it with
/// its payload and error types.
///
/// # Examples
///
/// ```no_run
/// use recache::flight::InFlightRegistry;
///
/// # async fn demo() {
/// let registry: InFlightRegistry<String, String> = InFlightRegistry::with_defaults();
/// let value = registry
///     .coalesce("jobs:id=1", || async { Ok("fresh".to_string()) })
///     .await
///     .unwrap();
/// # }
/// ```
pub struct InFlightRegistry<V, E> {
    flights: Arc<Mutex<FlightMap<V, E>>>,
    max_pending: Duration,
    next_generation: std::sync::atomic::AtomicU64,
}

impl<V, E> InFlightRegistry<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a registry whose watchdog declares flights stuck after
    /// `max_pending`.
    pub fn new(max_pending: Duration) -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            max_pending,
            next_generation: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Creates a registry with the default 30-second stuck-flight ceiling.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }

    /// Runs `producer` for `key`, or joins the computation already in flight.
    ///
    /// The producer is invoked only when no live flight exists for the key,
    /// and it runs in a detached task so caller cancellation cannot abort it.
    /// All concurrent callers resolve to clones of the same settled result.
    ///
    /// If a joined flight vanishes without settling (its producer panicked),
    /// the waiter retries as a fresh miss with its own producer. A panicking
    /// producer re-raises the panic in the caller that started it.
    pub async fn coalesce<F, Fut>(&self, key: &str, producer: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (tx, generation) = loop {
            match self.join_or_claim(key) {
                Role::Runner { tx, generation } => break (tx, generation),
                Role::Waiter(mut rx) => match rx.recv().await {
                    Ok(result) => return result,
                    Err(_) => {
                        // The flight settled nothing — its producer panicked
                        // and the slot was reclaimed. Retry as a fresh miss.
                        debug!(key, "joined flight vanished; retrying as fresh miss");
                        continue;
                    }
                },
            }
        };

        // Armed before the producer is even constructed: a panic anywhere
        // from here on releases the slot instead of leaving a dead flight
        // for the watchdog to find.
        let guard = FlightGuard {
            flights: Arc::clone(&self.flights),
            key: key.to_string(),
            generation,
        };
        let fut = producer();

        let handle = tokio::spawn(async move {
            let result = fut.await;
            // Release the slot before fulfilling: a caller racing with this
            // cleanup must start fresh, not join a settled flight. The guard
            // also fires if the producer panicked above.
            drop(guard);
            let _ = tx.send(result.clone());
            result
        });

        match handle.await {
            Ok(result) => result,
            Err(join_err) => match join_err.try_into_panic() {
                Ok(payload) => std::panic::resume_unwind(payload),
                // Detached tasks are never aborted by this crate; a
                // cancelled join can only mean the runtime is shutting down.
                Err(join_err) => {
                    unreachable!("in-flight producer task cancelled: {join_err}")
                }
            },
        }
    }

    /// Number of computations currently in flight.
    pub fn len(&self) -> usize {
        self.lock_flights().len()
    }

    /// Returns `true` when nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.lock_flights().is_empty()
    }

    /// Number of callers sharing the flight for `key`, if one exists.
    pub fn waiter_count(&self, key: &str) -> Option<u32> {
        self.lock_flights().get(key).map(|f| f.waiter_count)
    }

    /// Force-removes every flight older than the configured pending ceiling.
    ///
    /// Called periodically by the reaper; the same check also runs lazily on
    /// each `coalesce`. Returns the number of flights purged.
    pub fn purge_stuck(&self) -> usize {
        let now = Instant::now();
        let mut flights = self.lock_flights();
        let before = flights.len();
        flights.retain(|key, flight| {
            let stuck = now.duration_since(flight.started_at) > self.max_pending;
            if stuck {
                warn!(
                    key,
                    waiters = flight.waiter_count,
                    pending = ?now.duration_since(flight.started_at),
                    "purging stuck in-flight computation"
                );
            }
            !stuck
        });
        before - flights.len()
    }

    // The atomic check-and-insert: in one critical section, either subscribe
    // to a live flight or claim the slot. A stuck entry found here is removed
    // first so the caller can start a fresh producer instead of hanging.
    fn join_or_claim(&self, key: &str) -> Role<V, E> {
        let mut flights = self.lock_flights();

        let stuck_waiters = flights.get(key).and_then(|flight| {
            (flight.started_at.elapsed() > self.max_pending).then_some(flight.waiter_count)
        });
        if let Some(waiters) = stuck_waiters {
            warn!(
                key,
                waiters, "removing stuck in-flight computation before fresh start"
            );
            flights.remove(key);
        }

        if let Some(flight) = flights.get_mut(key) {
            flight.waiter_count += 1;
            return Role::Waiter(flight.tx.subscribe());
        }

        let (tx, _rx) = broadcast::channel(1);
        let generation = self
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        flights.insert(
            key.to_string(),
            Flight {
                tx: tx.clone(),
                generation,
                started_at: Instant::now(),
                waiter_count: 1,
            },
        );
        Role::Runner { tx, generation }
    }

    fn lock_flights(&self) -> MutexGuard<'_, FlightMap<V, E>> {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Removes the flight for `key` on drop — but only while its generation still
// matches, so a stale flight's cleanup never destroys a fresh flight that was
// re-registered under the same key after a watchdog purge.
struct FlightGuard<V, E> {
    flights: Arc<Mutex<FlightMap<V, E>>>,
    key: String,
    generation: u64,
}

impl<V, E> Drop for FlightGuard<V, E> {
    fn drop(&mut self) {
        let mut flights = self
            .flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if flights
            .get(&self.key)
            .is_some_and(|f| f.generation == self.generation)
        {
            flights.remove(&self.key);
        }
    }
}
