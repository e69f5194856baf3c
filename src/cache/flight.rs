use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::{counter, gauge};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{
    CacheConfig, CacheError, METRIC_FLIGHT_IN_FLIGHT, METRIC_FLIGHT_JOINED_TOTAL,
    METRIC_FLIGHT_REJECTED_TOTAL,
};

/// Handle on a running compilation; every clone resolves to the same outcome.
pub type FlightFuture<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;

struct Flight<T: Clone> {
    id: u64,
    future: FlightFuture<T>,
}

/// Per-key request coalescing over a bounded pool of blocking workers.
///
/// A submission for a key with no running flight starts one; submissions for
/// a key that is already running join it. Flights are driven by their own
/// task, so a waiter that goes away does not cancel the work for the others.
/// At most `workers + queue_size` flights exist at once; anything beyond that
/// is rejected immediately.
pub struct SingleFlight<T: Clone> {
    label: &'static str,
    flights: Arc<DashMap<String, Flight<T>>>,
    admission: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    next_id: Arc<AtomicU64>,
}

impl<T: Clone> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label,
            flights: Arc::clone(&self.flights),
            admission: Arc::clone(&self.admission),
            workers: Arc::clone(&self.workers),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(label: &'static str, config: CacheConfig) -> Self {
        let admission = config.admission_limit().min(Semaphore::MAX_PERMITS);
        let workers = config.workers.get().min(Semaphore::MAX_PERMITS);
        Self {
            label,
            flights: Arc::new(DashMap::new()),
            admission: Arc::new(Semaphore::new(admission)),
            workers: Arc::new(Semaphore::new(workers)),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start or join the flight for `key`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit<F>(&self, key: &str, task: F) -> Result<FlightFuture<T>, CacheError>
    where
        F: FnOnce() -> Result<T, CacheError> + Send + 'static,
    {
        let vacant = match self.flights.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                counter!(METRIC_FLIGHT_JOINED_TOTAL, "cache" => self.label).increment(1);
                debug!(cache = self.label, key, "joined running compilation");
                return Ok(existing.get().future.clone());
            }
            Entry::Vacant(vacant) => vacant,
        };

        let Ok(admission) = Arc::clone(&self.admission).try_acquire_owned() else {
            counter!(METRIC_FLIGHT_REJECTED_TOTAL, "cache" => self.label).increment(1);
            warn!(cache = self.label, key, "compilation rejected: executor saturated");
            return Err(CacheError::Rejected {
                key: key.to_string(),
            });
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let flights = Arc::clone(&self.flights);
        let workers = Arc::clone(&self.workers);
        let label = self.label;
        let owned_key = key.to_string();

        let future = async move {
            let _admission = admission;
            let outcome = match workers.acquire_owned().await {
                Ok(_permit) => match tokio::task::spawn_blocking(task).await {
                    Ok(outcome) => outcome,
                    Err(err) => Err(CacheError::Aborted {
                        key: owned_key.clone(),
                        reason: err.to_string(),
                    }),
                },
                Err(_) => Err(CacheError::Aborted {
                    key: owned_key.clone(),
                    reason: "worker pool closed".to_string(),
                }),
            };

            // Deregister before waiters observe the outcome. A newer flight
            // for the same key is left alone.
            flights.remove_if(&owned_key, |_, flight| flight.id == id);
            gauge!(METRIC_FLIGHT_IN_FLIGHT, "cache" => label).decrement(1.0);
            outcome
        }
        .boxed()
        .shared();

        vacant.insert(Flight {
            id,
            future: future.clone(),
        });
        gauge!(METRIC_FLIGHT_IN_FLIGHT, "cache" => self.label).increment(1.0);
        debug!(cache = self.label, key, flight = id, "started compilation");

        tokio::spawn(future.clone());
        Ok(future)
    }

    /// Submit and wait for the outcome.
    pub async fn run<F>(&self, key: &str, task: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> Result<T, CacheError> + Send + 'static,
    {
        self.submit(key, task)?.await
    }

    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.flights.contains_key(key)
    }
}
