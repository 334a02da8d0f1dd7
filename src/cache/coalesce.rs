//! In-flight request coalescing.
//!
//! At most one fetch per key runs at a time. Callers that arrive while a fetch
//! is running wait on the same shared future and receive a clone of its
//! outcome, success or error.
//!
//! # Design Decisions
//! - Keyed table of `Shared` futures behind one mutex, no polling
//! - The entry is removed by the first waiter that sees the fetch complete,
//!   so the next request for the key starts a fresh fetch
//! - Each waiter is counted; when the last one goes away before completion
//!   the shared future is dropped, which cancels the outbound request

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use metrics::counter;

struct InFlight<T> {
    fetch: Shared<BoxFuture<'static, T>>,
    waiters: usize,
    id: u64,
}

struct Registry<T> {
    entries: HashMap<String, InFlight<T>>,
    next_id: u64,
}

/// Keyed registry of shared in-flight fetches.
pub struct Coalescer<T: Clone> {
    registry: Mutex<Registry<T>>,
}

impl<T> Default for Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                entries: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry<T>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of keys with a fetch currently running.
    pub fn in_flight(&self) -> usize {
        self.registry().entries.len()
    }

    /// Run `make_fetch` for `key`, or join the fetch already running for it.
    ///
    /// `make_fetch` is only invoked when this caller becomes the leader.
    pub async fn run<F, Fut>(&self, key: &str, make_fetch: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (fetch, id) = {
            let mut registry = self.registry();
            match registry.entries.get_mut(key) {
                Some(in_flight) => {
                    in_flight.waiters += 1;
                    counter!("replay_proxy_coalesced_waits_total").increment(1);
                    tracing::debug!(key = %key, waiters = in_flight.waiters, "Joining in-flight fetch");
                    (in_flight.fetch.clone(), in_flight.id)
                }
                None => {
                    registry.next_id += 1;
                    let id = registry.next_id;
                    let fetch = make_fetch().boxed().shared();
                    registry.entries.insert(
                        key.to_string(),
                        InFlight {
                            fetch: fetch.clone(),
                            waiters: 1,
                            id,
                        },
                    );
                    (fetch, id)
                }
            }
        };

        let mut guard = WaiterGuard {
            coalescer: self,
            key,
            id,
            completed: false,
        };
        let outcome = fetch.await;
        guard.completed = true;
        outcome
    }
}

/// Releases a waiter's claim on an in-flight entry, also on cancellation.
struct WaiterGuard<'a, T: Clone + Send + Sync + 'static> {
    coalescer: &'a Coalescer<T>,
    key: &'a str,
    id: u64,
    completed: bool,
}

impl<T: Clone + Send + Sync + 'static> Drop for WaiterGuard<'_, T> {
    fn drop(&mut self) {
        let mut registry = self.coalescer.registry();
        let Some(in_flight) = registry.entries.get_mut(self.key) else {
            return;
        };
        // A newer fetch may already occupy the key.
        if in_flight.id != self.id {
            return;
        }
        if self.completed {
            registry.entries.remove(self.key);
            return;
        }
        in_flight.waiters = in_flight.waiters.saturating_sub(1);
        if in_flight.waiters == 0 {
            tracing::debug!(key = %self.key, "Last waiter left, cancelling fetch");
            registry.entries.remove(self.key);
        }
    }
}
