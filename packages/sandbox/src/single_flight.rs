// ABOUTME: Keyed single-flight map of in-flight operations
// ABOUTME: Concurrent callers for the same key share one future instead of starting duplicates

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::Mutex;

pub type Flight<T> = Shared<BoxFuture<'static, T>>;

struct Entry<T: Clone> {
    generation: u64,
    flight: Flight<T>,
}

pub struct SingleFlight<T: Clone> {
    inner: Mutex<(u64, HashMap<String, Entry<T>>)>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new((0, HashMap::new())),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, or start one with `start(generation)`.
    /// Returns the shared future and whether this call started it.
    ///
    /// `start` runs under the map lock, so it must only build the future, not await anything.
    pub fn join_or_start<F>(&self, key: &str, start: F) -> (Flight<T>, bool)
    where
        F: FnOnce(u64) -> BoxFuture<'static, T>,
    {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = guard.1.get(key) {
            return (entry.flight.clone(), false);
        }
        guard.0 += 1;
        let generation = guard.0;
        let flight = start(generation).shared();
        guard.1.insert(
            key.to_string(),
            Entry {
                generation,
                flight: flight.clone(),
            },
        );
        (flight, true)
    }

    /// Forget the flight for `key` if it is still the one identified by `generation`.
    pub fn complete(&self, key: &str, generation: u64) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if guard
            .1
            .get(key)
            .map(|e| e.generation == generation)
            .unwrap_or(false)
        {
            guard.1.remove(key);
        }
    }

    pub fn in_flight(&self, key: &str) -> bool {
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.1.contains_key(key)
    }
}
