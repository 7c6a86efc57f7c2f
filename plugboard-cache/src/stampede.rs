//! Stampede guard: at most one concurrent compute per cache key.
//!
//! The first caller to miss on a key becomes the owner and computes;
//! concurrent callers for the same key park on a `Notify` until the owner
//! finishes (or disappears), then re-check the cache. De-duplication is
//! best-effort: a waiter that outlives its timeout computes on its own
//! rather than blocking forever, and an owner whose request is abandoned
//! drops its guard, which frees the slot and wakes the waiters.

use crate::key::CacheKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

type InflightMap = Arc<Mutex<HashMap<CacheKey, Arc<Notify>>>>;

fn lock(map: &InflightMap) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Arc<Notify>>> {
    match map.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Registry of in-flight computations.
pub(crate) struct StampedeGuard {
    inflight: InflightMap,
}

/// Outcome of trying to start a computation.
pub(crate) enum FlightSlot {
    /// This caller computes; dropping the guard releases the slot and
    /// wakes waiters, whether the compute finished or was abandoned.
    Owner(FlightGuard),
    /// Another caller is already computing this key; park on the notify,
    /// then re-check the cache.
    Waiter(Arc<Notify>),
}

pub(crate) struct FlightGuard {
    key: CacheKey,
    inflight: InflightMap,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let notify = lock(&self.inflight).remove(&self.key);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }
}

impl StampedeGuard {
    pub(crate) fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Claim the compute slot for `key`, or join the existing flight.
    pub(crate) fn begin(&self, key: &CacheKey) -> FlightSlot {
        let mut inflight = lock(&self.inflight);
        if let Some(notify) = inflight.get(key) {
            return FlightSlot::Waiter(Arc::clone(notify));
        }
        inflight.insert(key.clone(), Arc::new(Notify::new()));
        FlightSlot::Owner(FlightGuard {
            key: key.clone(),
            inflight: Arc::clone(&self.inflight),
        })
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        lock(&self.inflight).len()
    }
}
