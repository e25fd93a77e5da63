//! Per-key fill coordination
//!
//! Every lookup, fill, purge and eviction for a key runs while holding that
//! key's lock. Locks are created on demand and dropped from the registry when
//! the last holder or waiter releases them. A waiter cancelled after being
//! handed the lock leaves an idle slot behind; idle slots are pruned on the
//! next `lock` call and never count as in flight.

use crate::key::CacheKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Registry = Mutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>;

/// Registry of in-flight keys, owned by a cache instance
#[derive(Clone, Default)]
pub struct KeyLocks {
    inner: Arc<Registry>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &CacheKey) -> KeyGuard {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.retain(|_, slot| !is_idle(slot));
            map.entry(key.clone()).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        KeyGuard {
            key: key.clone(),
            registry: self.inner.clone(),
            guard: Some(guard),
        }
    }

    /// Whether some caller currently holds or awaits `key`
    pub fn is_locked(&self, key: &CacheKey) -> bool {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(key).is_some_and(|slot| !is_idle(slot))
    }

    /// Number of keys with work in progress
    pub fn in_flight(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.values().filter(|slot| !is_idle(slot)).count()
    }
}

/// Only the registry itself references the slot. Clones are taken under the
/// registry lock, so an idle slot cannot gain a holder concurrently.
fn is_idle(slot: &Arc<AsyncMutex<()>>) -> bool {
    Arc::strong_count(slot) == 1
}

/// Exclusive hold on one key; released on drop
pub struct KeyGuard {
    key: CacheKey,
    registry: Arc<Registry>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyGuard {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Release the async lock first so its Arc no longer counts as a holder
        drop(self.guard.take());
        let mut map = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if map.get(&self.key).is_some_and(is_idle) {
            map.remove(&self.key);
        }
    }
}
