//! Process-wide registry of live connections, keyed by peer identity.
//!
//! Entries are weak: being registered never keeps an actor alive once its
//! loops have exited.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use sockroute_core::{BridgeError, PeerKey};
use tracing::{debug, info};

use super::actor::ConnectionActor;

/// Registry of connection actors.
pub type ConnectionRegistry = Registry<ConnectionActor>;

/// Concurrent map from [`PeerKey`] to a weak reference of `T`.
pub struct Registry<T> {
    entries: DashMap<PeerKey, Weak<T>>,
}

impl<T> Registry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register `value` under `key`, replacing any previous entry.
    pub fn store(&self, key: PeerKey, value: &Arc<T>) {
        if self.entries.insert(key.clone(), Arc::downgrade(value)).is_some() {
            debug!(peer = %key, "registry entry overwritten");
        }
    }

    /// Look up a live entry.
    pub fn lookup(&self, key: &PeerKey) -> Option<Arc<T>> {
        self.entries.get(key).and_then(|entry| entry.upgrade())
    }

    /// Look up a live entry, treating absence as a contract violation.
    pub fn require(&self, key: &PeerKey) -> Result<Arc<T>, BridgeError> {
        self.lookup(key)
            .ok_or_else(|| BridgeError::NotRegistered(key.clone()))
    }

    /// Remove an entry. Removing an absent key is a no-op.
    pub fn remove(&self, key: &PeerKey) {
        if self.entries.remove(key).is_some() {
            debug!(peer = %key, "registry entry removed");
        }
    }

    /// Remove `key` only while it still refers to `value`.
    ///
    /// Returns whether an entry was removed. A newer registration under the
    /// same key is left alone.
    pub fn remove_entry(&self, key: &PeerKey, value: &T) -> bool {
        let removed = self
            .entries
            .remove_if(key, |_, weak| std::ptr::eq(weak.as_ptr(), value))
            .is_some();
        if removed {
            debug!(peer = %key, "registry entry removed");
        }
        removed
    }

    /// Number of entries (including ones whose value is already gone).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Number of entries whose value is still alive.
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.value().strong_count() > 0).count()
    }

    /// Whether the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All registered keys, sorted.
    pub fn keys(&self) -> Vec<PeerKey> {
        let mut keys: Vec<PeerKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Drop entries whose value no longer exists. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, weak| weak.strong_count() > 0);
        before.saturating_sub(self.entries.len())
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Start a background task that periodically prunes dead entries.
pub fn start_prune_task<T: Send + Sync + 'static>(
    registry: Arc<Registry<T>>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            let _ = ticker.tick().await;
            let removed = registry.prune();
            if removed > 0 {
                info!(removed, "pruned dead registry entries");
            }
        }
    })
}
