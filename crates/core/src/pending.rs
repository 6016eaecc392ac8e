//! Expiring key→value cache used to hand a custom script to a call session
//! before its telephony leg connects.
//!
//! Entries are read at most once: [`ExpiringCache::take_if_present`] removes
//! the entry under the same lock that reads it, so two concurrent takers of
//! the same key can never both succeed. Expired entries are purged lazily on
//! lookup and by an optional background sweeper.

use crate::agent::AgentScript;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Pending per-call scripts, keyed by call id.
pub type PendingConfigStore = ExpiringCache<AgentScript>;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

pub struct ExpiringCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V> ExpiringCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stores `value` under `key`, replacing any previous entry and restarting its TTL.
    pub fn put(&self, key: impl Into<String>, value: V) {
        let expires_at = Instant::now() + self.ttl;
        self.entries
            .lock()
            .insert(key.into(), Entry { value, expires_at });
    }

    /// Removes and returns the entry if it exists and has not expired.
    pub fn take_if_present(&self, key: &str) -> Option<V> {
        let entry = self.entries.lock().remove(key)?;
        if entry.expires_at <= Instant::now() {
            debug!(key, "Pending entry expired before it was taken");
            return None;
        }
        Some(entry.value)
    }

    /// Drops an entry without reading it. Returns whether one was present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Send + 'static> ExpiringCache<V> {
    /// Purges expired entries every `every` until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(purged, "Swept expired pending entries");
                }
            }
        })
    }
}
