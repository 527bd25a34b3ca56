//! Time-windowed in-process cache.
//!
//! Entries live for a fixed TTL measured from their last `set`. Readers
//! never see an expired entry; expired entries are dropped lazily on read
//! or in bulk via [`TtlCache::purge_expired`].

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Minimal cache contract used by the tracker's lookup paths.
pub trait Cache<K, V>: Send + Sync {
    /// Returns a clone of the live entry for `key`, if any.
    fn get(&self, key: &K) -> Option<V>;

    /// Inserts or replaces `key`, restarting its TTL.
    fn set(&self, key: K, value: V);

    /// Drops `key` immediately.
    fn expire(&self, key: &K);
}

/// [`Cache`] backed by a mutex-guarded `HashMap` with a single TTL.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (V, Instant)>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of stored entries, including ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (_, at)| now.duration_since(*at) < self.ttl);
        before - entries.len()
    }
}

impl<K, V> Cache<K, V> for TtlCache<K, V>
where
    K: Eq + Hash + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        let live = match entries.get(key) {
            Some((_, at)) => at.elapsed() < self.ttl,
            None => return None,
        };
        if live {
            entries.get(key).map(|(v, _)| v.clone())
        } else {
            entries.remove(key);
            None
        }
    }

    fn set(&self, key: K, value: V) {
        self.entries.lock().insert(key, (value, Instant::now()));
    }

    fn expire(&self, key: &K) {
        self.entries.lock().remove(key);
    }
}
