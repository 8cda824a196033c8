use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Minimum spacing between two full sweeps triggered by `insert`.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

struct Entries<V> {
    map: HashMap<String, CacheEntry<V>>,
    next_sweep: Instant,
}

impl<V> Entries<V> {
    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, e| e.expires_at > now);
        self.next_sweep = now + SWEEP_INTERVAL;
        before - self.map.len()
    }
}

/// Concurrent key → value map with per-entry expiry.
///
/// A lookup drops its own key once stale. Inserts sweep every expired entry,
/// at most once per [`SWEEP_INTERVAL`], so keys that are never read again
/// still leave the map.
pub struct TtlCache<V> {
    entries: Mutex<Entries<V>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                next_sweep: Instant::now() + SWEEP_INTERVAL,
            }),
        }
    }

    /// Fresh value for `key`, dropping the entry if it has expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.map.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.map.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store `value` for `ttl`. A zero TTL stores nothing.
    pub fn insert(&self, key: &str, value: V, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if now >= entries.next_sweep {
            entries.sweep(now);
        }
        entries.map.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.map.remove(key).map(|e| e.value)
    }

    /// Number of stored entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.sweep(Instant::now())
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).map.clear();
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
