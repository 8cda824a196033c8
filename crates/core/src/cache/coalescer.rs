use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::errors::CoreError;
use super::ttl_cache::TtlCache;

type SharedCall<V> = Shared<BoxFuture<'static, Result<V, CoreError>>>;

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    /// Calls answered from a fresh cache entry.
    pub cache_hits: u64,
    /// Calls that started an upstream request.
    pub upstream_calls: u64,
    /// Calls that joined a request already in flight.
    pub joined: u64,
    pub cached_entries: usize,
}

/// Deduplicates identical in-flight upstream calls and caches successes.
///
/// All callers presenting the same key while a call is in flight await the
/// same shared future and observe the same `Ok`/`Err`. Only successes are
/// cached; a failure is shared with concurrent callers but the next call
/// goes upstream again.
pub struct RequestCoalescer<V: Clone> {
    cache: TtlCache<V>,
    in_flight: Mutex<HashMap<String, SharedCall<V>>>,
    cache_hits: AtomicU64,
    upstream_calls: AtomicU64,
    joined: AtomicU64,
}

impl<V> RequestCoalescer<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            cache: TtlCache::new(),
            in_flight: Mutex::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            upstream_calls: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    /// Run `fetch` under `key`, unless a fresh cached value or an identical
    /// in-flight call can answer instead. `fetch` is dropped unpolled in
    /// those cases.
    pub async fn coalesce<F>(&self, key: &str, ttl: Duration, fetch: F) -> Result<V, CoreError>
    where
        F: Future<Output = Result<V, CoreError>> + Send + 'static,
    {
        if let Some(value) = self.cache.get(key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, "cache hit");
            return Ok(value);
        }

        let call = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            // a call may have completed between the cache check and the lock
            if let Some(value) = self.cache.get(key) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }
            match in_flight.get(key) {
                Some(call) => {
                    self.joined.fetch_add(1, Ordering::Relaxed);
                    debug!(key, "joined in-flight request");
                    call.clone()
                }
                None => {
                    self.upstream_calls.fetch_add(1, Ordering::Relaxed);
                    let call = fetch.boxed().shared();
                    in_flight.insert(key.to_string(), call.clone());
                    call
                }
            }
        };

        // Retires the in-flight entry even if this caller is cancelled or
        // the upstream future panics.
        let _guard = InFlightGuard {
            in_flight: &self.in_flight,
            key,
            call: &call,
        };

        let result = call.clone().await;
        if let Ok(value) = &result {
            // cache before the guard drops, so a newcomer sees one or the other
            self.cache.insert(key, value.clone(), ttl);
        }
        result
    }

    pub fn invalidate(&self, key: &str) {
        self.cache.remove(key);
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            upstream_calls: self.upstream_calls.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
            cached_entries: self.cache.len(),
        }
    }
}

impl<V> Default for RequestCoalescer<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

struct InFlightGuard<'a, V: Clone> {
    in_flight: &'a Mutex<HashMap<String, SharedCall<V>>>,
    key: &'a str,
    call: &'a SharedCall<V>,
}

impl<V: Clone> Drop for InFlightGuard<'_, V> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if in_flight.get(self.key).is_some_and(|c| c.ptr_eq(self.call)) {
            in_flight.remove(self.key);
        }
    }
}

/// Order-independent cache key: `namespace|A,B,C|k=v|...`.
///
/// Symbols are sorted and deduplicated, so `[MSFT, AAPL]` and
/// `[AAPL, MSFT, AAPL]` collapse onto the same upstream call.
pub fn cache_key(namespace: &str, symbols: &[String], params: &[(&str, &str)]) -> String {
    let mut sorted: Vec<&str> = symbols.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut key = format!("{namespace}|{}", sorted.join(","));
    for (name, value) in params {
        key.push('|');
        key.push_str(name);
        key.push('=');
        key.push_str(value);
    }
    key
}
