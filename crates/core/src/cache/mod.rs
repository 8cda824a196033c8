pub mod coalescer;
pub mod ttl_cache;

pub use coalescer::{cache_key, CoalescerStats, RequestCoalescer};
pub use ttl_cache::TtlCache;

use crate::models::history::ProviderHistory;
use crate::models::quote::QuoteBatch;

/// The engine's only shared mutable state: one coalescer per payload kind.
///
/// Built once per process and handed to the services behind an `Arc`.
#[derive(Default)]
pub struct MarketCache {
    pub quotes: RequestCoalescer<QuoteBatch>,
    pub history: RequestCoalescer<ProviderHistory>,
}

/// Snapshot of both coalescers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub quotes: CoalescerStats,
    pub history: CoalescerStats,
}

impl MarketCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            quotes: self.quotes.stats(),
            history: self.history.stats(),
        }
    }

    pub fn clear(&self) {
        self.quotes.clear();
        self.history.clear();
    }
}
