pub mod api;
pub mod cache;
pub mod config;
pub mod errors;
pub mod models;
pub mod providers;
pub mod services;

use chrono::{DateTime, Utc};
use std::sync::Arc;

use api::ApiResponse;
use cache::{CacheStats, MarketCache};
use config::EngineConfig;
use errors::CoreError;
use models::{
    asset::AssetRecord,
    history::{HistoryRange, HistoryResult, Interval, PricePoint},
    internal_id::InternalId,
    quote::QuoteResult,
};
use providers::registry::ProviderRegistry;
use services::{
    batch_service::BatchService,
    fx_service::FxService,
    history_service::HistoryService,
    quote_service::QuoteService,
    resolver::{self, ResolveInput},
};

/// Main entry point of the quote engine.
///
/// Owns the provider registry, the shared cache and the services built on
/// them. Cheap to share: wrap it in an `Arc` and call it from any task.
#[must_use]
pub struct QuoteEngine {
    config: EngineConfig,
    registry: Arc<ProviderRegistry>,
    cache: Arc<MarketCache>,
    batch_service: BatchService,
    history_service: HistoryService,
    fx_service: FxService,
}

impl std::fmt::Debug for QuoteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.cache.stats();
        f.debug_struct("QuoteEngine")
            .field("tase_reference_entries", &self.registry.tase_reference().len())
            .field("cached_quotes", &stats.quotes.cached_entries)
            .field("cached_histories", &stats.history.cached_entries)
            .field("max_concurrency", &self.config.max_concurrency)
            .finish()
    }
}

impl QuoteEngine {
    /// Build an engine with the default adapters against the configured
    /// endpoints.
    pub fn new(config: EngineConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let registry = ProviderRegistry::new_with_defaults(&config)?;
        Ok(Self::build(config, registry))
    }

    /// Build an engine around a caller-assembled registry (custom or mock
    /// adapters).
    pub fn with_registry(config: EngineConfig, registry: ProviderRegistry) -> Self {
        Self::build(config, registry)
    }

    fn build(config: EngineConfig, registry: ProviderRegistry) -> Self {
        let registry = Arc::new(registry);
        let cache = Arc::new(MarketCache::new());
        let quote_service = Arc::new(QuoteService::new(Arc::clone(&registry), Arc::clone(&cache), &config));

        Self {
            batch_service: BatchService::new(Arc::clone(&quote_service), config.max_concurrency),
            history_service: HistoryService::new(Arc::clone(&registry), Arc::clone(&cache), &config),
            fx_service: FxService::new(quote_service),
            config,
            registry,
            cache,
        }
    }

    // ── Quotes ──────────────────────────────────────────────────────

    /// Quote a list of loose identifiers; one record per input, in order.
    pub async fn fetch_batch(&self, ids: &[String]) -> Vec<QuoteResult> {
        self.batch_service.fetch_batch(ids).await
    }

    /// Shekels per US dollar.
    pub async fn usd_ils_rate(&self) -> Result<f64, CoreError> {
        self.fx_service.usd_ils_rate().await
    }

    /// Convert between USD and ILS at the current rate.
    pub async fn convert(&self, amount: f64, from: &str, to: &str) -> Result<f64, CoreError> {
        self.fx_service.convert(amount, from, to).await
    }

    // ── History ─────────────────────────────────────────────────────

    pub async fn fetch_history(
        &self,
        id: &InternalId,
        range: HistoryRange,
        interval: Option<Interval>,
    ) -> HistoryResult {
        self.history_service.fetch_history(id, range, interval).await
    }

    /// Value of `id` closest to `target`.
    pub async fn price_at(&self, id: &InternalId, target: DateTime<Utc>) -> Result<PricePoint, CoreError> {
        self.history_service.price_at(id, target).await
    }

    // ── Resolution ──────────────────────────────────────────────────

    /// Canonical id for a loose identifier string.
    #[must_use]
    pub fn resolve(&self, input: &str) -> Option<InternalId> {
        resolver::resolve(ResolveInput::Raw(input))
    }

    /// Canonical id for an asset record from any producer.
    #[must_use]
    pub fn resolve_record(&self, record: &AssetRecord) -> Option<InternalId> {
        resolver::resolve(ResolveInput::Record(record))
    }

    // ── Request contracts ───────────────────────────────────────────

    /// Quote batch request from decoded query parameters.
    pub async fn handle_quote_request<K, V>(&self, params: &[(K, V)]) -> ApiResponse
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        api::quote_response(&self.batch_service, params).await
    }

    /// History request from decoded query parameters.
    pub async fn handle_history_request<K, V>(&self, params: &[(K, V)]) -> ApiResponse
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        api::history_response(&self.history_service, params).await
    }

    // ── Cache ───────────────────────────────────────────────────────

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop every cached response; in-flight requests are unaffected.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }
}
