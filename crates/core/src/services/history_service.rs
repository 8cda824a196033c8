use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::{cache_key, MarketCache};
use crate::config::EngineConfig;
use crate::errors::CoreError;
use crate::models::history::{
    HistoryPoint, HistoryRange, HistoryResult, HistorySeries, Interval, PricePoint, ProviderHistory,
};
use crate::models::internal_id::{InternalId, ProviderTag};
use crate::models::quote::QuoteSource;
use crate::providers::registry::{ProviderRegistry, ProviderRole};
use crate::providers::traits::QuoteProvider;
use super::normalizer::normalize_series;
use super::upstream::{call_with_retry, UpstreamPolicy};

/// Price series per internal id, cached longer than quotes.
pub struct HistoryService {
    registry: Arc<ProviderRegistry>,
    cache: Arc<MarketCache>,
    policy: UpstreamPolicy,
    history_ttl: Duration,
    intraday_ttl: Duration,
}

impl HistoryService {
    pub fn new(registry: Arc<ProviderRegistry>, cache: Arc<MarketCache>, config: &EngineConfig) -> Self {
        Self {
            registry,
            cache,
            policy: UpstreamPolicy::from_config(config),
            history_ttl: config.history_ttl(),
            intraday_ttl: config.intraday_history_ttl(),
        }
    }

    /// Series for `id` over `range`. `interval` defaults per range.
    pub async fn fetch_history(
        &self,
        id: &InternalId,
        range: HistoryRange,
        interval: Option<Interval>,
    ) -> HistoryResult {
        match self.fetch_series(id, range, interval).await {
            Ok(series) => HistoryResult::Ok(series),
            Err(err) => {
                debug!(id = %id, range = %range, error = %err, "history unavailable");
                HistoryResult::failure(id.to_string(), &err)
            }
        }
    }

    /// Like [`fetch_history`](Self::fetch_history), keeping the typed error.
    pub async fn fetch_series(
        &self,
        id: &InternalId,
        range: HistoryRange,
        interval: Option<Interval>,
    ) -> Result<HistorySeries, CoreError> {
        let interval = interval.unwrap_or_else(|| range.default_interval());
        let (raw, source, symbol) = self.fetch_raw(id, range, &interval).await?;
        Ok(build_series(id, &symbol, raw, source))
    }

    /// Value of `id` nearest to `target`, from the smallest range that
    /// reaches back that far. Future targets are rejected.
    pub async fn price_at(&self, id: &InternalId, target: DateTime<Utc>) -> Result<PricePoint, CoreError> {
        let now = Utc::now();
        if target > now {
            return Err(CoreError::InvalidRequest(format!("{target} is in the future")));
        }
        let days_back = (now - target).num_days() + 1;
        let range = HistoryRange::covering(days_back).ok_or_else(|| {
            CoreError::InvalidRequest(format!("{target} is older than the longest history range"))
        })?;

        let series = self.fetch_series(id, range, None).await?;
        let point = series
            .nearest(target.timestamp_millis())
            .ok_or_else(|| CoreError::not_found(series.source.as_str(), &id.symbol))?;

        Ok(PricePoint {
            id: id.clone(),
            timestamp_ms: point.timestamp_ms,
            value: point.value,
            currency: series.currency.clone(),
            source: series.source,
        })
    }

    async fn fetch_raw(
        &self,
        id: &InternalId,
        range: HistoryRange,
        interval: &Interval,
    ) -> Result<(ProviderHistory, QuoteSource, String), CoreError> {
        match id.provider {
            ProviderTag::CoinGecko => self
                .from_chain(ProviderRole::Crypto, &id.symbol, range, interval)
                .await
                .map(|(raw, source)| (raw, source, id.symbol.clone())),
            ProviderTag::Yahoo => self
                .from_chain(ProviderRole::Global, &id.symbol, range, interval)
                .await
                .map(|(raw, source)| (raw, source, id.symbol.clone())),
            ProviderTag::Tase => self.from_tase(id, range, interval).await,
        }
    }

    /// Official symbol first, then the inferred `<number>.TA`.
    async fn from_tase(
        &self,
        id: &InternalId,
        range: HistoryRange,
        interval: &Interval,
    ) -> Result<(ProviderHistory, QuoteSource, String), CoreError> {
        let mut candidates = Vec::new();
        if let Some(security) = self.registry.tase_reference().lookup(&id.symbol) {
            candidates.push((security.yahoo_symbol.clone(), QuoteSource::TaseOfficial));
        }
        candidates.push((format!("{}.TA", id.symbol), QuoteSource::TaseYahooInferred));

        let mut last_error = None;
        for (symbol, source) in candidates {
            match self.from_chain(ProviderRole::Global, &symbol, range, interval).await {
                Ok((raw, _)) => return Ok((raw, source, symbol)),
                Err(err) => {
                    debug!(id = %id, symbol = %symbol, error = %err, "TASE history candidate failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CoreError::not_found("TASE", &id.symbol)))
    }

    async fn from_chain(
        &self,
        role: ProviderRole,
        symbol: &str,
        range: HistoryRange,
        interval: &Interval,
    ) -> Result<(ProviderHistory, QuoteSource), CoreError> {
        let mut last_error = None;
        for provider in self.registry.chain(role) {
            match self.fetch_cached(provider, symbol, range, interval).await {
                Ok(raw) if raw.points.iter().any(|p| p.value.is_finite()) => {
                    return Ok((raw, provider.source()));
                }
                Ok(_) => last_error = Some(CoreError::not_found(provider.name(), symbol)),
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or_else(|| CoreError::Internal("no provider registered".into())))
    }

    async fn fetch_cached(
        &self,
        provider: &Arc<dyn QuoteProvider>,
        symbol: &str,
        range: HistoryRange,
        interval: &Interval,
    ) -> Result<ProviderHistory, CoreError> {
        let key = cache_key(
            &format!("{}:history", provider.name()),
            &[symbol.to_string()],
            &[("range", range.as_str()), ("interval", interval.as_str())],
        );
        let ttl = if range.is_intraday() {
            self.intraday_ttl
        } else {
            self.history_ttl
        };

        let provider = Arc::clone(provider);
        let symbol = symbol.to_string();
        let interval = interval.clone();
        let policy = self.policy;
        let call = async move {
            let name = provider.name().to_string();
            call_with_retry(&name, policy, || {
                let provider = Arc::clone(&provider);
                let symbol = symbol.clone();
                let interval = interval.clone();
                async move { provider.fetch_history(&symbol, range, &interval).await }
            })
            .await
        };
        self.cache.history.coalesce(&key, ttl, call).await
    }
}

/// Sort, drop non-finite values, then normalize units across the series.
fn build_series(id: &InternalId, symbol: &str, raw: ProviderHistory, source: QuoteSource) -> HistorySeries {
    let mut points: Vec<HistoryPoint> = raw
        .points
        .into_iter()
        .filter(|p| p.value.is_finite())
        .collect();
    points.sort_by_key(|p| p.timestamp_ms);
    points.dedup_by_key(|p| p.timestamp_ms);

    let (points, currency) = normalize_series(&points, raw.currency.as_deref(), symbol, raw.instrument_type);
    HistorySeries {
        id: id.to_string(),
        points,
        currency,
        source,
    }
}
