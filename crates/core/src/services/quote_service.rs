use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{cache_key, MarketCache};
use crate::config::EngineConfig;
use crate::errors::{CoreError, FailureKind};
use crate::models::asset::InstrumentType;
use crate::models::internal_id::InternalId;
use crate::models::quote::{ProviderQuote, Quote, QuoteBatch, QuoteResult, QuoteSource};
use crate::providers::registry::{ProviderRegistry, ProviderRole};
use crate::providers::tase_reference::TaseSecurity;
use crate::providers::traits::QuoteProvider;
use super::normalizer::{normalize, PriceInput};
use super::upstream::{call_with_retry, contain_panic, UpstreamPolicy};

/// Raw quote plus the stage that produced it.
type StageQuote = (ProviderQuote, QuoteSource);

/// One step of the TASE waterfall.
enum TaseStage {
    /// Official symbol from the local reference dataset, priced by Yahoo.
    Official(TaseSecurity),
    /// A scrape adapter, tried with the bare security number.
    Scrape(Arc<dyn QuoteProvider>),
    /// Yahoo with the inferred `<number>.TA` symbol.
    YahooInferred(String),
}

impl TaseStage {
    fn label(&self) -> String {
        match self {
            TaseStage::Official(sec) => format!("official ({})", sec.yahoo_symbol),
            TaseStage::Scrape(p) => p.name().to_string(),
            TaseStage::YahooInferred(symbol) => format!("inferred ({symbol})"),
        }
    }
}

/// Fallback orchestrator: picks adapters per id in priority order, moves
/// on only when a stage fails or has no price, and tags the result with
/// the stage that succeeded.
///
/// Every upstream call goes through the shared [`MarketCache`] (cache +
/// coalescing) and the [`UpstreamPolicy`] (deadline + bounded retries).
pub struct QuoteService {
    registry: Arc<ProviderRegistry>,
    cache: Arc<MarketCache>,
    policy: UpstreamPolicy,
    quote_ttl: Duration,
    max_concurrency: usize,
}

impl QuoteService {
    pub fn new(registry: Arc<ProviderRegistry>, cache: Arc<MarketCache>, config: &EngineConfig) -> Self {
        Self {
            registry,
            cache,
            policy: UpstreamPolicy::from_config(config),
            quote_ttl: config.quote_ttl(),
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    // ── Public entry points per provider group ──────────────────────

    /// Quotes for `cg:` ids: grouped CoinGecko calls, one retry policy.
    pub async fn quote_crypto(&self, ids: &[InternalId]) -> Vec<(InternalId, QuoteResult)> {
        self.quote_group(ProviderRole::Crypto, ids).await
    }

    /// Quotes for `yahoo:` ids: batch quote endpoint, then the chart
    /// endpoint for whatever is still missing.
    pub async fn quote_global(&self, ids: &[InternalId]) -> Vec<(InternalId, QuoteResult)> {
        self.quote_group(ProviderRole::Global, ids).await
    }

    /// Quote for one `tase:` id through the waterfall: official symbol →
    /// scrape sources in order → Yahoo with the inferred symbol.
    pub async fn quote_tase(&self, id: &InternalId) -> QuoteResult {
        let number = id.symbol.as_str();
        let inferred = format!("{number}.TA");

        let mut stages = Vec::new();
        match self.registry.tase_reference().lookup(number) {
            Some(security) => stages.push(TaseStage::Official(security.clone())),
            None => debug!(id = %id, "no reference entry, skipping official stage"),
        }
        stages.extend(
            self.registry
                .chain(ProviderRole::TaseScrape)
                .iter()
                .cloned()
                .map(TaseStage::Scrape),
        );
        stages.push(TaseStage::YahooInferred(inferred.clone()));

        let mut last_error = None;
        for stage in stages {
            let label = stage.label();
            debug!(id = %id, stage = %label, "trying TASE stage");

            let attempt = match &stage {
                TaseStage::Official(security) => self
                    .quote_yahoo_symbol(&security.yahoo_symbol)
                    .await
                    .map(|(mut quote, _)| {
                        if quote.instrument_type == InstrumentType::Unknown
                            || security.instrument_type == InstrumentType::Index
                        {
                            quote.instrument_type = security.instrument_type;
                        }
                        quote.name = quote.name.or_else(|| security.name.clone());
                        (quote, QuoteSource::TaseOfficial, security.yahoo_symbol.clone())
                    }),
                TaseStage::Scrape(provider) => self
                    .fetch_one(provider, number)
                    .await
                    .and_then(|quote| require_price(provider.name(), number, quote))
                    .map(|quote| (quote, provider.source(), inferred.clone())),
                TaseStage::YahooInferred(symbol) => self
                    .quote_yahoo_symbol(symbol)
                    .await
                    .map(|(quote, _)| (quote, QuoteSource::TaseYahooInferred, symbol.clone())),
            };

            match attempt {
                Ok((raw, source, symbol)) => {
                    debug!(id = %id, stage = %label, source = %source, "TASE stage succeeded");
                    return build_quote(id, &symbol, raw, source);
                }
                Err(err) => {
                    log_stage_failure(id, &label, &err);
                    last_error = Some(err);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| CoreError::not_found("TASE", number));
        warn!(id = %id, error = %err, "TASE waterfall exhausted");
        QuoteResult::failure(id.to_string(), &err)
    }

    /// Quote a Yahoo symbol through the global chain (quote, then chart).
    pub async fn quote_yahoo_symbol(&self, symbol: &str) -> Result<StageQuote, CoreError> {
        let chain = self.registry.chain(ProviderRole::Global);
        let mut outcomes = self.run_chain(chain, &[symbol.to_string()]).await;
        outcomes
            .remove(symbol)
            .unwrap_or_else(|| Err(CoreError::not_found("Yahoo Finance", symbol)))
    }

    // ── Chain execution ─────────────────────────────────────────────

    async fn quote_group(&self, role: ProviderRole, ids: &[InternalId]) -> Vec<(InternalId, QuoteResult)> {
        if ids.is_empty() {
            return Vec::new();
        }
        let symbols: Vec<String> = ids.iter().map(|id| id.symbol.clone()).collect();
        let mut outcomes = self.run_chain(self.registry.chain(role), &symbols).await;

        ids.iter()
            .map(|id| {
                let result = match outcomes.remove(&id.symbol) {
                    Some(Ok((raw, source))) => build_quote(id, &id.symbol, raw, source),
                    Some(Err(err)) => QuoteResult::failure(id.to_string(), &err),
                    None => QuoteResult::failure(
                        id.to_string(),
                        &CoreError::Internal(format!("no outcome recorded for {id}")),
                    ),
                };
                (id.clone(), result)
            })
            .collect()
    }

    /// Try `chain` in order for every symbol; a symbol leaves the pending
    /// set on its first quote with a usable price. Symbols that exhaust the
    /// chain keep the last stage's error.
    async fn run_chain(
        &self,
        chain: &[Arc<dyn QuoteProvider>],
        symbols: &[String],
    ) -> HashMap<String, Result<StageQuote, CoreError>> {
        let mut pending: Vec<String> = Vec::new();
        for symbol in symbols {
            if !pending.contains(symbol) {
                pending.push(symbol.clone());
            }
        }

        let mut outcomes: HashMap<String, Result<StageQuote, CoreError>> = HashMap::new();
        if chain.is_empty() {
            for symbol in pending {
                outcomes.insert(symbol, Err(CoreError::Internal("no provider registered".into())));
            }
            return outcomes;
        }

        for provider in chain {
            if pending.is_empty() {
                break;
            }
            let mut results = self.fetch_with(provider, &pending).await;
            let mut still_pending = Vec::new();

            for symbol in pending {
                let result = results
                    .remove(&symbol)
                    .unwrap_or_else(|| Err(CoreError::not_found(provider.name(), &symbol)))
                    .and_then(|quote| require_price(provider.name(), &symbol, quote));
                match result {
                    Ok(quote) => {
                        outcomes.insert(symbol, Ok((quote, provider.source())));
                    }
                    Err(err) => {
                        log_provider_failure(provider.name(), &symbol, &err);
                        outcomes.insert(symbol.clone(), Err(err));
                        still_pending.push(symbol);
                    }
                }
            }
            pending = still_pending;
        }

        outcomes
    }

    /// Fetch `symbols` from one adapter: chunked batch calls when the
    /// adapter supports them, bounded per-symbol calls otherwise. A panic
    /// fails only the chunk or symbol it happened in.
    async fn fetch_with(&self, provider: &Arc<dyn QuoteProvider>, symbols: &[String]) -> QuoteBatch {
        let batch_size = provider.max_batch_size();

        if batch_size > 1 {
            let chunks: Vec<Vec<String>> = symbols.chunks(batch_size).map(<[String]>::to_vec).collect();
            let batch_label = format!("{} batch", provider.name());
            let label = batch_label.as_str();
            let responses = join_all(chunks.iter().map(|chunk| async move {
                contain_panic(label, self.fetch_chunk(provider, chunk.clone()))
                    .await
                    .and_then(|response| response)
            }))
            .await;

            let mut merged = QuoteBatch::new();
            for (chunk, response) in chunks.into_iter().zip(responses) {
                match response {
                    Ok(batch) => merged.extend(batch),
                    // a failed request fails every symbol it carried
                    Err(err) => merged.extend(chunk.into_iter().map(|s| (s, Err(err.clone())))),
                }
            }
            return merged;
        }

        stream::iter(symbols.iter().cloned())
            .map(|symbol| async move {
                let label = format!("{} quote for {symbol}", provider.name());
                let result = contain_panic(&label, self.fetch_one(provider, &symbol))
                    .await
                    .and_then(|quote| quote);
                (symbol, result)
            })
            .buffered(self.max_concurrency)
            .collect()
            .await
    }

    /// One coalesced, cached, retried batch request.
    async fn fetch_chunk(&self, provider: &Arc<dyn QuoteProvider>, symbols: Vec<String>) -> Result<QuoteBatch, CoreError> {
        let key = cache_key(&format!("{}:quote", provider.name()), &symbols, &[]);
        let provider = Arc::clone(provider);
        let policy = self.policy;

        let call = async move {
            let name = provider.name().to_string();
            call_with_retry(&name, policy, || {
                let provider = Arc::clone(&provider);
                let symbols = symbols.clone();
                async move { provider.fetch_quotes(&symbols).await }
            })
            .await
        };
        self.cache.quotes.coalesce(&key, self.quote_ttl, call).await
    }

    /// One coalesced, cached, retried single-symbol request. Failures are
    /// returned as `Err` so they are never cached.
    async fn fetch_one(&self, provider: &Arc<dyn QuoteProvider>, symbol: &str) -> Result<ProviderQuote, CoreError> {
        let key = cache_key(&format!("{}:quote", provider.name()), &[symbol.to_string()], &[]);
        let provider = Arc::clone(provider);
        let owned = symbol.to_string();
        let policy = self.policy;

        let call = async move {
            let name = provider.name().to_string();
            let quote = call_with_retry(&name, policy, || {
                let provider = Arc::clone(&provider);
                let symbol = owned.clone();
                async move { provider.fetch_quote(&symbol).await }
            })
            .await?;
            let mut batch = QuoteBatch::new();
            batch.insert(owned, Ok(quote));
            Ok(batch)
        };

        let mut batch = self.cache.quotes.coalesce(&key, self.quote_ttl, call).await?;
        batch
            .remove(symbol)
            .unwrap_or_else(|| Err(CoreError::Internal(format!("cached batch lacks {symbol}"))))
    }
}

/// Treat a quote without a usable price as a miss for this stage.
fn require_price(provider: &str, symbol: &str, quote: ProviderQuote) -> Result<ProviderQuote, CoreError> {
    if quote.has_price() {
        Ok(quote)
    } else {
        Err(CoreError::not_found(provider, symbol))
    }
}

fn log_provider_failure(provider: &str, symbol: &str, err: &CoreError) {
    match err.kind() {
        FailureKind::UpstreamAuthFailure => {
            warn!(provider, symbol, error = %err, "upstream rejected request (credentials or IP block)")
        }
        FailureKind::UpstreamTransientFailure => {
            warn!(provider, symbol, error = %err, "upstream unavailable")
        }
        _ => debug!(provider, symbol, error = %err, "provider miss"),
    }
}

fn log_stage_failure(id: &InternalId, stage: &str, err: &CoreError) {
    match err.kind() {
        FailureKind::UpstreamAuthFailure => {
            warn!(id = %id, stage, error = %err, "TASE stage blocked by upstream")
        }
        _ => debug!(id = %id, stage, error = %err, "TASE stage failed, advancing"),
    }
}

/// Normalize a raw quote into the outgoing record for `id`.
///
/// `symbol` is the provider symbol that decides unit handling (`.TA`).
pub(crate) fn build_quote(id: &InternalId, symbol: &str, raw: ProviderQuote, source: QuoteSource) -> QuoteResult {
    let Some(price) = raw.price else {
        return QuoteResult::failure(id.to_string(), &CoreError::not_found(source.as_str(), symbol));
    };
    let normalized = normalize(&PriceInput {
        price,
        currency: raw.currency.as_deref(),
        symbol,
        instrument_type: raw.instrument_type,
        agorot_normalized: raw.agorot_normalized,
        previous_close: raw.previous_close,
        change_pct: raw.change_pct,
    });

    QuoteResult::Ok(Quote {
        id: id.to_string(),
        resolved_id: None,
        price: normalized.price,
        currency: normalized.currency,
        change_pct: normalized.change_pct,
        timestamp_ms: raw
            .timestamp_ms
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        source,
        name: raw.name,
    })
}
