use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;

use crate::config::EngineConfig;
use crate::errors::CoreError;
use crate::models::asset::InstrumentType;
use crate::models::history::{HistoryPoint, HistoryRange, Interval, ProviderHistory};
use crate::models::quote::{ProviderQuote, QuoteBatch, QuoteSource};
use super::http::{build_client, get_text, parse_json};
use super::traits::QuoteProvider;

const PROVIDER: &str = "CoinGecko";

/// CoinGecko API provider for cryptocurrency prices.
///
/// - **Free**: Demo API key optional (set via `api_keys["coingecko"]`).
/// - **Batch**: `/simple/price` covers many coins in one request.
/// - **History**: `/coins/{id}/market_chart`.
///
/// Note: CoinGecko uses slugs like "bitcoin", "ethereum". Ticker → slug
/// mapping happens in the resolver, not here.
pub struct CoinGeckoProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    chunk_size: usize,
}

impl CoinGeckoProvider {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            client: build_client(config.request_timeout(), &config.user_agent),
            base_url: config.endpoints.coingecko.trim_end_matches('/').to_string(),
            api_key: config.api_key("coingecko").map(str::to_string),
            chunk_size: config.coingecko_chunk_size,
        }
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url).header("accept", "application/json");
        match &self.api_key {
            Some(key) => request.header("x-cg-demo-api-key", key),
            None => request,
        }
    }
}

// ── CoinGecko API response types ────────────────────────────────────

#[derive(Deserialize)]
struct SimplePrice {
    usd: Option<f64>,
    usd_24h_change: Option<f64>,
    last_updated_at: Option<i64>,
}

#[derive(Deserialize)]
struct MarketChartResponse {
    prices: Vec<(f64, Option<f64>)>,
}

#[async_trait]
impl QuoteProvider for CoinGeckoProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn source(&self) -> QuoteSource {
        QuoteSource::CoinGecko
    }

    fn max_batch_size(&self) -> usize {
        self.chunk_size
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<ProviderQuote, CoreError> {
        let mut batch = self.fetch_quotes(&[symbol.to_string()]).await?;
        batch
            .remove(symbol)
            .unwrap_or_else(|| Err(CoreError::not_found(PROVIDER, symbol)))
    }

    async fn fetch_quotes(&self, symbols: &[String]) -> Result<QuoteBatch, CoreError> {
        if symbols.is_empty() {
            return Ok(QuoteBatch::new());
        }
        let ids = symbols.join(",");
        let url = format!(
            "{}/simple/price?ids={}&vs_currencies=usd&include_24hr_change=true&include_last_updated_at=true",
            self.base_url,
            urlencoding::encode(&ids)
        );

        let body = get_text(PROVIDER, &ids, self.get(&url)).await?;
        let mut prices: HashMap<String, SimplePrice> = parse_json(PROVIDER, &body)?;

        // a coin missing from an otherwise healthy response is a per-coin miss
        let batch = symbols
            .iter()
            .map(|slug| {
                let result = match prices.remove(slug) {
                    Some(SimplePrice {
                        usd: Some(price),
                        usd_24h_change,
                        last_updated_at,
                    }) => Ok(ProviderQuote {
                        symbol: slug.clone(),
                        price: Some(price),
                        currency: Some("USD".to_string()),
                        change_pct: usd_24h_change,
                        timestamp_ms: last_updated_at.map(|s| s * 1000),
                        instrument_type: InstrumentType::Crypto,
                        ..ProviderQuote::default()
                    }),
                    _ => Err(CoreError::not_found(PROVIDER, slug)),
                };
                (slug.clone(), result)
            })
            .collect();

        Ok(batch)
    }

    async fn fetch_history(
        &self,
        symbol: &str,
        range: HistoryRange,
        interval: &Interval,
    ) -> Result<ProviderHistory, CoreError> {
        let mut url = format!(
            "{}/coins/{}/market_chart?vs_currency=usd&days={}",
            self.base_url,
            urlencoding::encode(symbol),
            range.days()
        );
        // CoinGecko picks granularity from `days`; only daily can be forced
        if interval.is_daily_or_coarser() && !range.is_intraday() {
            url.push_str("&interval=daily");
        }

        let body = get_text(PROVIDER, symbol, self.get(&url)).await?;
        let chart: MarketChartResponse = parse_json(PROVIDER, &body)?;

        let points: Vec<HistoryPoint> = chart
            .prices
            .into_iter()
            .filter_map(|(t, v)| {
                let value = v.filter(|v| v.is_finite())?;
                Some(HistoryPoint {
                    timestamp_ms: t as i64,
                    value,
                })
            })
            .collect();

        if points.is_empty() {
            return Err(CoreError::not_found(PROVIDER, symbol));
        }

        Ok(ProviderHistory {
            symbol: symbol.to_string(),
            points,
            currency: Some("USD".to_string()),
            instrument_type: InstrumentType::Crypto,
        })
    }
}
