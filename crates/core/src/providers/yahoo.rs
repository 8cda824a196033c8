//! Yahoo Finance adapters.
//!
//! Two endpoint strategies for the same upstream:
//! - [`YahooQuoteProvider`]: `/v7/finance/quote`, batch-capable, but the one
//!   Yahoo blocks first (401/403 without a crumb from some networks).
//! - [`YahooChartProvider`]: `/v8/finance/chart/{symbol}`, one symbol per
//!   request, rarely blocked; also the history source.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::config::EngineConfig;
use crate::errors::CoreError;
use crate::models::asset::InstrumentType;
use crate::models::history::{HistoryPoint, HistoryRange, Interval, ProviderHistory};
use crate::models::quote::{ProviderQuote, QuoteBatch, QuoteSource};
use super::http::{build_client, get_text, parse_json};
use super::traits::QuoteProvider;

const QUOTE_PROVIDER: &str = "Yahoo Finance";
const CHART_PROVIDER: &str = "Yahoo Finance Chart";

// ── Yahoo API response types ────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteEnvelope {
    quote_response: QuoteResponse,
}

#[derive(Deserialize)]
struct QuoteResponse {
    #[serde(default)]
    result: Vec<QuoteRow>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteRow {
    symbol: String,
    regular_market_price: Option<f64>,
    regular_market_previous_close: Option<f64>,
    regular_market_change_percent: Option<f64>,
    regular_market_time: Option<i64>,
    currency: Option<String>,
    quote_type: Option<String>,
    short_name: Option<String>,
    long_name: Option<String>,
}

#[derive(Deserialize)]
struct ChartEnvelope {
    chart: ChartBody,
}

#[derive(Deserialize)]
struct ChartBody {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Deserialize)]
struct ChartError {
    code: Option<String>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct ChartResult {
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Option<ChartIndicators>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    currency: Option<String>,
    symbol: Option<String>,
    regular_market_price: Option<f64>,
    regular_market_time: Option<i64>,
    previous_close: Option<f64>,
    chart_previous_close: Option<f64>,
    instrument_type: Option<String>,
    long_name: Option<String>,
    short_name: Option<String>,
}

#[derive(Deserialize)]
struct ChartIndicators {
    #[serde(default)]
    quote: Vec<ChartQuote>,
}

#[derive(Deserialize)]
struct ChartQuote {
    #[serde(default)]
    close: Vec<Option<f64>>,
}

impl ChartResult {
    fn closes(&self) -> &[Option<f64>] {
        self.indicators
            .as_ref()
            .and_then(|i| i.quote.first())
            .map(|q| q.close.as_slice())
            .unwrap_or(&[])
    }

    /// `(timestamp_ms, close)` pairs with null and non-finite closes dropped.
    fn points(&self) -> Vec<HistoryPoint> {
        self.timestamp
            .iter()
            .zip(self.closes())
            .filter_map(|(&ts, close)| {
                let value = close.filter(|v| v.is_finite())?;
                Some(HistoryPoint {
                    timestamp_ms: ts * 1000,
                    value,
                })
            })
            .collect()
    }
}

fn instrument_type(label: Option<&str>, symbol: &str) -> InstrumentType {
    match label.map(InstrumentType::from_provider_label) {
        Some(kind) if kind != InstrumentType::Unknown => kind,
        _ if symbol.starts_with('^') => InstrumentType::Index,
        _ => InstrumentType::Unknown,
    }
}

/// Unwrap the single chart result, mapping Yahoo's in-body errors.
fn chart_result(body: &str, symbol: &str) -> Result<ChartResult, CoreError> {
    let envelope: ChartEnvelope = parse_json(CHART_PROVIDER, body)?;
    if let Some(err) = envelope.chart.error {
        let code = err.code.unwrap_or_default();
        if code.eq_ignore_ascii_case("Not Found") {
            return Err(CoreError::not_found(CHART_PROVIDER, symbol));
        }
        return Err(CoreError::parse(
            CHART_PROVIDER,
            format!("{code}: {}", err.description.unwrap_or_default()),
        ));
    }
    envelope
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| CoreError::not_found(CHART_PROVIDER, symbol))
}

// ── Quote endpoint ──────────────────────────────────────────────────

/// Yahoo Finance batch quote endpoint.
///
/// - **Free**: No API key required.
/// - **Coverage**: Global equities, ETFs, indices, FX pairs, TASE (`.TA`).
/// - **Batch**: up to `yahoo_chunk_size` symbols per request.
///
/// Prices come in the instrument's native currency; TASE listings report
/// `ILA` (Agorot), normalized downstream.
pub struct YahooQuoteProvider {
    client: Client,
    base_url: String,
    chunk_size: usize,
}

impl YahooQuoteProvider {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            client: build_client(config.request_timeout(), &config.user_agent),
            base_url: config.endpoints.yahoo.trim_end_matches('/').to_string(),
            chunk_size: config.yahoo_chunk_size,
        }
    }
}

#[async_trait]
impl QuoteProvider for YahooQuoteProvider {
    fn name(&self) -> &str {
        QUOTE_PROVIDER
    }

    fn source(&self) -> QuoteSource {
        QuoteSource::Yahoo
    }

    fn max_batch_size(&self) -> usize {
        self.chunk_size
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<ProviderQuote, CoreError> {
        let mut batch = self.fetch_quotes(&[symbol.to_string()]).await?;
        batch
            .remove(symbol)
            .unwrap_or_else(|| Err(CoreError::not_found(QUOTE_PROVIDER, symbol)))
    }

    async fn fetch_quotes(&self, symbols: &[String]) -> Result<QuoteBatch, CoreError> {
        if symbols.is_empty() {
            return Ok(QuoteBatch::new());
        }
        let joined = symbols.join(",");
        let url = format!(
            "{}/v7/finance/quote?symbols={}",
            self.base_url,
            urlencoding::encode(&joined)
        );

        let body = get_text(QUOTE_PROVIDER, &joined, self.client.get(&url)).await?;
        let envelope: QuoteEnvelope = parse_json(QUOTE_PROVIDER, &body)?;

        let mut batch = QuoteBatch::new();
        for row in envelope.quote_response.result {
            // rows come back keyed by Yahoo's spelling; match case-insensitively
            let Some(requested) = symbols.iter().find(|s| s.eq_ignore_ascii_case(&row.symbol)) else {
                continue;
            };
            let quote = ProviderQuote {
                symbol: requested.clone(),
                price: row.regular_market_price,
                currency: row.currency,
                previous_close: row.regular_market_previous_close,
                change_pct: row.regular_market_change_percent,
                timestamp_ms: row.regular_market_time.map(|s| s * 1000),
                instrument_type: instrument_type(row.quote_type.as_deref(), requested),
                name: row.long_name.or(row.short_name),
                agorot_normalized: false,
            };
            batch.insert(requested.clone(), Ok(quote));
        }
        for symbol in symbols {
            batch
                .entry(symbol.clone())
                .or_insert_with(|| Err(CoreError::not_found(QUOTE_PROVIDER, symbol)));
        }
        Ok(batch)
    }
}

// ── Chart endpoint ──────────────────────────────────────────────────

/// Yahoo Finance chart endpoint: single-symbol quotes derived from the
/// intraday series, and history for every range.
pub struct YahooChartProvider {
    client: Client,
    base_url: String,
}

impl YahooChartProvider {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            client: build_client(config.request_timeout(), &config.user_agent),
            base_url: config.endpoints.yahoo.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_chart(
        &self,
        symbol: &str,
        range: &str,
        interval: &str,
    ) -> Result<ChartResult, CoreError> {
        let url = format!(
            "{}/v8/finance/chart/{}?range={range}&interval={interval}",
            self.base_url,
            urlencoding::encode(symbol)
        );
        let body = get_text(CHART_PROVIDER, symbol, self.client.get(&url)).await?;
        chart_result(&body, symbol)
    }
}

#[async_trait]
impl QuoteProvider for YahooChartProvider {
    fn name(&self) -> &str {
        CHART_PROVIDER
    }

    fn source(&self) -> QuoteSource {
        QuoteSource::YahooChart
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<ProviderQuote, CoreError> {
        let chart = self.fetch_chart(symbol, "1d", "5m").await?;
        let points = chart.points();
        let meta = &chart.meta;

        // live market price → latest non-null close → previous close
        let previous_close = meta.previous_close.or(meta.chart_previous_close);
        let price = meta
            .regular_market_price
            .filter(|p| p.is_finite())
            .or_else(|| points.last().map(|p| p.value))
            .or(previous_close);

        let timestamp_ms = meta
            .regular_market_time
            .map(|s| s * 1000)
            .or_else(|| points.last().map(|p| p.timestamp_ms));

        Ok(ProviderQuote {
            symbol: symbol.to_string(),
            price,
            currency: meta.currency.clone(),
            previous_close,
            change_pct: None,
            timestamp_ms,
            instrument_type: instrument_type(
                meta.instrument_type.as_deref(),
                meta.symbol.as_deref().unwrap_or(symbol),
            ),
            name: meta.long_name.clone().or_else(|| meta.short_name.clone()),
            agorot_normalized: false,
        })
    }

    async fn fetch_history(
        &self,
        symbol: &str,
        range: HistoryRange,
        interval: &Interval,
    ) -> Result<ProviderHistory, CoreError> {
        let chart = self
            .fetch_chart(symbol, range.as_str(), interval.as_str())
            .await?;
        let points = chart.points();
        if points.is_empty() {
            return Err(CoreError::not_found(CHART_PROVIDER, symbol));
        }
        Ok(ProviderHistory {
            symbol: symbol.to_string(),
            points,
            currency: chart.meta.currency.clone(),
            instrument_type: instrument_type(chart.meta.instrument_type.as_deref(), symbol),
        })
    }
}
