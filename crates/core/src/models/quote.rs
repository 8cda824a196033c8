use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::errors::{CoreError, FailureKind};
use super::asset::InstrumentType;
use super::internal_id::InternalId;

/// Stage that actually produced a quote or series.
///
/// Callers use it to tell authoritative data (official symbol via Yahoo,
/// CoinGecko) from best-effort data (scrapes, inferred `.TA` symbols).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuoteSource {
    #[serde(rename = "coingecko")]
    CoinGecko,
    #[serde(rename = "yahoo")]
    Yahoo,
    #[serde(rename = "yahoo-chart")]
    YahooChart,
    #[serde(rename = "tase-official")]
    TaseOfficial,
    #[serde(rename = "tase-primary")]
    TasePrimary,
    #[serde(rename = "tase-secondary")]
    TaseSecondary,
    #[serde(rename = "tase-yahoo-inferred")]
    TaseYahooInferred,
}

impl QuoteSource {
    pub fn as_str(self) -> &'static str {
        match self {
            QuoteSource::CoinGecko => "coingecko",
            QuoteSource::Yahoo => "yahoo",
            QuoteSource::YahooChart => "yahoo-chart",
            QuoteSource::TaseOfficial => "tase-official",
            QuoteSource::TasePrimary => "tase-primary",
            QuoteSource::TaseSecondary => "tase-secondary",
            QuoteSource::TaseYahooInferred => "tase-yahoo-inferred",
        }
    }
}

impl fmt::Display for QuoteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-neutral raw quote as returned by an adapter, before currency
/// normalization. Prices may still be in Agorot here.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProviderQuote {
    /// Provider-specific symbol the quote was fetched for.
    pub symbol: String,
    pub price: Option<f64>,
    /// Raw currency code exactly as reported (`USD`, `ILA`, ...), if any.
    pub currency: Option<String>,
    pub previous_close: Option<f64>,
    pub change_pct: Option<f64>,
    pub timestamp_ms: Option<i64>,
    pub instrument_type: InstrumentType,
    pub name: Option<String>,
    /// Provider already reports shekels for a security that trades in Agorot.
    pub agorot_normalized: bool,
}

impl ProviderQuote {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Self::default()
        }
    }

    /// A usable price is present, finite and positive.
    pub fn has_price(&self) -> bool {
        self.price.is_some_and(|p| p.is_finite() && p > 0.0)
    }
}

/// Per-symbol results of one upstream call. Whole-call failures are the
/// `Err` of the surrounding `Result`; a coin or ticker missing from an
/// otherwise healthy response is an `Err` entry here.
pub type QuoteBatch = HashMap<String, Result<ProviderQuote, CoreError>>;

/// Normalized successful quote.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    /// Identifier exactly as requested by the caller.
    pub id: String,
    /// Canonical id, present only when it differs from `id` (legacy migration).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_id: Option<InternalId>,
    pub price: f64,
    pub currency: String,
    pub change_pct: f64,
    pub timestamp_ms: i64,
    pub source: QuoteSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Structured per-id failure. Serialized as `{id, error}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuoteFailure {
    pub id: String,
    pub error: String,
    #[serde(skip)]
    pub kind: FailureKind,
}

impl QuoteFailure {
    pub fn new(id: impl Into<String>, err: &CoreError) -> Self {
        Self {
            id: id.into(),
            error: err.to_string(),
            kind: err.kind(),
        }
    }
}

/// One slot of a batch response: exactly one of price or error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QuoteResult {
    Ok(Quote),
    Err(QuoteFailure),
}

impl QuoteResult {
    pub fn failure(id: impl Into<String>, err: &CoreError) -> Self {
        QuoteResult::Err(QuoteFailure::new(id, err))
    }

    pub fn id(&self) -> &str {
        match self {
            QuoteResult::Ok(q) => &q.id,
            QuoteResult::Err(f) => &f.id,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, QuoteResult::Ok(_))
    }

    pub fn quote(&self) -> Option<&Quote> {
        match self {
            QuoteResult::Ok(q) => Some(q),
            QuoteResult::Err(_) => None,
        }
    }

    pub fn error(&self) -> Option<&QuoteFailure> {
        match self {
            QuoteResult::Ok(_) => None,
            QuoteResult::Err(f) => Some(f),
        }
    }

    /// Re-address the record to the identifier the caller asked for.
    pub(crate) fn for_request(mut self, requested: &str, resolved: &InternalId) -> Self {
        match &mut self {
            QuoteResult::Ok(q) => {
                q.id = requested.to_string();
                q.resolved_id = (requested != resolved.to_string()).then(|| resolved.clone());
            }
            QuoteResult::Err(f) => f.id = requested.to_string(),
        }
        self
    }
}
