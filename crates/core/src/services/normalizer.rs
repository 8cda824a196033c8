//! Currency and units normalization of raw provider prices.
//!
//! TASE securities trade in Agorot (1/100 ILS) and several upstreams report
//! them that way, labelled `ILA` or not labelled at all. Everything leaving
//! the engine is in shekels (`ILS`), except index values, which are points.

use crate::models::asset::InstrumentType;
use crate::models::history::HistoryPoint;

/// Without currency metadata, a TASE price above this is assumed to be in
/// Agorot. A documented approximation kept for legacy scrape sources: a
/// security genuinely priced above 500 ILS is divided wrongly.
pub const AGOROT_HEURISTIC_THRESHOLD: f64 = 500.0;

const AGOROT_CODE: &str = "ILA";
const SHEKEL_CODE: &str = "ILS";

/// Raw price and the metadata that decides its unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceInput<'a> {
    pub price: f64,
    /// Currency code as reported; `None` when the provider gives none.
    pub currency: Option<&'a str>,
    /// Provider symbol; TASE listings end in `.TA`.
    pub symbol: &'a str,
    pub instrument_type: InstrumentType,
    /// Provider already converted Agorot to shekels.
    pub agorot_normalized: bool,
    pub previous_close: Option<f64>,
    pub change_pct: Option<f64>,
}

impl<'a> PriceInput<'a> {
    pub fn new(price: f64, currency: Option<&'a str>, symbol: &'a str, instrument_type: InstrumentType) -> Self {
        Self {
            price,
            currency,
            symbol,
            instrument_type,
            agorot_normalized: false,
            previous_close: None,
            change_pct: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPrice {
    pub price: f64,
    pub currency: String,
    pub change_pct: f64,
}

fn is_tase_symbol(symbol: &str) -> bool {
    symbol.len() > 3
        && symbol
            .get(symbol.len() - 3..)
            .is_some_and(|s| s.eq_ignore_ascii_case(".TA"))
}

fn is_index(symbol: &str, instrument_type: InstrumentType) -> bool {
    instrument_type == InstrumentType::Index || symbol.starts_with('^')
}

/// Divisor turning the raw unit into shekels: 100 or 1.
///
/// `reference_price` is the magnitude the legacy heuristic looks at when
/// no currency metadata exists.
pub fn agorot_divisor(
    currency: Option<&str>,
    symbol: &str,
    instrument_type: InstrumentType,
    agorot_normalized: bool,
    reference_price: f64,
) -> f64 {
    if !is_tase_symbol(symbol) || is_index(symbol, instrument_type) || agorot_normalized {
        return 1.0;
    }
    let in_agorot = match currency.map(str::trim).filter(|c| !c.is_empty()) {
        // explicit metadata always wins over magnitude
        Some(code) => code.eq_ignore_ascii_case(AGOROT_CODE),
        None => reference_price > AGOROT_HEURISTIC_THRESHOLD,
    };
    if in_agorot {
        100.0
    } else {
        1.0
    }
}

/// Output currency label: `ILA` becomes `ILS`; a missing code defaults to
/// `ILS` on TASE and `USD` elsewhere.
pub fn output_currency(currency: Option<&str>, symbol: &str) -> String {
    match currency.map(str::trim).filter(|c| !c.is_empty()) {
        Some(code) if code.eq_ignore_ascii_case(AGOROT_CODE) => SHEKEL_CODE.to_string(),
        Some(code) => code.to_ascii_uppercase(),
        None if is_tase_symbol(symbol) => SHEKEL_CODE.to_string(),
        None => "USD".to_string(),
    }
}

/// Normalize one raw price into `(price, currency, change_pct)`.
pub fn normalize(input: &PriceInput<'_>) -> NormalizedPrice {
    let divisor = agorot_divisor(
        input.currency,
        input.symbol,
        input.instrument_type,
        input.agorot_normalized,
        input.price,
    );
    let price = input.price / divisor;

    let change_pct = input
        .change_pct
        .filter(|c| c.is_finite())
        .or_else(|| {
            // both sides of the ratio in the same unit
            let previous = input.previous_close? / divisor;
            (previous.is_finite() && previous != 0.0).then(|| (price - previous) / previous * 100.0)
        })
        .unwrap_or(0.0);

    NormalizedPrice {
        price,
        currency: output_currency(input.currency, input.symbol),
        change_pct,
    }
}

/// Normalize a whole series with one divisor, chosen from the metadata and,
/// for the heuristic, the latest value.
pub fn normalize_series(
    points: &[HistoryPoint],
    currency: Option<&str>,
    symbol: &str,
    instrument_type: InstrumentType,
) -> (Vec<HistoryPoint>, String) {
    let reference = points.last().map(|p| p.value).unwrap_or(0.0);
    let divisor = agorot_divisor(currency, symbol, instrument_type, false, reference);
    let normalized = points
        .iter()
        .map(|p| HistoryPoint {
            timestamp_ms: p.timestamp_ms,
            value: p.value / divisor,
        })
        .collect();
    (normalized, output_currency(currency, symbol))
}
