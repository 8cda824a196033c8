use std::sync::Arc;
use tracing::debug;

use crate::errors::CoreError;
use super::quote_service::QuoteService;

/// Yahoo symbol quoting shekels per US dollar.
pub const USD_ILS_SYMBOL: &str = "ILS=X";

/// Exchange rates for display conversions.
///
/// Rates come from the global quote chain, so they share its cache,
/// coalescing and retry policy.
pub struct FxService {
    quotes: Arc<QuoteService>,
}

impl FxService {
    pub fn new(quotes: Arc<QuoteService>) -> Self {
        Self { quotes }
    }

    /// Shekels per one US dollar.
    pub async fn usd_ils_rate(&self) -> Result<f64, CoreError> {
        let (quote, source) = self.quotes.quote_yahoo_symbol(USD_ILS_SYMBOL).await?;
        let rate = quote
            .price
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| CoreError::not_found(source.as_str(), USD_ILS_SYMBOL))?;
        debug!(rate, source = %source, "USD/ILS rate");
        Ok(rate)
    }

    /// Convert `amount` between USD and ILS. Same-currency amounts come back
    /// unchanged; other pairs are rejected.
    pub async fn convert(&self, amount: f64, from: &str, to: &str) -> Result<f64, CoreError> {
        let from = from.trim().to_uppercase();
        let to = to.trim().to_uppercase();
        if from == to {
            return Ok(amount);
        }
        match (from.as_str(), to.as_str()) {
            ("USD", "ILS") => Ok(amount * self.usd_ils_rate().await?),
            ("ILS", "USD") => Ok(amount / self.usd_ils_rate().await?),
            _ => Err(CoreError::InvalidRequest(format!(
                "unsupported conversion {from} → {to}"
            ))),
        }
    }
}
