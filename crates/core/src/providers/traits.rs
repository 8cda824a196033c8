use async_trait::async_trait;
use futures::future::join_all;

use crate::errors::CoreError;
use crate::models::history::{HistoryRange, Interval, ProviderHistory};
use crate::models::quote::{ProviderQuote, QuoteBatch, QuoteSource};

/// Trait abstraction for every upstream market-data source.
///
/// Adapters are stateless apart from their HTTP client: they translate a
/// provider symbol into a request and the raw response into a
/// [`ProviderQuote`], or a [`CoreError`] from the shared failure taxonomy.
/// Caching, retries and fallbacks live above them.
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    /// Human-readable name of this provider (for logs/errors/cache keys).
    fn name(&self) -> &str;

    /// Source tag recorded on quotes this adapter produces directly.
    fn source(&self) -> QuoteSource;

    /// How many symbols one upstream request may carry.
    fn max_batch_size(&self) -> usize {
        1
    }

    /// Latest quote for a single provider symbol.
    async fn fetch_quote(&self, symbol: &str) -> Result<ProviderQuote, CoreError>;

    /// Latest quotes for several symbols. Batch-capable adapters override
    /// this with a single request; the default fans out per symbol.
    async fn fetch_quotes(&self, symbols: &[String]) -> Result<QuoteBatch, CoreError> {
        let results = join_all(symbols.iter().map(|s| self.fetch_quote(s))).await;
        Ok(symbols.iter().cloned().zip(results).collect())
    }

    /// Price series for a symbol. Adapters without history report a miss.
    async fn fetch_history(
        &self,
        symbol: &str,
        _range: HistoryRange,
        _interval: &Interval,
    ) -> Result<ProviderHistory, CoreError> {
        Err(CoreError::not_found(self.name(), symbol))
    }
}
