use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::errors::CoreError;

use super::coingecko::CoinGeckoProvider;
use super::tase_primary::TasePrimaryProvider;
use super::tase_reference::TaseReference;
use super::tase_secondary::TaseSecondaryProvider;
use super::traits::QuoteProvider;
use super::yahoo::{YahooChartProvider, YahooQuoteProvider};

/// Position an adapter occupies in the fallback chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderRole {
    /// `cg:` ids.
    Crypto,
    /// `yahoo:` ids, and the official/inferred TASE stages.
    Global,
    /// TASE scrape stages, between the official symbol and the inferred one.
    TaseScrape,
}

/// Registry of all available adapters, one ordered chain per role.
///
/// Chains are tried in registration order, so the order of `register`
/// calls is the fallback contract. Adapters are shared across requests.
pub struct ProviderRegistry {
    chains: HashMap<ProviderRole, Vec<Arc<dyn QuoteProvider>>>,
    tase_reference: TaseReference,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new(tase_reference: TaseReference) -> Self {
        Self {
            chains: HashMap::new(),
            tase_reference,
        }
    }

    /// Create a registry with all default adapters pre-configured:
    /// CoinGecko; Yahoo quote then Yahoo chart; TASE primary then secondary.
    pub fn new_with_defaults(config: &EngineConfig) -> Result<Self, CoreError> {
        let reference = TaseReference::load(config.tase_reference_path.as_deref())?;
        let mut registry = Self::new(reference);

        registry.register(ProviderRole::Crypto, Arc::new(CoinGeckoProvider::new(config)));

        registry.register(ProviderRole::Global, Arc::new(YahooQuoteProvider::new(config)));
        registry.register(ProviderRole::Global, Arc::new(YahooChartProvider::new(config)));

        registry.register(ProviderRole::TaseScrape, Arc::new(TasePrimaryProvider::new(config)));
        registry.register(ProviderRole::TaseScrape, Arc::new(TaseSecondaryProvider::new(config)));

        Ok(registry)
    }

    /// Append an adapter to the end of a role's chain.
    pub fn register(&mut self, role: ProviderRole, provider: Arc<dyn QuoteProvider>) {
        self.chains.entry(role).or_default().push(provider);
    }

    /// All adapters of a role, ordered by registration priority.
    pub fn chain(&self, role: ProviderRole) -> &[Arc<dyn QuoteProvider>] {
        self.chains.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_provider_for(&self, role: ProviderRole) -> bool {
        !self.chain(role).is_empty()
    }

    pub fn provider_names(&self, role: ProviderRole) -> Vec<String> {
        self.chain(role).iter().map(|p| p.name().to_string()).collect()
    }

    pub fn tase_reference(&self) -> &TaseReference {
        &self.tase_reference
    }
}
