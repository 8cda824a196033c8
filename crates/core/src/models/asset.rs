use serde::{Deserialize, Serialize};

/// Kind of instrument as far as price normalization cares.
///
/// The only distinction that changes numbers is `Index`: index values are
/// points, never currency amounts, so they are never Agorot-adjusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentType {
    Equity,
    Etf,
    Fund,
    Index,
    Crypto,
    Currency,
    #[default]
    Unknown,
}

impl InstrumentType {
    /// Map a provider-reported label (Yahoo `quoteType`/`instrumentType`,
    /// TASE security type) onto an instrument type.
    pub fn from_provider_label(label: &str) -> Self {
        let trimmed = label.trim();
        if trimmed.contains("מדד") {
            return InstrumentType::Index;
        }
        match trimmed.to_ascii_uppercase().as_str() {
            "EQUITY" | "STOCK" | "SHARE" | "SHARES" => InstrumentType::Equity,
            "ETF" | "ETN" => InstrumentType::Etf,
            "MUTUALFUND" | "FUND" | "MUTUAL FUND" => InstrumentType::Fund,
            "INDEX" | "INDICES" => InstrumentType::Index,
            "CRYPTOCURRENCY" | "CRYPTO" => InstrumentType::Crypto,
            "CURRENCY" | "FX" => InstrumentType::Currency,
            _ => InstrumentType::Unknown,
        }
    }
}

impl std::fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstrumentType::Equity => write!(f, "Equity"),
            InstrumentType::Etf => write!(f, "ETF"),
            InstrumentType::Fund => write!(f, "Fund"),
            InstrumentType::Index => write!(f, "Index"),
            InstrumentType::Crypto => write!(f, "Crypto"),
            InstrumentType::Currency => write!(f, "Currency"),
            InstrumentType::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Asset descriptor as handed over by callers (user holdings, imports).
///
/// Every field is optional: records come from several generations of
/// storage with different spellings, hence the aliases. Resolution into an
/// [`InternalId`](super::internal_id::InternalId) happens in
/// [`crate::services::resolver::resolve_record`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssetRecord {
    /// Already-prefixed identifier (`cg:bitcoin`, `tase:662577`).
    #[serde(alias = "apiId", alias = "marketDataId")]
    pub internal_id: Option<String>,

    pub symbol: Option<String>,

    pub ticker: Option<String>,

    /// TASE security number ("מספר נייר").
    #[serde(alias = "securityId", alias = "taseId")]
    pub security_number: Option<String>,

    /// Explicit data-source flag (`coingecko`, `tase`, `yahoo`).
    pub data_source: Option<String>,

    #[serde(alias = "type")]
    pub asset_type: Option<String>,

    /// Free-text category label chosen by the user.
    pub category: Option<String>,

    pub exchange: Option<String>,

    pub currency: Option<String>,

    pub name: Option<String>,
}

impl AssetRecord {
    /// Convenience constructor for the common "ticker only" case.
    pub fn with_symbol(symbol: impl Into<String>) -> Self {
        Self {
            symbol: Some(symbol.into()),
            ..Self::default()
        }
    }

    /// First non-empty of `symbol` and `ticker`, trimmed.
    pub fn best_symbol(&self) -> Option<&str> {
        [self.symbol.as_deref(), self.ticker.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
    }
}
