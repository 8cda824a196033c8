use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::errors::CoreError;

/// Upstream family an instrument is priced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTag {
    /// Cryptocurrencies, keyed by CoinGecko slug (`bitcoin`).
    #[serde(rename = "coingecko")]
    CoinGecko,
    /// Global equities, ETFs, indices and FX pairs, keyed by Yahoo symbol.
    Yahoo,
    /// Tel Aviv Stock Exchange securities, keyed by bare security number.
    Tase,
}

impl ProviderTag {
    /// Prefix used in the `<prefix>:<symbol>` wire form.
    pub fn prefix(self) -> &'static str {
        match self {
            ProviderTag::CoinGecko => "cg",
            ProviderTag::Yahoo => "yahoo",
            ProviderTag::Tase => "tase",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "cg" => Some(ProviderTag::CoinGecko),
            "yahoo" => Some(ProviderTag::Yahoo),
            "tase" => Some(ProviderTag::Tase),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderTag::CoinGecko => write!(f, "coingecko"),
            ProviderTag::Yahoo => write!(f, "yahoo"),
            ProviderTag::Tase => write!(f, "tase"),
        }
    }
}

/// Canonical identifier of one tradable instrument: `cg:bitcoin`,
/// `yahoo:AAPL`, `tase:1183441`.
///
/// Parsing through [`FromStr`] accepts only the canonical form, and a
/// `tase:` symbol must be all digits. Loose
/// inputs (bare tickers, legacy formats) go through
/// [`crate::services::resolver`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InternalId {
    pub provider: ProviderTag,
    pub symbol: String,
}

impl InternalId {
    pub fn new(provider: ProviderTag, symbol: impl Into<String>) -> Self {
        Self {
            provider,
            symbol: symbol.into(),
        }
    }

    pub fn coingecko(slug: impl Into<String>) -> Self {
        Self::new(ProviderTag::CoinGecko, slug)
    }

    pub fn yahoo(symbol: impl Into<String>) -> Self {
        Self::new(ProviderTag::Yahoo, symbol)
    }

    pub fn tase(security_number: impl Into<String>) -> Self {
        Self::new(ProviderTag::Tase, security_number)
    }

    /// Yahoo-compatible symbol inferred for a TASE security (`<number>.TA`).
    pub fn inferred_tase_symbol(&self) -> Option<String> {
        match self.provider {
            ProviderTag::Tase => Some(format!("{}.TA", self.symbol)),
            _ => None,
        }
    }
}

impl fmt::Display for InternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider.prefix(), self.symbol)
    }
}

impl FromStr for InternalId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, symbol) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| CoreError::Resolution(format!("missing provider prefix in '{s}'")))?;
        let provider = ProviderTag::from_prefix(prefix)
            .ok_or_else(|| CoreError::Resolution(format!("unknown provider prefix '{prefix}'")))?;
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Err(CoreError::Resolution(format!("empty symbol in '{s}'")));
        }
        if provider == ProviderTag::Tase && !symbol.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CoreError::Resolution(format!(
                "TASE ids take a bare security number, got '{symbol}'"
            )));
        }
        Ok(Self::new(provider, symbol))
    }
}

impl Serialize for InternalId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InternalId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
