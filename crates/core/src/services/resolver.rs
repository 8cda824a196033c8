//! Identifier resolution: arbitrary asset records and loose strings →
//! canonical [`InternalId`].
//!
//! Pure functions, no I/O. `None` means "cannot resolve, skip this asset".

use crate::models::asset::AssetRecord;
use crate::models::internal_id::{InternalId, ProviderTag};

/// Common crypto tickers → CoinGecko slugs. Unmapped tickers fall back to
/// the lowercased ticker, which is right for most long-tail coins.
const CRYPTO_SLUGS: &[(&str, &str)] = &[
    ("BTC", "bitcoin"),
    ("ETH", "ethereum"),
    ("USDT", "tether"),
    ("USDC", "usd-coin"),
    ("BNB", "binancecoin"),
    ("XRP", "ripple"),
    ("ADA", "cardano"),
    ("SOL", "solana"),
    ("DOGE", "dogecoin"),
    ("DOT", "polkadot"),
    ("MATIC", "matic-network"),
    ("POL", "polygon-ecosystem-token"),
    ("LTC", "litecoin"),
    ("AVAX", "avalanche-2"),
    ("LINK", "chainlink"),
    ("UNI", "uniswap"),
    ("ATOM", "cosmos"),
    ("XLM", "stellar"),
    ("ALGO", "algorand"),
    ("NEAR", "near"),
    ("FTM", "fantom"),
    ("SHIB", "shiba-inu"),
    ("TRX", "tron"),
    ("DAI", "dai"),
    ("AAVE", "aave"),
    ("CRO", "crypto-com-chain"),
    ("FIL", "filecoin"),
    ("ICP", "internet-computer"),
    ("ETC", "ethereum-classic"),
    ("HBAR", "hedera-hashgraph"),
    ("VET", "vechain"),
    ("MANA", "decentraland"),
    ("SAND", "the-sandbox"),
    ("XMR", "monero"),
    ("EOS", "eos"),
    ("XTZ", "tezos"),
    ("TON", "the-open-network"),
    ("ARB", "arbitrum"),
    ("OP", "optimism"),
    ("PEPE", "pepe"),
];

const CRYPTO_LABELS: &[&str] = &["crypto", "cryptocurrency", "cryptocurrencies", "coin", "קריפטו"];
const TASE_LABELS: &[&str] = &["tase", "tlv", "ta", "xtae", "בורסת תל אביב"];

/// Input accepted by [`resolve`].
#[derive(Debug, Clone, Copy)]
pub enum ResolveInput<'a> {
    Raw(&'a str),
    Record(&'a AssetRecord),
}

/// Resolve either a raw identifier string or an asset record.
pub fn resolve(input: ResolveInput<'_>) -> Option<InternalId> {
    match input {
        ResolveInput::Raw(s) => resolve_str(s),
        ResolveInput::Record(r) => resolve_record(r),
    }
}

// ── String input ────────────────────────────────────────────────────

/// Resolve a raw identifier string.
///
/// Legacy forms are migrated first, canonical ids pass through unchanged,
/// then numeric strings are TASE and anything else is a Yahoo symbol. A
/// known provider prefix with an empty or malformed symbol (`yahoo:`,
/// `tase:TEVA`) resolves to nothing.
pub fn resolve_str(input: &str) -> Option<InternalId> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Some(migrated) = migrate_legacy(input) {
        return Some(migrated);
    }
    match input.parse::<InternalId>() {
        Ok(id) => return Some(id),
        Err(_) if has_known_prefix(input) => return None,
        Err(_) => {}
    }
    if is_numeric(input) {
        return Some(InternalId::tase(input));
    }
    Some(InternalId::yahoo(input))
}

/// Rewrite a legacy identifier into canonical form, or `None` when `input`
/// is not a legacy form. Idempotent: canonical output is never legacy.
///
/// Legacy forms: `1183441`, `1183441.TA`, `yahoo:1183441`,
/// `yahoo:1183441.TA`, `tase:1183441.TA`, `coingecko:<slug>`.
pub fn migrate_legacy(input: &str) -> Option<InternalId> {
    let input = input.trim();
    if let Some(number) = tase_number(input) {
        return Some(InternalId::tase(number));
    }
    let (prefix, rest) = input.split_once(':')?;
    let rest = rest.trim();
    match prefix.trim().to_ascii_lowercase().as_str() {
        "yahoo" => tase_number(rest).map(InternalId::tase),
        "tase" => {
            let number = strip_ta_suffix(rest)?;
            is_numeric(number).then(|| InternalId::tase(number))
        }
        "coingecko" if !rest.is_empty() => Some(InternalId::coingecko(rest)),
        _ => None,
    }
}

/// Bare security number from `1183441` or `1183441.TA`.
fn tase_number(s: &str) -> Option<&str> {
    let base = strip_ta_suffix(s).unwrap_or(s);
    is_numeric(base).then_some(base)
}

fn strip_ta_suffix(s: &str) -> Option<&str> {
    let cut = s.len().checked_sub(3)?;
    let (base, suffix) = (s.get(..cut)?, s.get(cut..)?);
    suffix.eq_ignore_ascii_case(".TA").then_some(base)
}

fn has_known_prefix(s: &str) -> bool {
    s.split_once(':').is_some_and(|(prefix, _)| {
        let prefix = prefix.trim();
        ProviderTag::from_prefix(prefix).is_some() || prefix.eq_ignore_ascii_case("coingecko")
    })
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

// ── Record input ────────────────────────────────────────────────────

/// One step of the record cascade: if `applies`, `extract` decides.
///
/// A rule that applies but cannot extract lets the cascade continue.
pub struct ResolverRule {
    pub name: &'static str,
    pub applies: fn(&AssetRecord) -> bool,
    pub extract: fn(&AssetRecord) -> Option<InternalId>,
}

/// The record cascade. Order is the contract: earlier rules win.
pub const RESOLVER_RULES: &[ResolverRule] = &[
    ResolverRule {
        name: "explicit-id",
        applies: has_prefixed_id,
        extract: extract_prefixed_id,
    },
    ResolverRule {
        name: "crypto",
        applies: is_crypto,
        extract: extract_crypto,
    },
    ResolverRule {
        name: "tase",
        applies: is_tase,
        extract: extract_tase,
    },
    ResolverRule {
        name: "default-yahoo",
        applies: has_symbol,
        extract: extract_default,
    },
];

/// Resolve an asset record by the first applicable rule that yields an id.
pub fn resolve_record(record: &AssetRecord) -> Option<InternalId> {
    resolve_record_with_rule(record).map(|(_, id)| id)
}

/// Like [`resolve_record`], also naming the rule that matched.
pub fn resolve_record_with_rule(record: &AssetRecord) -> Option<(&'static str, InternalId)> {
    RESOLVER_RULES
        .iter()
        .filter(|rule| (rule.applies)(record))
        .find_map(|rule| (rule.extract)(record).map(|id| (rule.name, id)))
}

fn field(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn label_in(value: &Option<String>, labels: &[&str]) -> bool {
    field(value).is_some_and(|v| labels.iter().any(|l| v.eq_ignore_ascii_case(l)))
}

fn has_prefixed_id(record: &AssetRecord) -> bool {
    field(&record.internal_id).is_some_and(has_known_prefix)
}

fn extract_prefixed_id(record: &AssetRecord) -> Option<InternalId> {
    field(&record.internal_id).and_then(resolve_str)
}

fn is_crypto(record: &AssetRecord) -> bool {
    label_in(&record.data_source, &["coingecko", "cg"])
        || label_in(&record.asset_type, CRYPTO_LABELS)
        || label_in(&record.category, CRYPTO_LABELS)
}

fn extract_crypto(record: &AssetRecord) -> Option<InternalId> {
    let ticker = record.best_symbol()?;
    // "BTC-USD" style tickers name the coin before the dash
    let base = ticker.split(['-', '/']).next().unwrap_or(ticker).trim();
    let slug = CRYPTO_SLUGS
        .iter()
        .find(|(t, _)| t.eq_ignore_ascii_case(base))
        .map(|(_, slug)| slug.to_string())
        .unwrap_or_else(|| base.to_lowercase());
    (!slug.is_empty()).then(|| InternalId::coingecko(slug))
}

fn is_tase(record: &AssetRecord) -> bool {
    if label_in(&record.data_source, TASE_LABELS) || label_in(&record.exchange, TASE_LABELS) {
        return true;
    }
    let symbol = record.best_symbol();
    let ils = field(&record.currency).is_some_and(|c| c.eq_ignore_ascii_case("ILS") || c.eq_ignore_ascii_case("ILA"));
    if ils && symbol.is_some_and(is_numeric) {
        return true;
    }
    symbol
        .and_then(strip_ta_suffix)
        .is_some_and(is_numeric)
}

fn extract_tase(record: &AssetRecord) -> Option<InternalId> {
    let from_security_number = field(&record.security_number).and_then(tase_number);
    let from_symbol = || {
        [record.symbol.as_deref(), record.ticker.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find_map(tase_number)
    };
    from_security_number
        .or_else(from_symbol)
        .map(InternalId::tase)
}

fn has_symbol(record: &AssetRecord) -> bool {
    record.best_symbol().is_some()
}

fn extract_default(record: &AssetRecord) -> Option<InternalId> {
    let symbol = record.best_symbol()?;
    if symbol.contains(':') {
        return resolve_str(symbol);
    }
    Some(InternalId::yahoo(symbol))
}
