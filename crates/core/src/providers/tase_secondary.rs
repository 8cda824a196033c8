use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};

use crate::config::EngineConfig;
use crate::errors::CoreError;
use crate::models::asset::InstrumentType;
use crate::models::quote::{ProviderQuote, QuoteSource};
use super::http::{build_client, get_text};
use super::tase_text::{parse_tase_number, repair_display_name};
use super::traits::QuoteProvider;

const PROVIDER: &str = "TASE secondary";

const PRICE_SELECTORS: &[&str] = &["[data-field='last-rate']", ".paper-data .num.last", ".quote-price .num"];
const CHANGE_SELECTORS: &[&str] = &["[data-field='change-pct']", ".paper-data .num.change"];
const BASE_RATE_SELECTORS: &[&str] = &["[data-field='base-rate']", ".paper-data .num.base"];
const NAME_SELECTORS: &[&str] = &["h1.paper-name", ".paper-header h1", "h1"];
const UNIT_SELECTORS: &[&str] = &["[data-field='unit']", ".price-unit"];
const TYPE_SELECTORS: &[&str] = &["[data-field='paper-type']", ".paper-type"];

/// Secondary TASE scrape source: a financial portal's HTML quote page.
///
/// The page rarely states its unit. When it does, a shekel marker means the
/// price is already normalized and an Agorot marker means `ILA`; otherwise
/// the quote carries no currency and the normalizer falls back to the
/// legacy magnitude heuristic.
pub struct TaseSecondaryProvider {
    client: Client,
    base_url: String,
}

impl TaseSecondaryProvider {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            client: build_client(config.request_timeout(), &config.user_agent),
            base_url: config.endpoints.tase_secondary.trim_end_matches('/').to_string(),
        }
    }
}

/// Text of the first element matching any of `selectors`.
fn first_text(document: &Html, selectors: &[&str]) -> Option<String> {
    selectors.iter().find_map(|css| {
        let selector = Selector::parse(css).ok()?;
        let element = document.select(&selector).next()?;
        let text = element.text().collect::<String>();
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    })
}

enum PriceUnit {
    Shekel,
    Agorot,
    Unstated,
}

fn price_unit(document: &Html) -> PriceUnit {
    match first_text(document, UNIT_SELECTORS) {
        Some(unit) if unit.contains("אג") || unit.eq_ignore_ascii_case("ILA") => PriceUnit::Agorot,
        Some(unit)
            if unit.contains('₪')
                || unit.contains("ש\"ח")
                || unit.contains("שקל")
                || unit.eq_ignore_ascii_case("ILS") =>
        {
            PriceUnit::Shekel
        }
        _ => PriceUnit::Unstated,
    }
}

/// Scrape a quote page for `security_number`.
pub(crate) fn parse_quote_page(html: &str, security_number: &str) -> Result<ProviderQuote, CoreError> {
    let document = Html::parse_document(html);

    let price_text = first_text(&document, PRICE_SELECTORS)
        .ok_or_else(|| CoreError::parse(PROVIDER, "price element missing"))?;
    let price = parse_tase_number(&price_text)
        .ok_or_else(|| CoreError::parse(PROVIDER, format!("unreadable price '{price_text}'")))?;
    if price <= 0.0 {
        return Err(CoreError::not_found(PROVIDER, security_number));
    }

    let instrument_type = first_text(&document, TYPE_SELECTORS)
        .map(|t| InstrumentType::from_provider_label(&t))
        .unwrap_or(InstrumentType::Unknown);

    let (currency, agorot_normalized) = match price_unit(&document) {
        PriceUnit::Shekel => (Some("ILS".to_string()), true),
        PriceUnit::Agorot => (Some("ILA".to_string()), false),
        PriceUnit::Unstated => (None, false),
    };

    Ok(ProviderQuote {
        symbol: security_number.to_string(),
        price: Some(price),
        currency,
        previous_close: first_text(&document, BASE_RATE_SELECTORS).and_then(|t| parse_tase_number(&t)),
        change_pct: first_text(&document, CHANGE_SELECTORS).and_then(|t| parse_tase_number(&t)),
        timestamp_ms: None,
        instrument_type,
        name: first_text(&document, NAME_SELECTORS).and_then(|t| repair_display_name(&t)),
        agorot_normalized,
    })
}

#[async_trait]
impl QuoteProvider for TaseSecondaryProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn source(&self) -> QuoteSource {
        QuoteSource::TaseSecondary
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<ProviderQuote, CoreError> {
        let url = format!(
            "{}/quote/generalview/{}",
            self.base_url,
            urlencoding::encode(symbol)
        );
        let body = get_text(PROVIDER, symbol, self.client.get(&url)).await?;
        parse_quote_page(&body, symbol)
    }
}
