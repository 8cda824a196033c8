use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::errors::CoreError;
use crate::models::asset::InstrumentType;
use crate::models::quote::{ProviderQuote, QuoteSource};
use super::http::{build_client, get_text};
use super::tase_text::{parse_tase_number, repair_display_name};
use super::traits::QuoteProvider;

const PROVIDER: &str = "TASE";
const REFERER: &str = "https://market.tase.co.il/";

/// Primary TASE scrape source: the exchange site's "major data" JSON feed.
///
/// - **Free**: No API key; requires a browser user agent and referer.
/// - **Units**: securities trade in Agorot, so prices are tagged `ILA`.
///   Index rows carry point values and no currency.
/// - **Robustness**: numbers arrive as numbers or formatted strings; any
///   shape problem is a soft miss so the waterfall moves on.
pub struct TasePrimaryProvider {
    client: Client,
    base_url: String,
}

impl TasePrimaryProvider {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            client: build_client(config.request_timeout(), &config.user_agent),
            base_url: config.endpoints.tase_primary.trim_end_matches('/').to_string(),
        }
    }
}

/// Numeric field that may be a JSON number or a formatted string.
fn number_field(data: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| match data.get(*key)? {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => parse_tase_number(s),
        _ => None,
    })
}

fn text_field<'a>(data: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| data.get(*key)?.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Turn a major-data payload into a raw quote for `security_number`.
pub(crate) fn parse_major_data(body: &str, security_number: &str) -> Result<ProviderQuote, CoreError> {
    let data: Value = serde_json::from_str(body)
        .map_err(|e| CoreError::parse(PROVIDER, format!("not JSON: {e}")))?;
    // the feed wraps the row in an array for some security types
    let data = match &data {
        Value::Array(rows) => rows
            .first()
            .ok_or_else(|| CoreError::not_found(PROVIDER, security_number))?,
        Value::Object(_) => &data,
        _ => return Err(CoreError::parse(PROVIDER, "unexpected payload")),
    };

    let price = number_field(data, &["LastRate", "lastRate", "LastPrice"])
        .filter(|p| *p > 0.0)
        .ok_or_else(|| CoreError::not_found(PROVIDER, security_number))?;

    let is_index = data.get("IsIndex").and_then(Value::as_bool).unwrap_or(false);
    let instrument_type = if is_index {
        InstrumentType::Index
    } else {
        text_field(data, &["Type", "SecurityType"])
            .map(InstrumentType::from_provider_label)
            .unwrap_or(InstrumentType::Unknown)
    };

    Ok(ProviderQuote {
        symbol: security_number.to_string(),
        price: Some(price),
        currency: (instrument_type != InstrumentType::Index).then(|| "ILA".to_string()),
        previous_close: number_field(data, &["BaseRate", "baseRate"]),
        change_pct: number_field(data, &["Change", "ChangePercent"]),
        timestamp_ms: None,
        instrument_type,
        name: text_field(data, &["SecurityLongName", "LongName", "Name"])
            .and_then(repair_display_name),
        agorot_normalized: false,
    })
}

#[async_trait]
impl QuoteProvider for TasePrimaryProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn source(&self) -> QuoteSource {
        QuoteSource::TasePrimary
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<ProviderQuote, CoreError> {
        let url = format!(
            "{}/api/security/majordata?securityId={}&lang=1",
            self.base_url,
            urlencoding::encode(symbol)
        );
        let request = self
            .client
            .get(&url)
            .header("referer", REFERER)
            .header("accept", "application/json");

        let body = get_text(PROVIDER, symbol, request).await?;
        parse_major_data(&body, symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_and_number_fields() {
        let body = r#"{"SecurityLongName":"בנק הפועלים בע''מ","LastRate":"3,512.00","BaseRate":3490,"Change":"0.63","Type":"מניות"}"#;
        let quote = parse_major_data(body, "662577").unwrap();
        assert_eq!(quote.price, Some(3512.0));
        assert_eq!(quote.previous_close, Some(3490.0));
        assert_eq!(quote.change_pct, Some(0.63));
        assert_eq!(quote.currency.as_deref(), Some("ILA"));
        assert_eq!(quote.name.as_deref(), Some("בנק הפועלים בע\"מ"));
    }

    #[test]
    fn index_rows_have_no_currency() {
        let body = r#"[{"Name":"ת\"א 35","LastRate":2101.5,"IsIndex":true}]"#;
        let quote = parse_major_data(body, "142").unwrap();
        assert_eq!(quote.instrument_type, InstrumentType::Index);
        assert_eq!(quote.currency, None);
    }

    #[test]
    fn html_block_page_is_parse_failure() {
        let err = parse_major_data("<html>Access denied</html>", "662577").unwrap_err();
        assert!(matches!(err, CoreError::Parse { .. }));
    }

    #[test]
    fn missing_rate_is_not_found() {
        let err = parse_major_data(r#"{"Name":"x","LastRate":0}"#, "1").unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }
}
