use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;

use crate::errors::{redact_query, CoreError};

/// Shared HTTP client setup for all adapters: per-request deadline and a
/// browser-like user agent (Yahoo and the TASE sites reject bare clients).
pub fn build_client(timeout: Duration, user_agent: &str) -> Client {
    Client::builder()
        .timeout(timeout)
        .user_agent(user_agent)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Map a non-success HTTP status onto the failure taxonomy.
///
/// 401/403 mean blocked credentials or IP and are surfaced; 429 and 5xx are
/// transient; 404 and anything else is a soft miss for this symbol.
pub fn classify_status(provider: &str, status: StatusCode, symbol: &str) -> CoreError {
    match status.as_u16() {
        401 | 403 => CoreError::UpstreamAuth {
            provider: provider.to_string(),
            status: status.as_u16(),
        },
        429 | 500..=599 => CoreError::UpstreamHttp {
            provider: provider.to_string(),
            status: status.as_u16(),
        },
        _ => CoreError::not_found(provider, symbol),
    }
}

/// Attribute a transport error to `provider`.
pub fn transport_error(provider: &str, e: reqwest::Error) -> CoreError {
    if e.is_timeout() {
        CoreError::Timeout {
            provider: provider.to_string(),
        }
    } else if e.is_decode() {
        CoreError::parse(provider, redact_query(&e.to_string()))
    } else {
        CoreError::Network(format!("{provider}: {}", redact_query(&e.to_string())))
    }
}

/// Send a request and reject non-success statuses.
pub async fn send_checked(
    provider: &str,
    symbol: &str,
    request: RequestBuilder,
) -> Result<Response, CoreError> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(provider, e))?;
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(classify_status(provider, status, symbol))
    }
}

/// Send a request and read the body as text.
pub async fn get_text(
    provider: &str,
    symbol: &str,
    request: RequestBuilder,
) -> Result<String, CoreError> {
    send_checked(provider, symbol, request)
        .await?
        .text()
        .await
        .map_err(|e| transport_error(provider, e))
}

/// Parse a JSON body, attributing shape problems to `provider`.
pub fn parse_json<T: serde::de::DeserializeOwned>(provider: &str, body: &str) -> Result<T, CoreError> {
    serde_json::from_str(body)
        .map_err(|e| CoreError::parse(provider, format!("unexpected response shape: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;

    #[test]
    fn auth_statuses_are_surfaced() {
        for code in [401, 403] {
            let err = classify_status("Yahoo", StatusCode::from_u16(code).unwrap(), "AAPL");
            assert_eq!(err.kind(), FailureKind::UpstreamAuthFailure);
        }
    }

    #[test]
    fn server_errors_and_throttling_are_transient() {
        for code in [429, 500, 502, 503] {
            let err = classify_status("Yahoo", StatusCode::from_u16(code).unwrap(), "AAPL");
            assert!(err.kind().is_retryable(), "status {code}");
        }
    }

    #[test]
    fn not_found_and_other_client_errors_are_soft_misses() {
        for code in [400, 404, 410] {
            let err = classify_status("Yahoo", StatusCode::from_u16(code).unwrap(), "AAPL");
            assert_eq!(err.kind(), FailureKind::UpstreamNotFound, "status {code}");
        }
    }
}
