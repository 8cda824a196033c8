//! Request/response contracts of the quote and history operations.
//!
//! Transport-neutral: callers hand over decoded query parameters and get a
//! status code plus a JSON body back. Partial failures are always `200`;
//! only a request without any identifier is rejected with `400`.

use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use tracing::warn;

use crate::errors::CoreError;
use crate::models::history::{HistoryRange, HistoryResult, Interval};
use crate::models::quote::QuoteResult;
use crate::services::batch_service::BatchService;
use crate::services::history_service::HistoryService;
use crate::services::resolver::resolve_str;

/// Range used when a history request does not name one.
pub const DEFAULT_HISTORY_RANGE: HistoryRange = HistoryRange::OneMonth;

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            body: json!({ "error": message.into() }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Identifiers from repeated `ids`/`id` parameters, each possibly
/// comma-separated. Trimmed, empties dropped, first occurrence kept.
pub fn parse_ids<K, V>(params: &[(K, V)]) -> Vec<String>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut ids: Vec<String> = Vec::new();
    for (name, value) in params {
        if !matches!(name.as_ref(), "ids" | "id") {
            continue;
        }
        for part in value.as_ref().split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if !ids.iter().any(|existing| existing == part) {
                ids.push(part.to_string());
            }
        }
    }
    ids
}

fn param<'a, K, V>(params: &'a [(K, V)], name: &str) -> Option<&'a str>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    params
        .iter()
        .find(|(k, _)| k.as_ref() == name)
        .map(|(_, v)| v.as_ref().trim())
        .filter(|v| !v.is_empty())
}

/// Parsed history request.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRequest {
    pub id: String,
    pub range: HistoryRange,
    pub interval: Option<Interval>,
}

impl HistoryRequest {
    /// `id` is required; `range` defaults to one month; `interval` is
    /// validated when present.
    pub fn from_params<K, V>(params: &[(K, V)]) -> Result<Self, CoreError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let id = parse_ids(params)
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::InvalidRequest("missing 'id' parameter".into()))?;
        let range = param(params, "range")
            .map(str::parse::<HistoryRange>)
            .transpose()?
            .unwrap_or(DEFAULT_HISTORY_RANGE);
        let interval = param(params, "interval")
            .map(str::parse::<Interval>)
            .transpose()?;
        Ok(Self { id, range, interval })
    }
}

/// Quote batch operation: one record per requested id.
pub async fn quote_response<K, V>(batch: &BatchService, params: &[(K, V)]) -> ApiResponse
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let ids = parse_ids(params);
    if ids.is_empty() {
        return ApiResponse::bad_request("no ids supplied; use ?ids=a,b or repeated ?id=");
    }

    match AssertUnwindSafe(batch.fetch_batch(&ids)).catch_unwind().await {
        Ok(results) => ApiResponse::ok(to_json(&results, &ids)),
        Err(_) => {
            warn!(ids = ids.len(), "quote batch panicked, answering with per-id errors");
            let err = CoreError::Internal("unexpected failure while quoting".into());
            let results: Vec<QuoteResult> = ids.iter().map(|id| QuoteResult::failure(id.as_str(), &err)).collect();
            ApiResponse::ok(to_json(&results, &ids))
        }
    }
}

/// History operation: a series, or `{id, error}` with status 200.
pub async fn history_response<K, V>(history: &HistoryService, params: &[(K, V)]) -> ApiResponse
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let request = match HistoryRequest::from_params(params) {
        Ok(request) => request,
        Err(err) => return ApiResponse::bad_request(err.to_string()),
    };

    let Some(resolved) = resolve_str(&request.id) else {
        let err = CoreError::Resolution(format!("cannot resolve '{}'", request.id));
        return ApiResponse::ok(to_json(&HistoryResult::failure(request.id.as_str(), &err), &[]));
    };

    let fetch = history.fetch_history(&resolved, request.range, request.interval.clone());
    let result = match AssertUnwindSafe(fetch).catch_unwind().await {
        Ok(HistoryResult::Ok(mut series)) => {
            series.id = request.id.clone();
            HistoryResult::Ok(series)
        }
        Ok(HistoryResult::Err(mut failure)) => {
            failure.id = request.id.clone();
            HistoryResult::Err(failure)
        }
        Err(_) => {
            warn!(id = %request.id, "history request panicked");
            HistoryResult::failure(
                request.id.as_str(),
                &CoreError::Internal("unexpected failure while fetching history".into()),
            )
        }
    };
    ApiResponse::ok(to_json(&result, &[]))
}

fn to_json<T: Serialize>(value: &T, ids: &[String]) -> Value {
    serde_json::to_value(value).unwrap_or_else(|err| {
        warn!(error = %err, "response serialization failed");
        Value::Array(
            ids.iter()
                .map(|id| json!({ "id": id, "error": "internal error" }))
                .collect(),
        )
    })
}
