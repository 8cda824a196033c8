use serde::Serialize;
use thiserror::Error;

/// Unified error type for the entire quote-engine-core library.
///
/// Adapter failures are captured as values (inside `QuoteBatch` entries or
/// `QuoteFailure` records) rather than propagated across the batch boundary,
/// so the type is `Clone`: one in-flight upstream call can hand the same
/// outcome to every coalesced caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    // ── Input ───────────────────────────────────────────────────────
    #[error("Cannot resolve identifier: {0}")]
    Resolution(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    // ── Upstream / Network ──────────────────────────────────────────
    #[error("Timeout ({provider})")]
    Timeout { provider: String },

    #[error("Upstream HTTP error ({provider}): status {status}")]
    UpstreamHttp { provider: String, status: u16 },

    #[error("Upstream rejected credentials ({provider}): status {status}")]
    UpstreamAuth { provider: String, status: u16 },

    #[error("Not found ({provider}): {symbol}")]
    NotFound { provider: String, symbol: String },

    #[error("Parse error ({provider}): {message}")]
    Parse { provider: String, message: String },

    #[error("Network error: {0}")]
    Network(String),

    // ── Internal ────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse failure classes used for waterfall and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Input could not be mapped to a provider and symbol. Terminal.
    ResolutionFailure,
    /// Timeout, 429, 5xx or a dropped connection. Retried a bounded number of times.
    UpstreamTransientFailure,
    /// 401/403. Never retried, surfaced in logs.
    UpstreamAuthFailure,
    /// Symbol unknown to the provider. Advances the waterfall quietly.
    UpstreamNotFound,
    /// Response shape unexpected. Soft miss.
    ParseFailure,
    /// Bug or panic inside the engine.
    Internal,
}

impl CoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Resolution(_) | Self::InvalidRequest(_) | Self::Config(_) => {
                FailureKind::ResolutionFailure
            }
            Self::Timeout { .. } | Self::UpstreamHttp { .. } | Self::Network(_) => {
                FailureKind::UpstreamTransientFailure
            }
            Self::UpstreamAuth { .. } => FailureKind::UpstreamAuthFailure,
            Self::NotFound { .. } => FailureKind::UpstreamNotFound,
            Self::Parse { .. } => FailureKind::ParseFailure,
            Self::Internal(_) => FailureKind::Internal,
        }
    }

    pub fn not_found(provider: &str, symbol: &str) -> Self {
        Self::NotFound {
            provider: provider.to_string(),
            symbol: symbol.to_string(),
        }
    }

    pub fn parse(provider: &str, message: impl Into<String>) -> Self {
        Self::Parse {
            provider: provider.to_string(),
            message: message.into(),
        }
    }
}

impl FailureKind {
    /// Only transient upstream failures are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::UpstreamTransientFailure)
    }
}

// ── Conversion helpers (From impls) ─────────────────────────────────

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Parse {
            provider: "json".into(),
            message: e.to_string(),
        }
    }
}

/// Strip query parameters from URLs embedded in an error message, so API
/// keys passed as parameters never end up in logs or response bodies.
pub(crate) fn redact_query(msg: &str) -> String {
    match msg.find('?') {
        Some(idx) => format!("{}?<query redacted>", &msg[..idx]),
        None => msg.to_string(),
    }
}
