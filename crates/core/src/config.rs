use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::CoreError;

/// Environment variable prefix for [`EngineConfig::apply_env_overrides`].
pub const ENV_PREFIX: &str = "QUOTE_ENGINE_";

/// Upper bound on retries per upstream call.
pub const MAX_RETRIES_CAP: u32 = 2;

/// Base URLs of every upstream. Overridable so tests can point adapters at
/// a local mock server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub coingecko: String,
    pub yahoo: String,
    pub tase_primary: String,
    pub tase_secondary: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            coingecko: "https://api.coingecko.com/api/v3".to_string(),
            yahoo: "https://query1.finance.yahoo.com".to_string(),
            tase_primary: "https://api.tase.co.il".to_string(),
            tase_secondary: "https://www.bizportal.co.il".to_string(),
        }
    }
}

impl Endpoints {
    /// Every upstream at the same base URL (one mock server in tests).
    pub fn all(base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        Self {
            coingecko: base.clone(),
            yahoo: base.clone(),
            tase_primary: base.clone(),
            tase_secondary: base,
        }
    }
}

/// Engine configuration: cache lifetimes, upstream deadlines, batching
/// limits and endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub quote_ttl_secs: u64,
    pub history_ttl_secs: u64,
    /// TTL for `1d`/`5d` history, which moves during the trading day.
    pub intraday_history_ttl_secs: u64,
    /// Deadline of a single upstream attempt.
    pub request_timeout_ms: u64,
    /// Retries after the first attempt, transient failures only.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub yahoo_chunk_size: usize,
    pub coingecko_chunk_size: usize,
    /// Concurrent TASE waterfalls / chart fallbacks per batch.
    pub max_concurrency: usize,
    pub user_agent: String,
    pub endpoints: Endpoints,
    /// Optional API keys. Keys: provider name (e.g., "coingecko").
    pub api_keys: HashMap<String, String>,
    /// Extra TASE reference entries (JSON array) merged over the built-in table.
    pub tase_reference_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quote_ttl_secs: 60,
            history_ttl_secs: 3600,
            intraday_history_ttl_secs: 300,
            request_timeout_ms: 6000,
            max_retries: 1,
            retry_backoff_ms: 250,
            yahoo_chunk_size: 50,
            coingecko_chunk_size: 100,
            max_concurrency: 8,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
            endpoints: Endpoints::default(),
            api_keys: HashMap::new(),
            tase_reference_path: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, CoreError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CoreError::Config(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Apply `QUOTE_ENGINE_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), CoreError> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply overrides from `(name, value)` pairs; unknown names are ignored.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), CoreError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match key {
                "QUOTE_TTL_SECS" => self.quote_ttl_secs = parse_number(&name, &value)?,
                "HISTORY_TTL_SECS" => self.history_ttl_secs = parse_number(&name, &value)?,
                "INTRADAY_HISTORY_TTL_SECS" => {
                    self.intraday_history_ttl_secs = parse_number(&name, &value)?
                }
                "REQUEST_TIMEOUT_MS" => self.request_timeout_ms = parse_number(&name, &value)?,
                "MAX_RETRIES" => self.max_retries = parse_number(&name, &value)?,
                "YAHOO_CHUNK_SIZE" => self.yahoo_chunk_size = parse_number(&name, &value)?,
                "COINGECKO_CHUNK_SIZE" => {
                    self.coingecko_chunk_size = parse_number(&name, &value)?
                }
                "MAX_CONCURRENCY" => self.max_concurrency = parse_number(&name, &value)?,
                "COINGECKO_API_KEY" => {
                    self.api_keys.insert("coingecko".to_string(), value);
                }
                "TASE_REFERENCE_PATH" => self.tase_reference_path = Some(PathBuf::from(value)),
                _ => {}
            }
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.request_timeout_ms == 0 {
            return Err(CoreError::Config("request_timeout_ms must be > 0".into()));
        }
        if self.yahoo_chunk_size == 0 || self.coingecko_chunk_size == 0 {
            return Err(CoreError::Config("chunk sizes must be > 0".into()));
        }
        if self.max_concurrency == 0 {
            return Err(CoreError::Config("max_concurrency must be > 0".into()));
        }
        Ok(())
    }

    pub fn quote_ttl(&self) -> Duration {
        Duration::from_secs(self.quote_ttl_secs)
    }

    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history_ttl_secs)
    }

    pub fn intraday_history_ttl(&self) -> Duration {
        Duration::from_secs(self.intraday_history_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn effective_retries(&self) -> u32 {
        self.max_retries.min(MAX_RETRIES_CAP)
    }

    pub fn api_key(&self, provider: &str) -> Option<&str> {
        self.api_keys.get(provider).map(String::as_str)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, CoreError> {
    value
        .trim()
        .parse()
        .map_err(|_| CoreError::Config(format!("{name} must be a number, got '{value}'")))
}
