use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::errors::CoreError;

/// Deadline and retry budget applied to every upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamPolicy {
    /// Deadline of one attempt, independent of sibling calls.
    pub timeout: Duration,
    /// Retries after the first attempt (0-2).
    pub max_retries: u32,
    /// Linear backoff step between attempts.
    pub backoff: Duration,
}

impl UpstreamPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            timeout: config.request_timeout(),
            max_retries: config.effective_retries(),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

impl Default for UpstreamPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Run `call` under the policy: each attempt gets its own deadline; only
/// transient failures are retried; everything else returns at once.
pub async fn call_with_retry<T, F, Fut>(
    provider: &str,
    policy: UpstreamPolicy,
    mut call: F,
) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Timeout {
                provider: provider.to_string(),
            }),
        };

        match result {
            Err(err) if err.kind().is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                debug!(provider, attempt, error = %err, "retrying upstream call");
                tokio::time::sleep(policy.backoff * attempt).await;
            }
            other => return other,
        }
    }
}

/// Await `fut`; a panic inside it becomes an `Internal` error naming `what`
/// instead of unwinding into sibling work.
pub async fn contain_panic<T, F>(what: &str, fut: F) -> Result<T, CoreError>
where
    F: Future<Output = T>,
{
    AssertUnwindSafe(fut).catch_unwind().await.map_err(|_| {
        warn!(call = what, "upstream work panicked");
        CoreError::Internal(format!("{what} failed unexpectedly"))
    })
}
