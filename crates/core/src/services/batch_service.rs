use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::CoreError;
use crate::models::internal_id::{InternalId, ProviderTag};
use crate::models::quote::QuoteResult;
use super::quote_service::QuoteService;
use super::resolver::resolve_str;
use super::upstream::contain_panic;

/// Turns a list of loose identifiers into one record per input.
///
/// Inputs are resolved, split by provider and fetched as three concurrent
/// groups. A failure anywhere stays confined to the ids it concerns: each
/// TASE waterfall has its own panic boundary, and a panic that still escapes
/// a group degrades that group to per-id `Internal` errors.
pub struct BatchService {
    quotes: Arc<QuoteService>,
    max_concurrency: usize,
}

impl BatchService {
    pub fn new(quotes: Arc<QuoteService>, max_concurrency: usize) -> Self {
        Self {
            quotes,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Quote every input. The output has exactly one record per input, in
    /// input order; duplicate inputs share one fetch.
    pub async fn fetch_batch(&self, inputs: &[String]) -> Vec<QuoteResult> {
        let resolutions: Vec<(&str, Result<InternalId, CoreError>)> = inputs
            .iter()
            .map(|input| {
                let requested = input.trim();
                let resolved = if requested.is_empty() {
                    Err(CoreError::Resolution("empty identifier".into()))
                } else {
                    resolve_str(requested)
                        .ok_or_else(|| CoreError::Resolution(format!("cannot resolve '{requested}'")))
                };
                (requested, resolved)
            })
            .collect();

        let mut crypto = Vec::new();
        let mut global = Vec::new();
        let mut tase = Vec::new();
        for id in resolutions.iter().filter_map(|(_, r)| r.as_ref().ok()) {
            let group = match id.provider {
                ProviderTag::CoinGecko => &mut crypto,
                ProviderTag::Yahoo => &mut global,
                ProviderTag::Tase => &mut tase,
            };
            if !group.contains(id) {
                group.push(id.clone());
            }
        }

        let (crypto_results, global_results, tase_results) = tokio::join!(
            isolated("crypto", &crypto, self.quotes.quote_crypto(&crypto)),
            isolated("global", &global, self.quotes.quote_global(&global)),
            isolated("tase", &tase, self.quote_tase_group(&tase)),
        );

        let merged: HashMap<InternalId, QuoteResult> = crypto_results
            .into_iter()
            .chain(global_results)
            .chain(tase_results)
            .collect();

        let results: Vec<QuoteResult> = resolutions
            .into_iter()
            .map(|(requested, resolved)| match resolved {
                Ok(id) => match merged.get(&id) {
                    Some(result) => result.clone().for_request(requested, &id),
                    None => QuoteResult::failure(
                        requested,
                        &CoreError::Internal(format!("no result produced for {id}")),
                    ),
                },
                Err(err) => QuoteResult::failure(requested, &err),
            })
            .collect();

        let ok = results.iter().filter(|r| r.is_ok()).count();
        info!(
            requested = inputs.len(),
            crypto = crypto.len(),
            global = global.len(),
            tase = tase.len(),
            ok,
            failed = results.len() - ok,
            "batch quote complete"
        );
        results
    }

    /// TASE waterfalls are sequential per id, so run several ids at once,
    /// bounded by `max_concurrency`. A panic fails only its own id.
    async fn quote_tase_group(&self, ids: &[InternalId]) -> Vec<(InternalId, QuoteResult)> {
        stream::iter(ids.iter().cloned())
            .map(|id| async move {
                let label = format!("TASE waterfall for {id}");
                let result = contain_panic(&label, self.quotes.quote_tase(&id))
                    .await
                    .unwrap_or_else(|err| QuoteResult::failure(id.to_string(), &err));
                (id, result)
            })
            .buffered(self.max_concurrency)
            .collect()
            .await
    }
}

/// Await one provider group; a panic inside it fails only that group's ids.
async fn isolated<F>(group: &str, ids: &[InternalId], fut: F) -> Vec<(InternalId, QuoteResult)>
where
    F: Future<Output = Vec<(InternalId, QuoteResult)>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(results) => results,
        Err(_) => {
            warn!(group, ids = ids.len(), "provider group panicked");
            let err = CoreError::Internal(format!("{group} provider group failed unexpectedly"));
            ids.iter()
                .map(|id| (id.clone(), QuoteResult::failure(id.to_string(), &err)))
                .collect()
        }
    }
}
