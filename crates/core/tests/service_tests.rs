// ═══════════════════════════════════════════════════════════════════
// Service Tests — resolver, normalizer, cache/coalescer, fallback
// orchestrator, batch merge, history, FX (mock providers, no network)
// ═══════════════════════════════════════════════════════════════════

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quote_engine_core::cache::{cache_key, RequestCoalescer, TtlCache};
use quote_engine_core::config::EngineConfig;
use quote_engine_core::errors::{CoreError, FailureKind};
use quote_engine_core::models::asset::{AssetRecord, InstrumentType};
use quote_engine_core::models::history::{
    HistoryPoint, HistoryRange, HistoryResult, Interval, ProviderHistory,
};
use quote_engine_core::models::internal_id::InternalId;
use quote_engine_core::models::quote::{ProviderQuote, QuoteBatch, QuoteSource};
use quote_engine_core::providers::registry::{ProviderRegistry, ProviderRole};
use quote_engine_core::providers::tase_reference::TaseReference;
use quote_engine_core::providers::traits::QuoteProvider;
use quote_engine_core::services::normalizer::{normalize, normalize_series, PriceInput};
use quote_engine_core::services::resolver::{
    migrate_legacy, resolve, resolve_record, resolve_record_with_rule, resolve_str, ResolveInput,
};
use quote_engine_core::QuoteEngine;

// ═══════════════════════════════════════════════════════════════════
// Mock Provider
// ═══════════════════════════════════════════════════════════════════

/// Scripted adapter: answers from fixed tables and counts upstream calls.
struct MockProvider {
    name: &'static str,
    source: QuoteSource,
    batch_size: usize,
    quotes: HashMap<String, Result<ProviderQuote, CoreError>>,
    history: HashMap<String, ProviderHistory>,
    /// Whole-call failure returned for the first `n` calls.
    fail_first: Option<(usize, CoreError)>,
    delay: Option<Duration>,
    panics: bool,
    /// Panic only when this symbol is requested.
    panic_on: Option<&'static str>,
    calls: AtomicUsize,
}

impl MockProvider {
    fn new(name: &'static str, source: QuoteSource) -> Self {
        Self {
            name,
            source,
            batch_size: 1,
            quotes: HashMap::new(),
            history: HashMap::new(),
            fail_first: None,
            delay: None,
            panics: false,
            panic_on: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn batch(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    fn with_quote(mut self, symbol: &str, price: f64, currency: Option<&str>) -> Self {
        let quote = ProviderQuote {
            symbol: symbol.into(),
            price: Some(price),
            currency: currency.map(str::to_string),
            timestamp_ms: Some(1_700_000_000_000),
            ..ProviderQuote::default()
        };
        self.quotes.insert(symbol.into(), Ok(quote));
        self
    }

    fn with_raw_quote(mut self, quote: ProviderQuote) -> Self {
        self.quotes.insert(quote.symbol.clone(), Ok(quote));
        self
    }

    fn with_error(mut self, symbol: &str, err: CoreError) -> Self {
        self.quotes.insert(symbol.into(), Err(err));
        self
    }

    fn with_history(mut self, symbol: &str, points: &[(i64, f64)], currency: &str) -> Self {
        self.history.insert(
            symbol.into(),
            ProviderHistory {
                symbol: symbol.into(),
                points: points
                    .iter()
                    .map(|&(t, v)| HistoryPoint {
                        timestamp_ms: t,
                        value: v,
                    })
                    .collect(),
                currency: Some(currency.into()),
                instrument_type: InstrumentType::Unknown,
            },
        );
        self
    }

    fn failing_first(mut self, n: usize, err: CoreError) -> Self {
        self.fail_first = Some((n, err));
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    fn panicking_on(mut self, symbol: &'static str) -> Self {
        self.panic_on = Some(symbol);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Shared preamble of every upstream call.
    async fn enter(&self) -> Result<(), CoreError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panics {
            panic!("{} exploded", self.name);
        }
        match &self.fail_first {
            Some((limit, err)) if n < *limit => Err(err.clone()),
            _ => Ok(()),
        }
    }

    fn lookup(&self, symbol: &str) -> Result<ProviderQuote, CoreError> {
        if self.panic_on == Some(symbol) {
            panic!("{} exploded on {symbol}", self.name);
        }
        self.quotes
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Err(CoreError::not_found(self.name, symbol)))
    }
}

#[async_trait]
impl QuoteProvider for MockProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn source(&self) -> QuoteSource {
        self.source
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<ProviderQuote, CoreError> {
        self.enter().await?;
        self.lookup(symbol)
    }

    async fn fetch_quotes(&self, symbols: &[String]) -> Result<QuoteBatch, CoreError> {
        self.enter().await?;
        Ok(symbols.iter().map(|s| (s.clone(), self.lookup(s))).collect())
    }

    async fn fetch_history(
        &self,
        symbol: &str,
        _range: HistoryRange,
        _interval: &Interval,
    ) -> Result<ProviderHistory, CoreError> {
        self.enter().await?;
        self.history
            .get(symbol)
            .cloned()
            .ok_or_else(|| CoreError::not_found(self.name, symbol))
    }
}

/// Every mock in a standard topology, kept so tests can count calls.
struct Mocks {
    crypto: Arc<MockProvider>,
    yahoo: Arc<MockProvider>,
    chart: Arc<MockProvider>,
    tase_primary: Arc<MockProvider>,
    tase_secondary: Arc<MockProvider>,
}

impl Mocks {
    fn standard() -> Self {
        Self::with(
            MockProvider::new("Mock CoinGecko", QuoteSource::CoinGecko)
                .batch(100)
                .with_quote("bitcoin", 64_000.0, Some("USD"))
                .with_quote("ethereum", 3_100.0, Some("USD")),
            MockProvider::new("Mock Yahoo", QuoteSource::Yahoo)
                .batch(50)
                .with_quote("AAPL", 189.5, Some("USD"))
                .with_quote("1183441.TA", 52_341.0, Some("ILA"))
                .with_quote("ILS=X", 3.7, Some("ILS")),
            MockProvider::new("Mock Yahoo Chart", QuoteSource::YahooChart),
            MockProvider::new("Mock TASE", QuoteSource::TasePrimary),
            MockProvider::new("Mock TASE secondary", QuoteSource::TaseSecondary),
        )
    }

    fn with(
        crypto: MockProvider,
        yahoo: MockProvider,
        chart: MockProvider,
        tase_primary: MockProvider,
        tase_secondary: MockProvider,
    ) -> Self {
        Self {
            crypto: Arc::new(crypto),
            yahoo: Arc::new(yahoo),
            chart: Arc::new(chart),
            tase_primary: Arc::new(tase_primary),
            tase_secondary: Arc::new(tase_secondary),
        }
    }

    fn registry(&self) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new(TaseReference::builtin());
        registry.register(ProviderRole::Crypto, self.crypto.clone());
        registry.register(ProviderRole::Global, self.yahoo.clone());
        registry.register(ProviderRole::Global, self.chart.clone());
        registry.register(ProviderRole::TaseScrape, self.tase_primary.clone());
        registry.register(ProviderRole::TaseScrape, self.tase_secondary.clone());
        registry
    }

    fn engine(&self) -> QuoteEngine {
        QuoteEngine::with_registry(test_config(), self.registry())
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        max_retries: 0,
        retry_backoff_ms: 1,
        request_timeout_ms: 1_000,
        ..EngineConfig::default()
    }
}

fn ids(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}

// ═══════════════════════════════════════════════════════════════════
// Resolver — strings
// ═══════════════════════════════════════════════════════════════════

mod resolver_strings {
    use super::*;

    #[test]
    fn bare_ticker_is_yahoo() {
        assert_eq!(resolve_str("AAPL"), Some(InternalId::yahoo("AAPL")));
        assert_eq!(resolve_str(" ^GSPC "), Some(InternalId::yahoo("^GSPC")));
    }

    #[test]
    fn numeric_is_tase() {
        assert_eq!(resolve_str("1183441"), Some(InternalId::tase("1183441")));
        assert_eq!(resolve_str("1183441.TA"), Some(InternalId::tase("1183441")));
    }

    #[test]
    fn canonical_ids_pass_through() {
        for raw in ["cg:bitcoin", "yahoo:AAPL", "tase:662577", "yahoo:TEVA.TA"] {
            assert_eq!(resolve_str(raw).unwrap().to_string(), raw);
        }
    }

    #[test]
    fn legacy_forms_migrate() {
        let tase = InternalId::tase("1183441");
        assert_eq!(resolve_str("yahoo:1183441"), Some(tase.clone()));
        assert_eq!(resolve_str("yahoo:1183441.TA"), Some(tase.clone()));
        assert_eq!(resolve_str("tase:1183441.TA"), Some(tase));
        assert_eq!(resolve_str("coingecko:bitcoin"), Some(InternalId::coingecko("bitcoin")));
    }

    #[test]
    fn migration_leaves_canonical_and_non_legacy_alone() {
        assert_eq!(migrate_legacy("yahoo:AAPL"), None);
        assert_eq!(migrate_legacy("tase:1183441"), None);
        assert_eq!(migrate_legacy("cg:bitcoin"), None);
    }

    #[test]
    fn resolution_is_idempotent() {
        for raw in [
            "AAPL",
            "1183441",
            "1183441.TA",
            "yahoo:1183441",
            "tase:1183441.TA",
            "coingecko:ethereum",
            "cg:bitcoin",
            "yahoo:^TA125.TA",
        ] {
            let once = resolve_str(raw).unwrap();
            let twice = resolve_str(&once.to_string()).unwrap();
            assert_eq!(once, twice, "{raw}");
        }
    }

    #[test]
    fn empty_input_is_unresolvable() {
        assert_eq!(resolve_str(""), None);
        assert_eq!(resolve_str("   "), None);
        assert_eq!(resolve(ResolveInput::Raw("")), None);
    }

    #[test]
    fn known_prefix_with_empty_symbol_is_unresolvable() {
        for raw in ["yahoo:", "cg:", "tase:", "coingecko:", " yahoo:  "] {
            assert_eq!(resolve_str(raw), None, "{raw}");
        }
    }

    #[test]
    fn tase_prefix_requires_a_security_number() {
        assert_eq!(resolve_str("tase:TEVA"), None);
        assert_eq!(resolve_str("TASE:teva.ta"), None);
        assert_eq!(resolve_str("tase:1183441"), Some(InternalId::tase("1183441")));
    }

    #[tokio::test]
    async fn malformed_tase_id_is_a_resolution_error_record() {
        let engine = Mocks::standard().engine();
        let results = engine.fetch_batch(&ids(&["tase:TEVA", "yahoo:"])).await;
        for (slot, raw) in results.iter().zip(["tase:TEVA", "yahoo:"]) {
            let failure = slot.error().unwrap();
            assert_eq!(failure.id, raw);
            assert_eq!(failure.kind, FailureKind::ResolutionFailure);
        }
    }

    #[test]
    fn unknown_prefix_falls_back_to_yahoo_symbol() {
        assert_eq!(resolve_str("foo:bar"), Some(InternalId::yahoo("foo:bar")));
    }
}

// ═══════════════════════════════════════════════════════════════════
// Resolver — asset records
// ═══════════════════════════════════════════════════════════════════

mod resolver_records {
    use super::*;

    fn record() -> AssetRecord {
        AssetRecord::default()
    }

    #[test]
    fn explicit_id_wins_over_everything() {
        let r = AssetRecord {
            internal_id: Some("tase:662577".into()),
            symbol: Some("BTC".into()),
            asset_type: Some("crypto".into()),
            ..record()
        };
        assert_eq!(
            resolve_record_with_rule(&r),
            Some(("explicit-id", InternalId::tase("662577")))
        );
    }

    #[test]
    fn explicit_legacy_id_is_migrated() {
        let r = AssetRecord {
            internal_id: Some("yahoo:1183441".into()),
            ..record()
        };
        assert_eq!(resolve_record(&r), Some(InternalId::tase("1183441")));
    }

    #[test]
    fn crypto_flags_map_tickers_to_slugs() {
        let by_type = AssetRecord {
            symbol: Some("BTC".into()),
            asset_type: Some("Crypto".into()),
            ..record()
        };
        assert_eq!(resolve_record(&by_type), Some(InternalId::coingecko("bitcoin")));

        let by_category = AssetRecord {
            ticker: Some("ETH-USD".into()),
            category: Some("cryptocurrency".into()),
            ..record()
        };
        assert_eq!(resolve_record(&by_category), Some(InternalId::coingecko("ethereum")));

        let by_source = AssetRecord {
            symbol: Some("FOOCOIN".into()),
            data_source: Some("coingecko".into()),
            ..record()
        };
        assert_eq!(resolve_record(&by_source), Some(InternalId::coingecko("foocoin")));
    }

    #[test]
    fn tase_prefers_security_number() {
        let r = AssetRecord {
            security_number: Some("1183441".into()),
            symbol: Some("KSM".into()),
            exchange: Some("TASE".into()),
            ..record()
        };
        assert_eq!(
            resolve_record_with_rule(&r),
            Some(("tase", InternalId::tase("1183441")))
        );
    }

    #[test]
    fn numeric_shekel_symbol_is_tase() {
        let r = AssetRecord {
            symbol: Some("629014".into()),
            currency: Some("ILS".into()),
            ..record()
        };
        assert_eq!(resolve_record(&r), Some(InternalId::tase("629014")));
    }

    #[test]
    fn tase_flag_without_number_falls_through_to_default() {
        let r = AssetRecord {
            symbol: Some("TEVA.TA".into()),
            exchange: Some("TASE".into()),
            ..record()
        };
        assert_eq!(
            resolve_record_with_rule(&r),
            Some(("default-yahoo", InternalId::yahoo("TEVA.TA")))
        );
    }

    #[test]
    fn plain_symbol_defaults_to_yahoo() {
        assert_eq!(
            resolve(ResolveInput::Record(&AssetRecord::with_symbol("MSFT"))),
            Some(InternalId::yahoo("MSFT"))
        );
    }

    #[test]
    fn empty_record_is_unresolvable() {
        assert_eq!(resolve_record(&record()), None);
    }
}

// ═══════════════════════════════════════════════════════════════════
// Normalizer
// ═══════════════════════════════════════════════════════════════════

mod normalizer {
    use super::*;

    #[test]
    fn agorot_are_divided_into_shekels() {
        let out = normalize(&PriceInput::new(52_341.0, Some("ILA"), "1183441.TA", InstrumentType::Etf));
        assert_close(out.price, 523.41);
        assert_eq!(out.currency, "ILS");
    }

    #[test]
    fn indices_are_never_divided() {
        let caret = normalize(&PriceInput::new(2_101.5, Some("ILA"), "^TA125.TA", InstrumentType::Unknown));
        assert_close(caret.price, 2_101.5);
        assert_eq!(caret.currency, "ILS");

        let typed = normalize(&PriceInput::new(2_101.5, Some("ILA"), "TA35.TA", InstrumentType::Index));
        assert_close(typed.price, 2_101.5);
    }

    #[test]
    fn explicit_shekels_are_never_divided_even_above_threshold() {
        let out = normalize(&PriceInput::new(812.0, Some("ILS"), "POLI.TA", InstrumentType::Equity));
        assert_close(out.price, 812.0);
    }

    #[test]
    fn heuristic_applies_only_without_metadata() {
        let high = normalize(&PriceInput::new(3_512.0, None, "POLI.TA", InstrumentType::Unknown));
        assert_close(high.price, 35.12);
        assert_eq!(high.currency, "ILS");

        let low = normalize(&PriceInput::new(142.3, None, "5100.TA", InstrumentType::Unknown));
        assert_close(low.price, 142.3);
    }

    #[test]
    fn already_normalized_prices_are_not_divided_twice() {
        let mut input = PriceInput::new(3_512.0, None, "POLI.TA", InstrumentType::Unknown);
        input.agorot_normalized = true;
        assert_close(normalize(&input).price, 3_512.0);
    }

    #[test]
    fn non_tase_prices_untouched() {
        let out = normalize(&PriceInput::new(189.5, Some("usd"), "AAPL", InstrumentType::Equity));
        assert_close(out.price, 189.5);
        assert_eq!(out.currency, "USD");

        let missing = normalize(&PriceInput::new(189.5, None, "AAPL", InstrumentType::Equity));
        assert_eq!(missing.currency, "USD");
    }

    #[test]
    fn change_is_derived_in_consistent_units() {
        let mut input = PriceInput::new(52_341.0, Some("ILA"), "1183441.TA", InstrumentType::Etf);
        input.previous_close = Some(52_000.0);
        let out = normalize(&input);
        assert_close(out.change_pct, (523.41 - 520.0) / 520.0 * 100.0);
    }

    #[test]
    fn reported_change_wins() {
        let mut input = PriceInput::new(100.0, Some("USD"), "AAPL", InstrumentType::Equity);
        input.previous_close = Some(50.0);
        input.change_pct = Some(1.5);
        assert_close(normalize(&input).change_pct, 1.5);
    }

    #[test]
    fn series_use_one_divisor() {
        let points = [
            HistoryPoint { timestamp_ms: 1, value: 52_000.0 },
            HistoryPoint { timestamp_ms: 2, value: 52_341.0 },
        ];
        let (out, currency) = normalize_series(&points, Some("ILA"), "1183441.TA", InstrumentType::Etf);
        assert_eq!(currency, "ILS");
        assert_close(out[0].value, 520.0);
        assert_close(out[1].value, 523.41);
    }
}

// ═══════════════════════════════════════════════════════════════════
// Cache & coalescer
// ═══════════════════════════════════════════════════════════════════

mod cache {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache: TtlCache<u32> = TtlCache::new();
        cache.insert("k", 7, Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some(7));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_calls_hit_upstream_once() {
        let coalescer: Arc<RequestCoalescer<u32>> = Arc::new(RequestCoalescer::new());
        let upstream = Arc::new(AtomicUsize::new(0));

        let calls = (0..10).map(|_| {
            let coalescer = Arc::clone(&coalescer);
            let upstream = Arc::clone(&upstream);
            async move {
                coalescer
                    .coalesce("yahoo:quote|AAPL", Duration::from_secs(60), async move {
                        upstream.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| *r == Ok(42)));
        assert_eq!(upstream.load(Ordering::SeqCst), 1);
        let stats = coalescer.stats();
        assert_eq!(stats.upstream_calls, 1);
        assert_eq!(stats.joined, 9);
        assert_eq!(coalescer.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn failures_are_shared_but_not_cached() {
        let coalescer: RequestCoalescer<u32> = RequestCoalescer::new();
        let err = CoreError::UpstreamHttp {
            provider: "p".into(),
            status: 503,
        };

        let first = coalescer
            .coalesce("k", Duration::from_secs(60), {
                let err = err.clone();
                async move { Err(err) }
            })
            .await;
        assert_eq!(first, Err(err));

        let second = coalescer
            .coalesce("k", Duration::from_secs(60), async { Ok(1) })
            .await;
        assert_eq!(second, Ok(1));
        assert_eq!(coalescer.stats().upstream_calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn successes_are_cached_until_ttl() {
        let coalescer: RequestCoalescer<u32> = RequestCoalescer::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(coalescer.coalesce("k", ttl, async { Ok(1) }).await, Ok(1));
        assert_eq!(coalescer.coalesce("k", ttl, async { Ok(2) }).await, Ok(1));
        assert_eq!(coalescer.stats().cache_hits, 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(coalescer.coalesce("k", ttl, async { Ok(3) }).await, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_keys_leave_the_cache_on_later_inserts() {
        let coalescer: RequestCoalescer<u32> = RequestCoalescer::new();
        let ttl = Duration::from_secs(60);
        for i in 0..500u32 {
            let value = coalescer
                .coalesce(&format!("yahoo:quote|chunk{i}"), ttl, async move { Ok(i) })
                .await;
            assert_eq!(value, Ok(i));
        }
        assert_eq!(coalescer.stats().cached_entries, 500);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(coalescer.coalesce("yahoo:quote|fresh", ttl, async { Ok(1) }).await, Ok(1));
        assert_eq!(coalescer.stats().cached_entries, 1);
    }

    #[test]
    fn keys_are_order_independent() {
        assert_eq!(
            cache_key("cg:quote", &ids(&["ethereum", "bitcoin"]), &[]),
            cache_key("cg:quote", &ids(&["bitcoin", "ethereum", "bitcoin"]), &[])
        );
    }
}

// ═══════════════════════════════════════════════════════════════════
// Batch — healthy providers
// ═══════════════════════════════════════════════════════════════════

mod batch_healthy {
    use super::*;

    #[tokio::test]
    async fn three_providers_three_records_in_order() {
        let mocks = Mocks::standard();
        let engine = mocks.engine();

        let results = engine
            .fetch_batch(&ids(&["cg:bitcoin", "yahoo:AAPL", "tase:1183441"]))
            .await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_ok()), "{results:?}");

        let btc = results[0].quote().unwrap();
        assert_eq!(btc.id, "cg:bitcoin");
        assert_eq!(btc.source, QuoteSource::CoinGecko);
        assert_close(btc.price, 64_000.0);

        let aapl = results[1].quote().unwrap();
        assert_eq!(aapl.source, QuoteSource::Yahoo);
        assert_eq!(aapl.currency, "USD");

        let etf = results[2].quote().unwrap();
        assert_eq!(etf.id, "tase:1183441");
        assert_eq!(etf.source, QuoteSource::TaseOfficial);
        assert_eq!(etf.currency, "ILS");
        assert_close(etf.price, 523.41);

        assert_eq!(mocks.tase_primary.calls(), 0);
        assert_eq!(mocks.tase_secondary.calls(), 0);
        assert_eq!(mocks.chart.calls(), 0);
    }

    #[tokio::test]
    async fn crypto_ids_share_one_upstream_call() {
        let mocks = Mocks::standard();
        let engine = mocks.engine();

        let results = engine.fetch_batch(&ids(&["cg:bitcoin", "cg:ethereum"])).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(mocks.crypto.calls(), 1);
    }

    #[tokio::test]
    async fn duplicates_get_one_record_each_from_one_fetch() {
        let mocks = Mocks::standard();
        let engine = mocks.engine();

        let results = engine.fetch_batch(&ids(&["AAPL", "AAPL", "yahoo:AAPL"])).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].id(), "AAPL");
        assert_eq!(results[1].id(), "AAPL");
        assert_eq!(results[2].id(), "yahoo:AAPL");
        assert_eq!(results[0].quote().unwrap().price, results[2].quote().unwrap().price);
        assert_eq!(mocks.yahoo.calls(), 1);
    }

    #[tokio::test]
    async fn legacy_input_keeps_requested_id_and_reports_resolved() {
        let mocks = Mocks::standard();
        let engine = mocks.engine();

        let results = engine.fetch_batch(&ids(&["yahoo:1183441"])).await;
        let quote = results[0].quote().unwrap();
        assert_eq!(quote.id, "yahoo:1183441");
        assert_eq!(quote.resolved_id, Some(InternalId::tase("1183441")));
        assert_eq!(quote.source, QuoteSource::TaseOfficial);
    }

    #[tokio::test]
    async fn empty_batch_is_empty() {
        let engine = Mocks::standard().engine();
        assert!(engine.fetch_batch(&[]).await.is_empty());
    }
}

// ═══════════════════════════════════════════════════════════════════
// Batch — failures stay per id
// ═══════════════════════════════════════════════════════════════════

mod batch_failures {
    use super::*;

    #[tokio::test]
    async fn unknown_coin_is_an_error_record() {
        let engine = Mocks::standard().engine();
        let results = engine.fetch_batch(&ids(&["cg:doesnotexist"])).await;

        assert_eq!(results.len(), 1);
        let failure = results[0].error().unwrap();
        assert_eq!(failure.id, "cg:doesnotexist");
        assert_eq!(failure.kind, FailureKind::UpstreamNotFound);
    }

    #[tokio::test]
    async fn unresolvable_inputs_are_resolution_errors() {
        let engine = Mocks::standard().engine();
        let results = engine.fetch_batch(&ids(&["", "   ", "cg:bitcoin"])).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].error().unwrap().kind, FailureKind::ResolutionFailure);
        assert_eq!(results[1].error().unwrap().kind, FailureKind::ResolutionFailure);
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn panicking_group_fails_only_its_ids() {
        let mocks = Mocks::with(
            MockProvider::new("Mock CoinGecko", QuoteSource::CoinGecko)
                .batch(100)
                .panicking(),
            MockProvider::new("Mock Yahoo", QuoteSource::Yahoo)
                .batch(50)
                .with_quote("AAPL", 189.5, Some("USD")),
            MockProvider::new("Mock Yahoo Chart", QuoteSource::YahooChart),
            MockProvider::new("Mock TASE", QuoteSource::TasePrimary),
            MockProvider::new("Mock TASE secondary", QuoteSource::TaseSecondary),
        );
        let engine = mocks.engine();

        let results = engine.fetch_batch(&ids(&["cg:bitcoin", "yahoo:AAPL"])).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].error().unwrap().kind, FailureKind::Internal);
        assert!(results[1].is_ok());
    }

    #[tokio::test]
    async fn panicking_tase_id_spares_its_siblings() {
        let mocks = Mocks::with(
            MockProvider::new("Mock CoinGecko", QuoteSource::CoinGecko).batch(100),
            MockProvider::new("Mock Yahoo", QuoteSource::Yahoo).batch(50),
            MockProvider::new("Mock Yahoo Chart", QuoteSource::YahooChart),
            MockProvider::new("Mock TASE", QuoteSource::TasePrimary)
                .with_quote("2222", 120.5, Some("ILS"))
                .panicking_on("1111"),
            MockProvider::new("Mock TASE secondary", QuoteSource::TaseSecondary),
        );
        let engine = mocks.engine();

        let results = engine.fetch_batch(&ids(&["tase:1111", "tase:2222"])).await;

        assert_eq!(results.len(), 2);
        let failure = results[0].error().unwrap();
        assert_eq!(failure.id, "tase:1111");
        assert_eq!(failure.kind, FailureKind::Internal);

        let quote = results[1].quote().unwrap();
        assert_eq!(quote.id, "tase:2222");
        assert_close(quote.price, 120.5);
        assert_eq!(quote.source, QuoteSource::TasePrimary);
    }

    #[tokio::test]
    async fn panicking_chart_symbol_spares_its_siblings() {
        let mocks = Mocks::with(
            MockProvider::new("Mock CoinGecko", QuoteSource::CoinGecko).batch(100),
            MockProvider::new("Mock Yahoo", QuoteSource::Yahoo).batch(50),
            MockProvider::new("Mock Yahoo Chart", QuoteSource::YahooChart)
                .with_quote("MSFT", 410.0, Some("USD"))
                .panicking_on("BAD"),
            MockProvider::new("Mock TASE", QuoteSource::TasePrimary),
            MockProvider::new("Mock TASE secondary", QuoteSource::TaseSecondary),
        );
        let engine = mocks.engine();

        let results = engine.fetch_batch(&ids(&["yahoo:BAD", "yahoo:MSFT"])).await;

        assert_eq!(results[0].error().unwrap().kind, FailureKind::Internal);
        let quote = results[1].quote().unwrap();
        assert_close(quote.price, 410.0);
        assert_eq!(quote.source, QuoteSource::YahooChart);
    }

    #[tokio::test]
    async fn blocked_quote_endpoint_falls_back_to_chart() {
        let mocks = Mocks::with(
            MockProvider::new("Mock CoinGecko", QuoteSource::CoinGecko),
            MockProvider::new("Mock Yahoo", QuoteSource::Yahoo)
                .batch(50)
                .failing_first(usize::MAX, CoreError::UpstreamAuth {
                    provider: "Mock Yahoo".into(),
                    status: 403,
                }),
            MockProvider::new("Mock Yahoo Chart", QuoteSource::YahooChart)
                .with_quote("MSFT", 410.0, Some("USD")),
            MockProvider::new("Mock TASE", QuoteSource::TasePrimary),
            MockProvider::new("Mock TASE secondary", QuoteSource::TaseSecondary),
        );
        let engine = mocks.engine();

        let results = engine.fetch_batch(&ids(&["MSFT"])).await;
        let quote = results[0].quote().unwrap();
        assert_eq!(quote.source, QuoteSource::YahooChart);
        assert_eq!(mocks.yahoo.calls(), 1, "auth failures are never retried");
    }

    #[tokio::test]
    async fn transient_failure_is_retried_within_budget() {
        let mocks = Mocks::with(
            MockProvider::new("Mock CoinGecko", QuoteSource::CoinGecko)
                .batch(100)
                .with_quote("bitcoin", 64_000.0, Some("USD"))
                .failing_first(1, CoreError::UpstreamHttp {
                    provider: "Mock CoinGecko".into(),
                    status: 503,
                }),
            MockProvider::new("Mock Yahoo", QuoteSource::Yahoo),
            MockProvider::new("Mock Yahoo Chart", QuoteSource::YahooChart),
            MockProvider::new("Mock TASE", QuoteSource::TasePrimary),
            MockProvider::new("Mock TASE secondary", QuoteSource::TaseSecondary),
        );
        let config = EngineConfig {
            max_retries: 1,
            ..test_config()
        };
        let engine = QuoteEngine::with_registry(config, mocks.registry());

        let results = engine.fetch_batch(&ids(&["cg:bitcoin"])).await;
        assert!(results[0].is_ok());
        assert_eq!(mocks.crypto.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out_into_error_record() {
        let mocks = Mocks::with(
            MockProvider::new("Mock CoinGecko", QuoteSource::CoinGecko)
                .batch(100)
                .with_quote("bitcoin", 64_000.0, Some("USD"))
                .with_delay(Duration::from_secs(30)),
            MockProvider::new("Mock Yahoo", QuoteSource::Yahoo)
                .batch(50)
                .with_quote("AAPL", 189.5, Some("USD")),
            MockProvider::new("Mock Yahoo Chart", QuoteSource::YahooChart),
            MockProvider::new("Mock TASE", QuoteSource::TasePrimary),
            MockProvider::new("Mock TASE secondary", QuoteSource::TaseSecondary),
        );
        let engine = mocks.engine();

        let results = engine.fetch_batch(&ids(&["cg:bitcoin", "AAPL"])).await;
        assert_eq!(
            results[0].error().unwrap().kind,
            FailureKind::UpstreamTransientFailure
        );
        assert!(results[1].is_ok());
    }
}

// ═══════════════════════════════════════════════════════════════════
// TASE waterfall
// ═══════════════════════════════════════════════════════════════════

mod tase_waterfall {
    use super::*;

    #[tokio::test]
    async fn primary_failure_falls_to_secondary_and_stops() {
        let mut scraped = ProviderQuote::new("5100");
        scraped.price = Some(142.3);
        scraped.currency = Some("ILS".into());
        scraped.agorot_normalized = true;

        let mocks = Mocks::with(
            MockProvider::new("Mock CoinGecko", QuoteSource::CoinGecko),
            MockProvider::new("Mock Yahoo", QuoteSource::Yahoo).batch(50),
            MockProvider::new("Mock Yahoo Chart", QuoteSource::YahooChart),
            MockProvider::new("Mock TASE", QuoteSource::TasePrimary)
                .with_error("5100", CoreError::parse("Mock TASE", "not JSON")),
            MockProvider::new("Mock TASE secondary", QuoteSource::TaseSecondary)
                .with_raw_quote(scraped),
        );
        let engine = mocks.engine();

        let results = engine.fetch_batch(&ids(&["tase:5100"])).await;
        let quote = results[0].quote().unwrap();

        assert_eq!(quote.source, QuoteSource::TaseSecondary);
        assert_close(quote.price, 142.3);
        assert_eq!(quote.currency, "ILS");
        assert_eq!(mocks.tase_primary.calls(), 1);
        assert_eq!(mocks.tase_secondary.calls(), 1);
        assert_eq!(mocks.yahoo.calls(), 0, "inferred-symbol stage must not run");
        assert_eq!(mocks.chart.calls(), 0);
    }

    #[tokio::test]
    async fn unlabelled_scrape_in_agorot_is_divided() {
        let mocks = Mocks::with(
            MockProvider::new("Mock CoinGecko", QuoteSource::CoinGecko),
            MockProvider::new("Mock Yahoo", QuoteSource::Yahoo).batch(50),
            MockProvider::new("Mock Yahoo Chart", QuoteSource::YahooChart),
            MockProvider::new("Mock TASE", QuoteSource::TasePrimary)
                .with_quote("5100", 14_230.0, None),
            MockProvider::new("Mock TASE secondary", QuoteSource::TaseSecondary),
        );
        let engine = mocks.engine();

        let results = engine.fetch_batch(&ids(&["5100"])).await;
        let quote = results[0].quote().unwrap();
        assert_eq!(quote.source, QuoteSource::TasePrimary);
        assert_close(quote.price, 142.3);
    }

    #[tokio::test]
    async fn inferred_symbol_is_last_resort() {
        let mocks = Mocks::with(
            MockProvider::new("Mock CoinGecko", QuoteSource::CoinGecko),
            MockProvider::new("Mock Yahoo", QuoteSource::Yahoo)
                .batch(50)
                .with_quote("5100.TA", 14_230.0, Some("ILA")),
            MockProvider::new("Mock Yahoo Chart", QuoteSource::YahooChart),
            MockProvider::new("Mock TASE", QuoteSource::TasePrimary),
            MockProvider::new("Mock TASE secondary", QuoteSource::TaseSecondary),
        );
        let engine = mocks.engine();

        let results = engine.fetch_batch(&ids(&["tase:5100"])).await;
        let quote = results[0].quote().unwrap();
        assert_eq!(quote.source, QuoteSource::TaseYahooInferred);
        assert_close(quote.price, 142.3);
        assert_eq!(mocks.tase_primary.calls(), 1);
        assert_eq!(mocks.tase_secondary.calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_waterfall_reports_last_stage_error() {
        let engine = Mocks::standard().engine();

        let results = engine.fetch_batch(&ids(&["tase:5100"])).await;
        let failure = results[0].error().unwrap();
        assert_eq!(failure.id, "tase:5100");
        assert_eq!(failure.kind, FailureKind::UpstreamNotFound);
        assert!(failure.error.contains("5100.TA"), "{}", failure.error);
    }

    #[tokio::test]
    async fn many_tase_ids_each_get_a_record() {
        let mut secondary = MockProvider::new("Mock TASE secondary", QuoteSource::TaseSecondary);
        for n in 0..20 {
            secondary = secondary.with_quote(&format!("90{n:02}"), 100.0 + n as f64, Some("ILS"));
        }
        let mocks = Mocks::with(
            MockProvider::new("Mock CoinGecko", QuoteSource::CoinGecko),
            MockProvider::new("Mock Yahoo", QuoteSource::Yahoo).batch(50),
            MockProvider::new("Mock Yahoo Chart", QuoteSource::YahooChart),
            MockProvider::new("Mock TASE", QuoteSource::TasePrimary),
            secondary,
        );
        let engine = mocks.engine();

        let inputs: Vec<String> = (0..20).map(|n| format!("tase:90{n:02}")).collect();
        let results = engine.fetch_batch(&inputs).await;

        assert_eq!(results.len(), 20);
        for (input, result) in inputs.iter().zip(&results) {
            assert_eq!(result.id(), input);
            assert_eq!(result.quote().unwrap().source, QuoteSource::TaseSecondary);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Engine-level coalescing
// ═══════════════════════════════════════════════════════════════════

mod engine_coalescing {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn concurrent_batches_share_upstream_calls() {
        let mocks = Mocks::with(
            MockProvider::new("Mock CoinGecko", QuoteSource::CoinGecko)
                .batch(100)
                .with_quote("bitcoin", 64_000.0, Some("USD"))
                .with_delay(Duration::from_millis(100)),
            MockProvider::new("Mock Yahoo", QuoteSource::Yahoo),
            MockProvider::new("Mock Yahoo Chart", QuoteSource::YahooChart),
            MockProvider::new("Mock TASE", QuoteSource::TasePrimary),
            MockProvider::new("Mock TASE secondary", QuoteSource::TaseSecondary),
        );
        let engine = mocks.engine();
        let request = ids(&["cg:bitcoin"]);

        let (a, b, c) = tokio::join!(
            engine.fetch_batch(&request),
            engine.fetch_batch(&request),
            engine.fetch_batch(&request),
        );
        assert!(a[0].is_ok() && b[0].is_ok() && c[0].is_ok());
        assert_eq!(mocks.crypto.calls(), 1);

        // fresh cache answers without upstream
        engine.fetch_batch(&request).await;
        assert_eq!(mocks.crypto.calls(), 1);
        assert!(engine.cache_stats().quotes.cache_hits >= 1);

        engine.clear_cache();
        engine.fetch_batch(&request).await;
        assert_eq!(mocks.crypto.calls(), 2);
    }
}

// ═══════════════════════════════════════════════════════════════════
// History
// ═══════════════════════════════════════════════════════════════════

mod history {
    use super::*;

    #[tokio::test]
    async fn crypto_series_is_sorted_and_cleaned() {
        let mocks = Mocks::with(
            MockProvider::new("Mock CoinGecko", QuoteSource::CoinGecko).with_history(
                "bitcoin",
                &[(3_000, 62_000.0), (1_000, 60_000.0), (2_000, f64::NAN)],
                "USD",
            ),
            MockProvider::new("Mock Yahoo", QuoteSource::Yahoo),
            MockProvider::new("Mock Yahoo Chart", QuoteSource::YahooChart),
            MockProvider::new("Mock TASE", QuoteSource::TasePrimary),
            MockProvider::new("Mock TASE secondary", QuoteSource::TaseSecondary),
        );
        let engine = mocks.engine();

        let result = engine
            .fetch_history(&InternalId::coingecko("bitcoin"), HistoryRange::OneMonth, None)
            .await;
        let series = result.series().unwrap();
        assert_eq!(series.source, QuoteSource::CoinGecko);
        assert_eq!(series.currency, "USD");
        let times: Vec<i64> = series.iter().map(|p| p.timestamp_ms).collect();
        assert_eq!(times, [1_000, 3_000]);
    }

    #[tokio::test]
    async fn tase_series_uses_official_symbol_and_shekels() {
        let mocks = Mocks::with(
            MockProvider::new("Mock CoinGecko", QuoteSource::CoinGecko),
            MockProvider::new("Mock Yahoo", QuoteSource::Yahoo),
            MockProvider::new("Mock Yahoo Chart", QuoteSource::YahooChart).with_history(
                "1183441.TA",
                &[(1_000, 52_000.0), (2_000, 52_341.0)],
                "ILA",
            ),
            MockProvider::new("Mock TASE", QuoteSource::TasePrimary),
            MockProvider::new("Mock TASE secondary", QuoteSource::TaseSecondary),
        );
        let engine = mocks.engine();

        let result = engine
            .fetch_history(&InternalId::tase("1183441"), HistoryRange::OneYear, None)
            .await;
        let series = result.series().unwrap();
        assert_eq!(series.source, QuoteSource::TaseOfficial);
        assert_eq!(series.currency, "ILS");
        assert_close(series.latest().unwrap().value, 523.41);
    }

    #[tokio::test]
    async fn history_is_cached() {
        let mocks = Mocks::with(
            MockProvider::new("Mock CoinGecko", QuoteSource::CoinGecko),
            MockProvider::new("Mock Yahoo", QuoteSource::Yahoo),
            MockProvider::new("Mock Yahoo Chart", QuoteSource::YahooChart).with_history(
                "AAPL",
                &[(1_000, 180.0)],
                "USD",
            ),
            MockProvider::new("Mock TASE", QuoteSource::TasePrimary),
            MockProvider::new("Mock TASE secondary", QuoteSource::TaseSecondary),
        );
        let engine = mocks.engine();
        let id = InternalId::yahoo("AAPL");

        engine.fetch_history(&id, HistoryRange::OneMonth, None).await;
        engine.fetch_history(&id, HistoryRange::OneMonth, None).await;
        assert_eq!(mocks.chart.calls(), 1);
    }

    #[tokio::test]
    async fn missing_series_is_error_slot() {
        let engine = Mocks::standard().engine();
        let result = engine
            .fetch_history(&InternalId::yahoo("NOPE"), HistoryRange::OneMonth, None)
            .await;
        match result {
            HistoryResult::Err(failure) => {
                assert_eq!(failure.id, "yahoo:NOPE");
                assert_eq!(failure.kind, FailureKind::UpstreamNotFound);
            }
            HistoryResult::Ok(series) => panic!("Expected error, got {series:?}"),
        }
    }

    #[tokio::test]
    async fn price_at_returns_nearest_point() {
        let now = Utc::now();
        let day = |d: i64| (now - ChronoDuration::days(d)).timestamp_millis();
        let mocks = Mocks::with(
            MockProvider::new("Mock CoinGecko", QuoteSource::CoinGecko),
            MockProvider::new("Mock Yahoo", QuoteSource::Yahoo),
            MockProvider::new("Mock Yahoo Chart", QuoteSource::YahooChart).with_history(
                "AAPL",
                &[(day(3), 180.0), (day(2), 185.0), (day(1), 190.0)],
                "USD",
            ),
            MockProvider::new("Mock TASE", QuoteSource::TasePrimary),
            MockProvider::new("Mock TASE secondary", QuoteSource::TaseSecondary),
        );
        let engine = mocks.engine();
        let id = InternalId::yahoo("AAPL");

        let target = now - ChronoDuration::days(2) + ChronoDuration::hours(1);
        let point = engine.price_at(&id, target).await.unwrap();
        assert_close(point.value, 185.0);
        assert_eq!(point.id, id);
        assert_eq!(point.currency, "USD");
    }

    #[tokio::test]
    async fn price_at_in_the_future_is_invalid() {
        let mocks = Mocks::standard();
        let engine = mocks.engine();
        let target = Utc::now() + ChronoDuration::days(3);
        let err = engine
            .price_at(&InternalId::yahoo("AAPL"), target)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));
        assert_eq!(mocks.chart.calls(), 0);
    }

    #[tokio::test]
    async fn price_at_beyond_longest_range_is_invalid() {
        let engine = Mocks::standard().engine();
        let target = Utc::now() - ChronoDuration::days(4_000);
        let err = engine
            .price_at(&InternalId::yahoo("AAPL"), target)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));
    }
}

// ═══════════════════════════════════════════════════════════════════
// FX
// ═══════════════════════════════════════════════════════════════════

mod fx {
    use super::*;

    #[tokio::test]
    async fn usd_ils_rate_from_yahoo() {
        let engine = Mocks::standard().engine();
        assert_close(engine.usd_ils_rate().await.unwrap(), 3.7);
    }

    #[tokio::test]
    async fn conversions() {
        let engine = Mocks::standard().engine();
        assert_close(engine.convert(100.0, "USD", "ILS").await.unwrap(), 370.0);
        assert_close(engine.convert(370.0, "ils", "usd").await.unwrap(), 100.0);
        assert_close(engine.convert(5.0, "EUR", "eur").await.unwrap(), 5.0);
        assert!(engine.convert(5.0, "EUR", "ILS").await.is_err());
    }

    #[tokio::test]
    async fn missing_rate_is_structured_error() {
        let mocks = Mocks::with(
            MockProvider::new("Mock CoinGecko", QuoteSource::CoinGecko),
            MockProvider::new("Mock Yahoo", QuoteSource::Yahoo).batch(50),
            MockProvider::new("Mock Yahoo Chart", QuoteSource::YahooChart),
            MockProvider::new("Mock TASE", QuoteSource::TasePrimary),
            MockProvider::new("Mock TASE secondary", QuoteSource::TaseSecondary),
        );
        let err = mocks.engine().usd_ils_rate().await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::UpstreamNotFound);
    }
}
