//! 캐시 우선, 요청 예산 안에서 동작하는 배치 시장 데이터 페처.
//!
//! 심볼마다 다음 순서로 처리합니다.
//!
//! ```text
//! NotRequested → CacheCheck ─┬─ hit  → Returned(cache)
//!                            └─ miss → Breaker ─┬─ 거부 → Returned(synthetic)
//!                                               └─ 허용 → Enqueue ─┬─ 대기열 초과 → Errored
//!                                                                  └─ WaitForWindow → Dispatch ─┬─ 성공 → 캐시 저장 → Returned(origin)
//!                                                                                               └─ 실패 → Errored
//! ```
//!
//! 제공자가 설정되지 않았거나 사용할 수 없으면 캐시 미스는 합성 데이터로 채우며, 이 경로는 실패하지 않습니다.
//! 서킷 브레이커가 거부한 호출은 예산 슬롯을 쓰지 않습니다.
//! 제공자가 요청 한도 초과를 알리면 같은 배치의 남은 호출도 `retry_after` 동안 기다립니다.

use chrono::{NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use clarity_cache::{CacheOrchestrator, CacheSetOptions, CacheStats};
use clarity_core::{
    batch_span, normalize_symbol, AppConfig, BatchRequest, CompanyProfile, DividendData,
    FetcherConfig, PriceRecord, Provenance, ProviderPlan,
};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitState};
use crate::error::{MarketError, Result};
use crate::origin::{ConnectionProbe, OriginAdapter};
use crate::rate_limiter::{BudgetSnapshot, RateLimiter};
use crate::synthetic::SyntheticGenerator;

/// 시세 캐시 태그.
pub const TAG_PRICES: &str = "prices";
/// 실시간성 캐시 태그.
pub const TAG_REAL_TIME: &str = "real-time";
/// 배당 캐시 태그.
pub const TAG_DIVIDENDS: &str = "dividends";
/// 기업 정보 캐시 태그.
pub const TAG_COMPANY_INFO: &str = "company-info";

/// 워밍업 요청 우선순위 (일반 요청보다 낮음).
pub const WARMUP_PRIORITY: i32 = -10;

/// 제공자가 `Retry-After` 없이 429를 돌려줄 때 예산을 닫는 시간.
const DEFAULT_PROVIDER_BACKOFF: Duration = Duration::from_secs(60);

/// 배치 결과에 담기는 레코드.
pub trait BatchRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn with_provenance(self, provenance: Provenance) -> Self;
}

impl BatchRecord for PriceRecord {
    fn with_provenance(self, provenance: Provenance) -> Self {
        PriceRecord::with_provenance(self, provenance)
    }
}

impl BatchRecord for DividendData {
    fn with_provenance(self, provenance: Provenance) -> Self {
        DividendData::with_provenance(self, provenance)
    }
}

impl BatchRecord for CompanyProfile {
    fn with_provenance(self, provenance: Provenance) -> Self {
        CompanyProfile::with_provenance(self, provenance)
    }
}

/// 심볼 하나의 실패.
#[derive(Debug, Clone)]
pub struct SymbolError {
    pub symbol: String,
    pub error: MarketError,
}

impl Serialize for SymbolError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("SymbolError", 3)?;
        state.serialize_field("symbol", &self.symbol)?;
        state.serialize_field("error", &self.error.to_string())?;
        state.serialize_field("retryable", &self.error.is_retryable())?;
        state.end()
    }
}

/// 배치 조회 결과.
///
/// 요청한 모든 심볼은 `records`와 `errors` 중 정확히 한 곳에 나타납니다.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult<T> {
    pub batch_id: Uuid,
    /// 정규화된 심볼 → 레코드
    pub records: BTreeMap<String, T>,
    pub errors: Vec<SymbolError>,
    pub from_cache: Vec<String>,
    pub from_origin: Vec<String>,
    pub synthetic: Vec<String>,
    /// 배치 종료 시점의 예산 상태
    pub budget: BudgetSnapshot,
}

impl<T> BatchResult<T> {
    pub fn error_for(&self, symbol: &str) -> Option<&MarketError> {
        self.errors
            .iter()
            .find(|e| e.symbol == symbol)
            .map(|e| &e.error)
    }

    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// 서비스 전반 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// 데이터 공급 모드.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataMode {
    /// 제공자에서 가져옴
    Live,
    /// 합성 데이터로 대체
    Synthetic,
}

/// `get_service_health` 진단 결과.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub mode: DataMode,
    pub provider: Option<String>,
    pub configured: bool,
    pub manually_unavailable: bool,
    pub plan: ProviderPlan,
    pub budget: BudgetSnapshot,
    pub circuit: CircuitBreakerMetrics,
    pub cache: CacheStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionProbe>,
    pub checked_at: chrono::DateTime<Utc>,
}

/// 한 종류의 레코드를 배치로 가져올 때의 캐시 규칙.
struct BatchProfile {
    operation: &'static str,
    key_prefix: String,
    ttl: Duration,
    tags: &'static [&'static str],
}

impl BatchProfile {
    fn key(&self, symbol: &str) -> String {
        format!("{}:{}", self.key_prefix, symbol)
    }

    fn options(&self) -> CacheSetOptions {
        CacheSetOptions::new(self.ttl).tags(self.tags.iter().copied())
    }
}

/// 배치 시장 데이터 서비스.
pub struct MarketDataService {
    cache: Arc<CacheOrchestrator>,
    limiter: Arc<RateLimiter>,
    origin: Option<Arc<dyn OriginAdapter>>,
    breaker: CircuitBreaker,
    synthetic: SyntheticGenerator,
    config: FetcherConfig,
    plan: ProviderPlan,
    manually_unavailable: AtomicBool,
}

impl std::fmt::Debug for MarketDataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataService")
            .field("origin", &self.origin.as_ref().map(|o| o.name().to_string()))
            .field("breaker", &self.breaker)
            .field("config", &self.config)
            .finish()
    }
}

impl MarketDataService {
    pub fn new(
        cache: Arc<CacheOrchestrator>,
        limiter: Arc<RateLimiter>,
        origin: Option<Arc<dyn OriginAdapter>>,
        config: &AppConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            config.fetcher.budget_identifier.clone(),
            config.circuit_breaker.clone(),
        );

        if !origin.as_ref().is_some_and(|o| o.is_configured()) {
            warn!("Market data provider not configured, serving synthetic data");
        }

        Self {
            cache,
            limiter,
            origin,
            breaker,
            synthetic: SyntheticGenerator::new(config.fetcher.synthetic_variation_pct),
            config: config.fetcher.clone(),
            plan: config.provider.plan,
            manually_unavailable: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &Arc<CacheOrchestrator> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn budget_identifier(&self) -> &str {
        &self.config.budget_identifier
    }

    /// 자격증명이 있는 제공자가 붙어 있는지.
    pub fn is_configured(&self) -> bool {
        self.origin.as_ref().is_some_and(|o| o.is_configured())
    }

    /// 제공자를 명시적으로 사용 불가로 표시합니다.
    pub fn mark_unavailable(&self, reason: &str) {
        self.manually_unavailable.store(true, Ordering::SeqCst);
        warn!(reason, "Market data provider marked unavailable");
    }

    /// 사용 불가 표시를 해제하고 서킷 브레이커를 리셋합니다.
    pub fn mark_available(&self) {
        self.manually_unavailable.store(false, Ordering::SeqCst);
        self.breaker.reset();
        info!("Market data provider marked available");
    }

    /// 지금 제공자를 호출할 수 있으면 해당 어댑터.
    fn live_origin(&self) -> Option<Arc<dyn OriginAdapter>> {
        let origin = self.origin.as_ref().filter(|o| o.is_configured())?;
        if self.manually_unavailable.load(Ordering::SeqCst) || self.breaker.is_open() {
            return None;
        }
        Some(origin.clone())
    }

    fn data_mode(&self) -> DataMode {
        if self.live_origin().is_some() {
            DataMode::Live
        } else {
            DataMode::Synthetic
        }
    }

    fn price_profile(&self) -> BatchProfile {
        BatchProfile {
            operation: "prices",
            key_prefix: "price".to_string(),
            ttl: self.config.price_ttl(),
            tags: &[TAG_PRICES, TAG_REAL_TIME],
        }
    }

    /// 여러 심볼의 시세를 가져옵니다. 심볼별 실패는 `errors`에 담기며 메서드는 실패하지 않습니다.
    pub async fn get_batch_prices(&self, request: &BatchRequest) -> BatchResult<PriceRecord> {
        let profile = self.price_profile();
        let synthetic = self.synthetic;
        self.run_batch(
            request,
            profile,
            |origin, symbol| async move {
                let quote = origin.fetch_price(&symbol).await?;
                Ok(quote.into_record(symbol, Provenance::Origin))
            },
            move |symbol| synthetic.price(symbol),
        )
        .await
    }

    /// 심볼 하나의 시세.
    pub async fn get_stock_price(&self, symbol: &str) -> Result<PriceRecord> {
        let normalized =
            normalize_symbol(symbol).ok_or_else(|| MarketError::InvalidSymbol(symbol.to_string()))?;
        let mut result = self
            .get_batch_prices(&BatchRequest::new([normalized.clone()]))
            .await;

        if let Some(record) = result.records.remove(&normalized) {
            return Ok(record);
        }
        Err(result
            .errors
            .into_iter()
            .next()
            .map(|e| e.error)
            .unwrap_or(MarketError::SymbolNotFound(normalized)))
    }

    /// 기간 내 배당 이력을 배치로 가져옵니다.
    pub async fn get_batch_dividend_data(
        &self,
        request: &BatchRequest,
        from: NaiveDate,
        to: NaiveDate,
    ) -> BatchResult<DividendData> {
        let profile = BatchProfile {
            operation: "dividends",
            key_prefix: format!("dividends:{}:{}", from, to),
            ttl: self.config.dividend_ttl(),
            tags: &[TAG_DIVIDENDS],
        };
        let synthetic = self.synthetic;
        self.run_batch(
            request,
            profile,
            move |origin, symbol| async move {
                let dividends = origin.fetch_dividends(&symbol, from, to).await?;
                Ok(DividendData {
                    symbol,
                    from,
                    to,
                    dividends,
                    fetched_at: Utc::now(),
                    provenance: Provenance::Origin,
                })
            },
            move |symbol| DividendData {
                symbol: symbol.to_string(),
                from,
                to,
                dividends: synthetic.dividends(symbol, from, to),
                fetched_at: Utc::now(),
                provenance: Provenance::Synthetic,
            },
        )
        .await
    }

    /// 기업 정보를 배치로 가져옵니다.
    pub async fn get_batch_company_info(
        &self,
        request: &BatchRequest,
    ) -> BatchResult<CompanyProfile> {
        let profile = BatchProfile {
            operation: "company-info",
            key_prefix: "company".to_string(),
            ttl: self.config.company_ttl(),
            tags: &[TAG_COMPANY_INFO],
        };
        let synthetic = self.synthetic;
        self.run_batch(
            request,
            profile,
            |origin, symbol| async move {
                let info = origin.fetch_company_info(&symbol).await?;
                Ok(CompanyProfile {
                    info,
                    fetched_at: Utc::now(),
                    provenance: Provenance::Origin,
                })
            },
            move |symbol| CompanyProfile {
                info: synthetic.company_info(symbol),
                fetched_at: Utc::now(),
                provenance: Provenance::Synthetic,
            },
        )
        .await
    }

    /// 시작 시 캐시를 채우기 위한 낮은 우선순위 시세 조회.
    pub async fn warm_up_prices<I, S>(&self, symbols: I) -> BatchResult<PriceRecord>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = BatchRequest::new(symbols).with_priority(WARMUP_PRIORITY);
        let result = self.get_batch_prices(&request).await;
        info!(
            warmed = result.from_origin.len(),
            cached = result.from_cache.len(),
            failed = result.errors.len(),
            "Price warmup finished"
        );
        result
    }

    /// 페처 태그(또는 지정한 태그)의 캐시 항목을 무효화합니다.
    pub async fn clear_cache(&self, tags: Option<&BTreeSet<String>>) -> usize {
        let default_tags: BTreeSet<String> = [TAG_PRICES, TAG_DIVIDENDS, TAG_COMPANY_INFO]
            .into_iter()
            .map(str::to_string)
            .collect();
        let tags = tags.filter(|t| !t.is_empty()).unwrap_or(&default_tags);
        self.cache.invalidate_by_tags(tags).await
    }

    /// 설정, 예산, 브레이커, 캐시 상태를 모은 진단 정보.
    ///
    /// `probe`가 참이면 제공자에 가벼운 연결 확인 요청을 한 번 보냅니다.
    pub async fn get_service_health(&self, probe: bool) -> ServiceHealth {
        let configured = self.is_configured();
        let manually_unavailable = self.manually_unavailable.load(Ordering::SeqCst);
        let mode = self.data_mode();
        let circuit = self.breaker.metrics();
        let cache = self.cache.stats().await;
        let budget = self
            .limiter
            .get_rate_limit_status(&self.config.budget_identifier);

        let connection = match (&self.origin, probe && configured) {
            (Some(origin), true) => Some(origin.test_connection().await),
            _ => None,
        };

        let degraded = mode == DataMode::Synthetic
            || circuit.state != CircuitState::Closed
            || cache.distributed_connected == Some(false)
            || connection.as_ref().is_some_and(|c| !c.success);

        ServiceHealth {
            status: if degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            mode,
            provider: self.origin.as_ref().map(|o| o.name().to_string()),
            configured,
            manually_unavailable,
            plan: self.plan,
            budget,
            circuit,
            cache,
            connection,
            checked_at: Utc::now(),
        }
    }

    async fn run_batch<T, Fetch, Fut, Synth>(
        &self,
        request: &BatchRequest,
        profile: BatchProfile,
        fetch: Fetch,
        synthesize: Synth,
    ) -> BatchResult<T>
    where
        T: BatchRecord,
        Fetch: Fn(Arc<dyn OriginAdapter>, String) -> Fut,
        Fut: Future<Output = Result<T>>,
        Synth: Fn(&str) -> T,
    {
        let batch_id = Uuid::new_v4();
        let span = batch_span!("market_batch", batch_id, request.symbols.len());

        async move {
            let identifier = self.config.budget_identifier.as_str();
            let mut result = BatchResult {
                batch_id,
                records: BTreeMap::new(),
                errors: Vec::new(),
                from_cache: Vec::new(),
                from_origin: Vec::new(),
                synthetic: Vec::new(),
                budget: self.limiter.get_rate_limit_status(identifier),
            };

            // 1. 심볼 정규화
            let mut symbols = BTreeSet::new();
            for raw in &request.symbols {
                match normalize_symbol(raw) {
                    Some(symbol) => {
                        symbols.insert(symbol);
                    }
                    None => result.errors.push(SymbolError {
                        symbol: raw.clone(),
                        error: MarketError::InvalidSymbol(raw.clone()),
                    }),
                }
            }

            // 2. 캐시 확인
            let mut uncached = Vec::new();
            for symbol in symbols {
                if !request.force_refresh {
                    if let Some(record) = self.cache.get::<T>(&profile.key(&symbol)).await {
                        result
                            .records
                            .insert(symbol.clone(), record.with_provenance(Provenance::Cache));
                        result.from_cache.push(symbol);
                        continue;
                    }
                }
                uncached.push(symbol);
            }

            if uncached.is_empty() {
                result.budget = self.limiter.get_rate_limit_status(identifier);
                return result;
            }

            // 3. 제공자를 쓸 수 없으면 합성 데이터
            let Some(origin) = self.live_origin() else {
                warn!(
                    operation = profile.operation,
                    count = uncached.len(),
                    "Provider unavailable, serving synthetic records"
                );
                for symbol in uncached {
                    let record = synthesize(&symbol).with_provenance(Provenance::Synthetic);
                    result.records.insert(symbol.clone(), record);
                    result.synthetic.push(symbol);
                }
                result.budget = self.limiter.get_rate_limit_status(identifier);
                return result;
            };

            // 4. 브레이커 허가 → 예산 슬롯 → 제공자 호출
            let limiter = &self.limiter;
            let breaker = &self.breaker;
            let fetch = &fetch;
            let items: Vec<_> = uncached
                .into_iter()
                .map(|symbol| {
                    let origin = origin.clone();
                    let key = symbol.clone();
                    let prepare = move || {
                        breaker.try_permit().map(|permit| {
                            move || async move {
                                let outcome = permit.run(fetch(origin, symbol)).await;
                                if let Err(MarketError::ProviderRateLimited { retry_after }) = &outcome {
                                    limiter.defer(
                                        identifier,
                                        retry_after.unwrap_or(DEFAULT_PROVIDER_BACKOFF),
                                    );
                                }
                                outcome
                            }
                        })
                    };
                    (key, prepare)
                })
                .collect();

            let outcomes = self
                .limiter
                .batch_execute_prepared(items, identifier, self.config.concurrency, request.priority)
                .await;

            // 5. 결과 병합
            let options = profile.options();
            for (symbol, outcome) in outcomes {
                match outcome {
                    Ok(record) => {
                        let record = record.with_provenance(Provenance::Origin);
                        if let Err(e) = self.cache.set(&profile.key(&symbol), &record, &options).await {
                            warn!(symbol = %symbol, error = %e, "Failed to cache fetched record");
                        }
                        result.records.insert(symbol.clone(), record);
                        result.from_origin.push(symbol);
                    }
                    Err(MarketError::CircuitOpen { .. }) => {
                        let record = synthesize(&symbol).with_provenance(Provenance::Synthetic);
                        result.records.insert(symbol.clone(), record);
                        result.synthetic.push(symbol);
                    }
                    Err(error) => {
                        debug!(symbol = %symbol, error = %error, "Symbol fetch failed");
                        result.errors.push(SymbolError { symbol, error });
                    }
                }
            }

            if !result.synthetic.is_empty() {
                warn!(
                    operation = profile.operation,
                    count = result.synthetic.len(),
                    "Circuit breaker refused calls, serving synthetic records"
                );
            }

            result.from_origin.sort();
            result.synthetic.sort();
            result.errors.sort_by(|a, b| a.symbol.cmp(&b.symbol));
            result.budget = self.limiter.get_rate_limit_status(identifier);

            info!(
                operation = profile.operation,
                cached = result.from_cache.len(),
                fetched = result.from_origin.len(),
                synthetic = result.synthetic.len(),
                failed = result.errors.len(),
                remaining = result.budget.remaining,
                "Batch finished"
            );
            result
        }
        .instrument(span)
        .await
    }
}
