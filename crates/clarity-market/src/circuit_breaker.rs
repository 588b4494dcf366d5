//! Circuit Breaker pattern implementation.
//!
//! 제공자 장애 시 연쇄 실패를 막고, 배치 페처가 합성 데이터 경로로 전환하도록 합니다.
//!
//! # 상태 전이
//!
//! ```text
//! Closed ──[실패 임계치 도달]──> Open
//!    ↑                            │
//!    │                   [타임아웃 경과]
//!    │                            ↓
//!    └──[성공]── HalfOpen ──[실패]──> Open
//! ```
//!
//! HalfOpen에서는 probe 요청 하나만 통과시킵니다.
//!
//! # 에러 유형별 임계치
//!
//! - **Network**: 네트워크/연결 오류 (기본 5회)
//! - **RateLimit**: 제공자 요청 한도 초과 (기본 10회 - 더 관대)
//! - **Timeout**: 요청 타임아웃 (기본 5회)
//! - **Service**: 5xx 등 서비스 오류 (기본 5회)

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use serde::{Deserialize, Serialize};

use clarity_core::CircuitBreakerConfig;

use crate::error::{MarketError, Result};

/// 에러 카테고리.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 네트워크/연결 오류
    Network,
    /// 제공자 요청 한도 초과
    RateLimit,
    /// 요청 타임아웃
    Timeout,
    /// 기타 서비스 오류
    Service,
}

impl ErrorCategory {
    /// MarketError에서 카테고리 추출.
    ///
    /// 제공자 상태와 무관한 에러는 None 반환.
    pub fn from_error(error: &MarketError) -> Option<Self> {
        match error {
            MarketError::NetworkError(_) => Some(ErrorCategory::Network),
            MarketError::ProviderRateLimited { .. } => Some(ErrorCategory::RateLimit),
            MarketError::Timeout(_) => Some(ErrorCategory::Timeout),
            MarketError::ServiceError { status, .. } if *status >= 500 => {
                Some(ErrorCategory::Service)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::RateLimit => write!(f, "rate_limit"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::Service => write!(f, "service"),
        }
    }
}

/// Circuit Breaker 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// 정상 상태 - 모든 요청 허용
    Closed,
    /// 장애 상태 - 모든 요청 즉시 거부
    Open,
    /// 복구 테스트 상태 - probe 요청 하나만 허용
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

fn threshold_for(config: &CircuitBreakerConfig, category: ErrorCategory) -> u32 {
    match &config.category_thresholds {
        Some(t) => match category {
            ErrorCategory::Network => t.network,
            ErrorCategory::RateLimit => t.rate_limit,
            ErrorCategory::Timeout => t.timeout,
            ErrorCategory::Service => t.service,
        },
        None => config.failure_threshold,
    }
}

/// Circuit Breaker 내부 상태.
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_state_change: Instant,
    /// HalfOpen probe가 진행 중인지
    probe_in_flight: bool,
    /// 카테고리별 실패 카운트
    category_failures: HashMap<ErrorCategory, u32>,
    /// Circuit을 Open으로 전이시킨 카테고리
    tripped_by: Option<ErrorCategory>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_state_change: Instant::now(),
            probe_in_flight: false,
            category_failures: HashMap::new(),
            tripped_by: None,
        }
    }
}

/// Circuit Breaker.
///
/// 예산 식별자마다 하나씩 생성됩니다.
///
/// # Example
///
/// ```ignore
/// let cb = CircuitBreaker::new("market-data-provider", CircuitBreakerConfig::default());
/// let permit = cb.try_permit()?;
/// let quote = permit.run(adapter.fetch_price("AAPL")).await?;
/// ```
pub struct CircuitBreaker {
    /// 이름 (로깅 및 메트릭용)
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    /// Circuit Open 횟수
    open_count: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// 새 Circuit Breaker 생성.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            open_count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 현재 상태 반환.
    pub fn state(&self) -> CircuitState {
        let mut state = self.lock();
        self.maybe_transition_from_open(&mut state);
        state.state
    }

    /// 요청을 즉시 거부할 상태인지 확인합니다. probe 슬롯을 점유하지 않습니다.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// 요청이 허용되는지 확인.
    ///
    /// HalfOpen에서는 probe 하나만 허용하며, 허용된 호출자는 결과를 반드시 기록해야 합니다.
    pub fn is_allowed(&self) -> bool {
        let mut state = self.lock();
        self.maybe_transition_from_open(&mut state);

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    false
                } else {
                    state.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Open 상태가 끝날 때까지 남은 시간.
    pub fn retry_after(&self) -> Option<Duration> {
        let state = self.lock();
        if state.state != CircuitState::Open {
            return None;
        }
        let elapsed = state.last_state_change.elapsed();
        Some(self.config.reset_timeout().saturating_sub(elapsed))
    }

    fn open_error(&self) -> MarketError {
        MarketError::CircuitOpen {
            name: self.name.clone(),
            retry_after: self.retry_after(),
        }
    }

    /// 호출 허가를 얻습니다. 거부되면 `CircuitOpen`.
    ///
    /// HalfOpen에서 얻은 허가는 probe 슬롯을 점유하며, 결과 없이 drop 되면 슬롯을 반납합니다.
    pub fn try_permit(&self) -> Result<CallPermit<'_>> {
        if !self.is_allowed() {
            return Err(self.open_error());
        }
        Ok(CallPermit {
            breaker: self,
            armed: true,
        })
    }

    /// 성공 기록.
    ///
    /// HalfOpen 상태에서 성공하면 Closed로 전이합니다.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        state.probe_in_flight = false;

        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    self.transition_to(&mut state, CircuitState::Closed);
                    tracing::info!(
                        circuit_breaker = %self.name,
                        "Circuit breaker recovered: HalfOpen -> Closed"
                    );
                }
            }
            CircuitState::Closed => {
                state.failure_count = 0;
                state.category_failures.clear();
                state.tripped_by = None;
            }
            CircuitState::Open => {}
        }
    }

    /// 특정 카테고리의 실패 기록.
    ///
    /// 카테고리별 임계치가 없으면 `failure_threshold`를 씁니다.
    pub fn record_failure_with_category(&self, category: ErrorCategory) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        state.probe_in_flight = false;

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;

                let count = {
                    let entry = state.category_failures.entry(category).or_insert(0);
                    *entry += 1;
                    *entry
                };
                let threshold = threshold_for(&self.config, category);

                if count >= threshold {
                    state.tripped_by = Some(category);
                    self.transition_to(&mut state, CircuitState::Open);
                    self.open_count.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        circuit_breaker = %self.name,
                        category = %category,
                        failure_count = count,
                        threshold,
                        "Circuit breaker tripped: Closed -> Open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.tripped_by = Some(category);
                self.transition_to(&mut state, CircuitState::Open);
                self.open_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    circuit_breaker = %self.name,
                    category = %category,
                    "Circuit breaker recovery failed: HalfOpen -> Open"
                );
            }
            CircuitState::Open => {}
        }
    }

    /// 결과를 기록합니다. 제공자 상태와 무관한 에러는 probe 슬롯만 반납합니다.
    pub fn record_result<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => self.record_success(),
            Err(e) => match ErrorCategory::from_error(e) {
                Some(category) => self.record_failure_with_category(category),
                None => self.release_probe(),
            },
        }
    }

    fn release_probe(&self) {
        self.lock().probe_in_flight = false;
    }

    /// 수동으로 Circuit 리셋.
    pub fn reset(&self) {
        let mut state = self.lock();
        self.transition_to(&mut state, CircuitState::Closed);
        tracing::info!(circuit_breaker = %self.name, "Circuit breaker manually reset");
    }

    /// 강제로 Open 상태로 전이합니다.
    pub fn trip(&self) {
        let mut state = self.lock();
        if state.state != CircuitState::Open {
            self.transition_to(&mut state, CircuitState::Open);
            self.open_count.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(circuit_breaker = %self.name, "Circuit breaker manually opened");
        }
    }

    /// 메트릭 반환.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut state = self.lock();
        self.maybe_transition_from_open(&mut state);
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            open_count: self.open_count.load(Ordering::Relaxed),
            time_in_current_state_ms: state.last_state_change.elapsed().as_millis() as u64,
            category_failures: state.category_failures.clone(),
            tripped_by: state.tripped_by,
        }
    }

    /// Open 상태에서 타임아웃이 경과했으면 HalfOpen으로 전이.
    fn maybe_transition_from_open(&self, state: &mut BreakerState) {
        if state.state == CircuitState::Open
            && state.last_state_change.elapsed() >= self.config.reset_timeout()
        {
            self.transition_to(state, CircuitState::HalfOpen);
            tracing::info!(
                circuit_breaker = %self.name,
                "Circuit breaker timeout: Open -> HalfOpen"
            );
        }
    }

    fn transition_to(&self, state: &mut BreakerState, new_state: CircuitState) {
        state.state = new_state;
        state.last_state_change = Instant::now();
        state.probe_in_flight = false;

        match new_state {
            CircuitState::Closed => {
                state.failure_count = 0;
                state.success_count = 0;
                state.category_failures.clear();
                state.tripped_by = None;
            }
            CircuitState::HalfOpen => state.success_count = 0,
            CircuitState::Open => {}
        }
    }
}

/// 브레이커가 허용한 호출 한 건.
#[must_use]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl CallPermit<'_> {
    /// 작업을 실행하고 결과를 브레이커에 기록합니다.
    pub async fn run<T, Fut>(mut self, operation: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let result = operation.await;
        self.armed = false;
        self.breaker.record_result(&result);
        result
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_probe();
        }
    }
}

/// Circuit Breaker 메트릭.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    /// 현재 연속 실패 횟수
    pub failure_count: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    /// Circuit Open 횟수
    pub open_count: u64,
    pub time_in_current_state_ms: u64,
    /// 카테고리별 현재 실패 카운트
    pub category_failures: HashMap<ErrorCategory, u32>,
    /// Circuit을 Open으로 전이시킨 카테고리
    pub tripped_by: Option<ErrorCategory>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clarity_core::CategoryThresholds;

    fn config(failure_threshold: u32, reset_timeout_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            reset_timeout_ms,
            success_threshold: 1,
            category_thresholds: None,
        }
    }

    #[test]
    fn test_initial_state() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_allowed());
    }

    #[tokio::test]
    async fn test_opens_after_failures() {
        let cb = CircuitBreaker::new("test", config(3, 30_000));

        cb.record_failure_with_category(ErrorCategory::Network);
        cb.record_failure_with_category(ErrorCategory::Network);
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure_with_category(ErrorCategory::Network);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_allowed());
        assert!(cb.retry_after().is_some());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new("test", config(3, 30_000));

        cb.record_failure_with_category(ErrorCategory::Network);
        cb.record_failure_with_category(ErrorCategory::Network);
        cb.record_success();

        cb.record_failure_with_category(ErrorCategory::Network);
        cb.record_failure_with_category(ErrorCategory::Network);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let cb = CircuitBreaker::new("test", config(1, 50));
        cb.record_failure_with_category(ErrorCategory::Network);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(cb.is_allowed());
        // 두 번째 호출은 probe가 끝날 때까지 거부
        assert!(!cb.is_allowed());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("test", config(1, 50));
        cb.record_failure_with_category(ErrorCategory::Network);
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(cb.is_allowed());

        cb.record_failure_with_category(ErrorCategory::Network);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().open_count, 2);
        assert_eq!(cb.metrics().tripped_by, Some(ErrorCategory::Network));
    }

    #[tokio::test]
    async fn test_non_provider_errors_are_ignored() {
        let cb = CircuitBreaker::new("test", config(2, 30_000));
        let not_found: Result<()> = Err(MarketError::SymbolNotFound("ZZZZ".into()));
        cb.record_result(&not_found);
        cb.record_result(&not_found);
        cb.record_result(&not_found);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_rate_limit_category_is_more_tolerant() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                category_thresholds: Some(CategoryThresholds::default()),
                ..config(5, 30_000)
            },
        );
        let limited: Result<()> = Err(MarketError::ProviderRateLimited { retry_after: None });
        for _ in 0..9 {
            cb.record_result(&limited);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_result(&limited);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().tripped_by, Some(ErrorCategory::RateLimit));
    }

    #[tokio::test]
    async fn test_permit_refused_when_open() {
        let cb = CircuitBreaker::new("provider", config(1, 30_000));
        let failed: Result<u32> = cb
            .try_permit()
            .unwrap()
            .run(async { Err(MarketError::Timeout("slow".into())) })
            .await;
        assert!(failed.is_err());

        let rejected = cb.try_permit();
        assert!(matches!(rejected, Err(MarketError::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_permit_releases_probe() {
        let cb = CircuitBreaker::new("test", config(1, 50));
        cb.trip();
        tokio::time::advance(Duration::from_millis(60)).await;

        let permit = cb.try_permit();
        assert!(permit.is_ok());
        assert!(cb.try_permit().is_err());

        drop(permit);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let recovered: Result<u32> = cb.try_permit().unwrap().run(async { Ok(7) }).await;
        assert_eq!(recovered.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_manual_reset_and_trip() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        cb.trip();
        assert!(cb.is_open());
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
