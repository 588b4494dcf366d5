//! 요청 예산 안에서 동작하는 배치 시장 데이터 페처.
//!
//! 이 crate는 다음을 제공합니다:
//! - 이름 있는 예산별 sliding-log rate limiter와 우선순위 대기열
//! - 제공자 장애를 감지하는 서킷 브레이커
//! - HTTP 제공자 어댑터와 결정적 합성 데이터 생성기
//! - 캐시 우선 배치 조회 서비스

pub mod circuit_breaker;
pub mod context;
pub mod error;
pub mod http;
pub mod origin;
pub mod rate_limiter;
pub mod service;
pub mod synthetic;

pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerMetrics, CircuitState, ErrorCategory,
};
pub use context::MarketContext;
pub use error::{MarketError, Result};
pub use http::HttpOriginAdapter;
pub use origin::{ConnectionProbe, OriginAdapter, PriceQuote};
pub use rate_limiter::{BudgetSnapshot, RateBudgetConfig, RateLimiter};
pub use service::{
    BatchRecord, BatchResult, DataMode, HealthStatus, MarketDataService, ServiceHealth,
    SymbolError, TAG_COMPANY_INFO, TAG_DIVIDENDS, TAG_PRICES, TAG_REAL_TIME, WARMUP_PRIORITY,
};
pub use synthetic::SyntheticGenerator;
