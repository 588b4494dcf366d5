//! 시장 데이터 에러 타입.

use std::time::Duration;
use thiserror::Error;

use clarity_cache::CacheError;

/// 시장 데이터 관련 에러.
#[derive(Debug, Clone, Error)]
pub enum MarketError {
    /// 제공자 자격증명 없음 (합성 데이터 모드)
    #[error("Provider credential missing: {0}")]
    ConfigurationMissing(String),

    /// 조합할 수 없는 설정
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// 내부 요청 예산 대기열 초과
    #[error("Rate budget '{identifier}' exhausted, retry after {retry_after:?}")]
    RateLimitExceeded {
        identifier: String,
        retry_after: Duration,
    },

    /// 제공자가 요청 한도 초과를 응답함 (HTTP 429)
    #[error("Provider rate limited (retry after {retry_after:?})")]
    ProviderRateLimited { retry_after: Option<Duration> },

    /// 네트워크/연결 에러
    #[error("Network error: {0}")]
    NetworkError(String),

    /// 타임아웃
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// 제공자 서버 에러 (5xx 등)
    #[error("Provider error {status}: {message}")]
    ServiceError { status: u16, message: String },

    /// 심볼을 찾을 수 없음
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    /// 유효하지 않은 심볼 입력
    #[error("Invalid symbol: {0:?}")]
    InvalidSymbol(String),

    /// 인증/권한 에러
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 응답 파싱 에러
    #[error("Parse error: {0}")]
    ParseError(String),

    /// 서킷 브레이커가 호출을 거부함
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen {
        name: String,
        retry_after: Option<Duration>,
    },

    /// 캐시 에러
    #[error("Cache error: {0}")]
    Cache(String),
}

impl MarketError {
    /// 재시도 가능한 에러인지 확인.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MarketError::RateLimitExceeded { .. }
                | MarketError::ProviderRateLimited { .. }
                | MarketError::NetworkError(_)
                | MarketError::Timeout(_)
                | MarketError::ServiceError { .. }
                | MarketError::CircuitOpen { .. }
        )
    }

    /// 어댑터 계층에서 즉시 재시도할 일시적 에러인지 확인.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MarketError::NetworkError(_) | MarketError::Timeout(_)
        ) || matches!(self, MarketError::ServiceError { status, .. } if *status >= 500)
    }

    /// 권장 재시도 대기 시간(밀리초) 반환.
    pub fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            MarketError::RateLimitExceeded { retry_after, .. } => {
                Some(retry_after.as_millis() as u64)
            }
            MarketError::ProviderRateLimited { retry_after } => Some(
                retry_after
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(60_000),
            ),
            MarketError::CircuitOpen { retry_after, .. } => {
                retry_after.map(|d| d.as_millis() as u64)
            }
            MarketError::NetworkError(_) => Some(1000),
            MarketError::Timeout(_) => Some(500),
            MarketError::ServiceError { .. } => Some(2000),
            _ => None,
        }
    }

    /// 인증 에러인지 확인.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, MarketError::Unauthorized(_))
    }
}

impl From<reqwest::Error> for MarketError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MarketError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            MarketError::NetworkError(err.to_string())
        } else if err.is_decode() {
            MarketError::ParseError(err.to_string())
        } else if let Some(status) = err.status() {
            MarketError::ServiceError {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            MarketError::NetworkError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for MarketError {
    fn from(err: serde_json::Error) -> Self {
        MarketError::ParseError(err.to_string())
    }
}

impl From<CacheError> for MarketError {
    fn from(err: CacheError) -> Self {
        MarketError::Cache(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MarketError>;
