//! 캐시 모듈 오류 타입.

use thiserror::Error;

use crate::entry::TierKind;

/// 캐시 관련 오류.
#[derive(Debug, Error)]
pub enum CacheError {
    /// 계층 연결 오류
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// 쿼리 실행 오류
    #[error("Query error: {0}")]
    QueryError(String),

    /// 직렬화/역직렬화 오류
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Redis 명령 오류
    #[error("Redis error: {0}")]
    RedisError(String),

    /// 마이그레이션 오류
    #[error("Migration error: {0}")]
    MigrationError(String),

    /// 계층 쓰기 실패
    #[error("Write to {tier} tier failed: {message}")]
    TierWriteFailure { tier: TierKind, message: String },

    /// 로컬 계층 예산보다 큰 항목
    #[error("Entry too large: {key} ({size} bytes > {limit} bytes)")]
    EntryTooLarge {
        key: String,
        size: usize,
        limit: usize,
    },

    /// 어떤 계층도, fallback도 값을 만들지 못함
    #[error("No value available for {key}: {reason}")]
    Unavailable { key: String, reason: String },

    /// 연결 풀 소진
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// 타임아웃 오류
    #[error("Operation timeout: {0}")]
    Timeout(String),
}

impl CacheError {
    /// 재시도하면 성공할 수 있는 오류인지 확인.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::ConnectionError(_)
                | CacheError::RedisError(_)
                | CacheError::PoolExhausted
                | CacheError::Timeout(_)
        )
    }
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => CacheError::PoolExhausted,
            sqlx::Error::Io(e) => CacheError::ConnectionError(e.to_string()),
            sqlx::Error::Database(db_err) => CacheError::QueryError(db_err.message().to_string()),
            _ => CacheError::QueryError(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CacheError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CacheError::MigrationError(err.to_string())
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CacheError::Timeout(err.to_string())
        } else if err.is_connection_dropped() || err.is_connection_refusal() {
            CacheError::ConnectionError(err.to_string())
        } else {
            CacheError::RedisError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
