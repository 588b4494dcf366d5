//! 코어 에러 타입.

use thiserror::Error;

/// 설정 및 부트스트랩 단계의 에러.
#[derive(Debug, Error)]
pub enum CoreError {
    /// 설정 소스 로드/역직렬화 실패
    #[error("설정 로드 실패: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// 값은 읽었지만 사용할 수 없는 설정
    #[error("잘못된 설정: {0}")]
    InvalidConfig(String),

    /// 로깅 초기화 실패
    #[error("로깅 초기화 실패: {0}")]
    Logging(String),
}

/// 코어 작업을 위한 Result 타입.
pub type CoreResult<T> = Result<T, CoreError>;
