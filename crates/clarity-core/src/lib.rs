//! # Clarity Core
//!
//! 시장 데이터 캐시/페처 서브시스템 전반에서 공유하는 기본 타입을 제공합니다:
//! - 가격, 배당, 기업 정보 레코드와 출처(provenance) 태그
//! - 배치 요청 타입
//! - 계층형 설정 관리
//! - 로깅 인프라

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::*;
pub use error::{CoreError, CoreResult};
pub use logging::*;
pub use types::*;
