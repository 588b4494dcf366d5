//! 다계층 캐시.
//!
//! 이 crate는 다음을 제공합니다:
//! - 공통 `CacheTier` trait과 로컬/Redis/PostgreSQL 계층
//! - 조회 fallback과 승격, 태그 무효화를 담당하는 `CacheOrchestrator`
//! - 계층별 적중 통계와 주기적 만료 정리

pub mod cleanup;
pub mod entry;
pub mod error;
pub mod orchestrator;
pub mod stats;
pub mod tier;

pub use cleanup::{CleanupHandle, MIN_CLEANUP_INTERVAL};
pub use entry::{tag_set, CacheSetOptions, StoredEntry, TierKind, TierSelector, MAX_TTL};
pub use error::{CacheError, Result};
pub use orchestrator::{CacheOrchestrator, CacheOrchestratorBuilder, WarmupReport, DEFAULT_TTL};
pub use stats::{CacheStats, TierStats};

// 계층 재내보내기
pub use tier::{CacheTier, LocalTier, LocalTierConfig, PostgresTier, RedisTier};
