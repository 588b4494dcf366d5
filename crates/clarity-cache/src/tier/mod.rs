//! 캐시 계층 trait 및 구현.
//!
//! 모든 계층은 미스일 때 에러 대신 `Ok(None)`을 반환하므로, 오케스트레이터는
//! 계층 목록을 순회하는 것만으로 fallback을 구성합니다.

pub mod local;
pub mod postgres;
pub mod redis;

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::entry::{StoredEntry, TierKind};
use crate::error::Result;

pub use self::local::{LocalTier, LocalTierConfig};
pub use self::postgres::PostgresTier;
pub use self::redis::RedisTier;

/// 저장 매체 하나에 대한 공통 인터페이스.
///
/// 각 계층은 TTL 만료를 독립적으로 적용합니다.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// 계층 종류.
    fn kind(&self) -> TierKind;

    /// 살아 있는 항목을 조회합니다.
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>>;

    /// 항목을 저장합니다. 같은 키가 있으면 덮어씁니다.
    async fn set(&self, entry: &StoredEntry) -> Result<()>;

    /// 항목을 삭제합니다. 삭제된 것이 있으면 `true`.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// 살아 있는 항목이 있는지 확인합니다.
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// 태그가 하나라도 겹치는 항목을 모두 삭제합니다.
    async fn invalidate_tags(&self, tags: &BTreeSet<String>) -> Result<usize>;

    /// 만료된 항목을 물리적으로 제거합니다.
    async fn purge_expired(&self) -> Result<usize>;

    /// 살아 있는 키 수.
    async fn len(&self) -> Result<usize>;

    /// 이 계층이 소유한 항목을 모두 삭제합니다.
    async fn clear(&self) -> Result<usize>;

    /// 계층 도달 가능 여부.
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    /// 추정 메모리 사용량 (로컬 계층만 의미 있음).
    async fn memory_usage(&self) -> Option<usize> {
        None
    }
}
