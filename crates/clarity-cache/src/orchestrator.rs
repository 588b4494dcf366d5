//! 다계층 캐시 오케스트레이터.
//!
//! 로컬 → 분산 → 영속 순서로 조회하고, 아래 계층에서 찾은 값은 더 빠른 계층으로
//! 승격합니다. 계층 오류는 해당 계층의 미스로 취급하고 조회는 계속 진행합니다.
//!
//! # 사용 예시
//!
//! ```ignore
//! let cache = CacheOrchestrator::builder()
//!     .with_tier(Arc::new(LocalTier::default()))
//!     .build();
//!
//! let options = CacheSetOptions::new(Duration::from_secs(60)).tag("prices");
//! cache.set("price:AAPL", &record, &options).await?;
//! let cached: Option<PriceRecord> = cache.get("price:AAPL").await;
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::cleanup::CleanupHandle;
use crate::entry::{CacheSetOptions, StoredEntry, TierKind, TierSelector};
use crate::error::{CacheError, Result};
use crate::stats::{hit_rate, CacheStats, TierCounters, TierStats};
use crate::tier::CacheTier;

/// 기본 TTL (5분).
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// `warmup` 결과.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmupReport {
    /// 저장에 성공한 항목 수
    pub stored: usize,
    /// 저장에 실패한 키
    pub failed: Vec<String>,
}

/// 계층 목록을 조합하는 캐시 진입점.
pub struct CacheOrchestrator {
    /// 선호 순서로 정렬된 계층
    tiers: Vec<Arc<dyn CacheTier>>,
    counters: [TierCounters; 3],
    lookups_hit: AtomicU64,
    lookups_missed: AtomicU64,
    default_ttl: Duration,
}

impl fmt::Debug for CacheOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOrchestrator")
            .field("tiers", &self.tier_kinds())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

/// [`CacheOrchestrator`] 빌더.
#[derive(Default)]
pub struct CacheOrchestratorBuilder {
    tiers: Vec<Arc<dyn CacheTier>>,
    default_ttl: Option<Duration>,
}

impl CacheOrchestratorBuilder {
    /// 계층을 추가합니다. 같은 종류가 이미 있으면 교체합니다.
    pub fn with_tier(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.tiers.retain(|t| t.kind() != tier.kind());
        self.tiers.push(tier);
        self
    }

    /// 계층이 있으면 추가합니다.
    pub fn with_optional_tier(self, tier: Option<Arc<dyn CacheTier>>) -> Self {
        match tier {
            Some(tier) => self.with_tier(tier),
            None => self,
        }
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn build(mut self) -> CacheOrchestrator {
        self.tiers.sort_by_key(|t| t.kind());
        let orchestrator = CacheOrchestrator {
            tiers: self.tiers,
            counters: Default::default(),
            lookups_hit: AtomicU64::new(0),
            lookups_missed: AtomicU64::new(0),
            default_ttl: self.default_ttl.unwrap_or(DEFAULT_TTL),
        };
        info!(tiers = ?orchestrator.tier_kinds(), "Cache orchestrator ready");
        orchestrator
    }
}

impl CacheOrchestrator {
    pub fn builder() -> CacheOrchestratorBuilder {
        CacheOrchestratorBuilder::default()
    }

    /// 붙어 있는 계층 종류 (선호 순서).
    pub fn tier_kinds(&self) -> Vec<TierKind> {
        self.tiers.iter().map(|t| t.kind()).collect()
    }

    pub fn has_tier(&self, kind: TierKind) -> bool {
        self.tiers.iter().any(|t| t.kind() == kind)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn counters(&self, kind: TierKind) -> &TierCounters {
        &self.counters[kind.index()]
    }

    /// 모든 계층에서 값을 조회합니다.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_from(key, TierSelector::All).await
    }

    /// 선택된 계층에서만 값을 조회합니다.
    ///
    /// 아래 계층에서 찾으면 선택에 포함된 더 빠른 계층으로 원래 남은 TTL 그대로 승격합니다.
    /// 역직렬화할 수 없는 항목은 해당 계층에서 삭제하고 다음 계층을 확인합니다.
    #[instrument(skip(self), level = "debug")]
    pub async fn get_from<T: DeserializeOwned>(&self, key: &str, selector: TierSelector) -> Option<T> {
        for (position, tier) in self.tiers.iter().enumerate() {
            let kind = tier.kind();
            if !selector.includes(kind) {
                continue;
            }
            let counters = self.counters(kind);

            match tier.get(key).await {
                Ok(Some(entry)) => match serde_json::from_str::<T>(&entry.payload) {
                    Ok(value) => {
                        counters.hit();
                        self.lookups_hit.fetch_add(1, Ordering::Relaxed);
                        debug!(key, tier = %kind, "Cache hit");
                        self.promote(&entry, position, selector).await;
                        return Some(value);
                    }
                    Err(e) => {
                        counters.error();
                        warn!(key, tier = %kind, error = %e, "Discarding undecodable cache entry");
                        if let Err(e) = tier.delete(key).await {
                            warn!(key, tier = %kind, error = %e, "Failed to delete undecodable entry");
                        }
                    }
                },
                Ok(None) => counters.miss(),
                Err(e) => {
                    counters.error();
                    warn!(key, tier = %kind, error = %e, "Cache tier read failed, treating as miss");
                }
            }
        }

        self.lookups_missed.fetch_add(1, Ordering::Relaxed);
        debug!(key, "Cache miss");
        None
    }

    async fn promote(&self, entry: &StoredEntry, found_at: usize, selector: TierSelector) {
        for tier in &self.tiers[..found_at] {
            let kind = tier.kind();
            if !selector.includes(kind) {
                continue;
            }
            if let Err(e) = tier.set(entry).await {
                self.counters(kind).error();
                warn!(key = %entry.key, tier = %kind, error = %e, "Cache promotion failed");
            }
        }
    }

    /// 값을 조회하고, 없으면 `fallback`으로 만들어 저장한 뒤 반환합니다.
    ///
    /// `fallback`이 실패하면 [`CacheError::Unavailable`]을 반환합니다.
    /// fallback 결과를 저장하지 못한 경우는 로그만 남깁니다.
    pub async fn get_or_fetch<T, F, Fut, E>(
        &self,
        key: &str,
        options: Option<CacheSetOptions>,
        fallback: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
    {
        if let Some(value) = self.get::<T>(key).await {
            return Ok(value);
        }

        let value = fallback().await.map_err(|e| CacheError::Unavailable {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let options = options.unwrap_or_else(|| CacheSetOptions::new(self.default_ttl));
        if let Err(e) = self.set(key, &value, &options).await {
            warn!(key, error = %e, "Failed to store fallback value");
        }
        Ok(value)
    }

    /// 선택된 모든 계층에 값을 저장합니다.
    ///
    /// 로컬/분산 계층 실패는 로그만 남기고, 영속 계층 실패는 [`CacheError::TierWriteFailure`]로 반환합니다.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: &CacheSetOptions,
    ) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        let entry = StoredEntry::new(key, payload, options.ttl, options.tags.clone());
        self.set_entry(&entry, options.tiers).await
    }

    /// 이미 직렬화된 항목을 저장합니다.
    pub async fn set_entry(&self, entry: &StoredEntry, selector: TierSelector) -> Result<()> {
        let mut persistent_failure = None;

        for tier in &self.tiers {
            let kind = tier.kind();
            if !selector.includes(kind) {
                continue;
            }
            if let Err(e) = tier.set(entry).await {
                self.counters(kind).error();
                warn!(key = %entry.key, tier = %kind, error = %e, "Cache tier write failed");
                if kind == TierKind::Persistent {
                    persistent_failure = Some(CacheError::TierWriteFailure {
                        tier: kind,
                        message: e.to_string(),
                    });
                }
            }
        }

        match persistent_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// 모든 계층에서 키를 삭제합니다. 하나라도 삭제했으면 `true`.
    pub async fn delete(&self, key: &str) -> bool {
        let mut deleted = false;
        for tier in &self.tiers {
            match tier.delete(key).await {
                Ok(removed) => deleted |= removed,
                Err(e) => {
                    self.counters(tier.kind()).error();
                    warn!(key, tier = %tier.kind(), error = %e, "Cache delete failed");
                }
            }
        }
        deleted
    }

    /// 선호 순서대로 확인해 살아 있는 항목이 있는지 반환합니다.
    pub async fn exists(&self, key: &str) -> bool {
        for tier in &self.tiers {
            match tier.exists(key).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    self.counters(tier.kind()).error();
                    warn!(key, tier = %tier.kind(), error = %e, "Cache exists check failed");
                }
            }
        }
        false
    }

    /// 태그가 하나라도 겹치는 항목을 모든 계층에서 삭제합니다.
    ///
    /// 반환값은 계층별로 삭제된 항목 수의 합입니다.
    #[instrument(skip(self))]
    pub async fn invalidate_by_tags(&self, tags: &BTreeSet<String>) -> usize {
        if tags.is_empty() {
            return 0;
        }
        let mut removed = 0;
        for tier in &self.tiers {
            match tier.invalidate_tags(tags).await {
                Ok(count) => removed += count,
                Err(e) => {
                    self.counters(tier.kind()).error();
                    warn!(tier = %tier.kind(), error = %e, "Tag invalidation failed");
                }
            }
        }
        info!(removed, "Invalidated cache entries by tag");
        removed
    }

    /// 미리 계산된 값을 일괄 저장합니다.
    pub async fn warmup<T, I>(&self, items: I, options: &CacheSetOptions) -> WarmupReport
    where
        T: Serialize,
        I: IntoIterator<Item = (String, T)>,
    {
        let mut report = WarmupReport::default();
        for (key, value) in items {
            match self.set(&key, &value, options).await {
                Ok(()) => report.stored += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Warmup entry failed");
                    report.failed.push(key);
                }
            }
        }
        info!(stored = report.stored, failed = report.failed.len(), "Cache warmup finished");
        report
    }

    /// 모든 계층의 항목을 삭제합니다.
    pub async fn clear(&self) -> usize {
        let mut removed = 0;
        for tier in &self.tiers {
            match tier.clear().await {
                Ok(count) => removed += count,
                Err(e) => {
                    self.counters(tier.kind()).error();
                    warn!(tier = %tier.kind(), error = %e, "Cache clear failed");
                }
            }
        }
        info!(removed, "Cache cleared");
        removed
    }

    /// 모든 계층에서 만료 항목을 정리합니다.
    pub async fn purge_expired(&self) -> usize {
        let mut purged = 0;
        for tier in &self.tiers {
            match tier.purge_expired().await {
                Ok(count) => purged += count,
                Err(e) => {
                    self.counters(tier.kind()).error();
                    warn!(tier = %tier.kind(), error = %e, "Expired entry sweep failed");
                }
            }
        }
        purged
    }

    /// 계층별 적중/미스, 메모리 추정치, 연결 상태를 모읍니다.
    pub async fn stats(&self) -> CacheStats {
        let mut tiers = Vec::with_capacity(self.tiers.len());
        let mut local_memory_bytes = None;
        let mut distributed_connected = None;
        let mut total_keys = 0;

        for tier in &self.tiers {
            let kind = tier.kind();
            let (hits, misses, errors) = self.counters(kind).snapshot();
            let healthy = tier.health_check().await.unwrap_or(false);
            let entries = tier.len().await.ok();
            total_keys += entries.unwrap_or(0);

            match kind {
                TierKind::Local => local_memory_bytes = tier.memory_usage().await,
                TierKind::Distributed => distributed_connected = Some(healthy),
                TierKind::Persistent => {}
            }

            tiers.push(TierStats {
                kind,
                hits,
                misses,
                errors,
                entries,
                healthy,
            });
        }

        let total_hits = self.lookups_hit.load(Ordering::Relaxed);
        let total_misses = self.lookups_missed.load(Ordering::Relaxed);

        CacheStats {
            tiers,
            total_hits,
            total_misses,
            hit_rate: hit_rate(total_hits, total_misses),
            local_memory_bytes,
            distributed_connected,
            total_keys,
        }
    }

    /// 주기적으로 만료 항목을 정리하는 백그라운드 작업을 시작합니다.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> CleanupHandle {
        CleanupHandle::spawn(Arc::downgrade(self), interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::tag_set;
    use crate::tier::LocalTier;

    fn local_only() -> CacheOrchestrator {
        CacheOrchestrator::builder()
            .with_tier(Arc::new(LocalTier::default()))
            .build()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let cache = local_only();
        let options = CacheSetOptions::new(Duration::from_secs(60));
        cache.set("k", &vec![1, 2, 3], &options).await.unwrap();

        let value: Option<Vec<i32>> = cache.get("k").await;
        assert_eq!(value, Some(vec![1, 2, 3]));
        assert!(cache.exists("k").await);
    }

    #[tokio::test]
    async fn test_miss_without_tiers() {
        let cache = CacheOrchestrator::builder().build();
        let value: Option<String> = cache.get("missing").await;
        assert!(value.is_none());

        let stats = cache.stats().await;
        assert_eq!(stats.total_misses, 1);
        assert_eq!(stats.total_keys, 0);
    }

    #[tokio::test]
    async fn test_wrong_type_is_treated_as_miss_and_dropped() {
        let cache = local_only();
        let options = CacheSetOptions::new(Duration::from_secs(60));
        cache.set("k", "text", &options).await.unwrap();

        let value: Option<u64> = cache.get("k").await;
        assert!(value.is_none());
        assert!(!cache.exists("k").await);
    }

    #[tokio::test]
    async fn test_get_or_fetch_stores_fallback_value() {
        let cache = local_only();
        let value: u32 = cache
            .get_or_fetch("k", None, || async { Ok::<_, String>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        // 두 번째 호출은 캐시에서 응답
        let again: u32 = cache
            .get_or_fetch("k", None, || async { Err::<u32, _>("should not run") })
            .await
            .unwrap();
        assert_eq!(again, 7);
    }

    #[tokio::test]
    async fn test_get_or_fetch_fallback_failure_is_unavailable() {
        let cache = local_only();
        let result: Result<u32> = cache
            .get_or_fetch("k", None, || async { Err::<u32, _>("origin down") })
            .await;
        assert!(matches!(result, Err(CacheError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_warmup_and_tag_invalidation() {
        let cache = local_only();
        let options = CacheSetOptions::new(Duration::from_secs(60)).tag("prices");
        let report = cache
            .warmup(vec![("a".to_string(), 1), ("b".to_string(), 2)], &options)
            .await;
        assert_eq!(report.stored, 2);
        assert!(report.failed.is_empty());

        let removed = cache.invalidate_by_tags(&tag_set(["prices"])).await;
        assert_eq!(removed, 2);
        assert!(!cache.exists("a").await);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let cache = local_only();
        let options = CacheSetOptions::new(Duration::from_secs(60));
        cache.set("a", &1, &options).await.unwrap();
        cache.set("b", &2, &options).await.unwrap();

        assert!(cache.delete("a").await);
        assert!(!cache.delete("a").await);
        assert_eq!(cache.clear().await, 1);
    }
}
