//! 오케스트레이터 통합 테스트.
//!
//! Redis/PostgreSQL 대신 종류를 지정할 수 있는 메모리 계층을 사용합니다.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clarity_cache::{
    tag_set, CacheError, CacheOrchestrator, CacheSetOptions, CacheTier, LocalTier, Result,
    StoredEntry, TierKind, TierSelector, MAX_TTL,
};

/// 다른 계층 역할을 하는 메모리 계층. 읽기/쓰기 실패를 주입할 수 있습니다.
struct MemoryTier {
    kind: TierKind,
    inner: LocalTier,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryTier {
    fn new(kind: TierKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            inner: LocalTier::default(),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        })
    }

    fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn unavailable(&self) -> CacheError {
        CacheError::ConnectionError(format!("{} tier unreachable", self.kind))
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn kind(&self) -> TierKind {
        self.kind
    }

    async fn get(&self, key: &str) -> Result<Option<StoredEntry>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(self.unavailable());
        }
        self.inner.get(key).await
    }

    async fn set(&self, entry: &StoredEntry) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(self.unavailable());
        }
        self.inner.set(entry).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn invalidate_tags(&self, tags: &BTreeSet<String>) -> Result<usize> {
        self.inner.invalidate_tags(tags).await
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.inner.purge_expired().await
    }

    async fn len(&self) -> Result<usize> {
        self.inner.len().await
    }

    async fn clear(&self) -> Result<usize> {
        self.inner.clear().await
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.fail_reads.load(Ordering::SeqCst))
    }
}

struct Fixture {
    cache: CacheOrchestrator,
    local: Arc<MemoryTier>,
    distributed: Arc<MemoryTier>,
    persistent: Arc<MemoryTier>,
}

fn three_tiers() -> Fixture {
    let local = MemoryTier::new(TierKind::Local);
    let distributed = MemoryTier::new(TierKind::Distributed);
    let persistent = MemoryTier::new(TierKind::Persistent);

    // 추가 순서와 상관없이 선호 순서로 정렬됨
    let cache = CacheOrchestrator::builder()
        .with_tier(persistent.clone())
        .with_tier(local.clone())
        .with_tier(distributed.clone())
        .build();

    Fixture {
        cache,
        local,
        distributed,
        persistent,
    }
}

fn minute() -> CacheSetOptions {
    CacheSetOptions::new(Duration::from_secs(60))
}

#[tokio::test]
async fn test_tiers_are_ordered_by_preference() {
    let fx = three_tiers();
    assert_eq!(
        fx.cache.tier_kinds(),
        vec![TierKind::Local, TierKind::Distributed, TierKind::Persistent]
    );
}

#[tokio::test]
async fn test_promotion_from_persistent_to_local() {
    let fx = three_tiers();
    let options = minute().tiers(TierSelector::Persistent);
    fx.cache.set("price:AAPL", &150.25_f64, &options).await.unwrap();
    assert!(fx.local.get("price:AAPL").await.unwrap().is_none());

    let first: Option<f64> = fx.cache.get("price:AAPL").await;
    assert_eq!(first, Some(150.25));

    let second: Option<f64> = fx.cache.get("price:AAPL").await;
    assert_eq!(second, Some(150.25));

    let stats = fx.cache.stats().await;
    assert_eq!(stats.hits_for(TierKind::Persistent), 1);
    assert_eq!(stats.hits_for(TierKind::Local), 1);
    assert_eq!(stats.total_hits, 2);

    // 승격된 항목은 원래 저장 시각을 유지
    let promoted = fx.distributed.get("price:AAPL").await.unwrap().unwrap();
    let original = fx.persistent.get("price:AAPL").await.unwrap().unwrap();
    assert_eq!(promoted.stored_at, original.stored_at);
    assert_eq!(promoted.ttl_ms, original.ttl_ms);
}

#[tokio::test]
async fn test_tag_invalidation_across_tiers() {
    let fx = three_tiers();
    fx.cache
        .set("price:AAPL", &1, &minute().tag("prices"))
        .await
        .unwrap();
    fx.cache
        .set("dividends:AAPL", &2, &minute().tag("dividends"))
        .await
        .unwrap();

    fx.cache.invalidate_by_tags(&tag_set(["prices"])).await;

    for tier in [&fx.local, &fx.distributed, &fx.persistent] {
        assert!(tier.get("price:AAPL").await.unwrap().is_none());
        assert!(tier.get("dividends:AAPL").await.unwrap().is_some());
    }
}

#[tokio::test]
async fn test_round_trip_struct() {
    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Quote {
        symbol: String,
        price: String,
        tags: Vec<String>,
    }

    let fx = three_tiers();
    let quote = Quote {
        symbol: "MSFT".to_string(),
        price: "410.12".to_string(),
        tags: vec!["a".to_string()],
    };
    fx.cache
        .set("quote:MSFT", &quote, &minute().tiers(TierSelector::All))
        .await
        .unwrap();

    let cached: Option<Quote> = fx.cache.get("quote:MSFT").await;
    assert_eq!(cached, Some(quote));
}

#[tokio::test]
async fn test_distributed_read_failure_falls_through() {
    let fx = three_tiers();
    fx.cache
        .set("k", &"v", &minute().tiers(TierSelector::Persistent))
        .await
        .unwrap();
    fx.distributed.fail_reads(true);

    let value: Option<String> = fx.cache.get("k").await;
    assert_eq!(value.as_deref(), Some("v"));

    let stats = fx.cache.stats().await;
    let distributed = stats.tier(TierKind::Distributed).unwrap();
    assert_eq!(distributed.errors, 1);
    assert_eq!(stats.distributed_connected, Some(false));
}

#[tokio::test]
async fn test_persistent_write_failure_surfaces() {
    let fx = three_tiers();
    fx.persistent.fail_writes(true);

    let result = fx.cache.set("k", &1, &minute()).await;
    assert!(matches!(
        result,
        Err(CacheError::TierWriteFailure {
            tier: TierKind::Persistent,
            ..
        })
    ));
    // 나머지 계층에는 저장됨
    assert!(fx.local.get("k").await.unwrap().is_some());
}

#[tokio::test]
async fn test_local_and_distributed_write_failures_are_swallowed() {
    let fx = three_tiers();
    fx.local.fail_writes(true);
    fx.distributed.fail_writes(true);

    fx.cache.set("k", &1, &minute()).await.unwrap();
    let value: Option<i32> = fx.cache.get("k").await;
    assert_eq!(value, Some(1));
}

#[tokio::test]
async fn test_get_from_respects_selector() {
    let fx = three_tiers();
    fx.cache
        .set("k", &1, &minute().tiers(TierSelector::Persistent))
        .await
        .unwrap();

    let local_only: Option<i32> = fx.cache.get_from("k", TierSelector::Local).await;
    assert!(local_only.is_none());

    let persistent_only: Option<i32> = fx.cache.get_from("k", TierSelector::Persistent).await;
    assert_eq!(persistent_only, Some(1));
    // 선택에 포함되지 않은 계층으로는 승격하지 않음
    assert!(fx.local.get("k").await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_removes_from_every_tier() {
    let fx = three_tiers();
    fx.cache.set("k", &1, &minute()).await.unwrap();

    assert!(fx.cache.delete("k").await);
    assert!(!fx.cache.exists("k").await);
    assert!(fx.persistent.get("k").await.unwrap().is_none());
}

#[tokio::test]
async fn test_stats_total_keys_and_memory() {
    let fx = three_tiers();
    fx.cache.set("a", &1, &minute()).await.unwrap();
    fx.cache
        .set("b", &2, &minute().tiers(TierSelector::Local))
        .await
        .unwrap();

    let stats = fx.cache.stats().await;
    assert_eq!(stats.total_keys, 4);
    assert_eq!(stats.tier(TierKind::Local).unwrap().entries, Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_ttl_expiry_through_orchestrator() {
    let cache = CacheOrchestrator::builder()
        .with_tier(Arc::new(LocalTier::default()))
        .build();
    let options = CacheSetOptions::new(Duration::from_millis(100));
    cache.set("k", &1, &options).await.unwrap();

    tokio::time::advance(Duration::from_millis(50)).await;
    assert_eq!(cache.get::<i32>("k").await, Some(1));

    tokio::time::advance(Duration::from_millis(100)).await;
    assert_eq!(cache.get::<i32>("k").await, None);
}

#[tokio::test]
async fn test_unbounded_ttl_is_clamped_in_every_tier() {
    let fx = three_tiers();

    fx.cache
        .set("forever", "kept", &CacheSetOptions::new(Duration::MAX))
        .await
        .unwrap();

    assert_eq!(fx.cache.get::<String>("forever").await, Some("kept".to_string()));
    for tier in [&fx.local, &fx.distributed, &fx.persistent] {
        let stored = tier.get("forever").await.unwrap().unwrap();
        assert_eq!(stored.ttl(), MAX_TTL);
    }
}
