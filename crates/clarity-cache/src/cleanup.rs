//! 만료 항목 주기 정리 작업.

use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::orchestrator::CacheOrchestrator;

/// 정리 주기의 하한.
pub const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// 백그라운드 정리 작업 핸들. drop 되면 작업도 중단됩니다.
#[derive(Debug)]
pub struct CleanupHandle {
    handle: JoinHandle<()>,
}

impl CleanupHandle {
    pub(crate) fn spawn(cache: Weak<CacheOrchestrator>, interval: Duration) -> Self {
        let interval = if interval < MIN_CLEANUP_INTERVAL {
            warn!(
                requested_ms = interval.as_millis() as u64,
                "Cleanup interval too short, using minimum"
            );
            MIN_CLEANUP_INTERVAL
        } else {
            interval
        };

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 첫 tick은 즉시 완료
            ticker.tick().await;

            loop {
                ticker.tick().await;
                // 오케스트레이터가 사라지면 종료
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired().await;
                if purged > 0 {
                    debug!(purged, "Expired cache entries swept");
                }
            }
            info!("Cache cleanup task stopped");
        });

        Self { handle }
    }

    /// 작업이 끝났는지 확인합니다.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// 작업을 즉시 중단합니다.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::CacheSetOptions;
    use crate::tier::{CacheTier, LocalTier};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired_without_access() {
        let local = Arc::new(LocalTier::default());
        let cache = Arc::new(
            CacheOrchestrator::builder()
                .with_tier(local.clone())
                .build(),
        );
        let options = CacheSetOptions::new(Duration::from_millis(100));
        cache.set("short", &1, &options).await.unwrap();

        let _handle = cache.spawn_cleanup(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(local.physical_len().await, 0);
        assert_eq!(local.len().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_clamped() {
        let local = Arc::new(LocalTier::default());
        let cache = Arc::new(
            CacheOrchestrator::builder()
                .with_tier(local.clone())
                .build(),
        );
        let options = CacheSetOptions::new(Duration::from_millis(100));
        cache.set("short", &1, &options).await.unwrap();

        let handle = cache.spawn_cleanup(Duration::ZERO);
        tokio::time::sleep(MIN_CLEANUP_INTERVAL + Duration::from_millis(500)).await;

        assert!(!handle.is_finished());
        assert_eq!(local.physical_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_stops_when_cache_dropped() {
        let cache = Arc::new(
            CacheOrchestrator::builder()
                .with_tier(Arc::new(LocalTier::default()))
                .build(),
        );
        let handle = cache.spawn_cleanup(Duration::from_secs(1));
        drop(cache);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(handle.is_finished());
    }
}
