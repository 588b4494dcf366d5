//! 설정에서 캐시, 예산, 제공자를 조립한 공유 컨텍스트.
//!
//! 분산/영속 계층은 URL이 설정된 경우에만 연결하며, 연결에 실패하면 경고를 남기고
//! 해당 계층 없이 동작합니다. 자격증명이 없으면 제공자 없이 합성 데이터 모드로 시작합니다.

use std::sync::Arc;
use tracing::{info, warn};

use clarity_cache::{
    CacheOrchestrator, CacheTier, CleanupHandle, LocalTier, LocalTierConfig, PostgresTier,
    RedisTier,
};
use clarity_core::AppConfig;

use crate::error::{MarketError, Result};
use crate::http::HttpOriginAdapter;
use crate::origin::OriginAdapter;
use crate::rate_limiter::RateLimiter;
use crate::service::MarketDataService;

/// 조립된 서브시스템.
pub struct MarketContext {
    pub config: Arc<AppConfig>,
    pub cache: Arc<CacheOrchestrator>,
    pub limiter: Arc<RateLimiter>,
    pub service: Arc<MarketDataService>,
    /// drop 시 정리 태스크도 중단됩니다
    cleanup: CleanupHandle,
}

impl MarketContext {
    /// 설정대로 모든 구성 요소를 만듭니다.
    pub async fn build(config: AppConfig) -> Result<Self> {
        let origin: Option<Arc<dyn OriginAdapter>> = if config.provider.has_credential() {
            Some(Arc::new(HttpOriginAdapter::new(&config.provider)?))
        } else {
            None
        };
        Self::build_with_origin(config, origin).await
    }

    /// 제공자 어댑터를 직접 지정해 만듭니다.
    pub async fn build_with_origin(
        config: AppConfig,
        origin: Option<Arc<dyn OriginAdapter>>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| MarketError::InvalidConfig(e.to_string()))?;

        let cache = Arc::new(build_cache(&config).await);
        let cleanup = cache.spawn_cleanup(config.cache.cleanup_interval());
        let limiter = Arc::new(RateLimiter::from_app_config(&config));
        let service = Arc::new(MarketDataService::new(
            cache.clone(),
            limiter.clone(),
            origin,
            &config,
        ));

        info!(
            tiers = ?cache.tier_kinds(),
            live = service.is_configured(),
            "Market data context ready"
        );

        Ok(Self {
            config: Arc::new(config),
            cache,
            limiter,
            service,
            cleanup,
        })
    }

    pub fn cleanup_running(&self) -> bool {
        !self.cleanup.is_finished()
    }
}

async fn build_cache(config: &AppConfig) -> CacheOrchestrator {
    let local: Arc<dyn CacheTier> = Arc::new(LocalTier::new(LocalTierConfig::from(&config.cache)));

    let distributed: Option<Arc<dyn CacheTier>> = match config.redis.url {
        Some(_) => match RedisTier::connect(&config.redis).await {
            Ok(tier) => Some(Arc::new(tier)),
            Err(e) => {
                warn!(error = %e, "Redis unavailable, distributed cache tier disabled");
                None
            }
        },
        None => None,
    };

    let persistent: Option<Arc<dyn CacheTier>> = match config.database.url {
        Some(_) => match PostgresTier::connect(&config.database).await {
            Ok(tier) => Some(Arc::new(tier)),
            Err(e) => {
                warn!(error = %e, "Database unavailable, persistent cache tier disabled");
                None
            }
        },
        None => None,
    };

    CacheOrchestrator::builder()
        .with_tier(local)
        .with_optional_tier(distributed)
        .with_optional_tier(persistent)
        .default_ttl(config.cache.default_ttl())
        .build()
}
