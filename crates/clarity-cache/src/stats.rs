//! 캐시 통계 구조체.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::entry::TierKind;

/// 계층별 누적 카운터.
#[derive(Debug, Default)]
pub(crate) struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl TierCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }
}

/// 계층 하나의 통계.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierStats {
    pub kind: TierKind,
    /// 이 계층에서 응답한 조회 수
    pub hits: u64,
    /// 이 계층을 확인했지만 없었던 조회 수
    pub misses: u64,
    /// 조회/쓰기 중 발생한 계층 오류 수
    pub errors: u64,
    /// 살아 있는 키 수 (조회 실패 시 `None`)
    pub entries: Option<usize>,
    /// 헬스 체크 결과
    pub healthy: bool,
}

/// 오케스트레이터 전체 통계.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// 선호 순서대로 붙어 있는 계층
    pub tiers: Vec<TierStats>,
    /// 어느 계층에서든 값이 나온 조회 수
    pub total_hits: u64,
    /// 모든 계층에서 찾지 못한 조회 수
    pub total_misses: u64,
    /// 적중률 (%)
    pub hit_rate: f64,
    /// 로컬 계층 추정 메모리 사용량
    pub local_memory_bytes: Option<usize>,
    /// 분산 계층 연결 여부. 분산 계층이 없으면 `None`
    pub distributed_connected: Option<bool>,
    /// 계층별 살아 있는 키 수의 합
    pub total_keys: usize,
}

impl CacheStats {
    pub fn tier(&self, kind: TierKind) -> Option<&TierStats> {
        self.tiers.iter().find(|t| t.kind == kind)
    }

    /// 특정 계층에서 응답한 조회 수. 계층이 없으면 0.
    pub fn hits_for(&self, kind: TierKind) -> u64 {
        self.tier(kind).map(|t| t.hits).unwrap_or(0)
    }

    /// 통계 요약 로그 출력
    pub fn log_summary(&self) {
        tracing::info!(
            tiers = self.tiers.len(),
            total_hits = self.total_hits,
            total_misses = self.total_misses,
            hit_rate = format!("{:.1}%", self.hit_rate),
            total_keys = self.total_keys,
            local_memory_bytes = ?self.local_memory_bytes,
            distributed_connected = ?self.distributed_connected,
            "Cache statistics"
        );
    }
}

pub(crate) fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        (hits as f64 / total as f64) * 100.0
    }
}
