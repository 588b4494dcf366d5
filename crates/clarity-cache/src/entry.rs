//! 캐시 항목과 저장 옵션.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// 캐시 계층 종류. 선언 순서가 조회 선호 순서입니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// 프로세스 내부 맵
    Local,
    /// 공유 키-값 저장소 (Redis)
    Distributed,
    /// 관계형 저장소 (PostgreSQL)
    Persistent,
}

impl TierKind {
    /// 선호 순서대로 모든 계층.
    pub const ALL: [TierKind; 3] = [TierKind::Local, TierKind::Distributed, TierKind::Persistent];

    pub(crate) fn index(&self) -> usize {
        match self {
            TierKind::Local => 0,
            TierKind::Distributed => 1,
            TierKind::Persistent => 2,
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierKind::Local => write!(f, "local"),
            TierKind::Distributed => write!(f, "distributed"),
            TierKind::Persistent => write!(f, "persistent"),
        }
    }
}

/// `set`이 쓸 계층, `get`이 읽을 수 있는 계층.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierSelector {
    Local,
    Distributed,
    Persistent,
    #[default]
    All,
}

impl TierSelector {
    pub fn includes(&self, kind: TierKind) -> bool {
        match self {
            TierSelector::All => true,
            TierSelector::Local => kind == TierKind::Local,
            TierSelector::Distributed => kind == TierKind::Distributed,
            TierSelector::Persistent => kind == TierKind::Persistent,
        }
    }
}

/// 허용하는 최대 TTL (약 100년). 이보다 긴 TTL은 이 값으로 줄입니다.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// 계층 간에 주고받는 직렬화된 캐시 항목.
///
/// `stored_at + ttl`이 지나면 물리적으로 남아 있어도 없는 것으로 취급합니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub key: String,
    /// JSON 직렬화된 값
    pub payload: String,
    pub stored_at: DateTime<Utc>,
    pub ttl_ms: u64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl StoredEntry {
    /// 현재 시각으로 새 항목을 생성합니다.
    pub fn new(
        key: impl Into<String>,
        payload: impl Into<String>,
        ttl: Duration,
        tags: BTreeSet<String>,
    ) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            stored_at: Utc::now(),
            ttl_ms: ttl.min(MAX_TTL).as_millis() as u64,
            tags,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// 만료 시각. 표현 범위를 넘으면 `DateTime::<Utc>::MAX_UTC`.
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.ttl_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .and_then(|ttl| self.stored_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// `now - stored_at > ttl` 이면 만료.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    /// 남은 TTL. 만료되었으면 `None`.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.is_expired_at(now) {
            return None;
        }
        (self.expires_at() - now).to_std().ok()
    }

    /// 로컬 계층 메모리 예산 계산용 추정 크기.
    pub fn size_bytes(&self) -> usize {
        self.key.len()
            + self.payload.len()
            + self.tags.iter().map(String::len).sum::<usize>()
            + std::mem::size_of::<Self>()
    }

    pub fn has_any_tag(&self, tags: &BTreeSet<String>) -> bool {
        !self.tags.is_disjoint(tags)
    }
}

/// `set` 옵션 (TTL, 대상 계층, 태그).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSetOptions {
    pub ttl: Duration,
    pub tiers: TierSelector,
    pub tags: BTreeSet<String>,
}

impl CacheSetOptions {
    /// 모든 계층에 쓰는 옵션.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tiers: TierSelector::All,
            tags: BTreeSet::new(),
        }
    }

    pub fn tiers(mut self, tiers: TierSelector) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// 태그 목록을 집합으로 만듭니다.
pub fn tag_set<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    tags.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_boundary() {
        let entry = StoredEntry::new("k", "1", Duration::from_millis(100), BTreeSet::new());
        let at = |ms| entry.stored_at + chrono::Duration::milliseconds(ms);

        assert!(!entry.is_expired_at(at(50)));
        assert!(!entry.is_expired_at(at(100)));
        assert!(entry.is_expired_at(at(150)));
        assert_eq!(entry.remaining_ttl(at(40)), Some(Duration::from_millis(60)));
        assert_eq!(entry.remaining_ttl(at(150)), None);
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let entry = StoredEntry::new("k", "1", Duration::MAX, BTreeSet::new());
        assert_eq!(entry.ttl(), MAX_TTL);
        assert!(entry.remaining_ttl(Utc::now()).is_some());

        // 다른 계층에서 읽은 항목은 범위를 벗어난 TTL을 가질 수 있음
        let stored = StoredEntry {
            ttl_ms: u64::MAX,
            ..entry
        };
        assert_eq!(stored.expires_at(), DateTime::<Utc>::MAX_UTC);
        assert!(!stored.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_tier_selector() {
        assert!(TierSelector::All.includes(TierKind::Persistent));
        assert!(TierSelector::Local.includes(TierKind::Local));
        assert!(!TierSelector::Local.includes(TierKind::Distributed));
    }

    #[test]
    fn test_tag_intersection() {
        let entry = StoredEntry::new(
            "price:AAPL",
            "{}",
            Duration::from_secs(60),
            tag_set(["prices", "real-time"]),
        );
        assert!(entry.has_any_tag(&tag_set(["prices"])));
        assert!(!entry.has_any_tag(&tag_set(["dividends"])));
    }

    #[test]
    fn test_stored_entry_json_roundtrip_keeps_tags() {
        let entry = StoredEntry::new("k", "[1,2]", Duration::from_secs(5), tag_set(["a"]));
        let json = serde_json::to_string(&entry).unwrap();
        let parsed: StoredEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_set_options_builder() {
        let options = CacheSetOptions::new(Duration::from_secs(60))
            .tiers(TierSelector::Local)
            .tag("prices")
            .tags(["real-time"]);
        assert_eq!(options.tiers, TierSelector::Local);
        assert_eq!(options.tags, tag_set(["prices", "real-time"]));
    }
}
