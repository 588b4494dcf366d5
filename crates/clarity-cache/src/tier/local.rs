//! 프로세스 내부 로컬 계층.
//!
//! 항목 수와 추정 바이트 예산을 넘으면 삽입 순서가 가장 오래된 10%를 제거합니다.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use clarity_core::CacheConfig;

use super::CacheTier;
use crate::entry::{StoredEntry, TierKind, MAX_TTL};
use crate::error::{CacheError, Result};

/// 로컬 계층 한도.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTierConfig {
    /// 최대 항목 수
    pub max_entries: usize,
    /// 추정 메모리 상한 (바이트)
    pub max_bytes: usize,
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_bytes: 50 * 1024 * 1024,
        }
    }
}

impl From<&CacheConfig> for LocalTierConfig {
    fn from(config: &CacheConfig) -> Self {
        Self {
            max_entries: config.local_max_entries.max(1),
            max_bytes: config.local_max_bytes,
        }
    }
}

struct LocalSlot {
    entry: StoredEntry,
    expires_at: Instant,
    seq: u64,
    size: usize,
}

impl LocalSlot {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

#[derive(Default)]
struct LocalState {
    slots: HashMap<String, LocalSlot>,
    /// 삽입 순번 → 키
    insertion_order: BTreeMap<u64, String>,
    next_seq: u64,
    bytes: usize,
}

impl LocalState {
    fn remove(&mut self, key: &str) -> Option<LocalSlot> {
        let slot = self.slots.remove(key)?;
        self.insertion_order.remove(&slot.seq);
        self.bytes = self.bytes.saturating_sub(slot.size);
        Some(slot)
    }

    fn remove_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&LocalSlot) -> bool,
    {
        let keys: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| predicate(slot))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    /// 가장 오래된 `count`개를 제거합니다.
    fn evict_oldest(&mut self, count: usize) -> usize {
        let victims: Vec<String> = self
            .insertion_order
            .values()
            .take(count)
            .cloned()
            .collect();
        for key in &victims {
            self.remove(key);
        }
        victims.len()
    }
}

/// 프로세스 내부 bounded 맵 계층.
pub struct LocalTier {
    config: LocalTierConfig,
    state: RwLock<LocalState>,
    evictions: AtomicU64,
}

impl LocalTier {
    pub fn new(config: LocalTierConfig) -> Self {
        Self {
            config,
            state: RwLock::new(LocalState::default()),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> LocalTierConfig {
        self.config
    }

    /// 지금까지 용량 초과로 제거된 항목 수.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// 만료 여부와 상관없이 물리적으로 남아 있는 항목 수.
    pub async fn physical_len(&self) -> usize {
        self.state.read().await.slots.len()
    }

    fn enforce_budget(&self, state: &mut LocalState) {
        while state.slots.len() > self.config.max_entries || state.bytes > self.config.max_bytes {
            let batch = (state.slots.len() / 10).max(1);
            let evicted = state.evict_oldest(batch);
            if evicted == 0 {
                break;
            }
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(
                evicted,
                remaining = state.slots.len(),
                bytes = state.bytes,
                "Local tier over budget, evicted oldest entries"
            );
        }
    }
}

impl Default for LocalTier {
    fn default() -> Self {
        Self::new(LocalTierConfig::default())
    }
}

#[async_trait]
impl CacheTier for LocalTier {
    fn kind(&self) -> TierKind {
        TierKind::Local
    }

    async fn get(&self, key: &str) -> Result<Option<StoredEntry>> {
        let now = Instant::now();
        {
            let state = self.state.read().await;
            match state.slots.get(key) {
                None => return Ok(None),
                Some(slot) if !slot.is_expired(now) => return Ok(Some(slot.entry.clone())),
                Some(_) => {}
            }
        }

        // 만료된 항목은 읽는 김에 제거
        let mut state = self.state.write().await;
        if state.slots.get(key).is_some_and(|slot| slot.is_expired(now)) {
            state.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, entry: &StoredEntry) -> Result<()> {
        let Some(remaining) = entry.remaining_ttl(Utc::now()) else {
            return Ok(());
        };

        let size = entry.size_bytes();
        if size > self.config.max_bytes {
            return Err(CacheError::EntryTooLarge {
                key: entry.key.clone(),
                size,
                limit: self.config.max_bytes,
            });
        }

        let mut state = self.state.write().await;
        state.remove(&entry.key);

        let seq = state.next_seq;
        state.next_seq += 1;
        state.insertion_order.insert(seq, entry.key.clone());
        state.bytes += size;
        state.slots.insert(
            entry.key.clone(),
            LocalSlot {
                entry: entry.clone(),
                expires_at: Instant::now() + remaining.min(MAX_TTL),
                seq,
                size,
            },
        );

        self.enforce_budget(&mut state);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.state.write().await.remove(key).is_some())
    }

    async fn invalidate_tags(&self, tags: &BTreeSet<String>) -> Result<usize> {
        let mut state = self.state.write().await;
        Ok(state.remove_where(|slot| slot.entry.has_any_tag(tags)))
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        Ok(state.remove_where(|slot| slot.is_expired(now)))
    }

    async fn len(&self) -> Result<usize> {
        let now = Instant::now();
        let state = self.state.read().await;
        Ok(state.slots.values().filter(|slot| !slot.is_expired(now)).count())
    }

    async fn clear(&self) -> Result<usize> {
        let mut state = self.state.write().await;
        let count = state.slots.len();
        let next_seq = state.next_seq;
        *state = LocalState {
            next_seq,
            ..Default::default()
        };
        Ok(count)
    }

    async fn memory_usage(&self) -> Option<usize> {
        Some(self.state.read().await.bytes)
    }
}
