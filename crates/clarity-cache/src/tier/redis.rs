//! Redis 분산 계층.
//!
//! 항목은 `{prefix}entry:{key}`에 JSON으로 저장되고 `PX`로 남은 TTL만큼 만료됩니다.
//! 태그마다 `{prefix}tag:{tag}` 집합에 키를 모아 태그 무효화에 사용합니다.

use async_trait::async_trait;
use chrono::Utc;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, instrument};

use clarity_core::RedisConfig;

use super::CacheTier;
use crate::entry::{StoredEntry, TierKind, MAX_TTL};
use crate::error::{CacheError, Result};

/// Redis 연결 래퍼.
#[derive(Clone)]
pub struct RedisTier {
    connection: MultiplexedConnection,
    key_prefix: String,
}

impl RedisTier {
    /// 새로운 Redis 연결을 생성합니다.
    ///
    /// URL이 없거나 연결에 실패하면 에러를 반환하며, 호출자는 로컬 전용으로 동작합니다.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| CacheError::ConnectionError("redis.url is not set".to_string()))?;

        info!("Connecting to Redis...");

        let client = Client::open(url).map_err(|e| CacheError::ConnectionError(e.to_string()))?;
        let timeout = Duration::from_secs(config.connect_timeout_secs);
        let connection = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| CacheError::Timeout(format!("redis connect after {:?}", timeout)))?
            .map_err(|e| CacheError::ConnectionError(e.to_string()))?;

        info!("Redis connection established");

        Ok(Self {
            connection,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}entry:{}", self.key_prefix, key)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}tag:{}", self.key_prefix, tag)
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection.clone();
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }
}

#[async_trait]
impl CacheTier for RedisTier {
    fn kind(&self) -> TierKind {
        TierKind::Distributed
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(self.entry_key(key)).await?;

        match value {
            Some(json) => {
                let entry: StoredEntry = serde_json::from_str(&json)?;
                if entry.is_expired_at(Utc::now()) {
                    return Ok(None);
                }
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, entry: &StoredEntry) -> Result<()> {
        let Some(remaining) = entry.remaining_ttl(Utc::now()) else {
            return Ok(());
        };
        let ttl_ms = (remaining.min(MAX_TTL).as_millis() as u64).max(1);
        let json = serde_json::to_string(entry)?;
        let entry_key = self.entry_key(&entry.key);

        let mut pipe = redis::pipe();
        pipe.atomic().pset_ex(&entry_key, json, ttl_ms).ignore();
        for tag in &entry.tags {
            pipe.sadd(self.tag_key(tag), &entry.key).ignore();
        }

        let mut conn = self.connection.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let deleted: i64 = conn.del(self.entry_key(key)).await?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let exists: bool = conn.exists(self.entry_key(key)).await?;
        Ok(exists)
    }

    async fn invalidate_tags(&self, tags: &BTreeSet<String>) -> Result<usize> {
        let mut conn = self.connection.clone();
        let mut removed = 0usize;

        for tag in tags {
            let tag_key = self.tag_key(tag);
            let members: Vec<String> = conn.smembers(&tag_key).await?;
            if !members.is_empty() {
                let keys: Vec<String> = members.iter().map(|k| self.entry_key(k)).collect();
                let deleted: i64 = conn.del(&keys).await?;
                removed += deleted as usize;
            }
            let _: i64 = conn.del(&tag_key).await?;
        }

        debug!(removed, "Redis tier tag invalidation");
        Ok(removed)
    }

    /// Redis가 항목을 직접 만료시키므로, 여기서는 만료된 키를 가리키는 태그 멤버만 정리합니다.
    async fn purge_expired(&self) -> Result<usize> {
        let tag_keys = self.keys_matching(&format!("{}tag:*", self.key_prefix)).await?;
        let mut conn = self.connection.clone();
        let mut pruned = 0usize;

        for tag_key in tag_keys {
            let members: Vec<String> = conn.smembers(&tag_key).await?;
            for member in members {
                let alive: bool = conn.exists(self.entry_key(&member)).await?;
                if !alive {
                    let _: i64 = conn.srem(&tag_key, &member).await?;
                    pruned += 1;
                }
            }
        }
        Ok(pruned)
    }

    async fn len(&self) -> Result<usize> {
        let keys = self
            .keys_matching(&format!("{}entry:*", self.key_prefix))
            .await?;
        Ok(keys.len())
    }

    async fn clear(&self) -> Result<usize> {
        let keys = self.keys_matching(&format!("{}*", self.key_prefix)).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let entries = keys
            .iter()
            .filter(|k| k.starts_with(&format!("{}entry:", self.key_prefix)))
            .count();

        let mut conn = self.connection.clone();
        let _: i64 = conn.del(&keys).await?;
        Ok(entries)
    }

    async fn health_check(&self) -> Result<bool> {
        let mut conn = self.connection.clone();
        let result: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(result == "PONG")
    }
}
