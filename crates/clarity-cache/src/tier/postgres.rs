//! PostgreSQL 영속 계층.
//!
//! `cache_entries`에 항목을, `cache_entry_tags`에 (키, 태그) 쌍을 저장합니다.
//! 태그 무효화는 태그 인덱스 테이블 조인으로 정확히 일치하는 태그만 대상으로 합니다.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, instrument};

use clarity_core::DatabaseConfig;

use super::CacheTier;
use crate::entry::{StoredEntry, TierKind};
use crate::error::{CacheError, Result};

/// `cache_entries` 조회 결과.
#[derive(Debug, FromRow)]
struct CacheEntryRecord {
    key: String,
    payload: String,
    stored_at: DateTime<Utc>,
    ttl_ms: i64,
    tags: Vec<String>,
}

impl From<CacheEntryRecord> for StoredEntry {
    fn from(record: CacheEntryRecord) -> Self {
        StoredEntry {
            key: record.key,
            payload: record.payload,
            stored_at: record.stored_at,
            ttl_ms: record.ttl_ms.max(0) as u64,
            tags: record.tags.into_iter().collect(),
        }
    }
}

/// PostgreSQL 연결 풀 래퍼.
#[derive(Clone)]
pub struct PostgresTier {
    pool: PgPool,
}

impl PostgresTier {
    /// 새로운 연결 풀을 생성하고, 설정에 따라 마이그레이션을 실행합니다.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| CacheError::ConnectionError("database.url is not set".to_string()))?;

        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(url)
            .await
            .map_err(|e| CacheError::ConnectionError(e.to_string()))?;

        info!("Database connection established");

        let tier = Self { pool };
        if config.run_migrations {
            tier.migrate().await?;
        }
        Ok(tier)
    }

    /// 기존 연결 풀에서 계층을 생성합니다.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 캐시 테이블 마이그레이션을 실행합니다.
    pub async fn migrate(&self) -> Result<()> {
        info!("Running cache migrations...");
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("Migrations completed successfully");
        Ok(())
    }
}

#[async_trait]
impl CacheTier for PostgresTier {
    fn kind(&self) -> TierKind {
        TierKind::Persistent
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>> {
        let record = sqlx::query_as::<_, CacheEntryRecord>(
            r#"
            SELECT e.key, e.payload, e.stored_at, e.ttl_ms,
                   COALESCE(array_agg(t.tag) FILTER (WHERE t.tag IS NOT NULL), '{}') AS tags
            FROM cache_entries e
            LEFT JOIN cache_entry_tags t ON t.key = e.key
            WHERE e.key = $1 AND e.expires_at > NOW()
            GROUP BY e.key
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record.map(StoredEntry::from))
    }

    async fn set(&self, entry: &StoredEntry) -> Result<()> {
        let ttl_ms = entry.ttl_ms.min(i64::MAX as u64) as i64;
        let tags: Vec<String> = entry.tags.iter().cloned().collect();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, payload, stored_at, ttl_ms, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (key) DO UPDATE SET
                payload = EXCLUDED.payload,
                stored_at = EXCLUDED.stored_at,
                ttl_ms = EXCLUDED.ttl_ms,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&entry.key)
        .bind(&entry.payload)
        .bind(entry.stored_at)
        .bind(ttl_ms)
        .bind(entry.expires_at())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM cache_entry_tags WHERE key = $1")
            .bind(&entry.key)
            .execute(&mut *tx)
            .await?;

        if !tags.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO cache_entry_tags (key, tag)
                SELECT $1, tag FROM UNNEST($2::text[]) AS tag
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&entry.key)
            .bind(&tags)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(key = %entry.key, "Persistent tier upsert");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM cache_entries WHERE key = $1 AND expires_at > NOW())",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn invalidate_tags(&self, tags: &BTreeSet<String>) -> Result<usize> {
        if tags.is_empty() {
            return Ok(0);
        }
        let tags: Vec<String> = tags.iter().cloned().collect();
        let result = sqlx::query(
            r#"
            DELETE FROM cache_entries
            WHERE key IN (SELECT key FROM cache_entry_tags WHERE tag = ANY($1))
            "#,
        )
        .bind(&tags)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn purge_expired(&self) -> Result<usize> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries WHERE expires_at > NOW()")
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as usize)
    }

    async fn clear(&self) -> Result<usize> {
        let result = sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}
