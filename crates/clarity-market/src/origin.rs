//! 외부 시장 데이터 제공자 인터페이스.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use clarity_core::{CompanyInfo, DividendRecord, PriceRecord, Provenance};

use crate::error::Result;

/// 제공자가 돌려준 시세 (출처 태그 이전).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub price: Decimal,
    pub change: Decimal,
    pub change_percent: Decimal,
    pub previous_close: Decimal,
    pub observed_at: DateTime<Utc>,
}

impl PriceQuote {
    pub fn into_record(self, symbol: impl Into<String>, provenance: Provenance) -> PriceRecord {
        PriceRecord {
            symbol: symbol.into(),
            price: self.price,
            change: self.change,
            change_percent: self.change_percent,
            previous_close: self.previous_close,
            observed_at: self.observed_at,
            provenance,
        }
    }
}

/// 연결 확인 결과.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProbe {
    pub success: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// 시장 데이터 제공자.
///
/// 요청 한도 초과는 반드시 [`crate::MarketError::ProviderRateLimited`]로 구분해서 반환해야
/// 배치 페처가 예산을 닫고 물러날 수 있습니다.
#[async_trait]
pub trait OriginAdapter: Send + Sync {
    /// 제공자 이름 (로깅용).
    fn name(&self) -> &str;

    /// 자격증명이 설정되어 있는지.
    fn is_configured(&self) -> bool;

    /// 심볼 하나의 최신 시세.
    async fn fetch_price(&self, symbol: &str) -> Result<PriceQuote>;

    /// 기간 내 배당 이력.
    async fn fetch_dividends(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DividendRecord>>;

    /// 기업 기본 정보.
    async fn fetch_company_info(&self, symbol: &str) -> Result<CompanyInfo>;

    /// 가벼운 연결 확인.
    async fn test_connection(&self) -> ConnectionProbe;
}
