//! 시장 데이터 레코드 타입.
//!
//! - `PriceRecord` - 종목 시세 (출처 태그 포함)
//! - `DividendRecord` / `DividendData` - 배당 이력
//! - `CompanyInfo` / `CompanyProfile` - 기업 정보
//! - `BatchRequest` - 배치 조회 요청

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// 레코드의 출처(신뢰 수준).
///
/// 호출자에게 반환되는 모든 레코드는 반드시 출처를 밝혀야 합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// 캐시 계층에서 제공
    Cache,
    /// 외부 제공자에서 방금 가져옴
    Origin,
    /// 제공자를 쓸 수 없어 합성한 값
    Synthetic,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Cache => write!(f, "cache"),
            Provenance::Origin => write!(f, "origin"),
            Provenance::Synthetic => write!(f, "synthetic"),
        }
    }
}

/// 종목 시세 레코드.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    /// 정규화된 심볼 (예: "AAPL")
    pub symbol: String,
    /// 현재가
    pub price: Decimal,
    /// 전일 대비 변동액
    pub change: Decimal,
    /// 전일 대비 변동률 (%)
    pub change_percent: Decimal,
    /// 전일 종가
    pub previous_close: Decimal,
    /// 관측 시각
    pub observed_at: DateTime<Utc>,
    /// 출처
    pub provenance: Provenance,
}

impl PriceRecord {
    /// 출처만 바꾼 복사본을 반환합니다.
    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }
}

/// 단일 배당 지급 레코드.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DividendRecord {
    pub symbol: String,
    /// 주당 배당금
    pub cash_amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    /// 배당락일
    pub ex_dividend_date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pay_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub declaration_date: Option<NaiveDate>,
    /// 연간 지급 횟수 (12 = 월배당, 4 = 분기배당)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<u32>,
}

/// 한 심볼의 기간별 배당 이력.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DividendData {
    pub symbol: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub dividends: Vec<DividendRecord>,
    pub fetched_at: DateTime<Utc>,
    pub provenance: Provenance,
}

impl DividendData {
    /// 기간 내 주당 배당금 합계.
    pub fn total_cash_amount(&self) -> Decimal {
        self.dividends.iter().map(|d| d.cash_amount).sum()
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }
}

/// 제공자가 반환하는 기업 정보.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyInfo {
    pub symbol: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_cap: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage_url: Option<String>,
}

/// 출처가 붙은 기업 정보.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyProfile {
    #[serde(flatten)]
    pub info: CompanyInfo,
    pub fetched_at: DateTime<Utc>,
    pub provenance: Provenance,
}

impl CompanyProfile {
    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }
}

/// 심볼을 캐시 키와 제공자 요청에 쓰는 형태로 정규화합니다.
///
/// 공백만 있는 심볼은 `None`.
pub fn normalize_symbol(symbol: &str) -> Option<String> {
    let trimmed = symbol.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_uppercase())
    }
}

/// 배치 조회 요청.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// 요청 심볼 (원본 표기 그대로, 중복 제거됨)
    pub symbols: BTreeSet<String>,
    /// 캐시를 건너뛰고 제공자에서 다시 가져올지 여부
    #[serde(default)]
    pub force_refresh: bool,
    /// 대기열 우선순위 (클수록 먼저)
    #[serde(default)]
    pub priority: i32,
}

impl BatchRequest {
    /// 심볼 목록으로 요청을 생성합니다.
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
            force_refresh: false,
            priority: 0,
        }
    }

    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}
