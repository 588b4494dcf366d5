//! 결정적 합성 데이터 생성기.
//!
//! 제공자를 쓸 수 없을 때 사용합니다. 같은 심볼, 같은 UTC 날짜에는 항상 같은 값을 만들고,
//! 시세는 심볼별 기준가에서 `±variation_pct` 안에 머뭅니다.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use clarity_core::{CompanyInfo, DividendRecord, PriceRecord, Provenance};

/// 자주 조회되는 종목의 기준가.
const KNOWN_BASE_PRICES: &[(&str, f64)] = &[
    ("AAPL", 185.0),
    ("MSFT", 410.0),
    ("GOOGL", 140.0),
    ("AMZN", 175.0),
    ("NVDA", 120.0),
    ("SPY", 500.0),
    ("VTI", 250.0),
    ("SCHD", 78.0),
    ("JEPI", 55.0),
    ("O", 55.0),
    ("KO", 60.0),
    ("JNJ", 155.0),
    ("PG", 165.0),
    ("T", 17.0),
    ("VZ", 40.0),
];

/// 합성 데이터 생성기.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticGenerator {
    /// 기준가 대비 최대 변동폭 (%)
    variation_pct: f64,
}

impl Default for SyntheticGenerator {
    fn default() -> Self {
        Self { variation_pct: 2.0 }
    }
}

fn digest(parts: &[&str]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hasher.finalize().into()
}

fn decimal(value: f64, dp: u32) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default().round_dp(dp)
}

impl SyntheticGenerator {
    pub fn new(variation_pct: f64) -> Self {
        Self {
            variation_pct: variation_pct.clamp(0.0, 50.0),
        }
    }

    pub fn variation_pct(&self) -> f64 {
        self.variation_pct
    }

    /// 심볼별 기준가. 목록에 없으면 심볼 해시로 10~500 사이 값을 정합니다.
    pub fn base_price(&self, symbol: &str) -> Decimal {
        if let Some((_, price)) = KNOWN_BASE_PRICES.iter().find(|(s, _)| *s == symbol) {
            return decimal(*price, 2);
        }
        let hash = digest(&[symbol]);
        let bucket = u16::from_be_bytes([hash[0], hash[1]]) as f64 / u16::MAX as f64;
        decimal(10.0 + bucket * 490.0, 2)
    }

    fn rng(&self, symbol: &str, scope: &str, date: NaiveDate) -> StdRng {
        StdRng::from_seed(digest(&[symbol, scope, &date.to_string()]))
    }

    /// 특정 날짜의 합성 시세.
    pub fn price_on(&self, symbol: &str, date: NaiveDate, observed_at: DateTime<Utc>) -> PriceRecord {
        let base = self.base_price(symbol);
        let mut rng = self.rng(symbol, "price", date);
        let pct = if self.variation_pct > 0.0 {
            rng.gen_range(-self.variation_pct..=self.variation_pct)
        } else {
            0.0
        };

        let factor = Decimal::ONE + decimal(pct, 4) / Decimal::ONE_HUNDRED;
        let price = (base * factor).round_dp(2);
        let change = price - base;
        let change_percent = if base.is_zero() {
            Decimal::ZERO
        } else {
            (change / base * Decimal::ONE_HUNDRED).round_dp(2)
        };

        PriceRecord {
            symbol: symbol.to_string(),
            price,
            change,
            change_percent,
            previous_close: base,
            observed_at,
            provenance: Provenance::Synthetic,
        }
    }

    /// 오늘(UTC) 기준 합성 시세.
    pub fn price(&self, symbol: &str) -> PriceRecord {
        let now = Utc::now();
        self.price_on(symbol, now.date_naive(), now)
    }

    /// 기간 내 분기 배당. 배당락일은 3/6/9/12월 15일입니다.
    pub fn dividends(&self, symbol: &str, from: NaiveDate, to: NaiveDate) -> Vec<DividendRecord> {
        let base = self.base_price(symbol);
        let hash = digest(&[symbol, "yield"]);
        // 연 1~5% 수익률
        let annual_yield = 1.0 + (hash[0] as f64 / u8::MAX as f64) * 4.0;
        let quarterly = (base * decimal(annual_yield / 400.0, 6)).round_dp(4);

        let mut dividends = Vec::new();
        for year in from.year()..=to.year() {
            for month in [12u32, 9, 6, 3] {
                let Some(ex_date) = NaiveDate::from_ymd_opt(year, month, 15) else {
                    continue;
                };
                if ex_date < from || ex_date > to {
                    continue;
                }
                dividends.push(DividendRecord {
                    symbol: symbol.to_string(),
                    cash_amount: quarterly,
                    currency: Some("USD".to_string()),
                    ex_dividend_date: ex_date,
                    pay_date: ex_date.checked_add_days(chrono::Days::new(14)),
                    record_date: ex_date.succ_opt(),
                    declaration_date: None,
                    frequency: Some(4),
                });
            }
        }
        dividends.sort_by(|a, b| b.ex_dividend_date.cmp(&a.ex_dividend_date));
        dividends
    }

    /// 최소한의 기업 정보.
    pub fn company_info(&self, symbol: &str) -> CompanyInfo {
        CompanyInfo {
            symbol: symbol.to_string(),
            name: symbol.to_string(),
            exchange: None,
            sector: None,
            industry: None,
            description: Some("Placeholder profile; provider unavailable".to_string()),
            market_cap: None,
            currency: Some("USD".to_string()),
            homepage_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_same_day_is_deterministic() {
        let generator = SyntheticGenerator::default();
        let now = Utc::now();
        let a = generator.price_on("AAPL", day(2024, 5, 1), now);
        let b = generator.price_on("AAPL", day(2024, 5, 1), now);
        assert_eq!(a, b);
        assert_eq!(a.provenance, Provenance::Synthetic);
        assert_eq!(a.previous_close, Decimal::new(18500, 2));
    }

    #[test]
    fn test_zero_variation_returns_base() {
        let generator = SyntheticGenerator::new(0.0);
        let record = generator.price_on("MSFT", day(2024, 5, 1), Utc::now());
        assert_eq!(record.price, generator.base_price("MSFT"));
        assert!(record.change.is_zero());
    }

    #[test]
    fn test_quarterly_dividends_within_range() {
        let generator = SyntheticGenerator::default();
        let dividends = generator.dividends("KO", day(2024, 1, 1), day(2024, 12, 31));
        assert_eq!(dividends.len(), 4);
        assert_eq!(dividends[0].ex_dividend_date, day(2024, 12, 15));
        assert!(dividends.iter().all(|d| d.cash_amount > Decimal::ZERO));

        let partial = generator.dividends("KO", day(2024, 4, 1), day(2024, 7, 1));
        assert_eq!(partial.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_price_within_variation(symbol in "[A-Z]{1,5}", offset in 0u32..3650, pct in 0.0f64..10.0) {
            let generator = SyntheticGenerator::new(pct);
            let date = day(2015, 1, 1) + chrono::Days::new(offset as u64);
            let record = generator.price_on(&symbol, date, Utc::now());
            let base = generator.base_price(&symbol);

            let bound = base * decimal(pct, 4) / Decimal::ONE_HUNDRED + Decimal::new(1, 2);
            prop_assert!((record.price - base).abs() <= bound);
            prop_assert!(record.price > Decimal::ZERO);
        }
    }
}
