//! 시세, 배당, 기업 정보 조회 명령.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};

use clarity_core::{BatchRequest, Provenance};
use clarity_market::MarketContext;

use super::{print_batch, print_json, OutputFormat};

/// 날짜 문자열 파싱 (YYYY-MM-DD).
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid date: {}. Expected YYYY-MM-DD", s))
}

/// 시작/종료일 결정. 기본은 최근 1년.
pub fn resolve_range(from: Option<&str>, to: Option<&str>) -> Result<(NaiveDate, NaiveDate)> {
    let to = match to {
        Some(s) => parse_date(s)?,
        None => Utc::now().date_naive(),
    };
    let from = match from {
        Some(s) => parse_date(s)?,
        None => to - Duration::days(365),
    };
    if from > to {
        anyhow::bail!("Start date must be before end date");
    }
    Ok((from, to))
}

fn source_label(provenance: Provenance) -> &'static str {
    match provenance {
        Provenance::Cache => "cache",
        Provenance::Origin => "live",
        Provenance::Synthetic => "synthetic",
    }
}

pub async fn prices(
    context: &MarketContext,
    symbols: Vec<String>,
    force: bool,
    priority: i32,
    format: OutputFormat,
) -> Result<()> {
    let request = BatchRequest::new(symbols)
        .force_refresh(force)
        .with_priority(priority);
    let result = context.service.get_batch_prices(&request).await;

    print_batch(&result, format, |symbol, record| {
        format!(
            "{:<8} {:>12} {:>+10} ({:>+6}%)  [{}]",
            symbol,
            record.price,
            record.change,
            record.change_percent,
            source_label(record.provenance)
        )
    })
}

pub async fn price(context: &MarketContext, symbol: &str, format: OutputFormat) -> Result<()> {
    let record = context.service.get_stock_price(symbol).await?;
    match format {
        OutputFormat::Json => print_json(&record),
        OutputFormat::Table => {
            println!(
                "{} {} (전일 {}, {:+}%) [{}]",
                record.symbol,
                record.price,
                record.previous_close,
                record.change_percent,
                source_label(record.provenance)
            );
            Ok(())
        }
    }
}

pub async fn dividends(
    context: &MarketContext,
    symbols: Vec<String>,
    from: Option<&str>,
    to: Option<&str>,
    force: bool,
    format: OutputFormat,
) -> Result<()> {
    let (from, to) = resolve_range(from, to)?;
    let request = BatchRequest::new(symbols).force_refresh(force);
    let result = context
        .service
        .get_batch_dividend_data(&request, from, to)
        .await;

    print_batch(&result, format, |symbol, data| {
        let latest = data
            .dividends
            .first()
            .map(|d| format!("최근 {} {}", d.ex_dividend_date, d.cash_amount))
            .unwrap_or_else(|| "배당 없음".to_string());
        format!(
            "{:<8} {:>3}건 합계 {:>10}  {}  [{}]",
            symbol,
            data.dividends.len(),
            data.total_cash_amount(),
            latest,
            source_label(data.provenance)
        )
    })
}

pub async fn company(
    context: &MarketContext,
    symbols: Vec<String>,
    force: bool,
    format: OutputFormat,
) -> Result<()> {
    let request = BatchRequest::new(symbols).force_refresh(force);
    let result = context.service.get_batch_company_info(&request).await;

    print_batch(&result, format, |symbol, profile| {
        format!(
            "{:<8} {} ({})  [{}]",
            symbol,
            profile.info.name,
            profile.info.exchange.as_deref().unwrap_or("-"),
            source_label(profile.provenance)
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_range() {
        let (from, to) = resolve_range(Some("2024-01-01"), Some("2024-06-30")).unwrap();
        assert_eq!(from, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(to, NaiveDate::from_ymd_opt(2024, 6, 30).unwrap());

        let (from, to) = resolve_range(None, Some("2024-12-31")).unwrap();
        assert_eq!((to - from).num_days(), 365);

        assert!(resolve_range(Some("2024-06-30"), Some("2024-01-01")).is_err());
        assert!(resolve_range(Some("06/30/2024"), None).is_err());
    }
}
