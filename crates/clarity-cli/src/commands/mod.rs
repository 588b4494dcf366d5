//! CLI 명령어 구현 모듈.

pub mod cache;
pub mod fetch;
pub mod health;

use anyhow::Result;
use serde::Serialize;

use clarity_market::{BatchResult, SymbolError};

/// 출력 형식.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            _ => Err(anyhow::anyhow!("Invalid format: {}. Use: table, json", s)),
        }
    }
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// 배치 결과 출력. `row`는 레코드 한 줄을 만듭니다.
pub(crate) fn print_batch<T, F>(result: &BatchResult<T>, format: OutputFormat, row: F) -> Result<()>
where
    T: Serialize,
    F: Fn(&str, &T) -> String,
{
    if format == OutputFormat::Json {
        return print_json(result);
    }

    for (symbol, record) in &result.records {
        println!("{}", row(symbol, record));
    }
    print_errors(&result.errors);

    println!(
        "\n캐시 {} / 제공자 {} / 합성 {} / 실패 {}  (예산 {}/{} 남음, 배치 {})",
        result.from_cache.len(),
        result.from_origin.len(),
        result.synthetic.len(),
        result.errors.len(),
        result.budget.remaining,
        result.budget.max_requests,
        result.batch_id,
    );
    Ok(())
}

fn print_errors(errors: &[SymbolError]) {
    for e in errors {
        let hint = if e.error.is_retryable() { " (재시도 가능)" } else { "" };
        println!("{:<8} ERROR {}{}", e.symbol, e.error, hint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_parse() {
        assert_eq!(OutputFormat::parse("JSON").unwrap(), OutputFormat::Json);
        assert_eq!(OutputFormat::parse("table").unwrap(), OutputFormat::Table);
        assert!(OutputFormat::parse("csv").is_err());
    }
}
