//! 캐시 관리 명령.

use anyhow::Result;
use std::collections::BTreeSet;
use tracing::info;

use clarity_market::MarketContext;

use super::{print_batch, OutputFormat};

pub async fn clear(context: &MarketContext, tags: Vec<String>, all: bool) -> Result<()> {
    let removed = if all {
        context.cache.clear().await
    } else {
        let tags: BTreeSet<String> = tags
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        context.service.clear_cache(Some(&tags)).await
    };

    info!(removed, all, "Cache cleared");
    println!("삭제된 항목: {}", removed);
    Ok(())
}

pub async fn warmup(context: &MarketContext, symbols: Vec<String>, format: OutputFormat) -> Result<()> {
    let result = context.service.warm_up_prices(symbols).await;
    print_batch(&result, format, |symbol, record| {
        format!("{:<8} {:>12}", symbol, record.price)
    })
}
