//! 시스템 상태 확인 명령.

use anyhow::Result;

use clarity_market::{HealthStatus, MarketContext};

use super::{print_json, OutputFormat};

pub async fn run(context: &MarketContext, probe: bool, format: OutputFormat) -> Result<()> {
    let health = context.service.get_service_health(probe).await;
    health.cache.log_summary();

    if format == OutputFormat::Json {
        return print_json(&health);
    }

    let status = match health.status {
        HealthStatus::Healthy => "정상",
        HealthStatus::Degraded => "저하",
    };
    println!("상태: {} ({:?})", status, health.mode);
    println!(
        "제공자: {} (설정 {}, 요금제 {:?})",
        health.provider.as_deref().unwrap_or("-"),
        if health.configured { "됨" } else { "안 됨" },
        health.plan
    );
    if let Some(conn) = &health.connection {
        println!(
            "연결 확인: {} ({}ms){}",
            if conn.success { "성공" } else { "실패" },
            conn.latency_ms,
            conn.message
                .as_deref()
                .map(|m| format!(" - {}", m))
                .unwrap_or_default()
        );
    }
    println!(
        "예산 '{}': {}/{} 사용, 대기 {}",
        health.budget.identifier,
        health.budget.count,
        health.budget.max_requests,
        health.budget.queued
    );
    println!(
        "서킷 브레이커: {:?} (연속 실패 {})",
        health.circuit.state, health.circuit.failure_count
    );
    for tier in &health.cache.tiers {
        println!(
            "캐시 {}: 적중 {} / 미스 {} / 에러 {} / 항목 {}",
            tier.kind,
            tier.hits,
            tier.misses,
            tier.errors,
            tier.entries
                .map(|n| n.to_string())
                .unwrap_or_else(|| "?".to_string())
        );
    }
    println!("캐시 적중률: {:.1}%", health.cache.hit_rate);
    Ok(())
}
