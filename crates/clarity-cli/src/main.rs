//! 시장 데이터 캐시/페처 CLI.
//!
//! # 사용 예시
//!
//! ```bash
//! # 여러 종목 시세 (캐시 우선)
//! clarity prices -s AAPL,MSFT,SCHD
//!
//! # 캐시를 건너뛰고 다시 가져오기
//! clarity prices -s AAPL --force
//!
//! # 최근 1년 배당
//! clarity dividends -s KO,JNJ -f 2024-01-01 -t 2024-12-31
//!
//! # 상태 확인 (제공자 연결 확인 포함)
//! clarity health --probe
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

mod commands;

use commands::OutputFormat;

#[derive(Parser)]
#[command(name = "clarity")]
#[command(about = "Income Clarity 시장 데이터 CLI - 다계층 캐시 + 요청 예산 기반 페처", long_about = None)]
#[command(version)]
struct Cli {
    /// 설정 파일 (없으면 환경 변수와 기본값 사용)
    #[arg(short, long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    /// 로그 레벨 덮어쓰기 (예: debug, clarity_market=trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// 출력 형식 (table, json)
    #[arg(long, global = true, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 여러 종목 시세 조회
    Prices {
        /// 종목 심볼 (쉼표로 구분, 예: AAPL,MSFT)
        #[arg(short, long, value_delimiter = ',', required = true)]
        symbols: Vec<String>,

        /// 캐시를 건너뛰고 제공자에서 다시 가져오기
        #[arg(long)]
        force: bool,

        /// 대기열 우선순위 (클수록 먼저)
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        priority: i32,
    },

    /// 단일 종목 시세 조회
    Price {
        /// 종목 심볼
        symbol: String,
    },

    /// 배당 이력 조회
    Dividends {
        /// 종목 심볼 (쉼표로 구분)
        #[arg(short, long, value_delimiter = ',', required = true)]
        symbols: Vec<String>,

        /// 시작 날짜 (YYYY-MM-DD, 기본: 1년 전)
        #[arg(short = 'f', long)]
        from: Option<String>,

        /// 종료 날짜 (YYYY-MM-DD, 기본: 오늘)
        #[arg(short, long)]
        to: Option<String>,

        #[arg(long)]
        force: bool,
    },

    /// 기업 기본 정보 조회
    Company {
        /// 종목 심볼 (쉼표로 구분)
        #[arg(short, long, value_delimiter = ',', required = true)]
        symbols: Vec<String>,

        #[arg(long)]
        force: bool,
    },

    /// 서비스 상태 확인
    Health {
        /// 제공자에 연결 확인 요청 보내기
        #[arg(long)]
        probe: bool,
    },

    /// 캐시 무효화
    ClearCache {
        /// 무효화할 태그 (쉼표로 구분, 기본: prices,dividends,company-info)
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,

        /// 모든 계층의 모든 항목 삭제
        #[arg(long, conflicts_with = "tags")]
        all: bool,
    },

    /// 시세 캐시 워밍업
    Warmup {
        /// 종목 심볼 (쉼표로 구분)
        #[arg(short, long, value_delimiter = ',', required = true)]
        symbols: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env 파일이 있으면 로드
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let format = OutputFormat::parse(&cli.format)?;

    let mut config = clarity_core::AppConfig::load(Some(&cli.config))?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    clarity_core::init_logging(&config.logging)?;

    let context = clarity_market::MarketContext::build(config).await?;

    let result = match cli.command {
        Commands::Prices {
            symbols,
            force,
            priority,
        } => commands::fetch::prices(&context, symbols, force, priority, format).await,
        Commands::Price { symbol } => commands::fetch::price(&context, &symbol, format).await,
        Commands::Dividends {
            symbols,
            from,
            to,
            force,
        } => {
            commands::fetch::dividends(&context, symbols, from.as_deref(), to.as_deref(), force, format)
                .await
        }
        Commands::Company { symbols, force } => {
            commands::fetch::company(&context, symbols, force, format).await
        }
        Commands::Health { probe } => commands::health::run(&context, probe, format).await,
        Commands::ClearCache { tags, all } => commands::cache::clear(&context, tags, all).await,
        Commands::Warmup { symbols } => commands::cache::warmup(&context, symbols, format).await,
    };

    if let Err(e) = &result {
        error!("Command failed: {:#}", e);
    }
    result
}
