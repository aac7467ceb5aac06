//! TD365 실시간 시세 CLI.
//!
//! # 사용 예시
//!
//! ```bash
//! # 데모 계정으로 종목 두 개 스트리밍
//! td365 stream -q 4021 -q 4022
//!
//! # 사용자 계정으로 스트리밍 (TD365_USERNAME / TD365_PASSWORD 필요)
//! td365 stream -q 4021 --account ACC123
//!
//! # 카탈로그 조회
//! td365 markets
//! td365 markets --super-group 1
//! td365 markets --group 42 --format json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use td365_cli::commands::markets::{list_markets, MarketsConfig, OutputFormat};
use td365_cli::commands::stream::{run_stream, StreamCliConfig};
use td365_core::config::AppConfig;
use td365_core::logging::init_logging;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "td365")]
#[command(about = "TD365 realtime quote client", long_about = None)]
#[command(version)]
struct Cli {
    /// 설정 파일 (TOML). 없으면 기본값과 TD365__* 환경 변수만 사용
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 종목을 구독하고 틱을 출력
    Stream {
        /// 구독할 quote ID (여러 번 지정 가능)
        #[arg(short, long = "quote", required = true)]
        quote_ids: Vec<u32>,

        /// 사용자 계정 ID (지정하지 않으면 원클릭 데모)
        #[arg(short, long)]
        account: Option<String>,
    },

    /// 마켓 카탈로그 조회
    Markets {
        /// 이 슈퍼 그룹 아래의 그룹 목록
        #[arg(long)]
        super_group: Option<u32>,

        /// 이 그룹 안의 종목 목록
        #[arg(long)]
        group: Option<u32>,

        /// 사용자 계정 ID (지정하지 않으면 원클릭 데모)
        #[arg(short, long)]
        account: Option<String>,

        /// 출력 형식 (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

fn load_config(path: Option<&str>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path)),
        None => AppConfig::from_env().context("Failed to load config from environment"),
    }
}

fn main() -> Result<()> {
    // .env가 없어도 무시
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    init_logging(config.logging.to_log_config())
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    match cli.command {
        Commands::Stream { quote_ids, account } => {
            let stream_config = StreamCliConfig { quote_ids, account };

            match run_stream(config, stream_config) {
                Ok(count) => {
                    info!("Stream finished after {} ticks", count);
                }
                Err(e) => {
                    error!("Stream failed: {:#}", e);
                    return Err(e);
                }
            }
        }

        Commands::Markets {
            super_group,
            group,
            account,
            format,
        } => {
            let markets_config = MarketsConfig {
                super_group,
                group,
                account,
                format: OutputFormat::parse(&format)?,
            };

            match list_markets(config, markets_config) {
                Ok(count) => {
                    info!("Listed {} entries", count);
                }
                Err(e) => {
                    error!("Catalog query failed: {:#}", e);
                    return Err(e);
                }
            }
        }
    }

    Ok(())
}
