//! 마켓 카탈로그 조회 명령.

use super::connect;
use anyhow::{Context, Result};
use td365_core::config::AppConfig;
use td365_core::types::{Market, MarketGroup};
use td365_feed::Platform;
use tracing::{info, warn};

/// 카탈로그 조회 설정.
#[derive(Debug)]
pub struct MarketsConfig {
    /// 이 슈퍼 그룹 아래의 그룹 목록
    pub super_group: Option<u32>,
    /// 이 그룹 안의 종목 목록
    pub group: Option<u32>,
    /// 사용자 계정 ID (없으면 데모)
    pub account: Option<String>,
    /// 출력 형식
    pub format: OutputFormat,
}

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

/// 카탈로그를 조회해 출력합니다. 출력한 항목 수를 반환합니다.
///
/// `group`이 있으면 종목, `super_group`이 있으면 그룹, 둘 다 없으면 슈퍼 그룹을 보여줍니다.
pub fn list_markets(app: AppConfig, config: MarketsConfig) -> Result<usize> {
    let platform = Platform::new(app).context("Failed to start I/O thread")?;
    connect(&platform, config.account.as_deref())?;

    let count = if let Some(group) = config.group {
        info!(group, "Querying markets");
        let markets = platform
            .get_market_quote(group)
            .with_context(|| format!("Failed to query markets of group {}", group))?;
        print_markets(&markets, config.format)?;
        markets.len()
    } else if let Some(super_group) = config.super_group {
        info!(super_group, "Querying market groups");
        let groups = platform
            .get_market_group(super_group)
            .with_context(|| format!("Failed to query groups of {}", super_group))?;
        print_groups(&groups, config.format)?;
        groups.len()
    } else {
        info!("Querying market super groups");
        let groups = platform
            .get_market_super_group()
            .context("Failed to query super groups")?;
        print_groups(&groups, config.format)?;
        groups.len()
    };

    if let Err(e) = platform.disconnect() {
        warn!(error = %e, "Disconnect failed");
    }
    Ok(count)
}

fn print_groups(groups: &[MarketGroup], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(groups)?),
        OutputFormat::Table => {
            println!("{:<10} {:<40} {:<6}", "ID", "NAME", "SUPER");
            println!("{}", "-".repeat(58));
            for group in groups {
                println!(
                    "{:<10} {:<40} {:<6}",
                    group.id, group.name, group.is_super_group
                );
            }
        }
    }
    Ok(())
}

fn print_markets(markets: &[Market], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(markets)?),
        OutputFormat::Table => {
            println!(
                "{:<10} {:<40} {:>14} {:>14} {:<8}",
                "QUOTE ID", "NAME", "BID", "ASK", "TRADABLE"
            );
            println!("{}", "-".repeat(90));
            for market in markets {
                println!(
                    "{:<10} {:<40} {:>14} {:>14} {:<8}",
                    market.quote_id, market.market_name, market.bid, market.ask, market.tradable
                );
            }
        }
    }
    Ok(())
}
