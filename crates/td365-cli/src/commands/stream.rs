//! 실시간 시세 스트리밍 명령.

use super::{connect, install_ctrlc};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use td365_core::config::AppConfig;
use td365_feed::Platform;
use tracing::{info, warn};

/// 스트리밍 설정.
#[derive(Debug)]
pub struct StreamCliConfig {
    /// 구독할 종목 quote ID
    pub quote_ids: Vec<u32>,
    /// 사용자 계정 ID (없으면 데모)
    pub account: Option<String>,
}

/// 접속하고 구독한 뒤 연결이 끝날 때까지 틱을 출력합니다.
///
/// 전달된 틱 수를 반환합니다.
pub fn run_stream(app: AppConfig, config: StreamCliConfig) -> Result<u64> {
    let platform = Arc::new(Platform::new(app).context("Failed to start I/O thread")?);
    install_ctrlc(&platform)?;

    connect(&platform, config.account.as_deref())?;

    for quote_id in &config.quote_ids {
        platform
            .subscribe(*quote_id)
            .with_context(|| format!("Failed to subscribe to {}", quote_id))?;
        info!(quote_id, "Subscribed");
    }

    let delivered = Arc::new(AtomicU64::new(0));
    let counter = delivered.clone();
    let result = platform.main_loop(move |tick| {
        println!("{}", tick);
        counter.fetch_add(1, Ordering::Relaxed);
    });
    let delivered = delivered.load(Ordering::Relaxed);

    if let Err(e) = platform.disconnect() {
        warn!(error = %e, "Disconnect failed");
    }

    result.context("Stream terminated")?;
    Ok(delivered)
}
