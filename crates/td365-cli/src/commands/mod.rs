//! CLI 명령어 구현 모듈.

pub mod markets;
pub mod stream;

use anyhow::{Context, Result};
use secrecy::SecretString;
use std::sync::Arc;
use td365_feed::Platform;
use tracing::info;

/// 환경 변수에서 읽은 계정 자격 증명.
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    /// `TD365_USERNAME` / `TD365_PASSWORD`를 읽습니다. 둘 중 하나라도 없으면 `None`.
    pub fn from_env() -> Option<Self> {
        let username = std::env::var("TD365_USERNAME").ok()?;
        let password = std::env::var("TD365_PASSWORD").ok()?;
        Some(Self {
            username,
            password: SecretString::from(password),
        })
    }
}

/// 계정이 지정되면 사용자 인증으로, 아니면 데모 계정으로 접속합니다.
pub fn connect(platform: &Platform, account: Option<&str>) -> Result<()> {
    match (Credentials::from_env(), account) {
        (Some(credentials), Some(account)) => {
            info!(username = %credentials.username, account, "Connecting with account");
            platform
                .connect_with_credentials(&credentials.username, credentials.password, account)
                .context("Failed to connect with account credentials")
        }
        (None, Some(_)) => Err(anyhow::anyhow!(
            "--account requires TD365_USERNAME and TD365_PASSWORD to be set"
        )),
        (_, None) => {
            info!("Connecting to one-click demo account");
            platform
                .connect_demo()
                .context("Failed to connect to demo account")
        }
    }
}

/// Ctrl-C가 눌리면 플랫폼을 종료시킵니다.
pub fn install_ctrlc(platform: &Arc<Platform>) -> Result<()> {
    let platform = platform.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl-C received, shutting down");
        platform.shutdown();
    })
    .context("Failed to install Ctrl-C handler")
}
