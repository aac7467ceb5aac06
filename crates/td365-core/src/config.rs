//! 설정 관리.
//!
//! 이 모듈은 클라이언트 설정을 정의하고 관리합니다.
//! 모든 섹션은 기본값을 가지므로 설정 파일 없이도 동작하며,
//! `TD365__` 접두사 환경 변수로 개별 값을 덮어쓸 수 있습니다
//! (예: `TD365__HTTP__REQUEST_TIMEOUT_SECS=10`).

use crate::logging::{LogConfig, LogFormat};
use crate::types::PriceGrouping;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 애플리케이션 설정.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP 세션 설정
    pub http: HttpConfig,
    /// 실시간 스트림 설정
    pub stream: StreamConfig,
    /// 계정 인증 설정
    pub auth: AuthConfig,
    /// 로깅 설정
    pub logging: LoggingConfig,
}

/// HTTP 세션 클라이언트 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// 요청당 타임아웃 (초)
    pub request_timeout_secs: u64,
    /// 로그인 리다이렉트 최대 추적 횟수
    pub max_redirects: usize,
    /// 세션 갱신 주기 (초)
    pub session_refresh_secs: u64,
    /// User-Agent 헤더
    pub user_agent: String,
    /// HTTP(S) 프록시 (예: "http://127.0.0.1:8080")
    pub proxy: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            max_redirects: 10,
            session_refresh_secs: 60,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0"
                .to_string(),
            proxy: None,
        }
    }
}

impl HttpConfig {
    /// 요청 타임아웃.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// 세션 갱신 주기.
    pub fn session_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.session_refresh_secs)
    }
}

/// 실시간 시세 스트림 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    /// URL 스킴 ("wss" 또는 테스트용 "ws")
    pub scheme: String,
    /// 포트
    pub port: u16,
    /// 경로
    pub path: String,
    /// 인증 프레임에 실어 보내는 클라이언트 프로토콜 버전
    pub client_version: String,
    /// 재연결 대기 시간 (밀리초)
    pub reconnect_delay_ms: u64,
    /// 연결 시도당 타임아웃 (초)
    pub connect_timeout_secs: u64,
    /// 수신 유휴 타임아웃 (초). 이 시간 동안 프레임이 없으면 재연결
    pub idle_timeout_secs: u64,
    /// Ready 이전 구독 요청 대기열 크기
    pub pending_command_capacity: usize,
    /// 구독 시 요청하는 가격 그룹
    pub price_grouping: PriceGrouping,
    /// 수신 프레임 원문 로깅
    pub debug_frames: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            scheme: "wss".to_string(),
            port: 443,
            path: "/".to_string(),
            client_version: "1.0.0.6".to_string(),
            reconnect_delay_ms: 1000,
            connect_timeout_secs: 10,
            idle_timeout_secs: 90,
            pending_command_capacity: 256,
            price_grouping: PriceGrouping::Sampled,
            debug_frames: false,
        }
    }
}

impl StreamConfig {
    /// 주어진 호스트의 스트림 URL을 만듭니다.
    pub fn url(&self, host: &str) -> String {
        format!("{}://{}:{}{}", self.scheme, host, self.port, self.path)
    }

    /// 재연결 대기 시간.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// 연결 타임아웃.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// 수신 유휴 타임아웃.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// 계정 인증(OAuth) 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// OAuth 토큰 발급 호스트
    pub oauth_host: String,
    /// 계정 포털 API 호스트
    pub portal_host: String,
    /// OAuth 클라이언트 ID
    pub client_id: String,
    /// 접근 토큰 캐시 파일 경로
    pub token_cache_path: PathBuf,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            oauth_host: "td365.eu.auth0.com".to_string(),
            portal_host: "portal-api.tradenation.com".to_string(),
            client_id: "eeXrVwSMXPZ4pJpwStuNyiUa7XxGZRX9".to_string(),
            token_cache_path: PathBuf::from("auth_token.json"),
        }
    }
}

/// 로깅 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 로그 레벨
    pub level: String,
    /// 로그 형식 (pretty, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    /// [`LogConfig`]로 변환합니다. 알 수 없는 형식은 pretty로 대체됩니다.
    pub fn to_log_config(&self) -> LogConfig {
        let format = self.format.parse().unwrap_or(LogFormat::Pretty);
        LogConfig::new(self.level.clone(), format)
    }
}

impl AppConfig {
    /// 파일과 환경 변수에서 설정을 로드합니다.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        Self::builder(Some(path.as_ref()))?.build()?.try_deserialize()
    }

    /// 환경 변수만으로 설정을 로드합니다.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::builder(None)?.build()?.try_deserialize()
    }

    fn builder(
        path: Option<&Path>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        let mut builder = config::Config::builder()
            // 기본값으로 시작
            .add_source(config::Config::try_from(&AppConfig::default())?);

        if let Some(path) = path {
            // 파일에서 로드
            builder = builder.add_source(config::File::from(path));
        }

        // 환경 변수로 오버라이드
        Ok(builder.add_source(
            config::Environment::with_prefix("TD365")
                .separator("__")
                .try_parsing(true),
        ))
    }
}
